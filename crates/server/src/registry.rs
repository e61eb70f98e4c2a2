//! Live connection set with fan-out.
//!
//! Each registered connection owns the receiving half of an unbounded
//! channel; the registry keeps the sending half. Broadcast is a non-blocking
//! hand-off onto every channel, so one slow client only delays itself.
//! A send fails only once the receiver is gone, and such connections are
//! evicted after the pass.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::warn;

/// Registry-assigned connection identifier. Never reused.
pub type ConnectionId = u64;

/// Result of one broadcast pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the message was handed to.
    pub delivered: usize,
    /// Connections removed because their receiver was gone.
    pub evicted: Vec<ConnectionId>,
}

struct RegistryInner<M> {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<M>>,
}

/// Mutex-guarded map of connection id to outbound channel.
pub struct ConnectionRegistry<M> {
    inner: Mutex<RegistryInner<M>>,
}

impl<M> Default for ConnectionRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ConnectionRegistry<M> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_id: 1,
                connections: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<M>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection. The returned receiver yields every later broadcast.
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.connections.insert(id, tx);
        (id, rx)
    }

    /// Remove a connection. Returns true only for the call that removed it.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().connections.remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().connections.is_empty()
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl<M: Clone> ConnectionRegistry<M> {
    /// Hand `message` to every registered connection.
    ///
    /// Delivery is attempted for all connections before any eviction, so a
    /// failure never skips a later client. The lock is not held while
    /// sending.
    pub fn broadcast(&self, message: &M) -> BroadcastReport {
        let targets: Vec<(ConnectionId, mpsc::UnboundedSender<M>)> = self
            .lock()
            .connections
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, tx) in targets {
            if tx.send(message.clone()).is_ok() {
                report.delivered += 1;
            } else {
                failed.push(id);
            }
        }

        if !failed.is_empty() {
            let mut inner = self.lock();
            for id in failed {
                if inner.connections.remove(&id).is_some() {
                    warn!(connection = id, "evicting connection after failed delivery");
                    report.evicted.push(id);
                }
            }
        }

        report
    }
}
