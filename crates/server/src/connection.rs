//! Per-connection task.
//!
//! A connection registers with the coordinator, pushes the current load,
//! then loops over three event sources:
//! - the next inbound command (checked first),
//! - a broadcast from the registry,
//! - the pacing deadline of the active playback.
//!
//! Any command therefore preempts a pending pacing wait. The connection
//! deregisters itself when dropped.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use megane_wire::{ParsedCommand, encode_frame, parse_command};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::registry::ConnectionId;
use crate::session::StreamingSession;
use crate::validation::{CommandOutcome, PlaybackDefaults};
use crate::{Coordinator, LoadedState, Outbound};

// ============================================================================
// Transport
// ============================================================================

/// One message received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A JSON command.
    Text(String),
    /// Binary payloads are not part of the control channel and are ignored.
    Binary(Bytes),
    /// The client asked to close.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Bidirectional message channel to one client.
///
/// `recv` must be cancel-safe: it is raced against other events and may be
/// dropped before completing.
#[async_trait]
pub trait Transport: Send {
    /// Next inbound message. `None` once the peer is gone or the read failed.
    async fn recv(&mut self) -> Option<Inbound>;

    /// Send one binary message.
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError>;
}

/// In-process transport backed by channels, for embedding the server next to
/// a viewer without a socket in between.
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

/// Client end of a [`ChannelTransport`].
pub struct ChannelClient {
    commands: mpsc::UnboundedSender<Inbound>,
    messages: mpsc::UnboundedReceiver<Bytes>,
}

/// Create a connected transport/client pair.
pub fn channel_transport() -> (ChannelTransport, ChannelClient) {
    let (commands, inbound) = mpsc::unbounded_channel();
    let (outbound, messages) = mpsc::unbounded_channel();
    (
        ChannelTransport { inbound, outbound },
        ChannelClient { commands, messages },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }
}

impl ChannelClient {
    /// Send a command as text. Returns false if the connection is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.commands.send(Inbound::Text(text.into())).is_ok()
    }

    /// Send a raw inbound message.
    pub fn send(&self, message: Inbound) -> bool {
        self.commands.send(message).is_ok()
    }

    /// Next message from the server, `None` once the connection has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.messages.recv().await
    }

    /// A message already queued, if any.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.messages.try_recv().ok()
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A registered client connection.
pub struct Connection {
    id: ConnectionId,
    coordinator: Arc<Coordinator>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    load: Option<Arc<LoadedState>>,
    session: StreamingSession,
    defaults: PlaybackDefaults,
}

impl Connection {
    /// Register a new connection with `coordinator`.
    pub fn accept(coordinator: Arc<Coordinator>) -> Self {
        let (id, outbound) = coordinator.registry().register();
        let defaults = coordinator.config().playback_defaults();
        info!(connection = id, "client connected");
        Self {
            id,
            coordinator,
            outbound,
            load: None,
            session: StreamingSession::new(),
            defaults,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Serve the client until it disconnects or a send fails.
    pub async fn run<T: Transport>(mut self, mut transport: T) {
        match self.serve(&mut transport).await {
            Ok(()) => info!(connection = self.id, "client disconnected"),
            Err(e) => warn!(connection = self.id, error = %e, "connection dropped after send failure"),
        }
    }

    async fn serve<T: Transport>(&mut self, transport: &mut T) -> Result<(), TransportError> {
        if let Some(load) = self.coordinator.current() {
            self.push_load(transport, load).await?;
        }

        loop {
            let due = self.session.next_due();
            tokio::select! {
                biased;

                inbound = transport.recv() => match inbound {
                    Some(Inbound::Text(text)) => self.handle_text(transport, &text).await?,
                    Some(Inbound::Binary(bytes)) => {
                        debug!(connection = self.id, len = bytes.len(), "ignoring binary message");
                    }
                    Some(Inbound::Close) | None => return Ok(()),
                },

                outbound = self.outbound.recv() => match outbound {
                    Some(Outbound::Reload(load)) => self.push_load(transport, load).await?,
                    Some(Outbound::Unload) => {
                        self.session.reset();
                        self.load = None;
                    }
                    // Removed from the registry.
                    None => return Ok(()),
                },

                _ = sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {
                    self.play_due_frame(transport).await?;
                }
            }
        }
    }

    /// Send a load's snapshot and metadata, unless this connection already
    /// has that generation or a newer one.
    async fn push_load<T: Transport>(
        &mut self,
        transport: &mut T,
        load: Arc<LoadedState>,
    ) -> Result<(), TransportError> {
        if let Some(current) = &self.load {
            if current.generation() >= load.generation() {
                debug!(
                    connection = self.id,
                    generation = load.generation(),
                    "load already delivered"
                );
                return Ok(());
            }
        }

        // Frame indices of the old trajectory no longer apply.
        self.session.reset();
        transport.send(load.snapshot_bytes().clone()).await?;
        transport.send(load.metadata_bytes().clone()).await?;
        debug!(
            connection = self.id,
            generation = load.generation(),
            "pushed snapshot and metadata"
        );
        self.load = Some(load);
        Ok(())
    }

    async fn handle_text<T: Transport>(
        &mut self,
        transport: &mut T,
        text: &str,
    ) -> Result<(), TransportError> {
        let command = match parse_command(text) {
            ParsedCommand::Command(command) => command,
            ParsedCommand::Ignored { reason } => {
                debug!(connection = self.id, %reason, "ignoring malformed command");
                return Ok(());
            }
        };

        let n_frames = self.load.as_ref().and_then(|load| load.n_frames());
        let outcome = self
            .session
            .apply(&command, n_frames, &self.defaults, Instant::now());
        match &outcome {
            CommandOutcome::SendFrame(frame) => {
                self.send_frame(transport, *frame).await?;
            }
            CommandOutcome::StartPlayback(playback) => debug!(
                connection = self.id,
                start = playback.start,
                end = playback.end,
                stride = playback.stride,
                fps = playback.fps,
                "playback started"
            ),
            CommandOutcome::Stop | CommandOutcome::EmptyRange { .. } => {
                debug!(connection = self.id, ?outcome, "playback idle");
            }
            dropped => {
                debug!(
                    connection = self.id,
                    command = command.type_name(),
                    outcome = ?dropped,
                    "command dropped"
                );
            }
        }
        Ok(())
    }

    async fn play_due_frame<T: Transport>(&mut self, transport: &mut T) -> Result<(), TransportError> {
        let Some(frame) = self.session.due_frame(Instant::now()) else {
            return Ok(());
        };
        if !self.send_frame(transport, frame).await? {
            self.session.reset();
            return Ok(());
        }
        self.session.frame_sent(Instant::now());
        Ok(())
    }

    /// Fetch, encode and send one frame. Returns false if the frame could not
    /// be produced; only transport failures are errors.
    async fn send_frame<T: Transport>(
        &self,
        transport: &mut T,
        frame: u32,
    ) -> Result<bool, TransportError> {
        let Some(trajectory) = self.load.as_ref().and_then(|load| load.trajectory()) else {
            return Ok(false);
        };
        let Some(positions) = trajectory.frame(frame as usize) else {
            warn!(connection = self.id, frame, "trajectory returned no data for frame");
            return Ok(false);
        };
        let message = match encode_frame(frame, &positions) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = self.id, frame, error = %e, "failed to encode frame");
                return Ok(false);
            }
        };
        transport.send(Bytes::from(message)).await?;
        Ok(true)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.coordinator.registry().remove(self.id);
    }
}

/// Register and serve one client over `transport`.
pub async fn run_connection<T: Transport>(transport: T, coordinator: Arc<Coordinator>) {
    Connection::accept(coordinator).run(transport).await;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use megane_model::{InMemoryTrajectory, NO_CELL, Structure, Trajectory};
    use megane_wire::{Message, decode_message};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::*;
    use crate::{Load, ServerConfig};

    fn structure(n_atoms: usize) -> Structure {
        Structure::new(
            vec![0.0; n_atoms * 3],
            vec![6; n_atoms],
            Vec::new(),
            Vec::new(),
            NO_CELL,
        )
    }

    /// Frame `f` holds every coordinate equal to `f`.
    fn load(n_atoms: usize, n_frames: usize) -> Load {
        let frames = (0..n_frames)
            .map(|f| vec![f as f32; n_atoms * 3])
            .collect();
        let trajectory: Arc<dyn Trajectory> =
            Arc::new(InMemoryTrajectory::from_frames(0.1, frames).unwrap());
        Load::new(structure(n_atoms)).with_trajectory(trajectory)
    }

    fn connect(coordinator: &Arc<Coordinator>) -> (ChannelClient, JoinHandle<()>) {
        let (transport, client) = channel_transport();
        let connection = Connection::accept(coordinator.clone());
        (client, tokio::spawn(connection.run(transport)))
    }

    async fn next(client: &mut ChannelClient) -> Message {
        let bytes = timeout(Duration::from_secs(60), client.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed");
        decode_message(&bytes).unwrap()
    }

    async fn next_frame_id(client: &mut ChannelClient) -> u32 {
        match next(client).await {
            Message::Frame(frame) => frame.frame_id,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    async fn expect_load(client: &mut ChannelClient, n_frames: u32) {
        assert!(matches!(next(client).await, Message::Snapshot(_)));
        match next(client).await {
            Message::Metadata(metadata) => assert_eq!(metadata.n_frames, n_frames),
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    async fn expect_silence(client: &mut ChannelClient) {
        let result = timeout(Duration::from_secs(10), client.recv()).await;
        assert!(result.is_err(), "unexpected message: {result:?}");
    }

    fn coordinator_with(load: Load) -> Arc<Coordinator> {
        let coordinator = Arc::new(Coordinator::new(ServerConfig::default()));
        coordinator.reconfigure(load).unwrap();
        coordinator
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_connection_receives_current_load() {
        let coordinator = coordinator_with(load(2, 5));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 5).await;
        expect_silence(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_load_sends_nothing() {
        let coordinator = Arc::new(Coordinator::new(ServerConfig::default()));
        let (mut client, _task) = connect(&coordinator);
        client.send_text(r#"{"type":"request_frame","frame":0}"#);
        client.send_text(r#"{"type":"stream"}"#);
        expect_silence(&mut client).await;
        assert_eq!(coordinator.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_frame() {
        let coordinator = coordinator_with(load(2, 5));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 5).await;

        client.send_text(r#"{"type":"request_frame","frame":3}"#);
        match next(&mut client).await {
            Message::Frame(frame) => {
                assert_eq!(frame.frame_id, 3);
                assert_eq!(frame.positions, vec![3.0; 6]);
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_and_malformed_ignored() {
        let coordinator = coordinator_with(load(1, 100));
        let (mut client, task) = connect(&coordinator);
        expect_load(&mut client, 100).await;

        client.send_text(r#"{"type":"request_frame","frame":1000}"#);
        client.send_text("not json");
        client.send_text(r#"{"type":"rewind"}"#);
        client.send(Inbound::Binary(Bytes::from_static(b"\x00\x01")));
        expect_silence(&mut client).await;

        // Still open and serving.
        client.send_text(r#"{"type":"request_frame","frame":5}"#);
        assert_eq!(next_frame_id(&mut client).await, 5);
        assert!(!task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_is_paced_and_ordered() {
        let coordinator = coordinator_with(load(1, 100));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 100).await;

        client.send_text(r#"{"type":"stream","start":10,"end":20,"stride":2,"fps":10}"#);

        let mut ids = Vec::new();
        let mut arrivals = Vec::new();
        for _ in 0..5 {
            ids.push(next_frame_id(&mut client).await);
            arrivals.push(Instant::now());
        }
        assert_eq!(ids, vec![10, 12, 14, 16, 18]);
        for pair in arrivals.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(100) && gap < Duration::from_millis(102),
                "gap {gap:?}"
            );
        }
        expect_silence(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_playback() {
        let coordinator = coordinator_with(load(1, 100));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 100).await;

        client.send_text(r#"{"type":"stream","fps":1}"#);
        assert_eq!(next_frame_id(&mut client).await, 0);

        // Sent while the connection waits out the one-second pacing.
        client.send_text(r#"{"type":"stop"}"#);
        expect_silence(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_supersedes_previous() {
        let coordinator = coordinator_with(load(1, 100));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 100).await;

        client.send_text(r#"{"type":"stream","start":0,"fps":1}"#);
        assert_eq!(next_frame_id(&mut client).await, 0);

        client.send_text(r#"{"type":"stream","start":50,"end":52,"fps":100}"#);
        assert_eq!(next_frame_id(&mut client).await, 50);
        assert_eq!(next_frame_id(&mut client).await, 51);
        expect_silence(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_frame_during_playback() {
        let coordinator = coordinator_with(load(1, 100));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 100).await;

        client.send_text(r#"{"type":"stream","start":0,"end":3,"fps":1}"#);
        assert_eq!(next_frame_id(&mut client).await, 0);

        client.send_text(r#"{"type":"request_frame","frame":42}"#);
        assert_eq!(next_frame_id(&mut client).await, 42);
        assert_eq!(next_frame_id(&mut client).await, 1);
        assert_eq!(next_frame_id(&mut client).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_playback_keeps_prior_state() {
        let coordinator = coordinator_with(load(1, 100));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 100).await;

        client.send_text(r#"{"type":"stream","start":0,"end":3,"fps":2}"#);
        assert_eq!(next_frame_id(&mut client).await, 0);

        client.send_text(r#"{"type":"stream","fps":0}"#);
        client.send_text(r#"{"type":"stream","stride":0}"#);
        client.send_text(r#"{"type":"stream","stride":-2}"#);
        assert_eq!(next_frame_id(&mut client).await, 1);
        assert_eq!(next_frame_id(&mut client).await, 2);
        expect_silence(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_range_sends_nothing() {
        let coordinator = coordinator_with(load(1, 100));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 100).await;

        client.send_text(r#"{"type":"stream","start":20,"end":20}"#);
        client.send_text(r#"{"type":"stream","start":30,"end":10}"#);
        expect_silence(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_deregisters() {
        let coordinator = coordinator_with(load(1, 10));
        let (mut client, task) = connect(&coordinator);
        expect_load(&mut client, 10).await;
        assert_eq!(coordinator.connection_count(), 1);

        client.send(Inbound::Close);
        task.await.unwrap();
        assert_eq!(coordinator.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_client_deregisters() {
        let coordinator = coordinator_with(load(1, 10));
        let (client, task) = connect(&coordinator);
        drop(client);
        task.await.unwrap();
        assert_eq!(coordinator.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_fans_out_and_skips_closed() {
        let coordinator = Arc::new(Coordinator::new(ServerConfig::default()));
        let (mut a, _task_a) = connect(&coordinator);
        let (b, task_b) = connect(&coordinator);
        let (mut c, _task_c) = connect(&coordinator);
        assert_eq!(coordinator.connection_count(), 3);

        drop(b);
        task_b.await.unwrap();

        coordinator.reconfigure(load(2, 7)).unwrap();
        assert_eq!(coordinator.connection_count(), 2);
        expect_load(&mut a, 7).await;
        expect_load(&mut c, 7).await;
        expect_silence(&mut a).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_resets_playback() {
        let coordinator = coordinator_with(load(1, 100));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 100).await;

        client.send_text(r#"{"type":"stream","fps":1}"#);
        assert_eq!(next_frame_id(&mut client).await, 0);

        coordinator.reconfigure(load(1, 3)).unwrap();
        expect_load(&mut client, 3).await;
        expect_silence(&mut client).await;

        client.send_text(r#"{"type":"request_frame","frame":50}"#);
        expect_silence(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_generation_pushed_once() {
        let coordinator = Arc::new(Coordinator::new(ServerConfig::default()));
        // Registered before the load exists but not yet running.
        let (transport, mut client) = channel_transport();
        let connection = Connection::accept(coordinator.clone());
        coordinator.reconfigure(load(1, 4)).unwrap();

        // The task sees the load both as current and as a queued broadcast.
        let _task = tokio::spawn(connection.run(transport));
        expect_load(&mut client, 4).await;
        expect_silence(&mut client).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_stops_playback() {
        let coordinator = coordinator_with(load(1, 100));
        let (mut client, _task) = connect(&coordinator);
        expect_load(&mut client, 100).await;

        client.send_text(r#"{"type":"stream","fps":1}"#);
        assert_eq!(next_frame_id(&mut client).await, 0);

        coordinator.clear();
        expect_silence(&mut client).await;

        let (mut late, _late_task) = connect(&coordinator);
        expect_silence(&mut late).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_connection_helper() {
        let coordinator = coordinator_with(load(1, 2));
        let (transport, mut client) = channel_transport();
        let task = tokio::spawn(run_connection(transport, coordinator.clone()));
        expect_load(&mut client, 2).await;
        drop(client);
        task.await.unwrap();
        assert_eq!(coordinator.connection_count(), 0);
    }
}
