//! megane Streaming Server
//!
//! The server pushes one loaded molecule, and optionally its trajectory, to
//! every connected viewer. It owns:
//! - The current load, encoded once per reconfigure
//! - The connection registry and broadcast
//! - Per-connection playback (request_frame / stream / stop)
//!
//! # Data Flow
//!
//! ```text
//! reconfigure(Load) ──► LoadedState (snapshot + metadata bytes)
//!                          │
//!                          ├─► cached for connections that arrive later
//!                          └─► broadcast to every registered connection
//!
//! connection task: inbound command ─► StreamingSession ─► Frame messages
//! ```
//!
//! Each connection runs in its own task; see [`connection`]. The WebSocket
//! endpoint in [`ws`] is one transport for it.

#![deny(unsafe_code)]

pub mod connection;
pub mod logging;
pub mod registry;
pub mod session;
pub mod validation;
pub mod ws;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use megane_model::{Structure, Trajectory};
use megane_wire::{EncodeError, Metadata, encode_metadata, encode_snapshot};
use registry::{BroadcastReport, ConnectionRegistry};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use validation::PlaybackDefaults;

pub use connection::{Connection, Inbound, Transport, TransportError, run_connection};

// ============================================================================
// Defaults
// ============================================================================

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8765";

/// Default WebSocket route.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Playback rate used when `stream` omits `fps`.
pub const DEFAULT_FPS: f64 = 30.0;

/// Environment variables read by [`ServerConfig::from_env`].
pub const ENV_BIND: &str = "MEGANE_BIND";
pub const ENV_WS_PATH: &str = "MEGANE_WS_PATH";
pub const ENV_DEFAULT_FPS: &str = "MEGANE_DEFAULT_FPS";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to encode load: {0}")]
    Encode(#[from] EncodeError),

    #[error("trajectory has {trajectory} atoms but the structure has {structure}")]
    AtomCountMismatch { structure: usize, trajectory: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to install logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Configuration
// ============================================================================

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub ws_path: String,
    pub default_fps: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            ws_path: DEFAULT_WS_PATH.to_string(),
            default_fps: DEFAULT_FPS,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `MEGANE_BIND`, `MEGANE_WS_PATH` and
    /// `MEGANE_DEFAULT_FPS`.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let mut config = Self::default();

        if let Some(bind) = lookup(ENV_BIND) {
            config.bind_addr = bind
                .trim()
                .parse()
                .map_err(|e| ServerError::Config(format!("{ENV_BIND}={bind:?}: {e}")))?;
        }
        if let Some(path) = lookup(ENV_WS_PATH) {
            config.ws_path = path.trim().to_string();
        }
        if let Some(fps) = lookup(ENV_DEFAULT_FPS) {
            config.default_fps = fps
                .trim()
                .parse()
                .map_err(|e| ServerError::Config(format!("{ENV_DEFAULT_FPS}={fps:?}: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if !self.ws_path.starts_with('/') {
            return Err(ServerError::Config(format!(
                "websocket path {:?} must start with '/'",
                self.ws_path
            )));
        }
        if !self.default_fps.is_finite() || self.default_fps <= 0.0 {
            return Err(ServerError::Config(format!(
                "default fps must be positive, got {}",
                self.default_fps
            )));
        }
        Ok(())
    }

    pub fn playback_defaults(&self) -> PlaybackDefaults {
        PlaybackDefaults {
            fps: self.default_fps,
        }
    }
}

// ============================================================================
// Loads
// ============================================================================

/// Input to [`Coordinator::reconfigure`].
#[derive(Clone)]
pub struct Load {
    pub structure: Structure,
    pub trajectory: Option<Arc<dyn Trajectory>>,
    /// Display names of the files the load came from.
    pub source_names: Vec<String>,
}

impl Load {
    pub fn new(structure: Structure) -> Self {
        Self {
            structure,
            trajectory: None,
            source_names: Vec::new(),
        }
    }

    pub fn with_trajectory(mut self, trajectory: Arc<dyn Trajectory>) -> Self {
        self.trajectory = Some(trajectory);
        self
    }

    pub fn with_source_names(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.source_names = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Summary of a successful reconfigure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub generation: u64,
    pub n_atoms: usize,
    pub n_bonds: usize,
    pub n_frames: usize,
    /// Hex SHA-256 of the encoded Snapshot message.
    pub snapshot_sha256: String,
}

/// A load with its messages already encoded. Shared read-only by every
/// connection; replaced as a unit on reconfigure.
pub struct LoadedState {
    structure: Structure,
    trajectory: Option<Arc<dyn Trajectory>>,
    snapshot: Bytes,
    metadata: Bytes,
    summary: LoadSummary,
}

impl LoadedState {
    fn build(load: Load, generation: u64) -> Result<Self, ServerError> {
        let Load {
            structure,
            trajectory,
            source_names,
        } = load;

        let n_atoms = structure.n_atoms();
        if let Some(trajectory) = &trajectory {
            if trajectory.n_atoms() != n_atoms {
                return Err(ServerError::AtomCountMismatch {
                    structure: n_atoms,
                    trajectory: trajectory.n_atoms(),
                });
            }
        }

        let snapshot = encode_snapshot(&structure)?;

        let n_frames = trajectory.as_ref().map_or(0, |t| t.n_frames());
        let metadata = Metadata {
            n_frames: count_u32("n_frames", n_frames)?,
            timestep_ps: trajectory.as_ref().map_or(0.0, |t| t.timestep_ps()),
            n_atoms: count_u32("n_atoms", n_atoms)?,
            source_names,
        };
        let metadata = encode_metadata(&metadata)?;

        let summary = LoadSummary {
            generation,
            n_atoms,
            n_bonds: structure.n_bonds(),
            n_frames,
            snapshot_sha256: format!("{:x}", Sha256::digest(&snapshot)),
        };

        Ok(Self {
            structure,
            trajectory,
            snapshot: Bytes::from(snapshot),
            metadata: Bytes::from(metadata),
            summary,
        })
    }

    pub fn generation(&self) -> u64 {
        self.summary.generation
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    pub fn trajectory(&self) -> Option<&dyn Trajectory> {
        self.trajectory.as_deref()
    }

    /// Frame count, `None` when no trajectory is loaded.
    pub fn n_frames(&self) -> Option<usize> {
        self.trajectory.as_ref().map(|t| t.n_frames())
    }

    /// Encoded Snapshot message.
    pub fn snapshot_bytes(&self) -> &Bytes {
        &self.snapshot
    }

    /// Encoded Metadata message.
    pub fn metadata_bytes(&self) -> &Bytes {
        &self.metadata
    }

    pub fn summary(&self) -> &LoadSummary {
        &self.summary
    }
}

impl std::fmt::Debug for LoadedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedState")
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

fn count_u32(field: &'static str, value: usize) -> Result<u32, EncodeError> {
    u32::try_from(value).map_err(|_| EncodeError::CountOverflow { field, value })
}

/// Message fanned out to connection tasks.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A new load is current; push its snapshot and metadata.
    Reload(Arc<LoadedState>),
    /// The load was cleared; stop playback and forget it.
    Unload,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Shared server state: configuration, current load, connection registry.
pub struct Coordinator {
    config: ServerConfig,
    registry: ConnectionRegistry<Outbound>,
    current: RwLock<Option<Arc<LoadedState>>>,
    /// Serializes reconfigure/clear and holds the last issued generation.
    generation: Mutex<u64>,
}

impl Coordinator {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            current: RwLock::new(None),
            generation: Mutex::new(0),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry<Outbound> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// The current load, if any.
    pub fn current(&self) -> Option<Arc<LoadedState>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current load and push it to every connection.
    ///
    /// The load is validated and encoded before anything is swapped, so on
    /// error the previous load stays current and nothing is broadcast.
    /// Encoding is CPU work; async callers with large loads should run this
    /// on a blocking thread.
    pub fn reconfigure(&self, load: Load) -> Result<LoadSummary, ServerError> {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);

        let state = Arc::new(LoadedState::build(load, *generation + 1)?);
        *generation = state.generation();
        self.set_current(Some(state.clone()));

        let report = self.registry.broadcast(&Outbound::Reload(state.clone()));
        let summary = state.summary().clone();
        info!(
            generation = summary.generation,
            n_atoms = summary.n_atoms,
            n_bonds = summary.n_bonds,
            n_frames = summary.n_frames,
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "reconfigured"
        );
        Ok(summary)
    }

    /// Drop the current load. Connections stop playback; later connections
    /// receive nothing until the next reconfigure.
    pub fn clear(&self) -> BroadcastReport {
        let _generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        self.set_current(None);
        let report = self.registry.broadcast(&Outbound::Unload);
        info!(delivered = report.delivered, "load cleared");
        report
    }

    fn set_current(&self, state: Option<Arc<LoadedState>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

// ============================================================================
// Tests
// ============================================================================
