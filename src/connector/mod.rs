//! Transport connectors: lifecycle plumbing shared by the persistent
//! WebSocket channel and the one-shot HTTPS mission.
//!
//! A connector is created per (deployment, session) pair and owns a single
//! transport. Persistent connectors run a reconnect loop on a dedicated
//! task; ephemeral connectors perform one connect–send–close mission.
//! Teardown is cooperative: a stop flag polled between ticks, never a
//! forced abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use thiserror::Error;
use tokio::time::Instant;

mod ephemeral;
mod persistent;

pub use ephemeral::{EphemeralConfig, EphemeralConnector};
pub use persistent::{ConnectorEvent, PersistentConfig, PersistentConnector};

/// Connector lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    /// No channel and not trying to open one
    Disconnected,
    /// Channel establishment in progress
    Connecting,
    /// Live channel
    Connected,
    /// Stop observed, teardown running
    Stopping,
    /// Terminal clean state
    Stopped,
    /// Terminal failure state
    Error,
}

/// Transport-path failures.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// Peer presented a key that does not match the expected pin. Fatal;
    /// never retried.
    #[error("SPKI pin mismatch: expected {expected}, presented {presented}")]
    SpkiMismatch {
        /// Pin the profile expects
        expected: String,
        /// Pin the peer presented
        presented: String,
    },

    /// Required TLS material absent or undecodable. Fatal.
    #[error("missing TLS material: {0}")]
    MissingTlsMaterial(String),

    /// Endpoint URL unusable
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Connect or receive deadline elapsed
    #[error("socket timeout")]
    SocketTimeout,

    /// Peer dropped or reset the channel
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// TLS-level failure other than a pin mismatch
    #[error("TLS failure: {0}")]
    Tls(String),

    /// Remote rejected the delivery at the HTTP layer
    #[error("delivery rejected: HTTP {0}")]
    Rejected(u16),

    /// Connector is stopped or its command channel is gone
    #[error("channel closed")]
    ChannelClosed,

    /// Send could not be completed
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl ConnectorError {
    /// Fatal errors abort instead of entering the reconnect path.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectorError::SpkiMismatch { .. } | ConnectorError::MissingTlsMaterial(_)
        )
    }
}

/// Result type alias for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// State shared between a connector's owner and its worker task.
#[derive(Debug)]
pub struct ChannelContext {
    channel_name: String,
    status: RwLock<ConnectorStatus>,
    last_heartbeat: Mutex<Option<Instant>>,
    stop: AtomicBool,
    closed: AtomicBool,
}

impl ChannelContext {
    pub(crate) fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            status: RwLock::new(ConnectorStatus::Disconnected),
            last_heartbeat: Mutex::new(None),
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Human-readable channel name, used in events and logs.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ConnectorStatus {
        *self.status.read().expect("status lock")
    }

    pub(crate) fn set_status(&self, status: ConnectorStatus) {
        *self.status.write().expect("status lock") = status;
    }

    /// Instant of the last successful receive or keepalive on the channel.
    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.last_heartbeat.lock().expect("heartbeat lock")
    }

    pub(crate) fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("heartbeat lock") = Some(Instant::now());
    }

    /// Request a cooperative stop. Takes effect within one loop tick.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// First caller wins; later calls see `false` and do nothing. This is
    /// what makes `close()` idempotent across concurrent teardown paths.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Whether close has been initiated.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
