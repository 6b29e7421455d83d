//! Events emitted by a connection group to its observers.

use serde_json::Value;

use crate::group::GroupStatus;

/// Everything an observer can learn from a connection group: status
/// transitions, channel health, verified inbound commands, and raw
/// unverifiable messages tagged for diagnostic display only.
#[derive(Debug)]
pub enum LinkEvent {
    /// Group state machine transition
    StatusChanged {
        /// New status
        status: GroupStatus,
        /// Human-readable reason, present on error transitions
        reason: Option<String>,
    },
    /// A transport channel came up
    Connected {
        /// Channel name
        channel: String,
    },
    /// A transport channel went down (reconnection may follow)
    Disconnected {
        /// Channel name
        channel: String,
        /// Why
        reason: String,
    },
    /// A reconnect attempt is scheduled
    Reconnecting {
        /// Channel name
        channel: String,
        /// Consecutive failure count
        attempt: u32,
    },
    /// A verified inbound message with no matching pending request
    Command {
        /// Envelope handler
        handler: String,
        /// Envelope content
        content: Value,
        /// Envelope timestamp
        ts: f64,
    },
    /// An inbound message that failed verification. Diagnostic display
    /// only; the content must not be trusted.
    Unverified {
        /// Raw message body
        raw: String,
        /// Why verification rejected it
        reason: String,
    },
    /// An unrecoverable group-level failure
    Error {
        /// Human-readable reason
        reason: String,
    },
}
