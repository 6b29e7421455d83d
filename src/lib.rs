//! # Swarmlink
//!
//! Secure transport core for a cockpit exchanging commands with remote,
//! semi-trusted swarm nodes over untrusted networks.
//!
//! ## Modules
//!
//! This crate provides four main modules:
//! - [`envelope`]: canonical signing, hybrid sealing, and verification of
//!   command envelopes
//! - [`pinning`]: SPKI pin extraction and pin-anchored TLS configuration
//! - [`connector`]: persistent (long-lived WebSocket) and ephemeral
//!   (one-shot HTTPS) transport connectors
//! - [`group`]: the per-deployment connect/bind state machine with
//!   request/response correlation
//!
//! Plus supporting modules:
//! - [`profile`]: vault-supplied certificate and key material
//! - [`network`]: endpoint parsing and defaults
//!
//! ## Trust model
//!
//! Swarm nodes use self-issued certificates. Channel trust is anchored
//! exclusively on SPKI pins — CA-chain and hostname validation are
//! intentionally disabled for swarm channels. See [`pinning`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use swarmlink::prelude::*;
//! use futures_util::StreamExt;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profile = CertProfile::pin_only(expected_pin)
//!         .with_remote_signing_key(node_signing_pub_pem);
//!
//!     let (group, mut events) = ConnectionGroup::new(
//!         GroupConfig::new("node-1", "wss://node-1.swarm.local:8443/channel"),
//!         profile,
//!     );
//!     group.connect().await?;
//!
//!     let keyset = SigningKeyset::signer(cockpit_signing_key);
//!     group
//!         .send_cmd(
//!             "cmd_ping",
//!             json!({}),
//!             &keyset,
//!             &SendOptions::default(),
//!             Some(Box::new(|reply| println!("reply: {reply}"))),
//!         )
//!         .await?;
//!
//!     while let Some(event) = events.next().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

// ============================================================================
// MODULES
// ============================================================================

/// Packet envelope protocol: canonical signing, hybrid sealing, verification.
pub mod envelope;

/// Transport connectors: persistent WebSocket loop and one-shot HTTPS
/// missions.
pub mod connector;

/// Connection groups: per-deployment state machine and request correlation.
pub mod group;

/// Endpoint parsing and network defaults.
pub mod network;

/// SPKI pin extraction and pin-anchored TLS configuration.
pub mod pinning;

/// Vault-supplied certificate and key material.
pub mod profile;

// ============================================================================
// PRELUDE
// ============================================================================

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use swarmlink::prelude::*;
/// ```
pub mod prelude {
    // Envelope exports
    pub use crate::envelope::{
        open_secure, seal, verify, wrap_secure, Envelope, SealError, SealedContent, SecureError,
        SecureOptions, SigAlg, VerifyError, VerifyOptions, COMMAND_PREFIX,
        EXTERNAL_EMBEDDED_HANDLER,
    };

    // Pinning exports
    pub use crate::pinning::{
        extract_pin, pinned_client_config, verify_pin, PinError, PinnedServerVerifier,
    };

    // Connector exports
    pub use crate::connector::{
        ConnectorError, ConnectorEvent, ConnectorResult, ConnectorStatus, EphemeralConfig,
        EphemeralConnector, PersistentConfig, PersistentConnector,
    };

    // Group exports
    pub use crate::group::{
        ConnectionGroup, GroupConfig, GroupError, GroupRegistry, GroupResult, GroupStatus,
        LinkEvent, LinkEvents, ReplyCallback, SendOptions,
    };

    // Profile exports
    pub use crate::profile::{
        decode_rsa_private_key_pem, decode_rsa_public_key_pem, key_fingerprint, CertProfile,
        KeyMaterialError, SigningKeyset,
    };

    // Network exports
    pub use crate::network::{parse_endpoint, Endpoint};
}
