//! Connection groups: the per-deployment connect/bind state machine.
//!
//! A [`ConnectionGroup`] owns the transports for one remote deployment: a
//! persistent WebSocket channel (primary) and optionally an ephemeral HTTPS
//! sender (secondary). `connect()` probes the remote identity, verifies its
//! SPKI pin against the cert profile, binds the transports, and only then
//! reports `Bound`. Outbound commands are correlated with their replies
//! through a pending-request map keyed by minted request ids.
//!
//! # Example
//!
//! ```rust,ignore
//! use swarmlink::group::{ConnectionGroup, GroupConfig, SendOptions};
//! use swarmlink::profile::{CertProfile, SigningKeyset};
//! use futures_util::StreamExt;
//! use serde_json::json;
//!
//! let profile = CertProfile::pin_only(expected_pin)
//!     .with_remote_signing_key(node_pub_pem);
//! let (group, mut events) = ConnectionGroup::new(
//!     GroupConfig::new("node-1", "wss://node-1.swarm.local:8443/channel"),
//!     profile,
//! );
//! group.connect().await?;
//!
//! while let Some(event) = events.next().await {
//!     // status transitions, verified commands, diagnostics
//! }
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use pin_project_lite::pin_project;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connector::{
    ConnectorError, ConnectorEvent, EphemeralConfig, EphemeralConnector, PersistentConfig,
    PersistentConnector,
};
use crate::envelope::{self, Envelope, SigAlg, VerifyOptions};
use crate::network::{parse_endpoint, Endpoint};
use crate::pinning::{capturing_client_config, extract_pin, pinned_client_config, PinError};
use crate::profile::{CertProfile, SigningKeyset};

mod events;
mod registry;

pub use events::LinkEvent;
pub use registry::GroupRegistry;

/// Wire field carrying the correlation id.
pub const REQUEST_ID_FIELD: &str = "req_id";

/// Group state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// No transports; the resting state
    Idle,
    /// Identity probe and bind in progress
    Probing,
    /// Transports bound; commands may be sent
    Bound,
    /// Probe or bind failed; retry is an explicit caller action
    Error,
}

/// Group-level failures.
#[derive(Debug, Error)]
pub enum GroupError {
    /// Operation requires the group to be `Bound`
    #[error("connection group is not bound")]
    NotBound,

    /// `connect()` while already probing or bound
    #[error("connection group is already active")]
    AlreadyActive,

    /// Command content must be a JSON object
    #[error("content is not a JSON object")]
    BadContent,

    /// The identity probe could not read the remote certificate
    #[error("identity probe failed: {0}")]
    Probe(String),

    /// The probed identity does not match the expected pin
    #[error("SPKI pin mismatch: expected {expected}, presented {presented}")]
    SpkiMismatch {
        /// Pin the profile expects
        expected: String,
        /// Pin the remote presented
        presented: String,
    },

    /// TLS material problems
    #[error(transparent)]
    Pin(#[from] PinError),

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] ConnectorError),

    /// Envelope sealing failure
    #[error("sealing failed: {0}")]
    Seal(String),

    /// Primary transport did not come up within the bind timeout
    #[error("bind timed out")]
    BindTimeout,

    /// No secondary transport was configured
    #[error("no secondary transport configured")]
    NoSecondaryTransport,
}

/// Result type alias for group operations.
pub type GroupResult<T> = Result<T, GroupError>;

/// Callback invoked with the verified reply envelope. Fires at most once.
pub type ReplyCallback = Box<dyn FnOnce(Value) + Send + 'static>;

/// Connection group configuration.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Deployment id; also the registry key
    pub deployment_id: String,
    /// Primary (persistent WebSocket) endpoint
    pub primary_url: String,
    /// Secondary (ephemeral HTTPS) endpoint
    pub secondary_url: Option<String>,
    /// Persistent connector tuning (its `url` is filled from `primary_url`)
    pub persistent: PersistentConfig,
    /// Verification options applied to inbound envelopes
    pub verify: VerifyOptions,
    /// Bound on the identity probe (seconds)
    pub probe_timeout_secs: u64,
    /// Bound on the initial primary bind (seconds)
    pub bind_timeout_secs: u64,
    /// Capacity of the observer event channel
    pub event_channel_capacity: usize,
}

impl GroupConfig {
    /// Config for a deployment with default tuning.
    pub fn new(deployment_id: impl Into<String>, primary_url: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            primary_url: primary_url.into(),
            secondary_url: None,
            persistent: PersistentConfig::default(),
            verify: VerifyOptions::default(),
            probe_timeout_secs: 10,
            bind_timeout_secs: 30,
            event_channel_capacity: 1000,
        }
    }

    /// Add a secondary ephemeral HTTPS endpoint.
    pub fn with_secondary_url(mut self, url: impl Into<String>) -> Self {
        self.secondary_url = Some(url.into());
        self
    }

    /// Override inbound verification options.
    pub fn with_verify(mut self, verify: VerifyOptions) -> Self {
        self.verify = verify;
        self
    }
}

/// Per-send sealing options.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Sign the envelope (outer shell too, when encrypting)
    pub sign: bool,
    /// Hybrid-encrypt and nest inside an `external_embedded` shell
    pub encrypt: bool,
    /// Signature algorithm
    pub alg: SigAlg,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            sign: true,
            encrypt: false,
            alg: SigAlg::default(),
        }
    }
}

impl SendOptions {
    /// Sign and encrypt.
    pub fn encrypted() -> Self {
        Self {
            sign: true,
            encrypt: true,
            alg: SigAlg::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct GroupState {
    status: GroupStatus,
    reason: Option<String>,
}

struct GroupShared {
    config: GroupConfig,
    profile: CertProfile,
    state: StdRwLock<GroupState>,
    pending: StdMutex<HashMap<String, ReplyCallback>>,
    primary: Mutex<Option<PersistentConnector>>,
    secondary: Mutex<Option<EphemeralConnector>>,
    event_tx: mpsc::Sender<LinkEvent>,
    connect_task: Mutex<Option<JoinHandle<()>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
}

/// Handle to a connection group. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnectionGroup {
    shared: Arc<GroupShared>,
}

pin_project! {
    /// Observer stream of [`LinkEvent`]s for one connection group.
    pub struct LinkEvents {
        #[pin]
        rx: mpsc::Receiver<LinkEvent>,
    }
}

impl Stream for LinkEvents {
    type Item = LinkEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        this.rx.poll_recv(cx)
    }
}

impl ConnectionGroup {
    /// Create a group for one remote deployment, returning the handle and
    /// its observer event stream.
    pub fn new(config: GroupConfig, profile: CertProfile) -> (Self, LinkEvents) {
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let shared = Arc::new(GroupShared {
            config,
            profile,
            state: StdRwLock::new(GroupState {
                status: GroupStatus::Idle,
                reason: None,
            }),
            pending: StdMutex::new(HashMap::new()),
            primary: Mutex::new(None),
            secondary: Mutex::new(None),
            event_tx,
            connect_task: Mutex::new(None),
            pump_task: Mutex::new(None),
            closing: AtomicBool::new(false),
        });
        (Self { shared }, LinkEvents { rx: event_rx })
    }

    /// Deployment id.
    pub fn id(&self) -> &str {
        &self.shared.config.deployment_id
    }

    /// Current state machine status.
    pub fn status(&self) -> GroupStatus {
        self.shared.state.read().expect("state lock").status
    }

    /// Reason attached to the last `Error` transition, if any.
    pub fn status_reason(&self) -> Option<String> {
        self.shared.state.read().expect("state lock").reason.clone()
    }

    /// Number of requests awaiting replies.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().expect("pending lock").len()
    }

    /// Start connecting: identity probe, pin check, transport bind. Runs on
    /// a spawned task so the caller never blocks on network I/O; the
    /// outcome arrives as a [`LinkEvent::StatusChanged`]. Failures park the
    /// group in `Error` — retrying is an explicit caller action (call
    /// `connect()` again).
    pub async fn connect(&self) -> GroupResult<()> {
        {
            let mut state = self.shared.state.write().expect("state lock");
            match state.status {
                GroupStatus::Probing | GroupStatus::Bound => return Err(GroupError::AlreadyActive),
                GroupStatus::Idle | GroupStatus::Error => {}
            }
            *state = GroupState {
                status: GroupStatus::Probing,
                reason: None,
            };
        }
        self.shared.emit(LinkEvent::StatusChanged {
            status: GroupStatus::Probing,
            reason: None,
        });

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            match GroupShared::run_connect(&shared).await {
                Ok(()) => {
                    if shared.closing.load(Ordering::SeqCst) {
                        shared.teardown_transports().await;
                        shared.set_state(GroupStatus::Idle, None);
                        return;
                    }
                    tracing::info!(deployment = %shared.config.deployment_id, "bound");
                    shared.set_state(GroupStatus::Bound, None);
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!(
                        deployment = %shared.config.deployment_id,
                        "connect failed: {reason}"
                    );
                    shared.teardown_transports().await;
                    shared.set_state(GroupStatus::Error, Some(reason));
                }
            }
        });
        *self.shared.connect_task.lock().await = Some(task);
        Ok(())
    }

    /// Seal and transmit a command on the primary transport, registering
    /// `on_reply` for correlation when provided. Returns the minted request
    /// id. Rejected outright — pending map untouched — unless `Bound`.
    pub async fn send_cmd(
        &self,
        handler: &str,
        content: Value,
        keyset: &SigningKeyset,
        options: &SendOptions,
        on_reply: Option<ReplyCallback>,
    ) -> GroupResult<String> {
        if self.status() != GroupStatus::Bound {
            return Err(GroupError::NotBound);
        }
        let Value::Object(mut map) = content else {
            return Err(GroupError::BadContent);
        };
        let request_id = Uuid::new_v4().to_string();
        map.insert(REQUEST_ID_FIELD.to_string(), Value::from(request_id.clone()));

        let wire = build_wire(handler, Value::Object(map), keyset, options)?;

        if let Some(callback) = on_reply {
            self.shared
                .pending
                .lock()
                .expect("pending lock")
                .insert(request_id.clone(), callback);
        }

        let guard = self.shared.primary.lock().await;
        let connector = guard.as_ref().ok_or(GroupError::NotBound)?;
        match connector.send_text(wire).await {
            Ok(()) => Ok(request_id),
            Err(e) => {
                self.shared
                    .pending
                    .lock()
                    .expect("pending lock")
                    .remove(&request_id);
                Err(e.into())
            }
        }
    }

    /// Seal and deliver a command as one ephemeral HTTPS mission on the
    /// secondary transport. No correlation; failure aborts the mission.
    pub async fn send_fire_and_forget(
        &self,
        handler: &str,
        content: Value,
        keyset: &SigningKeyset,
        options: &SendOptions,
    ) -> GroupResult<()> {
        if self.status() != GroupStatus::Bound {
            return Err(GroupError::NotBound);
        }
        if !content.is_object() {
            return Err(GroupError::BadContent);
        }
        let wire = build_wire(handler, content, keyset, options)?;

        let guard = self.shared.secondary.lock().await;
        let connector = guard.as_ref().ok_or(GroupError::NoSecondaryTransport)?;
        connector.send_one(wire).await.map_err(GroupError::from)
    }

    /// Tear down transports and return to `Idle`. Safe from any state and
    /// callable concurrently with a running `connect()`; outstanding reply
    /// callbacks are dropped.
    pub async fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);

        let connect_task = self.shared.connect_task.lock().await.take();
        if let Some(task) = connect_task {
            // Bounded by the probe and bind timeouts.
            let _ = task.await;
        }

        self.shared.teardown_transports().await;

        let pump_task = self.shared.pump_task.lock().await.take();
        if let Some(task) = pump_task {
            let _ = task.await;
        }

        self.shared.pending.lock().expect("pending lock").clear();
        self.shared.set_state(GroupStatus::Idle, None);
        self.shared.closing.store(false, Ordering::SeqCst);
    }
}

impl GroupShared {
    fn set_state(&self, status: GroupStatus, reason: Option<String>) {
        *self.state.write().expect("state lock") = GroupState {
            status,
            reason: reason.clone(),
        };
        self.emit(LinkEvent::StatusChanged { status, reason });
    }

    fn emit(&self, event: LinkEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(dropped) => {
                    tracing::warn!(
                        deployment = %self.config.deployment_id,
                        "event channel full, dropping {:?}",
                        std::mem::discriminant(&dropped)
                    );
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!(
                        deployment = %self.config.deployment_id,
                        "event receiver dropped"
                    );
                }
            }
        }
    }

    async fn teardown_transports(&self) {
        if let Some(primary) = self.primary.lock().await.take() {
            primary.close().await;
        }
        if let Some(secondary) = self.secondary.lock().await.take() {
            secondary.close();
        }
    }

    /// The connect sequence: TLS material, identity probe, pin check,
    /// primary bind, secondary construction, inbound pump.
    async fn run_connect(shared: &Arc<Self>) -> GroupResult<()> {
        let (tls, verifier) = pinned_client_config(&shared.profile)?;
        let tls = Arc::new(tls);

        // Identity probe: read the peer certificate and verify its pin
        // before committing any transport.
        let endpoint = parse_endpoint(&shared.config.primary_url)?;
        let presented = probe_identity(
            &endpoint,
            Duration::from_secs(shared.config.probe_timeout_secs),
        )
        .await?;
        if presented != shared.profile.expected_pin {
            return Err(GroupError::SpkiMismatch {
                expected: shared.profile.expected_pin.clone(),
                presented,
            });
        }
        tracing::debug!(
            deployment = %shared.config.deployment_id,
            "identity probe passed"
        );

        // Bind the primary persistent transport. The first establishment
        // reports exactly once; on failure the group goes to Error and the
        // caller decides whether to retry.
        let (conn_tx, conn_rx) = mpsc::channel(shared.config.event_channel_capacity);
        let mut persistent_config = shared.config.persistent.clone();
        persistent_config.url = shared.config.primary_url.clone();
        let (connector, ready) =
            PersistentConnector::spawn(persistent_config, tls.clone(), verifier.clone(), conn_tx);

        let bound = tokio::time::timeout(
            Duration::from_secs(shared.config.bind_timeout_secs),
            ready,
        )
        .await;
        match bound {
            Err(_) => {
                connector.close().await;
                return Err(GroupError::BindTimeout);
            }
            Ok(Err(_)) => {
                connector.close().await;
                return Err(GroupError::Transport(ConnectorError::ChannelClosed));
            }
            Ok(Ok(Err(e))) => {
                connector.close().await;
                return Err(GroupError::Transport(e));
            }
            Ok(Ok(Ok(()))) => {}
        }
        *shared.primary.lock().await = Some(connector);

        if let Some(secondary_url) = &shared.config.secondary_url {
            let connector = EphemeralConnector::new(
                EphemeralConfig::new(secondary_url.clone()),
                tls,
                verifier,
            );
            *shared.secondary.lock().await = Some(connector);
        }

        let pump_shared = shared.clone();
        let pump = tokio::spawn(async move { pump_shared.pump(conn_rx).await });
        *shared.pump_task.lock().await = Some(pump);

        Ok(())
    }

    /// Forward connector events to observers and route inbound messages.
    async fn pump(self: Arc<Self>, mut conn_rx: mpsc::Receiver<ConnectorEvent>) {
        while let Some(event) = conn_rx.recv().await {
            match event {
                ConnectorEvent::ChannelUp { channel } => {
                    self.emit(LinkEvent::Connected { channel });
                }
                ConnectorEvent::ChannelDown { channel, reason } => {
                    self.emit(LinkEvent::Disconnected { channel, reason });
                }
                ConnectorEvent::Retrying { channel, attempt } => {
                    self.emit(LinkEvent::Reconnecting { channel, attempt });
                }
                ConnectorEvent::Fatal { channel, error } => {
                    let reason = error.to_string();
                    tracing::error!(
                        deployment = %self.config.deployment_id,
                        %channel,
                        "transport failed: {reason}"
                    );
                    self.set_state(GroupStatus::Error, Some(reason.clone()));
                    self.emit(LinkEvent::Error { reason });
                }
                ConnectorEvent::Message { text, .. } => self.handle_inbound(text),
            }
        }
    }

    /// Verify an inbound message, then correlate or forward it. Rejected
    /// messages are surfaced for diagnostics only — never trusted, never
    /// silently dropped, and never fatal to the connector.
    fn handle_inbound(&self, text: String) {
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => {
                self.emit(LinkEvent::Unverified {
                    raw: text,
                    reason: "not valid JSON".to_string(),
                });
                return;
            }
        };

        let Some(remote_pub_pem) = &self.profile.remote_signing_pub_pem else {
            self.emit(LinkEvent::Unverified {
                raw: text,
                reason: "no remote signing key configured".to_string(),
            });
            return;
        };

        if let Err(e) = envelope::verify(&value, remote_pub_pem, &self.config.verify) {
            tracing::warn!(
                deployment = %self.config.deployment_id,
                "inbound verification rejected: {e}"
            );
            self.emit(LinkEvent::Unverified {
                raw: text,
                reason: e.to_string(),
            });
            return;
        }

        // Correlation id may sit at the top level or nested in content.
        let request_id = value
            .get(REQUEST_ID_FIELD)
            .and_then(Value::as_str)
            .or_else(|| {
                value
                    .get("content")
                    .and_then(|content| content.get(REQUEST_ID_FIELD))
                    .and_then(Value::as_str)
            })
            .map(str::to_string);

        if let Some(request_id) = &request_id {
            // Lookup and removal share one critical section so the callback
            // can fire at most once.
            let callback = self
                .pending
                .lock()
                .expect("pending lock")
                .remove(request_id);
            if let Some(callback) = callback {
                callback(value);
                return;
            }
        }

        let handler = value
            .get("handler")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ts = value.get("ts").and_then(Value::as_f64).unwrap_or_default();
        let content = value.get("content").cloned().unwrap_or(Value::Null);
        self.emit(LinkEvent::Command {
            handler,
            content,
            ts,
        });
    }
}

/// Seal a command into its wire form according to the send options.
fn build_wire(
    handler: &str,
    content: Value,
    keyset: &SigningKeyset,
    options: &SendOptions,
) -> GroupResult<String> {
    let inner = if let Some(inner_key) = &keyset.inner_key {
        envelope::seal(
            handler,
            content,
            inner_key,
            options.alg,
            keyset.inner_kid.as_deref(),
        )
        .map_err(|e| GroupError::Seal(e.to_string()))?
    } else if !options.sign && !options.encrypt {
        // Unsigned, unencrypted passthrough: trusted loop-back paths only.
        Envelope {
            ts: envelope_now()?,
            handler: handler.to_string(),
            content,
            sig: None,
            salg: None,
            ikid: None,
            okid: None,
        }
    } else {
        return Err(GroupError::Seal(
            "inner signing key required".to_string(),
        ));
    };

    let envelope = if options.encrypt {
        let outer_key = keyset.outer_key.as_ref().or(keyset.inner_key.as_ref());
        let secure = envelope::SecureOptions {
            sign: options.sign,
            encrypt: true,
            outer_alg: options.alg,
            outer_kid: keyset.outer_kid.clone(),
            recipient_kid: keyset.recipient_kid.clone(),
        };
        envelope::wrap_secure(&inner, keyset.recipient_pub.as_ref(), outer_key, &secure)
            .map_err(|e| GroupError::Seal(e.to_string()))?
    } else {
        inner
    };

    envelope
        .to_wire_string()
        .map_err(|e| GroupError::Seal(e.to_string()))
}

fn envelope_now() -> GroupResult<f64> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .map_err(|_| GroupError::Seal("system time before epoch".to_string()))
}

/// Read the remote's certificate over a raw TLS handshake and return its
/// SPKI pin. Uses a capture-only verifier; nothing is trusted here — the
/// caller compares the pin before any transport is bound.
async fn probe_identity(endpoint: &Endpoint, timeout: Duration) -> GroupResult<String> {
    let config = capturing_client_config()?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let tcp = tokio::time::timeout(
        timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| GroupError::Probe("connect timed out".to_string()))?
    .map_err(|e| GroupError::Probe(e.to_string()))?;

    let server_name = rustls::pki_types::ServerName::try_from(endpoint.host.clone())
        .map_err(|e| GroupError::Probe(e.to_string()))?;

    let stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| GroupError::Probe("handshake timed out".to_string()))?
        .map_err(|e| GroupError::Probe(e.to_string()))?;

    let (_, session) = stream.get_ref();
    let cert = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| GroupError::Probe("peer presented no certificate".to_string()))?;

    extract_pin(cert.as_ref()).map_err(|e| GroupError::Probe(e.to_string()))
}
