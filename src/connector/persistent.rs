//! Persistent WebSocket connector: a long-lived channel with reconnection.
//!
//! The worker task runs a tick loop: with no live channel it attempts to
//! establish one over pin-verified TLS, backing off a fixed delay plus
//! jitter on failure; with a live channel it performs one bounded receive
//! per tick, forwards inbound text, and refreshes the heartbeat. A stream
//! end or receive error marks the channel dead and forces reconnection.
//! The stop flag is observed between ticks.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};

use crate::connector::{ChannelContext, ConnectorError, ConnectorResult, ConnectorStatus};
use crate::pinning::PinnedServerVerifier;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Persistent connector configuration.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// WebSocket endpoint (`wss://…`)
    pub url: String,
    /// Channel name used in events and logs
    pub channel_name: String,
    /// Fixed reconnect delay (ms)
    pub reconnect_delay_ms: u64,
    /// Uniform jitter added to the reconnect delay (ms)
    pub reconnect_jitter_ms: u64,
    /// Bound on a single receive tick (seconds)
    pub recv_timeout_secs: u64,
    /// Bound on channel establishment (seconds)
    pub connect_timeout_secs: u64,
    /// Capacity of the outbound command channel
    pub command_channel_capacity: usize,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            channel_name: "primary".to_string(),
            reconnect_delay_ms: 5_000,
            reconnect_jitter_ms: 2_000,
            recv_timeout_secs: 30,
            connect_timeout_secs: 15,
            command_channel_capacity: 100,
        }
    }
}

impl PersistentConfig {
    /// Config for the given endpoint with default timing.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Name the channel.
    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }
}

/// Events a connector forwards to its owner.
#[derive(Debug)]
pub enum ConnectorEvent {
    /// Channel established
    ChannelUp {
        /// Channel name
        channel: String,
    },
    /// Channel lost; the loop will attempt reconnection
    ChannelDown {
        /// Channel name
        channel: String,
        /// Why the channel went down
        reason: String,
    },
    /// Reconnect attempt scheduled
    Retrying {
        /// Channel name
        channel: String,
        /// Consecutive failure count
        attempt: u32,
    },
    /// Inbound text message
    Message {
        /// Channel name
        channel: String,
        /// Raw message body
        text: String,
    },
    /// Unrecoverable failure; the loop has terminated
    Fatal {
        /// Channel name
        channel: String,
        /// The failure
        error: ConnectorError,
    },
}

/// Internal commands from the handle to the worker task.
enum ConnectorCommand {
    Send(String),
    Close,
}

/// Handle to a running persistent connector.
pub struct PersistentConnector {
    ctx: Arc<ChannelContext>,
    cmd_tx: mpsc::Sender<ConnectorCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentConnector {
    /// Spawn the worker task. The returned receiver resolves exactly once
    /// with the outcome of the *initial* channel establishment: the owner
    /// binds on `Ok` and must not auto-retry on `Err`. Reconnection applies
    /// only after a successful bind.
    pub fn spawn(
        config: PersistentConfig,
        tls: Arc<rustls::ClientConfig>,
        verifier: Arc<PinnedServerVerifier>,
        event_tx: mpsc::Sender<ConnectorEvent>,
    ) -> (Self, oneshot::Receiver<ConnectorResult<()>>) {
        let ctx = Arc::new(ChannelContext::new(config.channel_name.clone()));
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(run_loop(
            config,
            tls,
            verifier,
            ctx.clone(),
            cmd_rx,
            event_tx,
            ready_tx,
        ));

        (
            Self {
                ctx,
                cmd_tx,
                task: Mutex::new(Some(task)),
            },
            ready_rx,
        )
    }

    /// Shared lifecycle context (status, heartbeat).
    pub fn context(&self) -> &Arc<ChannelContext> {
        &self.ctx
    }

    /// Current status.
    pub fn status(&self) -> ConnectorStatus {
        self.ctx.status()
    }

    /// Queue a text frame for transmission on the live channel.
    pub async fn send_text(&self, text: String) -> ConnectorResult<()> {
        if self.ctx.is_closed() {
            return Err(ConnectorError::ChannelClosed);
        }
        self.cmd_tx
            .send(ConnectorCommand::Send(text))
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }

    /// Stop the worker cooperatively and wait for it to finish.
    ///
    /// Idempotent: teardown can race in from explicit close, group
    /// disconnect, and error handling; only the first call acts.
    pub async fn close(&self) {
        if !self.ctx.begin_close() {
            return;
        }
        self.ctx.request_stop();
        // Wake the loop if it is parked on the command channel.
        let _ = self.cmd_tx.send(ConnectorCommand::Close).await;
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::debug!(channel = %self.ctx.channel_name(), "connector task join: {e}");
            }
        }
    }
}

async fn run_loop(
    config: PersistentConfig,
    tls: Arc<rustls::ClientConfig>,
    verifier: Arc<PinnedServerVerifier>,
    ctx: Arc<ChannelContext>,
    mut cmd_rx: mpsc::Receiver<ConnectorCommand>,
    event_tx: mpsc::Sender<ConnectorEvent>,
    ready_tx: oneshot::Sender<ConnectorResult<()>>,
) {
    let recv_timeout = Duration::from_secs(config.recv_timeout_secs);
    let mut ready = Some(ready_tx);
    let mut attempt = 0u32;
    let mut channel: Option<(WsSink, WsSource)> = None;

    loop {
        // Stop flag is polled between ticks; cancellation is cooperative.
        if ctx.stop_requested() {
            if let Some(tx) = ready.take() {
                let _ = tx.send(Err(ConnectorError::ChannelClosed));
            }
            break;
        }

        let Some((mut sink, mut source)) = channel.take() else {
            ctx.set_status(ConnectorStatus::Connecting);
            match establish(&config, &tls, &verifier).await {
                Ok(streams) => {
                    channel = Some(streams);
                    attempt = 0;
                    ctx.set_status(ConnectorStatus::Connected);
                    ctx.touch_heartbeat();
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                    emit(
                        &event_tx,
                        ConnectorEvent::ChannelUp {
                            channel: ctx.channel_name().to_string(),
                        },
                    );
                }
                Err(e) => {
                    // Initial establishment failure is the owner's decision
                    // to retry; fatal errors are never retried.
                    if let Some(tx) = ready.take() {
                        ctx.set_status(ConnectorStatus::Error);
                        let _ = tx.send(Err(e));
                        return;
                    }
                    if e.is_fatal() {
                        tracing::error!(channel = %ctx.channel_name(), "fatal transport failure: {e}");
                        ctx.set_status(ConnectorStatus::Error);
                        emit(
                            &event_tx,
                            ConnectorEvent::Fatal {
                                channel: ctx.channel_name().to_string(),
                                error: e,
                            },
                        );
                        return;
                    }
                    attempt += 1;
                    tracing::warn!(
                        channel = %ctx.channel_name(),
                        attempt,
                        "channel establishment failed: {e}"
                    );
                    emit(
                        &event_tx,
                        ConnectorEvent::Retrying {
                            channel: ctx.channel_name().to_string(),
                            attempt,
                        },
                    );
                    // Fixed delay plus uniform jitter so simultaneous
                    // failures across connectors do not retry in lockstep.
                    let jitter = rand::thread_rng().gen_range(0..=config.reconnect_jitter_ms);
                    tokio::time::sleep(Duration::from_millis(config.reconnect_delay_ms + jitter))
                        .await;
                }
            }
            continue;
        };

        // One tick on the live channel: either a command or one bounded
        // receive. `dead` carries the reason when the channel is lost.
        let mut dead: Option<String> = None;
        let mut close_requested = false;

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnectorCommand::Send(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        tracing::warn!(channel = %ctx.channel_name(), "send failed: {e}");
                        dead = Some(format!("send failed: {e}"));
                    }
                }
                Some(ConnectorCommand::Close) | None => close_requested = true,
            },
            received = tokio::time::timeout(recv_timeout, source.next()) => match received {
                // Bounded receive elapsed without traffic; the tick ends so
                // the stop flag gets another look.
                Err(_) => {}
                Ok(Some(Ok(Message::Text(text)))) => {
                    ctx.touch_heartbeat();
                    emit(
                        &event_tx,
                        ConnectorEvent::Message {
                            channel: ctx.channel_name().to_string(),
                            text: text.to_string(),
                        },
                    );
                }
                Ok(Some(Ok(Message::Ping(payload)))) => {
                    ctx.touch_heartbeat();
                    if let Err(e) = sink.send(Message::Pong(payload)).await {
                        tracing::warn!(channel = %ctx.channel_name(), "pong failed: {e}");
                    }
                }
                Ok(Some(Ok(Message::Pong(_)))) => {
                    ctx.touch_heartbeat();
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    let reason = frame
                        .map(|f| format!("code {}, reason: {}", f.code, f.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    tracing::info!(channel = %ctx.channel_name(), "channel closed by peer: {reason}");
                    dead = Some(reason);
                }
                Ok(Some(Ok(_))) => {
                    // Binary and raw frames are not part of the protocol.
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(channel = %ctx.channel_name(), "receive failed: {e}");
                    dead = Some(e.to_string());
                }
                // An empty receive means the stream is gone: dead channel.
                Ok(None) => dead = Some("stream ended".to_string()),
            },
        }

        if close_requested {
            channel = Some((sink, source));
            break;
        }
        match dead {
            Some(reason) => {
                ctx.set_status(ConnectorStatus::Disconnected);
                emit(
                    &event_tx,
                    ConnectorEvent::ChannelDown {
                        channel: ctx.channel_name().to_string(),
                        reason,
                    },
                );
            }
            None => channel = Some((sink, source)),
        }
    }

    ctx.set_status(ConnectorStatus::Stopping);
    if let Some((mut sink, _)) = channel.take() {
        let _ = sink.send(Message::Close(None)).await;
    }
    ctx.set_status(ConnectorStatus::Stopped);
    tracing::debug!(channel = %ctx.channel_name(), "connector stopped");
}

/// Open the pin-verified WebSocket channel.
async fn establish(
    config: &PersistentConfig,
    tls: &Arc<rustls::ClientConfig>,
    verifier: &Arc<PinnedServerVerifier>,
) -> ConnectorResult<(WsSink, WsSource)> {
    let request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectorError::InvalidEndpoint(e.to_string()))?;

    let connect = connect_async_tls_with_config(
        request,
        None,
        false,
        Some(Connector::Rustls(tls.clone())),
    );
    let (stream, _response) =
        tokio::time::timeout(Duration::from_secs(config.connect_timeout_secs), connect)
            .await
            .map_err(|_| ConnectorError::SocketTimeout)?
            .map_err(|e| classify_handshake_error(e, verifier))?;

    Ok(stream.split())
}

/// Turn a handshake failure into a transport error, consulting the pin
/// verifier so a rejected pin is reported as the fatal mismatch it is
/// rather than a generic TLS failure.
fn classify_handshake_error(
    error: tokio_tungstenite::tungstenite::Error,
    verifier: &Arc<PinnedServerVerifier>,
) -> ConnectorError {
    if let Some(observation) = verifier.take_observation() {
        if !observation.matched {
            return ConnectorError::SpkiMismatch {
                expected: verifier.expected_pin().to_string(),
                presented: observation.presented,
            };
        }
    }

    use tokio_tungstenite::tungstenite::Error;
    match error {
        Error::Io(e) => ConnectorError::ConnectionReset(e.to_string()),
        Error::Tls(e) => ConnectorError::Tls(e.to_string()),
        Error::Url(e) => ConnectorError::InvalidEndpoint(e.to_string()),
        other => ConnectorError::ConnectionReset(other.to_string()),
    }
}

fn emit(event_tx: &mpsc::Sender<ConnectorEvent>, event: ConnectorEvent) {
    // Never block the loop on a slow consumer.
    if let Err(e) = event_tx.try_send(event) {
        match e {
            mpsc::error::TrySendError::Full(dropped) => {
                tracing::warn!(
                    "connector event channel full, dropping {:?}",
                    std::mem::discriminant(&dropped)
                );
            }
            mpsc::error::TrySendError::Closed(_) => {
                tracing::debug!("connector event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_timing() {
        let config = PersistentConfig::default();
        assert_eq!(config.reconnect_delay_ms, 5_000);
        assert_eq!(config.reconnect_jitter_ms, 2_000);
        assert_eq!(config.recv_timeout_secs, 30);
        assert_eq!(config.connect_timeout_secs, 15);
        assert_eq!(config.command_channel_capacity, 100);
    }

    #[test]
    fn backoff_jitter_stays_in_range() {
        let config = PersistentConfig::default();
        for _ in 0..64 {
            let jitter = rand::thread_rng().gen_range(0..=config.reconnect_jitter_ms);
            let delay = config.reconnect_delay_ms + jitter;
            assert!(delay >= config.reconnect_delay_ms);
            assert!(delay <= config.reconnect_delay_ms + config.reconnect_jitter_ms);
        }
    }
}
