//! Ephemeral HTTPS connector: one connect–send–close mission.
//!
//! Used for fire-and-forget delivery of a single sealed envelope. The
//! channel is torn down unconditionally after the attempt, success or not;
//! a network failure aborts the mission rather than retrying.

use std::sync::Arc;
use std::time::Duration;

use crate::connector::{ChannelContext, ConnectorError, ConnectorResult, ConnectorStatus};
use crate::pinning::PinnedServerVerifier;

/// Ephemeral connector configuration.
#[derive(Debug, Clone)]
pub struct EphemeralConfig {
    /// HTTPS endpoint (`https://…`) receiving the envelope POST
    pub url: String,
    /// Channel name used in events and logs
    pub channel_name: String,
    /// Bound on the whole mission (seconds)
    pub request_timeout_secs: u64,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            channel_name: "secondary".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl EphemeralConfig {
    /// Config for the given endpoint with default timing.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// One-shot sender over pin-verified HTTPS.
pub struct EphemeralConnector {
    config: EphemeralConfig,
    tls: Arc<rustls::ClientConfig>,
    verifier: Arc<PinnedServerVerifier>,
    ctx: Arc<ChannelContext>,
}

impl EphemeralConnector {
    /// Build a sender bound to a pinned TLS config.
    pub fn new(
        config: EphemeralConfig,
        tls: Arc<rustls::ClientConfig>,
        verifier: Arc<PinnedServerVerifier>,
    ) -> Self {
        let ctx = Arc::new(ChannelContext::new(config.channel_name.clone()));
        Self {
            config,
            tls,
            verifier,
            ctx,
        }
    }

    /// Shared lifecycle context.
    pub fn context(&self) -> &Arc<ChannelContext> {
        &self.ctx
    }

    /// Current status.
    pub fn status(&self) -> ConnectorStatus {
        self.ctx.status()
    }

    /// Deliver one wire-form envelope. The connection is closed when this
    /// returns, regardless of outcome.
    pub async fn send_one(&self, envelope_json: String) -> ConnectorResult<()> {
        if self.ctx.is_closed() {
            return Err(ConnectorError::ChannelClosed);
        }
        self.ctx.set_status(ConnectorStatus::Connecting);

        let client = reqwest::Client::builder()
            .use_preconfigured_tls((*self.tls).clone())
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .build()
            .map_err(|e| {
                self.ctx.set_status(ConnectorStatus::Error);
                ConnectorError::MissingTlsMaterial(e.to_string())
            })?;

        self.ctx.set_status(ConnectorStatus::Connected);
        let result = client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(envelope_json)
            .send()
            .await;

        // The mission ends here either way; the client (and its connection
        // pool) drops at end of scope.
        match result {
            Ok(response) if response.status().is_success() => {
                self.ctx.touch_heartbeat();
                self.ctx.set_status(ConnectorStatus::Stopped);
                tracing::debug!(channel = %self.ctx.channel_name(), "mission delivered");
                Ok(())
            }
            Ok(response) => {
                self.ctx.set_status(ConnectorStatus::Error);
                let status = response.status().as_u16();
                tracing::warn!(
                    channel = %self.ctx.channel_name(),
                    status,
                    "mission rejected by remote"
                );
                Err(ConnectorError::Rejected(status))
            }
            Err(e) => {
                self.ctx.set_status(ConnectorStatus::Error);
                Err(self.classify(e))
            }
        }
    }

    /// Mark the connector closed. Idempotent; later missions are rejected.
    pub fn close(&self) {
        if self.ctx.begin_close() {
            self.ctx.set_status(ConnectorStatus::Stopped);
        }
    }

    fn classify(&self, error: reqwest::Error) -> ConnectorError {
        if let Some(observation) = self.verifier.take_observation() {
            if !observation.matched {
                return ConnectorError::SpkiMismatch {
                    expected: self.verifier.expected_pin().to_string(),
                    presented: observation.presented,
                };
            }
        }
        if error.is_timeout() {
            ConnectorError::SocketTimeout
        } else if error.is_connect() {
            ConnectorError::ConnectionReset(error.to_string())
        } else {
            ConnectorError::SendFailed(error.to_string())
        }
    }
}
