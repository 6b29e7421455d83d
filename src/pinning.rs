//! SPKI pinning: pin extraction and pin-anchored TLS configuration.
//!
//! Swarm nodes present self-issued certificates, so standard CA-chain and
//! hostname validation are intentionally disabled on swarm channels. The
//! SHA-256 of the certificate's SubjectPublicKeyInfo — the *key*, not the
//! whole certificate — is the sole trust anchor. Pinning the key survives
//! certificate reissuance under the same key material. This trust model is
//! deliberate and must not be replaced with chain validation.

use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::envelope::b64_encode;
use crate::profile::CertProfile;

/// Failures while extracting pins or assembling pinned TLS configs.
#[derive(Debug, Clone, Error)]
pub enum PinError {
    /// Certificate DER failed to parse
    #[error("certificate parse failed: {0}")]
    CertParse(String),

    /// Required TLS material absent or undecodable
    #[error("missing TLS material: {0}")]
    MissingTlsMaterial(String),

    /// rustls rejected the assembled configuration
    #[error("TLS configuration failed: {0}")]
    TlsConfig(String),
}

/// Result type alias for pinning operations.
pub type PinResult<T> = Result<T, PinError>;

/// Compute the SPKI pin of a DER certificate: base64 SHA-256 over the
/// SubjectPublicKeyInfo substructure.
pub fn extract_pin(cert_der: &[u8]) -> PinResult<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| PinError::CertParse(e.to_string()))?;
    let spki = cert.public_key().raw;
    Ok(b64_encode(&Sha256::digest(spki)))
}

/// Check a DER certificate against an expected pin. Unparseable
/// certificates never match.
pub fn verify_pin(cert_der: &[u8], expected_pin: &str) -> bool {
    matches!(extract_pin(cert_der), Ok(pin) if pin == expected_pin)
}

/// Outcome of the most recent pin check performed by a verifier.
#[derive(Debug, Clone)]
pub struct PinObservation {
    /// Pin presented by the peer
    pub presented: String,
    /// Whether it matched the expected pin
    pub matched: bool,
}

/// rustls server-certificate verifier anchored exclusively on an SPKI pin.
///
/// No chain building, no hostname check, no validity-window check: the
/// remote certificates are self-issued, and the pin is the trust decision.
/// The last pin check is recorded so connectors can report an exact
/// mismatch reason after a failed handshake.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    expected_pin: String,
    provider: Arc<CryptoProvider>,
    last_observation: Mutex<Option<PinObservation>>,
}

impl PinnedServerVerifier {
    /// Create a verifier for the given expected pin.
    pub fn new(expected_pin: impl Into<String>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            expected_pin: expected_pin.into(),
            provider,
            last_observation: Mutex::new(None),
        }
    }

    /// The pin this verifier enforces.
    pub fn expected_pin(&self) -> &str {
        &self.expected_pin
    }

    /// Take the outcome of the most recent pin check, if any.
    pub fn take_observation(&self) -> Option<PinObservation> {
        self.last_observation.lock().ok()?.take()
    }

    fn record(&self, observation: PinObservation) {
        if let Ok(mut slot) = self.last_observation.lock() {
            *slot = Some(observation);
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = extract_pin(end_entity.as_ref())
            .map_err(|e| rustls::Error::General(format!("pin extraction failed: {e}")))?;
        let matched = presented == self.expected_pin;
        self.record(PinObservation {
            presented: presented.clone(),
            matched,
        });
        if matched {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::warn!(
                expected = %self.expected_pin,
                presented = %presented,
                "SPKI pin mismatch"
            );
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Verifier that accepts any certificate so the caller can read the
/// negotiated peer certificate afterwards. Used only by the connection
/// group's identity probe — never for payload channels.
#[derive(Debug)]
pub struct CapturingServerVerifier {
    provider: Arc<CryptoProvider>,
}

impl CapturingServerVerifier {
    /// Create a capturing verifier.
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for CapturingServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The crypto provider used for all swarm TLS configs.
pub(crate) fn tls_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Assemble a pin-anchored client TLS config from a cert profile.
///
/// The returned verifier handle lets connectors read the last pin
/// observation after a failed handshake. Client auth is attached when the
/// profile carries both a certificate and a key; carrying only one of the
/// two is a [`PinError::MissingTlsMaterial`].
pub fn pinned_client_config(
    profile: &CertProfile,
) -> PinResult<(ClientConfig, Arc<PinnedServerVerifier>)> {
    let provider = tls_provider();
    let verifier = Arc::new(PinnedServerVerifier::new(
        profile.expected_pin.clone(),
        provider.clone(),
    ));

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| PinError::TlsConfig(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone());

    let config = match (&profile.client_cert_pem, &profile.client_key_pem) {
        (Some(cert_pem), Some(key_pem)) => {
            let certs = decode_cert_chain_pem(cert_pem)?;
            let key = decode_private_key_pem(key_pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| PinError::TlsConfig(e.to_string()))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(PinError::MissingTlsMaterial(
                "client certificate and key must be supplied together".to_string(),
            ))
        }
    };

    Ok((config, verifier))
}

/// Probe-side TLS config: accepts any certificate for identity capture.
pub(crate) fn capturing_client_config() -> PinResult<ClientConfig> {
    let provider = tls_provider();
    let verifier = Arc::new(CapturingServerVerifier::new(provider.clone()));
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| PinError::TlsConfig(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

fn decode_cert_chain_pem(pem: &str) -> PinResult<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| PinError::MissingTlsMaterial(format!("client certificate: {e}")))?;
    if certs.is_empty() {
        return Err(PinError::MissingTlsMaterial(
            "client certificate PEM contains no certificates".to_string(),
        ));
    }
    Ok(certs)
}

fn decode_private_key_pem(pem: &str) -> PinResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| PinError::MissingTlsMaterial(format!("client key: {e}")))?
        .ok_or_else(|| {
            PinError::MissingTlsMaterial("client key PEM contains no private key".to_string())
        })
}
