//! Packet envelope protocol: canonical signing, hybrid sealing, verification.
//!
//! Every command crossing a swarm channel travels inside an [`Envelope`]:
//! a timestamp, a handler id, a structured content payload, and a signature
//! over the canonical byte-exact serialization of everything except the
//! signature itself. Optionally the whole envelope is hybrid-encrypted
//! (AES-256-GCM payload, RSA-OAEP-SHA256 key wrap) and nested inside an
//! outer signed shell — see [`wrap_secure`] / [`open_secure`].
//!
//! # Example
//!
//! ```rust,ignore
//! use swarmlink::envelope::{seal, verify, SigAlg, VerifyOptions};
//! use serde_json::json;
//!
//! let envelope = seal("cmd_ping", json!({}), &signing_key, SigAlg::Rs256, None)?;
//! let wire = envelope.to_wire_string()?;
//!
//! // receiving side
//! let value: serde_json::Value = serde_json::from_str(&wire)?;
//! verify(&value, &public_key_pem, &VerifyOptions::default())?;
//! ```

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde_json::{Map, Value};

pub mod canonical;
pub mod error;
mod secure;
mod sign;

pub use canonical::{canonical_bytes, signing_bytes};
pub use error::{SealError, SealResult, SecureError, SecureResult, VerifyError, VerifyResult};
pub use secure::{open_secure, wrap_secure, SealedContent, SecureOptions};
pub use sign::{seal, seal_at, verify, VerifyOptions};

/// Fixed handler carried by the outer shell of an embedded-secure delivery.
pub const EXTERNAL_EMBEDDED_HANDLER: &str = "external_embedded";

/// Prefix that marks a handler as a command (enforced when
/// [`VerifyOptions::require_command_prefix`] is set).
pub const COMMAND_PREFIX: &str = "cmd_";

/// AEAD label on the wire for the hybrid content block.
pub const AEAD_LABEL: &str = "AES-GCM";

/// Key-wrap algorithm label on the wire for the hybrid content block.
pub const KALG_LABEL: &str = "RSA-OAEP-SHA256";

/// Base64 decoding tolerant of missing padding. Remote peers are not
/// consistent about padding their signatures, so decoding is indifferent;
/// encoding always emits standard padded base64.
pub(crate) const B64_TOLERANT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode bytes as standard padded base64.
pub(crate) fn b64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64, tolerating absent padding.
pub(crate) fn b64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    B64_TOLERANT.decode(s)
}

#[cfg(test)]
pub(crate) fn resign_for_tests(bytes: &[u8], key: &rsa::RsaPrivateKey) -> String {
    b64_encode(&sign::sign_bytes(bytes, key, SigAlg::Rs256).expect("test signing"))
}

/// Signature algorithm selection.
///
/// RS256 (PKCS#1 v1.5 with SHA-256) is the default: deterministic padding,
/// so re-signing identical logical content yields identical bytes. PS256
/// (PSS with SHA-256) is accepted for peers that require it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigAlg {
    /// RSASSA-PKCS1-v1_5 with SHA-256 (deterministic)
    #[default]
    Rs256,
    /// RSASSA-PSS with SHA-256 (randomized salt)
    Ps256,
}

impl SigAlg {
    /// Wire label carried in the `salg` field.
    pub fn wire_name(self) -> &'static str {
        match self {
            SigAlg::Rs256 => "RS256",
            SigAlg::Ps256 => "PS256",
        }
    }

    /// Parse a wire label; `None` for unknown algorithms.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "RS256" => Some(SigAlg::Rs256),
            "PS256" => Some(SigAlg::Ps256),
            _ => None,
        }
    }
}

/// A signed (and possibly sealed) command envelope.
///
/// The wire form is a canonical JSON object; see [`Envelope::to_value`].
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Seconds since epoch, fractional.
    pub ts: f64,
    /// Command identifier.
    pub handler: String,
    /// Structured payload. Always a JSON object on the wire.
    pub content: Value,
    /// Base64 signature over the canonical sig-less serialization.
    pub sig: Option<String>,
    /// Signature algorithm label.
    pub salg: Option<SigAlg>,
    /// Inner signing key id.
    pub ikid: Option<String>,
    /// Outer signing key id (embedded-secure shells only).
    pub okid: Option<String>,
}

impl Envelope {
    /// Render the envelope as a JSON value. Object keys come out sorted when
    /// serialized, which makes this the canonical wire form.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(canonical::FIELD_TS.to_string(), Value::from(self.ts));
        map.insert(
            canonical::FIELD_HANDLER.to_string(),
            Value::from(self.handler.clone()),
        );
        map.insert(canonical::FIELD_CONTENT.to_string(), self.content.clone());
        if let Some(sig) = &self.sig {
            map.insert(canonical::FIELD_SIG.to_string(), Value::from(sig.clone()));
        }
        if let Some(salg) = self.salg {
            map.insert(
                canonical::FIELD_SALG.to_string(),
                Value::from(salg.wire_name()),
            );
        }
        if let Some(ikid) = &self.ikid {
            map.insert(canonical::FIELD_IKID.to_string(), Value::from(ikid.clone()));
        }
        if let Some(okid) = &self.okid {
            map.insert(canonical::FIELD_OKID.to_string(), Value::from(okid.clone()));
        }
        Value::Object(map)
    }

    /// Canonical wire bytes of the full envelope (signature included).
    pub fn to_wire_bytes(&self) -> SealResult<Vec<u8>> {
        canonical_bytes(&self.to_value())
    }

    /// Canonical wire string of the full envelope.
    pub fn to_wire_string(&self) -> SealResult<String> {
        let bytes = self.to_wire_bytes()?;
        String::from_utf8(bytes).map_err(|e| SealError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sig_alg_wire_names_round_trip() {
        for alg in [SigAlg::Rs256, SigAlg::Ps256] {
            assert_eq!(SigAlg::from_wire(alg.wire_name()), Some(alg));
        }
        assert_eq!(SigAlg::from_wire("ED25519"), None);
    }

    #[test]
    fn envelope_wire_form_is_sorted_and_compact() {
        let envelope = Envelope {
            ts: 1700000000.5,
            handler: "cmd_ping".to_string(),
            content: json!({"b": 1, "a": 2}),
            sig: Some("c2ln".to_string()),
            salg: Some(SigAlg::Rs256),
            ikid: None,
            okid: None,
        };
        let wire = envelope.to_wire_string().unwrap();
        assert_eq!(
            wire,
            r#"{"content":{"a":2,"b":1},"handler":"cmd_ping","salg":"RS256","sig":"c2ln","ts":1700000000.5}"#
        );
    }

    #[test]
    fn tolerant_decode_accepts_unpadded_base64() {
        let encoded = b64_encode(b"swarm");
        let unpadded = encoded.trim_end_matches('=');
        assert_eq!(b64_decode(unpadded).unwrap(), b"swarm");
        assert_eq!(b64_decode(&encoded).unwrap(), b"swarm");
    }
}
