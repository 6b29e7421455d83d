//! Envelope sealing and verification.

use std::time::{SystemTime, UNIX_EPOCH};

use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer, Verifier};
use rsa::{pkcs1v15, pss, RsaPrivateKey, RsaPublicKey};
use serde_json::Value;

use crate::envelope::canonical::{
    canonical_bytes, signing_bytes, FIELD_CONTENT, FIELD_HANDLER, FIELD_SALG, FIELD_SIG, FIELD_TS,
};
use crate::envelope::error::{SealError, SealResult, VerifyError, VerifyResult};
use crate::envelope::{b64_decode, b64_encode, Envelope, SigAlg, COMMAND_PREFIX};
use crate::profile::{decode_rsa_public_key_pem, KeyMaterialError};

/// Knobs for [`verify`].
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Maximum tolerated distance between the envelope timestamp and the
    /// local clock, in either direction.
    pub max_clock_skew_secs: u64,
    /// Require the handler to carry the `cmd_` prefix.
    pub require_command_prefix: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 300,
            require_command_prefix: false,
        }
    }
}

impl VerifyOptions {
    /// Set the clock skew tolerance.
    pub fn with_max_clock_skew_secs(mut self, secs: u64) -> Self {
        self.max_clock_skew_secs = secs;
        self
    }

    /// Require the `cmd_` handler prefix.
    pub fn with_command_prefix_required(mut self, required: bool) -> Self {
        self.require_command_prefix = required;
        self
    }
}

/// Current wall clock as fractional seconds since epoch.
pub(crate) fn now_ts() -> SealResult<f64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .map_err(|_| SealError::Serialization("system time before epoch".to_string()))
}

/// Build and sign an envelope for `handler` carrying `content`.
///
/// The signature covers the canonical serialization of the envelope minus
/// the `sig` field. RS256 signing is deterministic: sealing identical
/// logical content twice at the same timestamp yields identical bytes.
pub fn seal(
    handler: &str,
    content: Value,
    signing_key: &RsaPrivateKey,
    alg: SigAlg,
    key_id: Option<&str>,
) -> SealResult<Envelope> {
    let ts = now_ts()?;
    seal_at(ts, handler, content, signing_key, alg, key_id)
}

/// [`seal`] with an explicit timestamp.
pub fn seal_at(
    ts: f64,
    handler: &str,
    content: Value,
    signing_key: &RsaPrivateKey,
    alg: SigAlg,
    key_id: Option<&str>,
) -> SealResult<Envelope> {
    if !content.is_object() {
        return Err(SealError::NonObjectContent);
    }

    let mut envelope = Envelope {
        ts,
        handler: handler.to_string(),
        content,
        sig: None,
        salg: Some(alg),
        ikid: key_id.map(str::to_string),
        okid: None,
    };

    let Value::Object(map) = envelope.to_value() else {
        return Err(SealError::Serialization("envelope is not an object".to_string()));
    };
    let bytes = signing_bytes(&map)?;
    let sig = sign_bytes(&bytes, signing_key, alg)?;
    envelope.sig = Some(b64_encode(&sig));
    Ok(envelope)
}

/// Sign canonical bytes under the selected scheme.
pub(crate) fn sign_bytes(
    bytes: &[u8],
    signing_key: &RsaPrivateKey,
    alg: SigAlg,
) -> SealResult<Vec<u8>> {
    match alg {
        SigAlg::Rs256 => {
            let key = pkcs1v15::SigningKey::<Sha256>::new(signing_key.clone());
            Ok(key.sign(bytes).to_vec())
        }
        SigAlg::Ps256 => {
            let key = pss::SigningKey::<Sha256>::new(signing_key.clone());
            let mut rng = rand::rngs::OsRng;
            Ok(key.sign_with_rng(&mut rng, bytes).to_vec())
        }
    }
}

/// Verify a received envelope value against a PEM-encoded public key.
///
/// Checks run in a fixed order and fail closed; see
/// [`VerifyError`](crate::envelope::VerifyError) for the taxonomy. The
/// public key may be either SPKI (`BEGIN PUBLIC KEY`) or PKCS#1
/// (`BEGIN RSA PUBLIC KEY`) PEM.
pub fn verify(message: &Value, public_key_pem: &str, opts: &VerifyOptions) -> VerifyResult<()> {
    // 1. Shape: a JSON object whose content is itself an object.
    let Value::Object(map) = message else {
        return Err(VerifyError::BadPacketShape("not a JSON object".to_string()));
    };
    match map.get(FIELD_CONTENT) {
        Some(Value::Object(_)) => {}
        Some(_) => {
            return Err(VerifyError::BadPacketShape(
                "content is not an object".to_string(),
            ))
        }
        None => return Err(VerifyError::BadPacketShape("content missing".to_string())),
    }

    // 2. Handler.
    let handler = match map.get(FIELD_HANDLER) {
        Some(Value::String(h)) if !h.is_empty() => h.as_str(),
        _ => return Err(VerifyError::BadHandler),
    };
    if opts.require_command_prefix && !handler.starts_with(COMMAND_PREFIX) {
        return Err(VerifyError::HandlerNotCommand);
    }

    // 3. Timestamp within skew.
    let ts = match map.get(FIELD_TS) {
        None => return Err(VerifyError::MissingTimestamp),
        Some(v) => match v.as_f64() {
            Some(ts) if ts.is_finite() && ts > 0.0 => ts,
            _ => return Err(VerifyError::BadTimestamp),
        },
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| VerifyError::BadTimestamp)?
        .as_secs_f64();
    let skew = (now - ts).abs();
    if skew > opts.max_clock_skew_secs as f64 {
        return Err(VerifyError::TimestampSkew {
            skew_secs: skew,
            max_secs: opts.max_clock_skew_secs,
        });
    }

    // 4. Canonical re-serialization of the sig-less envelope.
    let mut unsigned = map.clone();
    unsigned.remove(FIELD_SIG);
    let bytes = canonical_bytes(&Value::Object(unsigned))
        .map_err(|e| VerifyError::BadContentSerialization(e.to_string()))?;

    // 5. Signature decode, tolerating missing padding.
    let sig_b64 = match map.get(FIELD_SIG) {
        Some(Value::String(s)) if !s.is_empty() => s.as_str(),
        _ => return Err(VerifyError::MissingSignature),
    };
    let sig_bytes = b64_decode(sig_b64).map_err(|_| VerifyError::BadSignatureEncoding)?;

    // Algorithm label, defaulting to RS256 when absent.
    let alg = match map.get(FIELD_SALG) {
        None => SigAlg::Rs256,
        Some(Value::String(name)) => SigAlg::from_wire(name).ok_or_else(|| {
            VerifyError::BadPacketShape(format!("unknown signature algorithm {name:?}"))
        })?,
        Some(_) => {
            return Err(VerifyError::BadPacketShape(
                "salg is not a string".to_string(),
            ))
        }
    };

    // 6. Public key decode (unified two-encoding acceptance).
    let public_key = decode_rsa_public_key_pem(public_key_pem).map_err(|e| match e {
        KeyMaterialError::UnsupportedLabel(label) => VerifyError::BadPublicKeyFormat(label),
        other => VerifyError::BadPublicKey(other.to_string()),
    })?;

    // 7. Cryptographic verification.
    verify_bytes(&bytes, &sig_bytes, &public_key, alg)
}

/// Verify a signature over canonical bytes.
pub(crate) fn verify_bytes(
    bytes: &[u8],
    sig: &[u8],
    public_key: &RsaPublicKey,
    alg: SigAlg,
) -> VerifyResult<()> {
    match alg {
        SigAlg::Rs256 => {
            let key = pkcs1v15::VerifyingKey::<Sha256>::new(public_key.clone());
            let sig =
                pkcs1v15::Signature::try_from(sig).map_err(|_| VerifyError::VerifyFailed)?;
            key.verify(bytes, &sig).map_err(|_| VerifyError::VerifyFailed)
        }
        SigAlg::Ps256 => {
            let key = pss::VerifyingKey::<Sha256>::new(public_key.clone());
            let sig = pss::Signature::try_from(sig).map_err(|_| VerifyError::VerifyFailed)?;
            key.verify(bytes, &sig).map_err(|_| VerifyError::VerifyFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::test_keys::{test_keypair, test_keypair_b};
    use serde_json::json;

    fn verify_opts() -> VerifyOptions {
        VerifyOptions::default()
    }

    #[test]
    fn seal_then_verify_succeeds() {
        let (private_key, public_pem) = test_keypair();
        let envelope = seal("cmd_ping", json!({}), private_key, SigAlg::Rs256, None).unwrap();
        let value = envelope.to_value();
        verify(&value, public_pem, &verify_opts()).unwrap();
    }

    #[test]
    fn seal_then_verify_pss_succeeds() {
        let (private_key, public_pem) = test_keypair();
        let envelope = seal(
            "cmd_status",
            json!({"detail": true}),
            private_key,
            SigAlg::Ps256,
            None,
        )
        .unwrap();
        verify(&envelope.to_value(), public_pem, &verify_opts()).unwrap();
    }

    #[test]
    fn verify_with_wrong_key_fails() {
        let (private_key, _) = test_keypair();
        let (_, other_pub_pem) = test_keypair_b();
        let envelope = seal("cmd_ping", json!({}), private_key, SigAlg::Rs256, None).unwrap();
        let err = verify(&envelope.to_value(), other_pub_pem, &verify_opts()).unwrap_err();
        assert_eq!(err, VerifyError::VerifyFailed);
    }

    #[test]
    fn mutating_content_after_sealing_fails_verification() {
        let (private_key, public_pem) = test_keypair();
        let envelope = seal(
            "cmd_update",
            json!({"target": "node-1", "value": 3}),
            private_key,
            SigAlg::Rs256,
            None,
        )
        .unwrap();

        let mut tampered = envelope.to_value();
        tampered["content"]["value"] = json!(4);
        let err = verify(&tampered, public_pem, &verify_opts()).unwrap_err();
        assert_eq!(err, VerifyError::VerifyFailed);
    }

    #[test]
    fn resigning_identical_content_is_deterministic() {
        let (private_key, _) = test_keypair();
        let a = seal_at(
            1700000000.0,
            "cmd_ping",
            json!({"k": "v"}),
            private_key,
            SigAlg::Rs256,
            None,
        )
        .unwrap();
        let b = seal_at(
            1700000000.0,
            "cmd_ping",
            json!({"k": "v"}),
            private_key,
            SigAlg::Rs256,
            None,
        )
        .unwrap();
        assert_eq!(a.to_wire_string().unwrap(), b.to_wire_string().unwrap());
    }

    #[test]
    fn stale_timestamp_is_rejected_as_skew() {
        let (private_key, public_pem) = test_keypair();
        let stale = now_ts().unwrap() - 1000.0;
        let envelope = seal_at(stale, "cmd_ping", json!({}), private_key, SigAlg::Rs256, None)
            .unwrap();
        let err = verify(
            &envelope.to_value(),
            public_pem,
            &verify_opts().with_max_clock_skew_secs(300),
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::TimestampSkew { .. }));
    }

    #[test]
    fn missing_fields_fail_closed() {
        let (_, public_pem) = test_keypair();
        let opts = verify_opts();

        let err = verify(&json!([]), public_pem, &opts).unwrap_err();
        assert!(matches!(err, VerifyError::BadPacketShape(_)));

        let err = verify(&json!({"handler": "cmd_x", "ts": 1.0}), public_pem, &opts).unwrap_err();
        assert!(matches!(err, VerifyError::BadPacketShape(_)));

        let err = verify(
            &json!({"content": {}, "ts": 1.0, "sig": "AAAA"}),
            public_pem,
            &opts,
        )
        .unwrap_err();
        assert_eq!(err, VerifyError::BadHandler);

        let err = verify(
            &json!({"content": {}, "handler": "cmd_x", "sig": "AAAA"}),
            public_pem,
            &opts,
        )
        .unwrap_err();
        assert_eq!(err, VerifyError::MissingTimestamp);

        let err = verify(
            &json!({"content": {}, "handler": "cmd_x", "ts": "soon", "sig": "AAAA"}),
            public_pem,
            &opts,
        )
        .unwrap_err();
        assert_eq!(err, VerifyError::BadTimestamp);
    }

    #[test]
    fn missing_signature_is_its_own_error() {
        let (private_key, public_pem) = test_keypair();
        let envelope = seal("cmd_ping", json!({}), private_key, SigAlg::Rs256, None).unwrap();
        let mut value = envelope.to_value();
        value.as_object_mut().unwrap().remove("sig");
        let err = verify(&value, public_pem, &verify_opts()).unwrap_err();
        assert_eq!(err, VerifyError::MissingSignature);
    }

    #[test]
    fn garbage_signature_encoding_is_rejected() {
        let (private_key, public_pem) = test_keypair();
        let envelope = seal("cmd_ping", json!({}), private_key, SigAlg::Rs256, None).unwrap();
        let mut value = envelope.to_value();
        value["sig"] = json!("not*base64!");
        let err = verify(&value, public_pem, &verify_opts()).unwrap_err();
        assert_eq!(err, VerifyError::BadSignatureEncoding);
    }

    #[test]
    fn unpadded_signature_still_verifies() {
        let (private_key, public_pem) = test_keypair();
        let envelope = seal("cmd_ping", json!({}), private_key, SigAlg::Rs256, None).unwrap();
        let mut value = envelope.to_value();
        let unpadded = value["sig"].as_str().unwrap().trim_end_matches('=').to_string();
        value["sig"] = json!(unpadded);
        verify(&value, public_pem, &verify_opts()).unwrap();
    }

    #[test]
    fn command_prefix_requirement_is_enforced() {
        let (private_key, public_pem) = test_keypair();
        let envelope = seal("status_report", json!({}), private_key, SigAlg::Rs256, None).unwrap();
        let err = verify(
            &envelope.to_value(),
            public_pem,
            &verify_opts().with_command_prefix_required(true),
        )
        .unwrap_err();
        assert_eq!(err, VerifyError::HandlerNotCommand);
    }

    #[test]
    fn non_object_content_cannot_be_sealed() {
        let (private_key, _) = test_keypair();
        let err = seal("cmd_ping", json!(42), private_key, SigAlg::Rs256, None).unwrap_err();
        assert!(matches!(err, SealError::NonObjectContent));
    }

    #[test]
    fn bad_public_key_is_reported_before_crypto() {
        let (private_key, _) = test_keypair();
        let envelope = seal("cmd_ping", json!({}), private_key, SigAlg::Rs256, None).unwrap();
        let err = verify(&envelope.to_value(), "not a pem", &verify_opts()).unwrap_err();
        assert!(matches!(err, VerifyError::BadPublicKey(_)));
    }
}
