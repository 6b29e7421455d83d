//! Hybrid sealing: AES-256-GCM payload encryption with RSA-OAEP key wrap.
//!
//! The plaintext is the canonical byte form of a complete inner envelope. A
//! fresh 32-byte symmetric key is generated per message, used once, and
//! zeroized; only its OAEP wrapping under the recipient's public key travels
//! on the wire.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rsa::sha2::Sha256;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::envelope::error::{SecureError, SecureResult};
use crate::envelope::sign::{now_ts, sign_bytes};
use crate::envelope::{
    b64_decode, b64_encode, Envelope, SigAlg, AEAD_LABEL, EXTERNAL_EMBEDDED_HANDLER, KALG_LABEL,
};

/// AES-GCM nonce length in bytes.
const IV_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;
/// Symmetric key length in bytes (AES-256).
const KEY_LEN: usize = 32;

/// The hybrid-encrypted content block as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedContent {
    /// AEAD label; always `"AES-GCM"`.
    pub aead: String,
    /// Base64 nonce.
    pub iv: String,
    /// Base64 ciphertext (tag excluded).
    pub ct: String,
    /// Base64 authentication tag.
    pub tag: String,
    /// Base64 wrapped symmetric key.
    pub ek: String,
    /// Key-wrap algorithm label; always `"RSA-OAEP-SHA256"`.
    pub kalg: String,
    /// Recipient key id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rkid: Option<String>,
}

/// Flags for [`wrap_secure`]. Either may be false independently; with
/// neither set the result is an unsigned, unencrypted shell, acceptable only
/// on trusted loop-back paths.
#[derive(Debug, Clone, Default)]
pub struct SecureOptions {
    /// Sign the outer shell.
    pub sign: bool,
    /// Hybrid-encrypt the inner envelope.
    pub encrypt: bool,
    /// Outer signature algorithm.
    pub outer_alg: SigAlg,
    /// Outer signing key id carried as `okid`.
    pub outer_kid: Option<String>,
    /// Recipient key id carried as `rkid` inside the sealed block.
    pub recipient_kid: Option<String>,
}

impl SecureOptions {
    /// Sign and encrypt — the normal posture for swarm delivery.
    pub fn signed_and_encrypted() -> Self {
        Self {
            sign: true,
            encrypt: true,
            ..Default::default()
        }
    }

    /// Sign only.
    pub fn signed() -> Self {
        Self {
            sign: true,
            ..Default::default()
        }
    }
}

/// Nest an inner envelope inside an outer `external_embedded` shell,
/// optionally encrypting the inner bytes and signing the shell.
pub fn wrap_secure(
    inner: &Envelope,
    recipient_pub: Option<&RsaPublicKey>,
    outer_signing_key: Option<&RsaPrivateKey>,
    opts: &SecureOptions,
) -> SecureResult<Envelope> {
    let content = if opts.encrypt {
        let recipient = recipient_pub.ok_or(SecureError::MissingRecipientKey)?;
        let plaintext = inner
            .to_wire_bytes()
            .map_err(|e| SecureError::Serialization(e.to_string()))?;
        let sealed = encrypt_payload(&plaintext, recipient, opts.recipient_kid.as_deref())?;
        serde_json::to_value(sealed).map_err(|e| SecureError::Serialization(e.to_string()))?
    } else {
        inner.to_value()
    };

    let mut outer = Envelope {
        ts: now_ts().map_err(|e| SecureError::Serialization(e.to_string()))?,
        handler: EXTERNAL_EMBEDDED_HANDLER.to_string(),
        content,
        sig: None,
        salg: None,
        ikid: None,
        okid: None,
    };

    if opts.sign {
        let key = outer_signing_key.ok_or(SecureError::MissingOuterKey)?;
        outer.salg = Some(opts.outer_alg);
        outer.okid = opts.outer_kid.clone();
        let Value::Object(map) = outer.to_value() else {
            return Err(SecureError::Serialization("shell is not an object".to_string()));
        };
        let bytes = crate::envelope::signing_bytes(&map)
            .map_err(|e| SecureError::Serialization(e.to_string()))?;
        let sig = sign_bytes(&bytes, key, opts.outer_alg)
            .map_err(|e| SecureError::OuterSigning(e.to_string()))?;
        outer.sig = Some(b64_encode(&sig));
    }

    Ok(outer)
}

/// Open a hybrid-encrypted content block and return the inner envelope value.
///
/// Key-unwrap failure and tag failure both surface as
/// [`SecureError::OpenFailed`]; nothing distinguishes which step rejected.
pub fn open_secure(sealed: &Value, recipient_priv: &RsaPrivateKey) -> SecureResult<Value> {
    let block: SealedContent = serde_json::from_value(sealed.clone())
        .map_err(|e| SecureError::BadShape(e.to_string()))?;

    if block.aead != AEAD_LABEL {
        return Err(SecureError::UnsupportedAlgorithm(block.aead));
    }
    if block.kalg != KALG_LABEL {
        return Err(SecureError::UnsupportedAlgorithm(block.kalg));
    }

    let iv = b64_decode(&block.iv).map_err(|e| SecureError::BadShape(e.to_string()))?;
    let ct = b64_decode(&block.ct).map_err(|e| SecureError::BadShape(e.to_string()))?;
    let tag = b64_decode(&block.tag).map_err(|e| SecureError::BadShape(e.to_string()))?;
    let ek = b64_decode(&block.ek).map_err(|e| SecureError::BadShape(e.to_string()))?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(SecureError::BadShape("bad iv or tag length".to_string()));
    }

    // From here on, all failures are indistinguishable.
    let key = Zeroizing::new(
        recipient_priv
            .decrypt(Oaep::new::<Sha256>(), &ek)
            .map_err(|_| SecureError::OpenFailed)?,
    );
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| SecureError::OpenFailed)?;

    let mut ct_and_tag = ct;
    ct_and_tag.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ct_and_tag.as_slice())
        .map_err(|_| SecureError::OpenFailed)?;

    serde_json::from_slice(&plaintext).map_err(|_| SecureError::BadInnerPayload)
}

fn encrypt_payload(
    plaintext: &[u8],
    recipient: &RsaPublicKey,
    recipient_kid: Option<&str>,
) -> SecureResult<SealedContent> {
    let mut rng = rand::rngs::OsRng;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rng.fill_bytes(key.as_mut());
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| SecureError::EncryptFailed)?;
    let mut ct_and_tag = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| SecureError::EncryptFailed)?;
    let tag = ct_and_tag.split_off(ct_and_tag.len() - TAG_LEN);

    let ek = recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), key.as_ref())
        .map_err(|_| SecureError::EncryptFailed)?;

    Ok(SealedContent {
        aead: AEAD_LABEL.to_string(),
        iv: b64_encode(&iv),
        ct: b64_encode(&ct_and_tag),
        tag: b64_encode(&tag),
        ek: b64_encode(&ek),
        kalg: KALG_LABEL.to_string(),
        rkid: recipient_kid.map(str::to_string),
    })
}
