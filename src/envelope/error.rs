//! Error types for envelope sealing, verification, and secure wrapping.

use thiserror::Error;

/// Verification failures, in the order the checks run.
///
/// Every variant is a hard rejection: a missing or malformed field is a
/// verification failure, never a silent pass.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    /// Message is not a JSON object or a required field has the wrong type
    #[error("bad packet shape: {0}")]
    BadPacketShape(String),

    /// Handler field missing, non-string, or empty
    #[error("bad handler")]
    BadHandler,

    /// Handler does not carry the required command prefix
    #[error("handler is not a command")]
    HandlerNotCommand,

    /// Timestamp field absent
    #[error("missing timestamp")]
    MissingTimestamp,

    /// Timestamp present but not a usable number
    #[error("bad timestamp")]
    BadTimestamp,

    /// Timestamp outside the allowed clock skew window
    #[error("timestamp skew: envelope is {skew_secs:.0}s from local clock (max {max_secs}s)")]
    TimestampSkew { skew_secs: f64, max_secs: u64 },

    /// Canonical re-serialization of the envelope failed
    #[error("bad content serialization: {0}")]
    BadContentSerialization(String),

    /// Signature field absent or empty
    #[error("missing signature")]
    MissingSignature,

    /// Signature present but not decodable base64
    #[error("bad signature encoding")]
    BadSignatureEncoding,

    /// Public key material not decodable at all
    #[error("bad public key: {0}")]
    BadPublicKey(String),

    /// Public key decodes as PEM but is not an accepted encoding
    #[error("bad public key format: {0}")]
    BadPublicKeyFormat(String),

    /// Cryptographic verification failed
    #[error("verification failed")]
    VerifyFailed,
}

/// Result type alias for verification.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Failures while sealing (signing) an envelope.
#[derive(Debug, Error)]
pub enum SealError {
    /// Content payloads must be JSON objects on the wire
    #[error("content is not a JSON object")]
    NonObjectContent,

    /// Canonical serialization failed
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The signing operation itself failed
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Result type alias for sealing.
pub type SealResult<T> = Result<T, SealError>;

/// Failures while hybrid-wrapping or opening a sealed payload.
///
/// Key-unwrap and authentication-tag failures collapse into the single
/// [`SecureError::OpenFailed`] variant so a caller cannot distinguish which
/// step rejected the payload.
#[derive(Debug, Error)]
pub enum SecureError {
    /// The sealed content block is missing fields or has wrong field types
    #[error("sealed content has invalid shape: {0}")]
    BadShape(String),

    /// An algorithm label other than the supported suite
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// `sign` was requested without an outer signing key
    #[error("outer signing key required when signing is requested")]
    MissingOuterKey,

    /// `encrypt` was requested without a recipient public key
    #[error("recipient public key required when encryption is requested")]
    MissingRecipientKey,

    /// Symmetric encryption or key wrapping failed
    #[error("encryption failed")]
    EncryptFailed,

    /// Key unwrap or authentication failed (indistinguishable by design)
    #[error("open failed")]
    OpenFailed,

    /// Decrypted payload is not valid JSON
    #[error("inner payload is not valid JSON")]
    BadInnerPayload,

    /// Serialization of the inner envelope failed
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Signing the outer shell failed
    #[error("outer signing failed: {0}")]
    OuterSigning(String),
}

/// Result type alias for secure wrap/open operations.
pub type SecureResult<T> = Result<T, SecureError>;
