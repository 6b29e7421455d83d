//! Canonical JSON serialization for signing.
//!
//! Signatures cover a byte-exact encoding, so the same logical envelope must
//! always serialize to the same bytes: object keys sorted, no incidental
//! whitespace. `serde_json`'s default object map is BTreeMap-backed, which
//! gives sorted keys for free — this crate must never enable the
//! `preserve_order` feature.

use serde_json::{Map, Value};

use crate::envelope::error::{SealError, SealResult};

/// Wire field: seconds since epoch, fractional.
pub const FIELD_TS: &str = "ts";
/// Wire field: command identifier.
pub const FIELD_HANDLER: &str = "handler";
/// Wire field: structured payload.
pub const FIELD_CONTENT: &str = "content";
/// Wire field: base64 signature over the canonical sig-less envelope.
pub const FIELD_SIG: &str = "sig";
/// Wire field: signature algorithm label.
pub const FIELD_SALG: &str = "salg";
/// Wire field: inner signing key id.
pub const FIELD_IKID: &str = "ikid";
/// Wire field: outer signing key id.
pub const FIELD_OKID: &str = "okid";
/// Wire field: recipient (key-wrap) key id.
pub const FIELD_RKID: &str = "rkid";

/// Serialize a JSON value to its canonical byte form.
///
/// Compact separators, keys in sorted order at every nesting level.
pub fn canonical_bytes(value: &Value) -> SealResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SealError::Serialization(e.to_string()))
}

/// Build the canonical signing bytes for an envelope-shaped map, excluding
/// the signature field itself.
pub fn signing_bytes(envelope: &Map<String, Value>) -> SealResult<Vec<u8>> {
    let mut unsigned = envelope.clone();
    unsigned.remove(FIELD_SIG);
    canonical_bytes(&Value::Object(unsigned))
}
