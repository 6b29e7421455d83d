//! Integration tests for the envelope protocol: sign/verify round trips,
//! canonicalization, and hybrid sealing through the public API.

use std::sync::OnceLock;

use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use swarmlink::envelope::{
    open_secure, seal, verify, wrap_secure, SecureError, SecureOptions, SigAlg, VerifyError,
    VerifyOptions,
};

fn keypair_a() -> &'static (RsaPrivateKey, String) {
    static KEYS: OnceLock<(RsaPrivateKey, String)> = OnceLock::new();
    KEYS.get_or_init(generate)
}

fn keypair_b() -> &'static (RsaPrivateKey, String) {
    static KEYS: OnceLock<(RsaPrivateKey, String)> = OnceLock::new();
    KEYS.get_or_init(generate)
}

fn generate() -> (RsaPrivateKey, String) {
    let mut rng = rand::rngs::OsRng;
    let key = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
    let pem = RsaPublicKey::from(&key)
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .expect("pem");
    (key, pem)
}

#[test]
fn seal_verify_round_trips_across_payload_shapes() {
    let (key, pub_pem) = keypair_a();
    let opts = VerifyOptions::default();

    let payloads = [
        json!({}),
        json!({"target": "node-7", "count": 3}),
        json!({"nested": {"deep": {"flag": true}}, "list": [1, 2, 3]}),
        json!({"unicode": "обстановка", "empty": ""}),
    ];
    for (i, content) in payloads.into_iter().enumerate() {
        let handler = format!("cmd_op_{i}");
        let envelope = seal(&handler, content, key, SigAlg::Rs256, None).unwrap();
        verify(&envelope.to_value(), pub_pem, &opts)
            .unwrap_or_else(|e| panic!("payload {i} failed: {e}"));
    }
}

#[test]
fn verify_rejects_foreign_key_with_verify_failed() {
    let (key_a, _) = keypair_a();
    let (_, pub_pem_b) = keypair_b();

    let envelope = seal("cmd_ping", json!({}), key_a, SigAlg::Rs256, None).unwrap();
    let err = verify(&envelope.to_value(), pub_pem_b, &VerifyOptions::default()).unwrap_err();
    assert_eq!(err, VerifyError::VerifyFailed);
}

#[test]
fn any_single_content_mutation_breaks_the_signature() {
    let (key, pub_pem) = keypair_a();
    let envelope = seal(
        "cmd_configure",
        json!({"mode": "active", "retries": 2, "tags": ["a", "b"]}),
        key,
        SigAlg::Rs256,
        None,
    )
    .unwrap();
    let baseline = envelope.to_value();
    verify(&baseline, pub_pem, &VerifyOptions::default()).unwrap();

    let mutations: Vec<(&str, Value)> = vec![
        ("mode", json!("passive")),
        ("retries", json!(3)),
        ("tags", json!(["a"])),
        ("added", json!(true)),
    ];
    for (field, new_value) in mutations {
        let mut tampered = baseline.clone();
        tampered["content"][field] = new_value;
        let err = verify(&tampered, pub_pem, &VerifyOptions::default()).unwrap_err();
        assert_eq!(err, VerifyError::VerifyFailed, "mutating {field:?}");
    }
}

#[test]
fn structurally_equal_envelopes_share_wire_bytes() {
    let (key, _) = keypair_a();
    // Same logical content, different construction order.
    let mut first = serde_json::Map::new();
    first.insert("alpha".to_string(), json!(1));
    first.insert("zebra".to_string(), json!({"y": 2, "x": 1}));
    let mut second = serde_json::Map::new();
    second.insert("zebra".to_string(), json!({"x": 1, "y": 2}));
    second.insert("alpha".to_string(), json!(1));

    let a = swarmlink::envelope::seal_at(
        1700000000.0,
        "cmd_ping",
        Value::Object(first),
        key,
        SigAlg::Rs256,
        None,
    )
    .unwrap();
    let b = swarmlink::envelope::seal_at(
        1700000000.0,
        "cmd_ping",
        Value::Object(second),
        key,
        SigAlg::Rs256,
        None,
    )
    .unwrap();
    assert_eq!(a.to_wire_string().unwrap(), b.to_wire_string().unwrap());
}

#[test]
fn stale_envelope_fails_with_timestamp_skew() {
    let (key, pub_pem) = keypair_a();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64();
    let envelope = swarmlink::envelope::seal_at(
        now - 1000.0,
        "cmd_ping",
        json!({}),
        key,
        SigAlg::Rs256,
        None,
    )
    .unwrap();

    let opts = VerifyOptions::default().with_max_clock_skew_secs(300);
    let err = verify(&envelope.to_value(), pub_pem, &opts).unwrap_err();
    assert!(matches!(err, VerifyError::TimestampSkew { .. }));

    // A generous skew window accepts the same envelope.
    let opts = VerifyOptions::default().with_max_clock_skew_secs(2000);
    verify(&envelope.to_value(), pub_pem, &opts).unwrap();
}

#[test]
fn hybrid_wrap_open_round_trips_arbitrary_payloads() {
    let (signer, _) = keypair_a();
    let (recipient, _) = keypair_b();
    let recipient_pub = RsaPublicKey::from(recipient);

    let payloads = [
        json!({}),
        json!({"prompt": "report status", "priority": 9}),
        json!({"blob": "QUJDREVGRw==", "nested": {"list": [null, 1.5, "s"]}}),
    ];
    for content in payloads {
        let inner = seal("cmd_oracle", content, signer, SigAlg::Rs256, None).unwrap();
        let outer = wrap_secure(
            &inner,
            Some(&recipient_pub),
            Some(signer),
            &SecureOptions::signed_and_encrypted(),
        )
        .unwrap();

        let opened = open_secure(&outer.content, recipient).unwrap();
        assert_eq!(opened, inner.to_value());
    }
}

#[test]
fn fresh_symmetric_key_per_message() {
    let (signer, _) = keypair_a();
    let (recipient, _) = keypair_b();
    let recipient_pub = RsaPublicKey::from(recipient);

    let inner = seal("cmd_ping", json!({}), signer, SigAlg::Rs256, None).unwrap();
    let opts = SecureOptions {
        encrypt: true,
        ..Default::default()
    };
    let first = wrap_secure(&inner, Some(&recipient_pub), None, &opts).unwrap();
    let second = wrap_secure(&inner, Some(&recipient_pub), None, &opts).unwrap();

    // Same plaintext, but fresh key and nonce every time.
    assert_ne!(first.content["ek"], second.content["ek"]);
    assert_ne!(first.content["iv"], second.content["iv"]);
    assert_ne!(first.content["ct"], second.content["ct"]);
}

#[test]
fn open_secure_does_not_reveal_which_step_failed() {
    let (signer, _) = keypair_a();
    let (recipient, _) = keypair_b();
    let recipient_pub = RsaPublicKey::from(recipient);

    let inner = seal("cmd_ping", json!({}), signer, SigAlg::Rs256, None).unwrap();
    let opts = SecureOptions {
        encrypt: true,
        ..Default::default()
    };
    let outer = wrap_secure(&inner, Some(&recipient_pub), None, &opts).unwrap();

    // Wrong private key: key unwrap fails.
    let unwrap_err = open_secure(&outer.content, signer).unwrap_err();
    // Corrupted tag: authentication fails.
    let mut corrupted = outer.content.clone();
    corrupted["tag"] = json!("AAAAAAAAAAAAAAAAAAAAAA==");
    let tag_err = open_secure(&corrupted, recipient).unwrap_err();

    assert!(matches!(unwrap_err, SecureError::OpenFailed));
    assert!(matches!(tag_err, SecureError::OpenFailed));
    assert_eq!(unwrap_err.to_string(), tag_err.to_string());
}

#[test]
fn both_public_key_encodings_verify() {
    let (key, _) = keypair_a();
    let public_key = RsaPublicKey::from(key);
    let spki_pem = public_key
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .unwrap();
    let pkcs1_pem = public_key.to_pkcs1_pem(rsa::pkcs8::LineEnding::LF).unwrap();

    let envelope = seal("cmd_ping", json!({}), key, SigAlg::Rs256, None).unwrap();
    let value = envelope.to_value();
    verify(&value, &spki_pem, &VerifyOptions::default()).unwrap();
    verify(&value, &pkcs1_pem, &VerifyOptions::default()).unwrap();
}

#[test]
fn wire_form_matches_the_documented_shape() {
    let (key, _) = keypair_a();
    let envelope = seal("cmd_ping", json!({"k": "v"}), key, SigAlg::Rs256, Some("key-1")).unwrap();
    let wire: Value = serde_json::from_str(&envelope.to_wire_string().unwrap()).unwrap();

    assert!(wire["ts"].is_f64());
    assert_eq!(wire["handler"], "cmd_ping");
    assert_eq!(wire["content"], json!({"k": "v"}));
    assert!(wire["sig"].is_string());
    assert_eq!(wire["salg"], "RS256");
    assert_eq!(wire["ikid"], "key-1");
}
