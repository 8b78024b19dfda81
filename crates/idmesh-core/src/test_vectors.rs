//! Test vectors for interop with other idmesh implementations
//!
//! Vectors are generated from fixed seeds so any implementation can
//! reproduce them byte for byte.

use crate::canonical::{canonical_bytes, IdentityUnsigned};
use crate::crypto::*;
use crate::types::*;
use serde::Serialize;
use std::collections::BTreeMap;

/// Test vector output format (JSON serializable)
#[derive(Serialize)]
pub struct TestVector {
    pub name: String,
    pub description: String,
    pub inputs: serde_json::Value,
    pub canonical_bytes_hex: String,
    pub hash_hex: String,
}

/// Generate all test vectors as JSON
pub fn generate_test_vectors() -> Vec<TestVector> {
    vec![did_vector(), identity_vector(), dht_key_vector()]
}

fn did_vector() -> TestVector {
    let keypair = KeyPair::from_seed(&[0x11; 32]);
    let public_key = keypair.public_key();
    let did = derive_did(&public_key);

    TestVector {
        name: "did_derivation".into(),
        description: "did = \"did:idmesh:\" || hex(BLAKE3(\"idmesh-did-v1\" || pk)[..20])".into(),
        inputs: serde_json::json!({
            "seed_hex": hex::encode([0x11u8; 32]),
            "public_key_hex": hex::encode(public_key),
        }),
        canonical_bytes_hex: hex::encode(public_key),
        hash_hex: did.trim_start_matches(DID_PREFIX).to_string(),
    }
}

fn identity_vector() -> TestVector {
    let keypair = KeyPair::from_seed(&[0x22; 32]);
    let mut metadata = BTreeMap::new();
    metadata.insert("displayName".to_string(), "alice".to_string());
    let identity = create_identity(&keypair, 1_700_000_000_000, Some(metadata)).unwrap();
    let unsigned = canonical_bytes(&IdentityUnsigned::from(&identity)).unwrap();

    TestVector {
        name: "identity_signature".into(),
        description: "signature = Ed25519(\"idmesh-identity-sig-v1\" || canonical(unsigned))".into(),
        inputs: serde_json::json!({
            "seed_hex": hex::encode([0x22u8; 32]),
            "timestamp": identity.timestamp,
            "metadata": { "displayName": "alice" },
        }),
        canonical_bytes_hex: hex::encode(unsigned),
        hash_hex: hex::encode(&identity.signature),
    }
}

fn dht_key_vector() -> TestVector {
    let key = "identity:did:idmesh:00";
    TestVector {
        name: "dht_key_id".into(),
        description: "key_id = BLAKE3(\"idmesh-dht-key-v1\" || key)[..20]".into(),
        inputs: serde_json::json!({ "key": key }),
        canonical_bytes_hex: hex::encode(key.as_bytes()),
        hash_hex: hex::encode(key_id(key).0),
    }
}

#[test]
fn test_vectors_are_reproducible() {
    let first: Vec<String> = generate_test_vectors()
        .iter()
        .map(|v| v.hash_hex.clone())
        .collect();
    let second: Vec<String> = generate_test_vectors()
        .iter()
        .map(|v| v.hash_hex.clone())
        .collect();
    assert_eq!(first, second);
}

#[test]
fn test_vector_shapes() {
    let vectors = generate_test_vectors();
    assert_eq!(vectors.len(), 3);

    // 20-byte digests render as 40 hex chars, signatures as 128
    assert_eq!(vectors[0].hash_hex.len(), 40);
    assert_eq!(vectors[1].hash_hex.len(), 128);
    assert_eq!(vectors[2].hash_hex.len(), 40);

    let json = serde_json::to_string_pretty(&vectors).unwrap();
    assert!(json.contains("identity_signature"));
}
