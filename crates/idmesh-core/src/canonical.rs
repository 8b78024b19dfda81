//! Canonical encoding for idmesh
//!
//! All hashed/signed objects use postcard serialization:
//! - Field order is Rust struct field order
//! - Maps are `BTreeMap` (sorted keys)
//! - Repeated identity lists are sorted by `(id, timestamp)` and deduped
//!   before hashing, so set-valued content hashes the same regardless of
//!   the order it was supplied in

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;
use std::collections::BTreeMap;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// The signed portion of an [`Identity`]: every field except the signature.
#[derive(Serialize)]
pub struct IdentityUnsigned<'a> {
    pub id: &'a str,
    pub public_key: &'a Bytes32,
    pub timestamp: Timestamp,
    pub metadata: &'a Option<BTreeMap<String, String>>,
}

impl<'a> From<&'a Identity> for IdentityUnsigned<'a> {
    fn from(identity: &'a Identity) -> Self {
        Self {
            id: &identity.id,
            public_key: &identity.public_key,
            timestamp: identity.timestamp,
            metadata: &identity.metadata,
        }
    }
}

/// The signed/hashed portion of a [`GossipMessage`]: `{type, data, sender, timestamp}`.
#[derive(Serialize)]
pub struct MessageUnsigned<'a> {
    pub kind: GossipKind,
    pub data: &'a GossipData,
    pub sender: &'a PeerId,
    pub timestamp: Timestamp,
}

impl<'a> From<&'a GossipMessage> for MessageUnsigned<'a> {
    fn from(message: &'a GossipMessage) -> Self {
        Self {
            kind: message.kind,
            data: &message.data,
            sender: &message.sender,
            timestamp: message.timestamp,
        }
    }
}

/// Sort by `(id, timestamp)` and drop exact duplicates.
pub fn normalize_identity_set(identities: &mut Vec<Identity>) {
    identities.sort_by(|a, b| a.id.cmp(&b.id).then(a.timestamp.cmp(&b.timestamp)));
    identities.dedup();
}

/// Check that metadata keys are non-empty.
pub fn validate_metadata(metadata: &Option<BTreeMap<String, String>>) -> Result<()> {
    if let Some(map) = metadata {
        if map.keys().any(|k| k.is_empty()) {
            return Err(Error::Validation("empty metadata key".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, ts: u64) -> Identity {
        Identity {
            id: id.into(),
            public_key: [1; 32],
            timestamp: ts,
            signature: vec![0; 64],
            metadata: None,
        }
    }

    #[test]
    fn test_canonical_bytes_deterministic() {
        let id = identity("did:idmesh:aa", 42);
        let bytes1 = canonical_bytes(&IdentityUnsigned::from(&id)).unwrap();
        let bytes2 = canonical_bytes(&IdentityUnsigned::from(&id)).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_signature_not_covered() {
        let a = identity("did:idmesh:aa", 42);
        let mut b = a.clone();
        b.signature = vec![9; 64];
        assert_eq!(
            canonical_bytes(&IdentityUnsigned::from(&a)).unwrap(),
            canonical_bytes(&IdentityUnsigned::from(&b)).unwrap()
        );
    }

    #[test]
    fn test_identity_set_normalization() {
        let mut set = vec![
            identity("b", 1),
            identity("a", 2),
            identity("a", 1),
            identity("b", 1),
        ];
        normalize_identity_set(&mut set);
        let keys: Vec<_> = set.iter().map(|i| (i.id.as_str(), i.timestamp)).collect();
        assert_eq!(keys, vec![("a", 1), ("a", 2), ("b", 1)]);
    }

    #[test]
    fn test_metadata_validation() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), "alice".to_string());
        assert!(validate_metadata(&Some(map.clone())).is_ok());

        map.insert(String::new(), "x".to_string());
        assert!(validate_metadata(&Some(map)).is_err());
        assert!(validate_metadata(&None).is_ok());
    }
}
