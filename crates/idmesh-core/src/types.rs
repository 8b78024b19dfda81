//! Core data model for idmesh
//!
//! Wire-facing types serialize to camelCase JSON-compatible shapes. Field
//! order matters for canonical (postcard) encoding, so do not reorder fields
//! without bumping the signing domains in [`crate::crypto`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 32-byte fixed-size array used for hashes and keys.
pub type Bytes32 = [u8; 32];

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;

/// Width of the DHT id space in bytes (160-bit digest).
pub const NODE_ID_LEN: usize = 20;

/// Width of the DHT id space in bits; also the number of k-buckets.
pub const NODE_ID_BITS: usize = NODE_ID_LEN * 8;

// =============================================================================
// PEER / NODE IDENTIFIERS
// =============================================================================

/// Transport-level peer identifier: the peer's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub Bytes32);

impl PeerId {
    /// Create from a transport public key
    pub fn from_public_key(public_key: &Bytes32) -> Self {
        Self(*public_key)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }

    /// Full lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a full hex encoding
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: Bytes32 = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Position in the 160-bit DHT id space. Keys and nodes share this space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// XOR distance to another id.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// XOR distance between two [`NodeId`]s.
///
/// Ordering is big-endian lexicographic, which is numeric ordering of the
/// 160-bit value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Distance(pub [u8; NODE_ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; NODE_ID_LEN]);
    pub const MAX: Distance = Distance([0xff; NODE_ID_LEN]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of significant bits (0 for the zero distance, 160 max).
    pub fn bit_length(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return NODE_ID_BITS - (byte_idx * 8 + byte.leading_zeros() as usize);
            }
        }
        0
    }
}

// =============================================================================
// IDENTITY
// =============================================================================

/// A self-sovereign identity record.
///
/// Immutable value: an update is a new `Identity` with the same `id` and a
/// later `timestamp`. The signature covers every other field (see
/// [`crate::crypto::identity_sign_bytes`]).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// `did:idmesh:<hex>` derived from the public key
    pub id: String,
    pub public_key: Bytes32,
    pub timestamp: Timestamp,
    /// Ed25519 signature (64 bytes)
    pub signature: Vec<u8>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Identity {
    /// Strictly-newer check used by every last-write-wins merge.
    pub fn supersedes(&self, other: &Identity) -> bool {
        self.id == other.id && self.timestamp > other.timestamp
    }

    /// Metadata lookup
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }
}

// =============================================================================
// GOSSIP
// =============================================================================

/// Gossip message type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GossipKind {
    IdentityAnnouncement,
    IdentityVerification,
    SyncRequest,
    SyncResponse,
}

impl GossipKind {
    /// Kinds that spread epidemically. Sync traffic is point-to-point and is
    /// never re-propagated.
    pub fn is_epidemic(&self) -> bool {
        matches!(
            self,
            GossipKind::IdentityAnnouncement | GossipKind::IdentityVerification
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GossipKind::IdentityAnnouncement => "identity_announcement",
            GossipKind::IdentityVerification => "identity_verification",
            GossipKind::SyncRequest => "sync_request",
            GossipKind::SyncResponse => "sync_response",
        }
    }
}

impl fmt::Display for GossipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer's opinion on an identity, optionally bound to a consensus proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationNotice {
    pub identity_id: String,
    pub proposal_id: Option<String>,
    /// Voter id (consensus participant id)
    pub verifier: String,
    pub approved: bool,
}

/// `sync_request{lastSync, nodeId, timestamp}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub last_sync: Timestamp,
    pub node_id: String,
    pub timestamp: Timestamp,
}

/// `sync_response{identities[], batchNumber, totalBatches, nodeId, timestamp}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub identities: Vec<Identity>,
    /// 1-based
    pub batch_number: u32,
    pub total_batches: u32,
    pub node_id: String,
    pub timestamp: Timestamp,
}

/// Gossip payload. On the wire the variant is implied by the sibling `type`
/// field; [`GossipMessage`] validation rejects a mismatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GossipData {
    IdentityAnnouncement(Identity),
    IdentityVerification(VerificationNotice),
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
}

impl GossipData {
    pub fn kind(&self) -> GossipKind {
        match self {
            GossipData::IdentityAnnouncement(_) => GossipKind::IdentityAnnouncement,
            GossipData::IdentityVerification(_) => GossipKind::IdentityVerification,
            GossipData::SyncRequest(_) => GossipKind::SyncRequest,
            GossipData::SyncResponse(_) => GossipKind::SyncResponse,
        }
    }
}

/// Derived gossip message identifier (never transmitted).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Bytes32);

impl MessageId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// `{type, data, sender, timestamp, signature}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    #[serde(rename = "type")]
    pub kind: GossipKind,
    pub data: GossipData,
    pub sender: PeerId,
    pub timestamp: Timestamp,
    pub signature: Vec<u8>,
}

// =============================================================================
// DHT
// =============================================================================

/// Routing-table record for a remote DHT node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhtContact {
    pub id: NodeId,
    /// Transport peer used to reach this node
    pub peer: PeerId,
    pub address: String,
    pub last_seen: Timestamp,
}

/// Stored DHT value with its lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DhtRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
    /// Lifetime in milliseconds
    pub ttl: u64,
}

impl DhtRecord {
    /// Expired when `now > timestamp + ttl`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.timestamp.saturating_add(self.ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_identity_and_symmetry() {
        let a = NodeId([0x12; NODE_ID_LEN]);
        let mut b_bytes = [0x34; NODE_ID_LEN];
        b_bytes[19] = 0x01;
        let b = NodeId(b_bytes);

        assert!(a.distance(&a).is_zero());
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(!a.distance(&b).is_zero());
    }

    #[test]
    fn test_distance_bit_length() {
        assert_eq!(Distance::ZERO.bit_length(), 0);
        assert_eq!(Distance::MAX.bit_length(), 160);

        let mut low = [0u8; NODE_ID_LEN];
        low[19] = 0b0000_0001;
        assert_eq!(Distance(low).bit_length(), 1);

        let mut mid = [0u8; NODE_ID_LEN];
        mid[18] = 0b0001_0000;
        assert_eq!(Distance(mid).bit_length(), 13);
    }

    #[test]
    fn test_distance_ordering_is_numeric() {
        let mut near = [0u8; NODE_ID_LEN];
        near[19] = 0xff;
        let mut far = [0u8; NODE_ID_LEN];
        far[0] = 0x01;
        assert!(Distance(near) < Distance(far));
    }

    #[test]
    fn test_record_expiry() {
        let record = DhtRecord {
            key: "user:alice".into(),
            value: b"payload".to_vec(),
            timestamp: 1_000,
            ttl: 1_000,
        };
        assert!(!record.is_expired(1_500));
        assert!(!record.is_expired(2_000));
        assert!(record.is_expired(2_001));
    }

    #[test]
    fn test_gossip_kind_wire_names() {
        let json = serde_json::to_string(&GossipKind::SyncResponse).unwrap();
        assert_eq!(json, "\"sync_response\"");
        assert!(GossipKind::IdentityAnnouncement.is_epidemic());
        assert!(!GossipKind::SyncRequest.is_epidemic());
    }

    #[test]
    fn test_sync_request_json_shape() {
        let req = SyncRequest {
            last_sync: 5,
            node_id: "abc".into(),
            timestamp: 9,
        };
        let value: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["lastSync"], 5);
        assert_eq!(value["nodeId"], "abc");
    }

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let peer = PeerId([7; 32]);
        assert_eq!(PeerId::from_hex(&peer.to_hex()), Some(peer));
        assert_eq!(PeerId::from_hex("zz"), None);
    }
}
