//! Cryptographic capability for idmesh
//!
//! All digests use BLAKE3 with domain separation prefixes; signatures are
//! Ed25519. Nothing here implements a primitive, it only fixes how the
//! primitives are applied to idmesh objects.

use crate::canonical::{canonical_bytes, normalize_identity_set, validate_metadata};
use crate::canonical::{IdentityUnsigned, MessageUnsigned};
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::collections::BTreeMap;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for DID derivation
pub const DOMAIN_DID: &[u8] = b"idmesh-did-v1";
/// Domain prefix for identity signatures
pub const DOMAIN_IDENTITY_SIG: &[u8] = b"idmesh-identity-sig-v1";
/// Domain prefix for gossip message ids
pub const DOMAIN_MESSAGE_ID: &[u8] = b"idmesh-message-id-v1";
/// Domain prefix for gossip message signatures
pub const DOMAIN_MESSAGE_SIG: &[u8] = b"idmesh-message-sig-v1";
/// Domain prefix for DHT key hashing
pub const DOMAIN_DHT_KEY: &[u8] = b"idmesh-dht-key-v1";
/// Domain prefix for DHT node ids
pub const DOMAIN_NODE_ID: &[u8] = b"idmesh-node-id-v1";
/// Domain prefix for consensus proposal ids
pub const DOMAIN_PROPOSAL: &[u8] = b"idmesh-proposal-v1";

/// DID method prefix
pub const DID_PREFIX: &str = "did:idmesh:";

// =============================================================================
// KEYS
// =============================================================================

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from seed bytes (deterministic recovery and tests)
    pub fn from_seed(seed: &Bytes32) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> Bytes32 {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The transport peer id for this key
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", self.peer_id())
    }
}

/// Verify an Ed25519 signature.
pub fn verify(public_key: &Bytes32, message: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| Error::InvalidSignature)?;
    let sig = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| Error::InvalidSignature)
}

// =============================================================================
// DIGESTS
// =============================================================================

/// Plain BLAKE3 digest.
pub fn digest(data: &[u8]) -> Bytes32 {
    *blake3::hash(data).as_bytes()
}

fn digest_160(domain: &[u8], data: &[u8]) -> [u8; NODE_ID_LEN] {
    let mut hasher = Hasher::new();
    hasher.update(domain);
    hasher.update(data);
    let full = hasher.finalize();
    let mut out = [0u8; NODE_ID_LEN];
    out.copy_from_slice(&full.as_bytes()[..NODE_ID_LEN]);
    out
}

/// Map a DHT key into the node id space.
///
/// `key_id = BLAKE3("idmesh-dht-key-v1" || key)[..20]`
pub fn key_id(key: &str) -> NodeId {
    NodeId(digest_160(DOMAIN_DHT_KEY, key.as_bytes()))
}

/// DHT node id of a transport peer.
pub fn node_id_for_peer(peer: &PeerId) -> NodeId {
    NodeId(digest_160(DOMAIN_NODE_ID, peer.as_bytes()))
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Derive the DID for a public key.
///
/// `did = "did:idmesh:" || hex(BLAKE3("idmesh-did-v1" || public_key)[..20])`
pub fn derive_did(public_key: &Bytes32) -> String {
    format!("{}{}", DID_PREFIX, hex::encode(digest_160(DOMAIN_DID, public_key)))
}

/// Bytes covered by an identity signature.
///
/// `sign_bytes = "idmesh-identity-sig-v1" || canonical_bytes(identity without signature)`
pub fn identity_sign_bytes(identity: &Identity) -> Result<Vec<u8>> {
    let unsigned = canonical_bytes(&IdentityUnsigned::from(identity))?;
    let mut bytes = Vec::with_capacity(DOMAIN_IDENTITY_SIG.len() + unsigned.len());
    bytes.extend_from_slice(DOMAIN_IDENTITY_SIG);
    bytes.extend_from_slice(&unsigned);
    Ok(bytes)
}

/// Issue a signed identity for `keypair`.
pub fn create_identity(
    keypair: &KeyPair,
    timestamp: Timestamp,
    metadata: Option<BTreeMap<String, String>>,
) -> Result<Identity> {
    validate_metadata(&metadata)?;
    let public_key = keypair.public_key();
    let mut identity = Identity {
        id: derive_did(&public_key),
        public_key,
        timestamp,
        signature: Vec::new(),
        metadata,
    };
    let sign_bytes = identity_sign_bytes(&identity)?;
    identity.signature = keypair.sign(&sign_bytes).to_vec();
    Ok(identity)
}

/// Verify an identity: the DID matches the key and the signature verifies.
pub fn verify_identity(identity: &Identity) -> Result<()> {
    if identity.id.is_empty() {
        return Err(Error::MissingField("id".into()));
    }
    if identity.signature.is_empty() {
        return Err(Error::MissingField("signature".into()));
    }
    let computed = derive_did(&identity.public_key);
    if computed != identity.id {
        return Err(Error::IdMismatch {
            computed,
            transmitted: identity.id.clone(),
        });
    }
    validate_metadata(&identity.metadata)?;
    let sign_bytes = identity_sign_bytes(identity)?;
    verify(&identity.public_key, &sign_bytes, &identity.signature)
}

// =============================================================================
// GOSSIP MESSAGES
// =============================================================================

/// Compute the dedup id of a gossip message.
///
/// `MessageId = BLAKE3("idmesh-message-id-v1" || canonical_bytes({type, data, sender, timestamp}))`
pub fn compute_message_id(message: &GossipMessage) -> Result<MessageId> {
    let bytes = canonical_bytes(&MessageUnsigned::from(message))?;
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_MESSAGE_ID);
    hasher.update(&bytes);
    Ok(MessageId(*hasher.finalize().as_bytes()))
}

fn message_sign_bytes(message: &GossipMessage) -> Result<Vec<u8>> {
    let unsigned = canonical_bytes(&MessageUnsigned::from(message))?;
    let mut bytes = Vec::with_capacity(DOMAIN_MESSAGE_SIG.len() + unsigned.len());
    bytes.extend_from_slice(DOMAIN_MESSAGE_SIG);
    bytes.extend_from_slice(&unsigned);
    Ok(bytes)
}

/// Build and sign a gossip message from `keypair`.
pub fn create_message(
    keypair: &KeyPair,
    data: GossipData,
    timestamp: Timestamp,
) -> Result<GossipMessage> {
    let mut message = GossipMessage {
        kind: data.kind(),
        data,
        sender: keypair.peer_id(),
        timestamp,
        signature: Vec::new(),
    };
    let sign_bytes = message_sign_bytes(&message)?;
    message.signature = keypair.sign(&sign_bytes).to_vec();
    Ok(message)
}

/// Verify a gossip message signature under its sender key.
pub fn verify_message(message: &GossipMessage) -> Result<()> {
    if message.signature.is_empty() {
        return Err(Error::MissingField("signature".into()));
    }
    if message.data.kind() != message.kind {
        return Err(Error::Validation(format!(
            "payload does not match type {}",
            message.kind
        )));
    }
    let sign_bytes = message_sign_bytes(message)?;
    verify(message.sender.as_bytes(), &sign_bytes, &message.signature)
}

// =============================================================================
// CONSENSUS
// =============================================================================

/// Derive a proposal id from the proposed identity set.
///
/// The set is normalized first so the same content always yields the same id.
pub fn compute_proposal_id(identities: &[Identity]) -> Result<String> {
    let mut set = identities.to_vec();
    normalize_identity_set(&mut set);
    let bytes = canonical_bytes(&set)?;
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_PROPOSAL);
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize().as_bytes()))
}
