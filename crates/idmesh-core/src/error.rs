//! Error types for idmesh

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// idmesh error taxonomy.
///
/// Capacity pressure (full caches, full buckets) is resolved by eviction
/// and never reported to callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Derived id does not match the transmitted one
    #[error("id mismatch: computed {computed} != transmitted {transmitted}")]
    IdMismatch { computed: String, transmitted: String },

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Payload rejected by validation (stale, future-dated, malformed)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown proposal, peer or key
    #[error("not found: {0}")]
    NotFound(String),

    /// Existing entry has an equal or later timestamp
    #[error("conflict on {id}: existing timestamp {existing} >= incoming {incoming}")]
    Conflict {
        id: String,
        existing: u64,
        incoming: u64,
    },

    /// No response or quorum within the deadline
    #[error("timed out: {0}")]
    Timeout(String),
}
