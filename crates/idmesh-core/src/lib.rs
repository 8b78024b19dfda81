//! idmesh Core Library
//!
//! This crate provides the data model, canonical encoding, and cryptographic
//! primitives shared by every idmesh component.
//!
//! # Modules
//!
//! - [`types`]: Identities, node/peer ids, gossip and sync payloads
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Keypairs, digests, id derivation and signature checks
//! - [`error`]: Error taxonomy
//! - [`time`]: Wall-clock helpers (unix milliseconds)

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod time;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use types::*;
