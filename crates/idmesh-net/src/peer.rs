//! Peer identity

pub use idmesh_core::types::PeerId;
