//! Networking boundary for idmesh nodes
//!
//! The real transport (connection establishment, NAT traversal, framing)
//! lives outside this workspace. This crate provides:
//! - Peer identity
//! - The [`Transport`] capability trait consumed by the node
//! - The wire envelope exchanged between nodes
//! - An in-memory transport for tests and local simulation

pub mod messages;
pub mod peer;
pub mod transport;

pub use messages::{AntiEntropyMessage, DhtMessage, WireMessage};
pub use peer::PeerId;
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::{Transport, TransportError, TransportEvent};
