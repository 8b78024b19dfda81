//! idmeshd - decentralized identity registry node
//!
//! A node keeps a durable ledger of self-sovereign identities and shares it
//! with its peers through:
//! - A Kademlia-style DHT for key-addressed storage and lookup
//! - Epidemic gossip with per-peer trust scoring and anti-entropy
//! - Threshold-voting consensus over identity proposals
//! - Batched ledger reconciliation (sync)

pub mod config;
pub mod consensus;
pub mod dht;
pub mod events;
pub mod gossip;
pub mod ledger;
pub mod node;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use consensus::ConsensusManager;
pub use dht::DhtNode;
pub use events::{EventBus, NodeEvent};
pub use gossip::GossipEngine;
pub use ledger::Ledger;
pub use node::{Node, NodeOptions};
pub use storage::{MemoryStore, Persistence, SledStore};
pub use sync::SyncManager;
