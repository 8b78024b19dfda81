//! Configuration for idmeshd

use crate::consensus::ConsensusConfig;
use crate::dht::DhtConfig;
use crate::gossip::GossipConfig;
use crate::ledger::LedgerConfig;
use crate::sync::SyncConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// idmeshd - decentralized identity registry node
#[derive(Parser, Debug, Clone)]
#[command(name = "idmeshd")]
#[command(about = "Identity registry node: ledger, DHT, gossip, consensus and sync")]
pub struct Config {
    /// Address this node announces to peers
    #[arg(short, long, default_value = "mem://idmeshd", env = "IDMESH_LISTEN")]
    pub listen: String,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/idmeshd")]
    pub data_dir: PathBuf,

    /// Hex-encoded 32-byte key seed. Generated and persisted when absent.
    #[arg(long, env = "IDMESH_KEY_SEED")]
    pub key_seed: Option<String>,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    // DHT
    /// Nodes responsible for each key
    #[arg(long, default_value = "3")]
    pub replica_count: usize,

    /// Parallel queries per lookup round
    #[arg(long, default_value = "3")]
    pub alpha: usize,

    /// Routing table bucket capacity
    #[arg(long, default_value = "20")]
    pub bucket_size: usize,

    /// Default DHT record lifetime in seconds
    #[arg(long, default_value = "86400")]
    pub record_ttl_secs: u64,

    /// Drop DHT nodes silent for this many seconds
    #[arg(long, default_value = "1800")]
    pub inactivity_secs: u64,

    /// DHT maintenance interval in seconds
    #[arg(long, default_value = "60")]
    pub dht_maintenance_secs: u64,

    // Gossip
    /// Peers each message is forwarded to
    #[arg(long, default_value = "6")]
    pub fanout: usize,

    /// Reject messages older than this many seconds
    #[arg(long, default_value = "300")]
    pub max_message_age_secs: u64,

    /// Tolerated clock skew in seconds
    #[arg(long, default_value = "30")]
    pub clock_skew_secs: u64,

    /// Dedup cache capacity
    #[arg(long, default_value = "10000")]
    pub message_cache_size: usize,

    /// Seconds a message stays in the dedup cache
    #[arg(long, default_value = "300")]
    pub message_ttl_secs: u64,

    /// Re-gossip interval in seconds
    #[arg(long, default_value = "30")]
    pub regossip_secs: u64,

    /// Anti-entropy interval in seconds
    #[arg(long, default_value = "60")]
    pub anti_entropy_secs: u64,

    // Consensus
    /// Fraction of participants that must vote and approve
    #[arg(long, default_value = "0.67")]
    pub consensus_threshold: f64,

    /// Discard pending proposals after this many seconds (kept forever if unset)
    #[arg(long)]
    pub proposal_ttl_secs: Option<u64>,

    /// Run registered and announced identities through threshold voting
    #[arg(long)]
    pub consensus_voting: bool,

    // Sync
    /// Periodic sync interval in seconds
    #[arg(long, default_value = "60")]
    pub sync_interval_secs: u64,

    /// Sync cycle deadline in seconds
    #[arg(long, default_value = "30")]
    pub sync_timeout_secs: u64,

    /// Identities per sync response batch
    #[arg(long, default_value = "50")]
    pub sync_batch_size: usize,

    /// Delay between sync response batches in milliseconds
    #[arg(long, default_value = "100")]
    pub sync_batch_delay_ms: u64,

    // Ledger
    /// Remove identities older than this many days
    #[arg(long, default_value = "30")]
    pub retention_days: u64,

    /// Retention sweep interval in seconds
    #[arg(long, default_value = "3600")]
    pub retention_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen.is_empty() {
            anyhow::bail!("Listen address cannot be empty");
        }
        if let Some(seed) = &self.key_seed {
            parse_seed(seed)?;
        }
        if !(0.5..=1.0).contains(&self.consensus_threshold) {
            anyhow::bail!(
                "Consensus threshold must be within [0.5, 1.0], got {}",
                self.consensus_threshold
            );
        }
        if self.replica_count == 0 || self.alpha == 0 || self.bucket_size == 0 {
            anyhow::bail!("replica count, alpha and bucket size must be positive");
        }
        if self.fanout == 0 {
            anyhow::bail!("Gossip fanout must be positive");
        }
        if self.sync_batch_size == 0 {
            anyhow::bail!("Sync batch size must be positive");
        }
        if self.message_cache_size == 0 {
            anyhow::bail!("Message cache size must be positive");
        }
        let intervals = [
            self.dht_maintenance_secs,
            self.regossip_secs,
            self.anti_entropy_secs,
            self.sync_interval_secs,
            self.sync_timeout_secs,
            self.retention_interval_secs,
        ];
        if intervals.contains(&0) {
            anyhow::bail!("Intervals and timeouts must be at least one second");
        }
        match self.log_format.as_str() {
            "json" | "pretty" => Ok(()),
            other => anyhow::bail!("Unknown log format: {}", other),
        }
    }

    /// Decoded key seed, if one was configured
    pub fn seed(&self) -> anyhow::Result<Option<[u8; 32]>> {
        self.key_seed.as_deref().map(parse_seed).transpose()
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            replica_count: self.replica_count,
            alpha: self.alpha,
            bucket_size: self.bucket_size,
            default_ttl: Duration::from_secs(self.record_ttl_secs),
            inactivity_threshold: Duration::from_secs(self.inactivity_secs),
            ..Default::default()
        }
    }

    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            fanout: self.fanout,
            max_message_age: Duration::from_secs(self.max_message_age_secs),
            clock_skew: Duration::from_secs(self.clock_skew_secs),
            cache_size: self.message_cache_size,
            message_ttl: Duration::from_secs(self.message_ttl_secs),
            ..Default::default()
        }
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            threshold: self.consensus_threshold,
            proposal_ttl: self.proposal_ttl_secs.map(Duration::from_secs),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_size: self.sync_batch_size,
            batch_delay: Duration::from_millis(self.sync_batch_delay_ms),
            timeout: Duration::from_secs(self.sync_timeout_secs),
            interval: Duration::from_secs(self.sync_interval_secs),
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            retention: Duration::from_secs(self.retention_days * 24 * 60 * 60),
        }
    }

    /// Timer periods for the node loop
    pub fn schedule(&self) -> Schedule {
        Schedule {
            sync: Duration::from_secs(self.sync_interval_secs),
            regossip: Duration::from_secs(self.regossip_secs),
            anti_entropy: Duration::from_secs(self.anti_entropy_secs),
            gossip_cleanup: Duration::from_secs(self.message_ttl_secs.max(1)),
            dht_maintenance: Duration::from_secs(self.dht_maintenance_secs),
            retention: Duration::from_secs(self.retention_interval_secs),
            sync_watchdog: (Duration::from_secs(self.sync_timeout_secs) / 4)
                .max(Duration::from_millis(250)),
        }
    }
}

/// Periodic task intervals of a running node
#[derive(Debug, Clone)]
pub struct Schedule {
    pub sync: Duration,
    pub regossip: Duration,
    pub anti_entropy: Duration,
    pub gossip_cleanup: Duration,
    pub dht_maintenance: Duration,
    pub retention: Duration,
    /// Sync deadline checks and proposal expiry, a fraction of the sync timeout
    pub sync_watchdog: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            sync: crate::sync::DEFAULT_SYNC_INTERVAL,
            regossip: Duration::from_secs(30),
            anti_entropy: Duration::from_secs(60),
            gossip_cleanup: crate::gossip::DEFAULT_MESSAGE_TTL,
            dht_maintenance: Duration::from_secs(60),
            retention: Duration::from_secs(60 * 60),
            sync_watchdog: crate::sync::DEFAULT_SYNC_TIMEOUT / 4,
        }
    }
}

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Key seed (deterministic identity across restarts)
    pub key_seed: [u8; 32],
}

fn parse_seed(hex_seed: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(hex_seed.trim())?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("Key seed must be 32 bytes, got {}", b.len()))
}
