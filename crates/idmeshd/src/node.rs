//! idmeshd node - main service loop
//!
//! The node task is the only consumer of transport events and timer ticks,
//! so handlers on one node run in arrival order. Work that waits on peers
//! for longer than a send (DHT maintenance, serving batched sync responses)
//! is spawned so the loop keeps draining replies.

use crate::config::{Config, NodeState, Schedule};
use crate::consensus::{ConsensusConfig, ConsensusError, ConsensusManager, VoteOutcome};
use crate::dht::{DhtConfig, DhtNode, DhtStats};
use crate::events::EventBus;
use crate::gossip::{GossipConfig, GossipEngine, GossipError, GossipStats};
use crate::ledger::{Ledger, LedgerConfig, LedgerError, LedgerStats};
use crate::storage::{Persistence, StorageError};
use crate::sync::{SyncConfig, SyncManager, SyncStats};
use idmesh_core::crypto::{compute_proposal_id, node_id_for_peer, verify_identity, KeyPair};
use idmesh_core::time::now_ms;
use idmesh_core::types::*;
use idmesh_net::{Transport, TransportError, TransportEvent, WireMessage};
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Storage key of the persisted [`NodeState`]
pub const NODE_STATE_KEY: &str = "node";
/// Proposals for which votes are held until the announcement arrives
const EARLY_VOTE_CAPACITY: usize = 1024;

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Corrupt node state: {0}")]
    State(#[from] postcard::Error),
}

/// Everything needed to assemble a node besides its keys, transport and storage.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub ledger: LedgerConfig,
    pub dht: DhtConfig,
    pub gossip: GossipConfig,
    pub consensus: ConsensusConfig,
    pub sync: SyncConfig,
    pub schedule: Schedule,
    pub bootstrap: Vec<String>,
    /// Propose registered and announced identities to consensus and gossip
    /// a verification vote for them
    pub consensus_voting: bool,
}

impl NodeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ledger: config.ledger_config(),
            dht: config.dht_config(),
            gossip: config.gossip_config(),
            consensus: config.consensus_config(),
            sync: config.sync_config(),
            schedule: config.schedule(),
            bootstrap: config.bootstrap.clone(),
            consensus_voting: config.consensus_voting,
        }
    }
}

/// Result of a local registration
#[derive(Debug, Clone)]
pub struct Registration {
    pub message_id: MessageId,
    /// Set when consensus voting is enabled
    pub proposal_id: Option<String>,
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub peer_count: usize,
    pub ledger: LedgerStats,
    pub dht: DhtStats,
    pub gossip: GossipStats,
    pub sync: SyncStats,
    pub consensus_version: u64,
    pub pending_proposals: usize,
}

/// Load the node key: the configured seed wins, then the persisted one,
/// otherwise a fresh seed is generated and persisted.
pub fn load_or_create_keypair(
    store: &dyn Persistence,
    seed: Option<[u8; 32]>,
) -> Result<KeyPair, NodeError> {
    let key_seed = match seed {
        Some(seed) => seed,
        None => match store.get(NODE_STATE_KEY)? {
            Some(bytes) => postcard::from_bytes::<NodeState>(&bytes)?.key_seed,
            None => {
                let mut seed = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut seed);
                seed
            }
        },
    };
    let state = NodeState { key_seed };
    store.put(NODE_STATE_KEY, &postcard::to_allocvec(&state)?)?;
    Ok(KeyPair::from_seed(&key_seed))
}

/// DHT key under which an identity is published
pub fn identity_key(id: &str) -> String {
    format!("identity:{}", id)
}

pub struct Node {
    peer_id: PeerId,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Persistence>,
    ledger: Arc<Ledger>,
    dht: Arc<DhtNode>,
    gossip: Arc<GossipEngine>,
    consensus: Arc<ConsensusManager>,
    sync: Arc<SyncManager>,
    events: EventBus,
    schedule: Schedule,
    bootstrap: Vec<String>,
    consensus_voting: bool,
    /// proposal id -> (voter, approve) received before the proposal opened
    early_votes: Mutex<LruCache<String, Vec<(String, bool)>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    pub fn new(
        options: NodeOptions,
        keypair: KeyPair,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Persistence>,
    ) -> Result<Arc<Self>, NodeError> {
        let events = EventBus::default();
        let peer_id = keypair.peer_id();

        let ledger = Arc::new(Ledger::open(store.clone(), options.ledger, events.clone())?);
        let dht = Arc::new(DhtNode::new(options.dht, transport.clone(), events.clone()));
        let gossip = Arc::new(GossipEngine::new(
            options.gossip,
            keypair,
            transport.clone(),
            events.clone(),
        ));
        let consensus = Arc::new(ConsensusManager::new(options.consensus, events.clone())?);
        consensus.add_participant(peer_id.to_hex());
        let sync = Arc::new(SyncManager::new(
            options.sync,
            ledger.clone(),
            gossip.clone(),
            transport.clone(),
            events.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        let early_votes = NonZeroUsize::new(EARLY_VOTE_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Ok(Arc::new(Self {
            peer_id,
            transport,
            store,
            ledger,
            dht,
            gossip,
            consensus,
            sync,
            events,
            schedule: options.schedule,
            bootstrap: options.bootstrap,
            consensus_voting: options.consensus_voting,
            early_votes: Mutex::new(LruCache::new(early_votes)),
            shutdown_tx,
        }))
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn address(&self) -> String {
        self.transport.local_address()
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn dht(&self) -> &Arc<DhtNode> {
        &self.dht
    }

    pub fn gossip(&self) -> &Arc<GossipEngine> {
        &self.gossip
    }

    pub fn consensus(&self) -> &Arc<ConsensusManager> {
        &self.consensus
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run the node until [`Node::shutdown`] or the transport closes.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: UnboundedReceiver<TransportEvent>,
    ) -> Result<(), NodeError> {
        info!(peer = %self.peer_id, address = %self.address(), "starting idmeshd node");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let connected = self.connect_bootstrap().await;
        if !self.bootstrap.is_empty() {
            info!(connected, total = self.bootstrap.len(), "bootstrap finished");
        }

        let mut sync_tick = ticker(self.schedule.sync);
        let mut regossip_tick = ticker(self.schedule.regossip);
        let mut anti_entropy_tick = ticker(self.schedule.anti_entropy);
        let mut cleanup_tick = ticker(self.schedule.gossip_cleanup);
        let mut maintenance_tick = ticker(self.schedule.dht_maintenance);
        let mut retention_tick = ticker(self.schedule.retention);
        let mut watchdog_tick = ticker(self.schedule.sync_watchdog);

        // Startup sync
        self.sync.start_sync().await;

        loop {
            tokio::select! {
                event = inbound.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            warn!("transport event stream closed");
                            break;
                        }
                    }
                }
                _ = sync_tick.tick() => {
                    self.sync.start_sync().await;
                }
                _ = regossip_tick.tick() => {
                    self.gossip.regossip().await;
                }
                _ = anti_entropy_tick.tick() => {
                    self.gossip.anti_entropy_round().await;
                }
                _ = cleanup_tick.tick() => {
                    let evicted = self.gossip.cleanup();
                    if evicted > 0 {
                        debug!(evicted, "gossip cache cleanup");
                    }
                }
                _ = maintenance_tick.tick() => {
                    let dht = self.dht.clone();
                    tokio::spawn(async move {
                        let report = dht.maintenance().await;
                        debug!(?report, "dht maintenance");
                    });
                }
                _ = retention_tick.tick() => {
                    self.ledger.cleanup_old_identities();
                }
                _ = watchdog_tick.tick() => {
                    let now = now_ms();
                    self.sync.clear_stuck_syncs(now);
                    self.consensus.expire_stale_proposals(now);
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        self.store.flush()?;
        Ok(())
    }

    /// Signal the run loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Connect to every bootstrap address, returning how many succeeded.
    pub async fn connect_bootstrap(&self) -> usize {
        let mut connected = 0;
        for address in &self.bootstrap {
            match self.transport.connect(address).await {
                Ok(peer) => {
                    debug!(peer = %peer, address = %address, "bootstrap peer connected");
                    connected += 1;
                }
                Err(e) => warn!(address = %address, error = %e, "bootstrap connect failed"),
            }
        }
        connected
    }

    pub async fn connect(&self, address: &str) -> Result<PeerId, NodeError> {
        Ok(self.transport.connect(address).await?)
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer, address } => {
                self.on_peer_connected(peer, address).await;
            }
            TransportEvent::PeerDisconnected(peer) => {
                info!(peer = %peer, "peer disconnected");
                self.gossip.remove_peer(&peer);
                self.consensus.remove_participant(&peer.to_hex());
            }
            TransportEvent::MessageReceived { from, message } => match message {
                WireMessage::Gossip(message) => {
                    if self.gossip.process_message(message.clone(), from).await {
                        self.dispatch(message).await;
                    }
                }
                WireMessage::AntiEntropy(message) => {
                    for accepted in self.gossip.handle_anti_entropy(from, message).await {
                        self.dispatch(accepted).await;
                    }
                }
                WireMessage::Dht(message) => {
                    self.dht.handle_message(from, message).await;
                }
            },
        }
    }

    async fn on_peer_connected(&self, peer: PeerId, address: String) {
        info!(peer = %peer, address = %address, "peer connected");
        let was_isolated = self.gossip.peer_count() == 0;
        self.gossip.add_peer(peer);
        self.consensus.add_participant(peer.to_hex());
        self.dht.add_node(DhtContact {
            id: node_id_for_peer(&peer),
            peer,
            address,
            last_seen: now_ms(),
        });

        if was_isolated && self.sync.is_stale(now_ms()) {
            debug!("first peer after isolation, syncing");
            self.sync.start_sync().await;
        }
    }

    /// Act on the payload of an accepted gossip message.
    async fn dispatch(self: &Arc<Self>, message: GossipMessage) {
        let sender = message.sender;
        match message.data {
            GossipData::IdentityAnnouncement(identity) => {
                self.ledger.add_identity(identity.clone());
                if self.consensus_voting {
                    self.propose_and_vote(identity).await;
                }
            }
            GossipData::IdentityVerification(notice) => {
                self.on_verification(notice, sender);
            }
            GossipData::SyncRequest(request) => {
                let sync = self.sync.clone();
                tokio::spawn(async move {
                    sync.handle_request(request, sender).await;
                });
            }
            GossipData::SyncResponse(response) => {
                self.sync.handle_response(response);
            }
        }
    }

    fn on_verification(&self, notice: VerificationNotice, sender: PeerId) {
        let Some(proposal_id) = notice.proposal_id else {
            debug!(identity = %notice.identity_id, verifier = %notice.verifier, "verification without proposal");
            return;
        };
        // A vote counts only for the peer that signed it
        if notice.verifier != sender.to_hex() {
            warn!(verifier = %notice.verifier, sender = %sender, "verification signed by another peer");
            return;
        }
        match self
            .consensus
            .try_vote(&proposal_id, &notice.verifier, notice.approved)
        {
            Ok(outcome) => self.apply_outcome(outcome),
            Err(ConsensusError::UnknownProposal(_)) if self.consensus_voting => {
                debug!(proposal = %proposal_id, voter = %notice.verifier, "holding vote for unseen proposal");
                let mut early = self.early_votes.lock();
                match early.get_mut(&proposal_id) {
                    Some(votes) => votes.push((notice.verifier, notice.approved)),
                    None => {
                        early.put(proposal_id, vec![(notice.verifier, notice.approved)]);
                    }
                }
            }
            Err(e) => debug!(proposal = %proposal_id, error = %e, "vote not applied"),
        }
    }

    /// Apply votes that arrived before `proposal_id` was opened here.
    fn replay_early_votes(&self, proposal_id: &str) {
        let Some(votes) = self.early_votes.lock().pop(proposal_id) else {
            return;
        };
        for (voter, approve) in votes {
            match self.consensus.try_vote(proposal_id, &voter, approve) {
                Ok(outcome) => self.apply_outcome(outcome),
                Err(e) => debug!(proposal = %proposal_id, voter = %voter, error = %e, "held vote not applied"),
            }
        }
    }

    fn apply_outcome(&self, outcome: VoteOutcome) {
        if let VoteOutcome::Committed { identities, version, .. } = outcome {
            let merged = self.ledger.merge_identities(identities);
            debug!(version, merged, "committed identities merged into ledger");
        }
    }

    /// Open (or join) the proposal for `identity` with our own yes vote and
    /// tell the other participants.
    async fn propose_and_vote(&self, identity: Identity) -> Option<String> {
        let identity_id = identity.id.clone();
        let proposer = self.peer_id.to_hex();
        let (proposal_id, outcome) = match self
            .consensus
            .try_propose_identities(vec![identity], &proposer)
        {
            Ok(result) => result,
            Err(e) => {
                warn!(identity = %identity_id, error = %e, "proposal failed");
                return None;
            }
        };
        self.apply_outcome(outcome);
        self.replay_early_votes(&proposal_id);

        let notice = VerificationNotice {
            identity_id,
            proposal_id: Some(proposal_id.clone()),
            verifier: proposer,
            approved: true,
        };
        if let Err(e) = self
            .gossip
            .broadcast_message(GossipData::IdentityVerification(notice))
            .await
        {
            warn!(proposal = %proposal_id, error = %e, "failed to gossip verification");
        }
        Some(proposal_id)
    }

    // =========================================================================
    // REGISTRY OPERATIONS
    // =========================================================================

    /// Register a locally issued identity: store it, announce it, publish it
    /// in the DHT and, with consensus voting on, propose it.
    pub async fn register_identity(&self, identity: Identity) -> Result<Registration, NodeError> {
        self.ledger.try_add_identity(identity.clone())?;

        let message_id = self
            .gossip
            .broadcast_message(GossipData::IdentityAnnouncement(identity.clone()))
            .await?;

        let key = identity_key(&identity.id);
        self.dht.store(&key, serde_json::to_vec(&identity)?, None).await;

        let proposal_id = if self.consensus_voting {
            self.propose_and_vote(identity.clone()).await
        } else {
            None
        };

        info!(identity = %identity.id, message = %message_id, "identity registered");
        Ok(Registration {
            message_id,
            proposal_id,
        })
    }

    /// Resolve an identity from the ledger, falling back to the DHT.
    /// A verified DHT hit is added to the ledger.
    pub async fn resolve_identity(&self, id: &str) -> Option<Identity> {
        if let Some(identity) = self.ledger.get_identity(id) {
            return Some(identity);
        }
        let bytes = self.dht.get(&identity_key(id)).await?;
        let identity: Identity = match serde_json::from_slice(&bytes) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(identity = %id, error = %e, "undecodable identity record");
                return None;
            }
        };
        if identity.id != id || verify_identity(&identity).is_err() {
            warn!(identity = %id, "identity record failed verification");
            return None;
        }
        self.ledger.add_identity(identity.clone());
        Some(identity)
    }

    /// Proposal id the network uses for `identity`
    pub fn proposal_id_for(identity: &Identity) -> Option<String> {
        compute_proposal_id(std::slice::from_ref(identity)).ok()
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            peer_count: self.transport.connected_peers().len(),
            ledger: self.ledger.stats(),
            dht: self.dht.stats(),
            gossip: self.gossip.stats(),
            sync: self.sync.stats(),
            consensus_version: self.consensus.version(),
            pending_proposals: self.consensus.pending_proposals().len(),
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use idmesh_core::crypto::create_identity;
    use idmesh_net::MemoryNetwork;

    fn spawn(network: &Arc<MemoryNetwork>, seed: u8, options: NodeOptions) -> Arc<Node> {
        let keypair = KeyPair::from_seed(&[seed; 32]);
        let (transport, rx) = network.join(keypair.peer_id(), format!("mem://{}", seed));
        let node = Node::new(
            options,
            keypair,
            Arc::new(transport),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        tokio::spawn(node.clone().run(rx));
        node
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[test]
    fn test_keypair_persisted() {
        let store = MemoryStore::new();
        let first = load_or_create_keypair(&store, None).unwrap();
        let again = load_or_create_keypair(&store, None).unwrap();
        assert_eq!(first.peer_id(), again.peer_id());

        let seeded = load_or_create_keypair(&store, Some([3; 32])).unwrap();
        assert_eq!(seeded.peer_id(), KeyPair::from_seed(&[3; 32]).peer_id());
        let reloaded = load_or_create_keypair(&store, None).unwrap();
        assert_eq!(reloaded.peer_id(), seeded.peer_id());
    }

    #[tokio::test]
    async fn test_connect_registers_peer_everywhere() {
        let network = MemoryNetwork::new();
        let a = spawn(&network, 1, NodeOptions::default());
        let b = spawn(&network, 2, NodeOptions::default());

        a.connect(&b.address()).await.unwrap();
        settle().await;

        assert_eq!(a.gossip().peers(), vec![b.peer_id()]);
        assert!(a.consensus().participants().contains(&b.peer_id().to_hex()));
        assert!(a.dht().contact_for_peer(&b.peer_id()).is_some());
        assert!(b.dht().contact_for_peer(&a.peer_id()).is_some());
    }

    #[tokio::test]
    async fn test_registration_reaches_peer() {
        let network = MemoryNetwork::new();
        let a = spawn(&network, 1, NodeOptions::default());
        let b = spawn(&network, 2, NodeOptions::default());
        a.connect(&b.address()).await.unwrap();
        settle().await;

        let identity = create_identity(&KeyPair::from_seed(&[42; 32]), now_ms(), None).unwrap();
        let registration = a.register_identity(identity.clone()).await.unwrap();
        assert!(registration.proposal_id.is_none());
        settle().await;

        assert_eq!(b.ledger().get_identity(&identity.id), Some(identity.clone()));
        assert_eq!(b.resolve_identity(&identity.id).await, Some(identity));
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let network = MemoryNetwork::new();
        let keypair = KeyPair::from_seed(&[1; 32]);
        let (transport, rx) = network.join(keypair.peer_id(), "mem://1");
        let node = Node::new(
            NodeOptions::default(),
            keypair,
            Arc::new(transport),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let handle = tokio::spawn(node.clone().run(rx));
        settle().await;
        node.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
