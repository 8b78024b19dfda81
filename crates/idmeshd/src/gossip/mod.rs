//! Epidemic gossip engine
//!
//! Messages are validated (signature, age, skew), deduplicated by content
//! id, scored against the sending peer and forwarded to a trust-weighted
//! fan-out. Re-gossip and anti-entropy rounds patch up what a single
//! fan-out missed.

pub mod cache;
pub mod trust;

pub use cache::{MessageCache, DEFAULT_MESSAGE_CACHE_SIZE};
pub use trust::{TrustTable, INITIAL_TRUST};

use crate::events::{EventBus, GossipEvent};
use idmesh_core::crypto::{compute_message_id, create_message, verify_identity, verify_message, KeyPair};
use idmesh_core::time::now_ms;
use idmesh_core::types::*;
use idmesh_net::{AntiEntropyMessage, Transport, TransportError, WireMessage};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default number of peers a message is forwarded to
pub const DEFAULT_FANOUT: usize = 6;
/// Messages older than this are rejected
pub const DEFAULT_MAX_MESSAGE_AGE: Duration = Duration::from_secs(5 * 60);
/// Tolerated clock skew for messages from the future
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(30);
/// Cached messages are kept this long
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(5 * 60);
/// Messages re-propagated per re-gossip round
pub const DEFAULT_REGOSSIP_BATCH: usize = 5;
/// Forwarding budget per message
pub const DEFAULT_MAX_PROPAGATIONS: u32 = 3;
/// Ids per anti-entropy inventory
pub const DEFAULT_MAX_INVENTORY: usize = 1_000;

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error(transparent)]
    Invalid(#[from] idmesh_core::Error),
    #[error("Message is {age_ms}ms old")]
    Stale { age_ms: u64 },
    #[error("Message is {ahead_ms}ms in the future")]
    FromFuture { ahead_ms: u64 },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Gossip configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub fanout: usize,
    pub max_message_age: Duration,
    pub clock_skew: Duration,
    pub cache_size: usize,
    pub message_ttl: Duration,
    pub regossip_batch: usize,
    pub max_propagations: u32,
    pub max_inventory: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
            max_message_age: DEFAULT_MAX_MESSAGE_AGE,
            clock_skew: DEFAULT_CLOCK_SKEW,
            cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
            message_ttl: DEFAULT_MESSAGE_TTL,
            regossip_batch: DEFAULT_REGOSSIP_BATCH,
            max_propagations: DEFAULT_MAX_PROPAGATIONS,
            max_inventory: DEFAULT_MAX_INVENTORY,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: u64,
    rejected: u64,
    duplicates: u64,
    sent: u64,
}

/// Gossip statistics
#[derive(Debug, Clone)]
pub struct GossipStats {
    pub peer_count: usize,
    pub cached_messages: usize,
    pub mean_trust: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub sent: u64,
}

pub struct GossipEngine {
    config: GossipConfig,
    keypair: KeyPair,
    transport: Arc<dyn Transport>,
    peers: RwLock<TrustTable>,
    cache: Mutex<MessageCache>,
    counters: Mutex<Counters>,
    events: EventBus,
}

impl GossipEngine {
    pub fn new(
        config: GossipConfig,
        keypair: KeyPair,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        Self {
            cache: Mutex::new(MessageCache::new(config.cache_size)),
            peers: RwLock::new(TrustTable::default()),
            counters: Mutex::new(Counters::default()),
            config,
            keypair,
            transport,
            events,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.keypair.peer_id()
    }

    // =========================================================================
    // PEERS
    // =========================================================================

    pub fn add_peer(&self, peer: PeerId) -> bool {
        if peer == self.local_peer() {
            return false;
        }
        let added = self.peers.write().add(peer);
        if added {
            debug!(peer = %peer, "gossip peer added");
            self.events.publish(GossipEvent::PeerAdded { peer }.into());
        }
        added
    }

    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let removed = self.peers.write().remove(peer);
        if removed {
            debug!(peer = %peer, "gossip peer removed");
            self.events
                .publish(GossipEvent::PeerRemoved { peer: *peer }.into());
        }
        removed
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.read().peers()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn trust_score(&self, peer: &PeerId) -> Option<f64> {
        self.peers.read().score(peer)
    }

    /// Adjust trust for a known peer. Senders outside the peer set are not
    /// tracked, so they never become fan-out targets.
    fn score_peer(&self, peer: PeerId, valid: bool) -> Option<f64> {
        let mut peers = self.peers.write();
        if valid {
            peers.record_valid(peer)
        } else {
            peers.record_invalid(peer)
        }
    }

    /// Fan-out targets: the most trusted half deterministically, the rest at
    /// random from the remaining peers.
    pub fn select_targets(&self, exclude: &[PeerId]) -> Vec<PeerId> {
        let ranked = self.peers.read().ranked(exclude);
        let fanout = self.config.fanout.min(ranked.len());
        let trusted = (self.config.fanout + 1) / 2;
        let trusted = trusted.min(fanout);

        let mut targets: Vec<PeerId> = ranked[..trusted].to_vec();
        let rest = &ranked[trusted..];
        let mut rng = rand::thread_rng();
        targets.extend(rest.choose_multiple(&mut rng, fanout - trusted).copied());
        targets
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    /// Sign `data` as a message from this node without sending it.
    pub fn sign(&self, data: GossipData) -> Result<GossipMessage, GossipError> {
        Ok(create_message(&self.keypair, data, now_ms())?)
    }

    /// Originate a message and send it to a fan-out of peers.
    pub async fn broadcast_message(&self, data: GossipData) -> Result<MessageId, GossipError> {
        let message = self.sign(data)?;
        let id = compute_message_id(&message)?;
        let kind = message.kind;
        self.cache.lock().insert(id, message.clone(), now_ms());

        let targets = self.select_targets(&[]);
        let sent = self.send_to_all(&targets, &message).await;
        self.cache.lock().bump_propagation(&id);

        debug!(id = %id, kind = %kind, sent, "gossip broadcast");
        self.events
            .publish(GossipEvent::MessageBroadcast { id, kind, sent }.into());
        Ok(id)
    }

    async fn send_to_all(&self, targets: &[PeerId], message: &GossipMessage) -> usize {
        let mut sent = 0;
        for peer in targets {
            match self
                .transport
                .send(peer, WireMessage::Gossip(message.clone()))
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %peer, error = %e, "gossip send failed"),
            }
        }
        self.counters.lock().sent += sent as u64;
        sent
    }

    /// Send one message directly to `peer` (sync traffic).
    pub async fn send_direct(&self, peer: &PeerId, message: GossipMessage) -> Result<(), GossipError> {
        self.transport
            .send(peer, WireMessage::Gossip(message))
            .await?;
        self.counters.lock().sent += 1;
        Ok(())
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    fn validate(&self, message: &GossipMessage, now: Timestamp) -> Result<(), GossipError> {
        if message.sender.as_bytes().iter().all(|b| *b == 0) {
            return Err(idmesh_core::Error::MissingField("sender".into()).into());
        }
        if message.signature.is_empty() {
            return Err(idmesh_core::Error::MissingField("signature".into()).into());
        }

        let max_age = self.config.max_message_age.as_millis() as u64;
        let skew = self.config.clock_skew.as_millis() as u64;
        if message.timestamp > now {
            let ahead_ms = message.timestamp - now;
            if ahead_ms > skew {
                return Err(GossipError::FromFuture { ahead_ms });
            }
        } else if now - message.timestamp > max_age {
            return Err(GossipError::Stale {
                age_ms: now - message.timestamp,
            });
        }

        verify_message(message)?;
        if let GossipData::IdentityAnnouncement(identity) = &message.data {
            verify_identity(identity)?;
        }
        Ok(())
    }

    /// Validate, dedup and forward a message received from `from`.
    ///
    /// Returns `true` only the first time a valid message is seen; the
    /// caller then acts on its payload.
    pub async fn process_message(&self, message: GossipMessage, from: PeerId) -> bool {
        let now = now_ms();
        if let Err(e) = self.validate(&message, now) {
            let score = self.score_peer(from, false);
            self.counters.lock().rejected += 1;
            warn!(from = %from, kind = %message.kind, error = %e, trust = ?score, "gossip message rejected");
            self.events.publish(
                GossipEvent::MessageRejected {
                    from,
                    reason: e.to_string(),
                }
                .into(),
            );
            return false;
        }

        let id = match compute_message_id(&message) {
            Ok(id) => id,
            Err(e) => {
                warn!(from = %from, error = %e, "cannot derive message id");
                return false;
            }
        };

        {
            let mut cache = self.cache.lock();
            if cache.contains(&id) {
                cache.bump_propagation(&id);
                self.counters.lock().duplicates += 1;
                trace!(id = %id, from = %from, "duplicate gossip message");
                return false;
            }
            cache.insert(id, message.clone(), now);
        }

        let score = self.score_peer(from, true);
        self.counters.lock().accepted += 1;
        debug!(id = %id, kind = %message.kind, from = %from, trust = ?score, "gossip message accepted");
        self.events.publish(
            GossipEvent::MessageAccepted {
                id,
                from,
                kind: message.kind,
            }
            .into(),
        );

        if message.kind.is_epidemic() {
            let targets = self.select_targets(&[from, message.sender]);
            if !targets.is_empty() {
                self.send_to_all(&targets, &message).await;
                self.cache.lock().bump_propagation(&id);
            }
        }
        true
    }

    // =========================================================================
    // PERIODIC
    // =========================================================================

    /// Re-propagate recent messages that are still under their forwarding budget.
    pub async fn regossip(&self) -> usize {
        let candidates = self
            .cache
            .lock()
            .regossip_candidates(self.config.regossip_batch, self.config.max_propagations);

        let mut forwarded = 0;
        for (id, message) in candidates {
            let targets = self.select_targets(&[message.sender]);
            if targets.is_empty() {
                continue;
            }
            self.send_to_all(&targets, &message).await;
            self.cache.lock().bump_propagation(&id);
            forwarded += 1;
        }
        if forwarded > 0 {
            trace!(forwarded, "regossip round");
        }
        forwarded
    }

    /// Send our inventory to one random peer. Returns the peer chosen.
    pub async fn anti_entropy_round(&self) -> Option<PeerId> {
        let peer = {
            let peers = self.peers();
            *peers.choose(&mut rand::thread_rng())?
        };
        let ids = self.cache.lock().inventory(self.config.max_inventory);
        let message = WireMessage::AntiEntropy(AntiEntropyMessage::Inventory { ids });
        match self.transport.send(&peer, message).await {
            Ok(()) => Some(peer),
            Err(e) => {
                debug!(peer = %peer, error = %e, "anti-entropy send failed");
                None
            }
        }
    }

    /// Handle an anti-entropy message from `from`.
    ///
    /// Returns the pushed messages that were accepted so the caller can act
    /// on their payloads.
    pub async fn handle_anti_entropy(
        &self,
        from: PeerId,
        message: AntiEntropyMessage,
    ) -> Vec<GossipMessage> {
        let size = match &message {
            AntiEntropyMessage::Inventory { ids } | AntiEntropyMessage::Request { ids } => ids.len(),
            AntiEntropyMessage::Push { messages } => messages.len(),
        };
        if size > self.config.max_inventory {
            let score = self.score_peer(from, false);
            self.counters.lock().rejected += 1;
            warn!(
                from = %from,
                size,
                limit = self.config.max_inventory,
                trust = ?score,
                "oversized anti-entropy message"
            );
            self.events.publish(
                GossipEvent::MessageRejected {
                    from,
                    reason: format!(
                        "anti-entropy list of {} exceeds {}",
                        size, self.config.max_inventory
                    ),
                }
                .into(),
            );
            return Vec::new();
        }

        match message {
            AntiEntropyMessage::Inventory { ids } => {
                let (missing, theirs_missing) = {
                    let cache = self.cache.lock();
                    let missing: Vec<MessageId> =
                        ids.iter().filter(|id| !cache.contains(id)).copied().collect();
                    let offered: HashSet<MessageId> = ids.into_iter().collect();
                    let theirs_missing: Vec<GossipMessage> = cache
                        .inventory(self.config.max_inventory)
                        .into_iter()
                        .filter(|id| !offered.contains(id))
                        .filter_map(|id| cache.get(&id).map(|e| e.message.clone()))
                        .collect();
                    (missing, theirs_missing)
                };

                if !missing.is_empty() {
                    trace!(from = %from, count = missing.len(), "requesting missing messages");
                    self.send_anti_entropy(&from, AntiEntropyMessage::Request { ids: missing })
                        .await;
                }
                if !theirs_missing.is_empty() {
                    trace!(to = %from, count = theirs_missing.len(), "pushing messages");
                    self.send_anti_entropy(
                        &from,
                        AntiEntropyMessage::Push {
                            messages: theirs_missing,
                        },
                    )
                    .await;
                }
                Vec::new()
            }
            AntiEntropyMessage::Request { ids } => {
                let messages: Vec<GossipMessage> = {
                    let cache = self.cache.lock();
                    ids.iter()
                        .filter_map(|id| cache.get(id).map(|e| e.message.clone()))
                        .collect()
                };
                if !messages.is_empty() {
                    self.send_anti_entropy(&from, AntiEntropyMessage::Push { messages })
                        .await;
                }
                Vec::new()
            }
            AntiEntropyMessage::Push { messages } => {
                let mut accepted = Vec::new();
                for message in messages {
                    if self.process_message(message.clone(), from).await {
                        accepted.push(message);
                    }
                }
                accepted
            }
        }
    }

    async fn send_anti_entropy(&self, peer: &PeerId, message: AntiEntropyMessage) {
        if let Err(e) = self
            .transport
            .send(peer, WireMessage::AntiEntropy(message))
            .await
        {
            debug!(peer = %peer, error = %e, "anti-entropy send failed");
        }
    }

    /// Evict cached messages past their TTL.
    pub fn cleanup(&self) -> usize {
        self.cache
            .lock()
            .evict_expired(now_ms(), self.config.message_ttl.as_millis() as u64)
    }

    pub fn has_message(&self, id: &MessageId) -> bool {
        self.cache.lock().contains(id)
    }

    pub fn stats(&self) -> GossipStats {
        let peers = self.peers.read();
        let counters = self.counters.lock();
        GossipStats {
            peer_count: peers.len(),
            cached_messages: self.cache.lock().len(),
            mean_trust: peers.mean_score(),
            accepted: counters.accepted,
            rejected: counters.rejected,
            duplicates: counters.duplicates,
            sent: counters.sent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idmesh_core::crypto::create_identity;
    use idmesh_net::{MemoryNetwork, TransportEvent};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn engine(
        network: &Arc<MemoryNetwork>,
        seed: u8,
        config: GossipConfig,
    ) -> (Arc<GossipEngine>, UnboundedReceiver<TransportEvent>) {
        let keypair = KeyPair::from_seed(&[seed; 32]);
        let (transport, rx) = network.join(keypair.peer_id(), format!("mem://{}", seed));
        let engine = GossipEngine::new(config, keypair, Arc::new(transport), EventBus::default());
        (Arc::new(engine), rx)
    }

    fn announcement(keypair: &KeyPair, timestamp: Timestamp) -> GossipMessage {
        let identity = create_identity(keypair, timestamp, None).unwrap();
        create_message(keypair, GossipData::IdentityAnnouncement(identity), timestamp).unwrap()
    }

    #[tokio::test]
    async fn test_dedup_true_then_false() {
        let network = MemoryNetwork::new();
        let (engine, _rx) = engine(&network, 1, GossipConfig::default());
        let author = KeyPair::from_seed(&[9; 32]);
        let message = announcement(&author, now_ms());

        assert!(engine.process_message(message.clone(), author.peer_id()).await);
        assert!(!engine.process_message(message, author.peer_id()).await);
        assert_eq!(engine.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn test_trust_moves_with_validity() {
        let network = MemoryNetwork::new();
        let (engine, _rx) = engine(&network, 1, GossipConfig::default());
        let good = KeyPair::from_seed(&[2; 32]);
        let bad = KeyPair::from_seed(&[3; 32]);
        engine.add_peer(good.peer_id());
        engine.add_peer(bad.peer_id());
        assert_eq!(engine.trust_score(&good.peer_id()), Some(0.5));

        assert!(engine.process_message(announcement(&good, now_ms()), good.peer_id()).await);
        let score = engine.trust_score(&good.peer_id()).unwrap();
        assert!((score - 0.51).abs() < 1e-9);

        let mut forged = announcement(&bad, now_ms());
        forged.signature[0] ^= 0xff;
        assert!(!engine.process_message(forged, bad.peer_id()).await);
        let score = engine.trust_score(&bad.peer_id()).unwrap();
        assert!((score - 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stale_and_future_rejected() {
        let network = MemoryNetwork::new();
        let (engine, _rx) = engine(&network, 1, GossipConfig::default());
        let author = KeyPair::from_seed(&[4; 32]);
        let now = now_ms();

        let stale = announcement(&author, now - 6 * 60 * 1000);
        assert!(!engine.process_message(stale, author.peer_id()).await);

        let future = announcement(&author, now + 60 * 1000);
        assert!(!engine.process_message(future, author.peer_id()).await);

        // Within the skew tolerance
        let slightly_ahead = announcement(&author, now + 5 * 1000);
        assert!(engine.process_message(slightly_ahead, author.peer_id()).await);
        assert_eq!(engine.stats().rejected, 2);
    }

    #[tokio::test]
    async fn test_fanout_prefers_trusted_peers() {
        let network = MemoryNetwork::new();
        let (engine, _rx) = engine(
            &network,
            1,
            GossipConfig {
                fanout: 4,
                ..Default::default()
            },
        );
        let peers: Vec<PeerId> = (10..20).map(|i| PeerId([i; 32])).collect();
        for peer in &peers {
            engine.add_peer(*peer);
        }
        // Make two peers clearly most trusted
        for _ in 0..5 {
            engine.peers.write().record_valid(peers[3]);
            engine.peers.write().record_valid(peers[7]);
        }

        let targets = engine.select_targets(&[peers[0]]);
        assert_eq!(targets.len(), 4);
        assert!(targets[..2].contains(&peers[3]));
        assert!(targets[..2].contains(&peers[7]));
        assert!(!targets.contains(&peers[0]));
        let unique: HashSet<_> = targets.iter().collect();
        assert_eq!(unique.len(), 4);

        // Fewer peers than the fan-out
        assert_eq!(engine.select_targets(&peers[..8]).len(), 2);
    }

    #[tokio::test]
    async fn test_accepted_announcement_is_forwarded() {
        let network = MemoryNetwork::new();
        let (a, _rx_a) = engine(&network, 1, GossipConfig::default());
        let (b, mut rx_b) = engine(&network, 2, GossipConfig::default());
        let (c, _rx_c) = engine(&network, 3, GossipConfig::default());
        a.transport.connect("mem://2").await.unwrap();
        a.add_peer(b.local_peer());
        let _ = rx_b.recv().await;

        let message = announcement(&KeyPair::from_seed(&[3; 32]), now_ms());
        assert!(a.process_message(message.clone(), c.local_peer()).await);

        match rx_b.recv().await.unwrap() {
            TransportEvent::MessageReceived {
                message: WireMessage::Gossip(forwarded),
                ..
            } => assert_eq!(forwarded, message),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_anti_entropy_exchange() {
        let network = MemoryNetwork::new();
        let (a, mut rx_a) = engine(&network, 1, GossipConfig::default());
        let (b, mut rx_b) = engine(&network, 2, GossipConfig::default());
        a.transport.connect("mem://2").await.unwrap();
        let _ = rx_a.recv().await;
        let _ = rx_b.recv().await;
        a.add_peer(b.local_peer());

        // a knows m1, b knows m2
        let m1 = announcement(&KeyPair::from_seed(&[5; 32]), now_ms());
        let m2 = announcement(&KeyPair::from_seed(&[6; 32]), now_ms());
        assert!(a.process_message(m1.clone(), PeerId([5; 32])).await);
        // Drain the forward of m1 to b
        let _ = rx_b.recv().await;
        assert!(b.process_message(m2.clone(), PeerId([6; 32])).await);

        assert_eq!(a.anti_entropy_round().await, Some(b.local_peer()));

        // b receives the inventory, requests m1 and pushes m2
        let TransportEvent::MessageReceived { from, message: WireMessage::AntiEntropy(inv) } =
            rx_b.recv().await.unwrap()
        else {
            panic!("expected inventory");
        };
        assert!(b.handle_anti_entropy(from, inv).await.is_empty());

        let mut pushed_to_a = Vec::new();
        for _ in 0..2 {
            if let TransportEvent::MessageReceived {
                from,
                message: WireMessage::AntiEntropy(msg),
            } = rx_a.recv().await.unwrap()
            {
                pushed_to_a.extend(a.handle_anti_entropy(from, msg).await);
            }
        }
        assert_eq!(pushed_to_a, vec![m2]);

        // a answered b's request with a push of m1
        let mut got_m1 = false;
        while let Ok(event) = rx_b.try_recv() {
            if let TransportEvent::MessageReceived {
                from,
                message: WireMessage::AntiEntropy(msg),
            } = event
            {
                got_m1 |= b.handle_anti_entropy(from, msg).await == vec![m1.clone()];
            }
        }
        assert!(got_m1);
    }

    #[tokio::test]
    async fn test_oversized_anti_entropy_rejected() {
        let network = MemoryNetwork::new();
        let config = GossipConfig {
            max_inventory: 4,
            ..Default::default()
        };
        let (a, mut rx_a) = engine(&network, 1, config);
        let (b, mut rx_b) = engine(&network, 2, GossipConfig::default());
        b.transport.connect("mem://1").await.unwrap();
        let _ = rx_a.recv().await;
        let _ = rx_b.recv().await;
        a.add_peer(b.local_peer());

        let ids: Vec<MessageId> = (0..5u8).map(|i| MessageId([i; 32])).collect();
        let request = AntiEntropyMessage::Request { ids: ids.clone() };
        assert!(a.handle_anti_entropy(b.local_peer(), request).await.is_empty());
        let inventory = AntiEntropyMessage::Inventory { ids };
        assert!(a.handle_anti_entropy(b.local_peer(), inventory).await.is_empty());

        assert_eq!(a.stats().rejected, 2);
        assert!((a.trust_score(&b.local_peer()).unwrap() - 0.4).abs() < 1e-9);
        // Nothing went back to b
        assert!(rx_b.try_recv().is_err());

        // A list within the limit is still served
        let within = AntiEntropyMessage::Inventory { ids: vec![MessageId([7; 32])] };
        assert!(a.handle_anti_entropy(b.local_peer(), within).await.is_empty());
        assert_eq!(a.stats().rejected, 2);
    }

    #[tokio::test]
    async fn test_regossip_respects_budget() {
        let network = MemoryNetwork::new();
        let (a, _rx_a) = engine(
            &network,
            1,
            GossipConfig {
                max_propagations: 2,
                ..Default::default()
            },
        );
        let (_b, _rx_b) = engine(&network, 2, GossipConfig::default());
        a.transport.connect("mem://2").await.unwrap();
        a.add_peer(KeyPair::from_seed(&[2; 32]).peer_id());

        // Originating counts as the first propagation
        a.broadcast_message(GossipData::IdentityVerification(VerificationNotice {
            identity_id: "did:idmesh:00".into(),
            proposal_id: None,
            verifier: "a".into(),
            approved: true,
        }))
        .await
        .unwrap();

        assert_eq!(a.regossip().await, 1);
        assert_eq!(a.regossip().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_by_ttl() {
        let network = MemoryNetwork::new();
        let (engine, _rx) = engine(
            &network,
            1,
            GossipConfig {
                message_ttl: Duration::from_millis(0),
                ..Default::default()
            },
        );
        let author = KeyPair::from_seed(&[4; 32]);
        engine.process_message(announcement(&author, now_ms()), author.peer_id()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(engine.cleanup(), 1);
        assert_eq!(engine.stats().cached_messages, 0);
    }
}
