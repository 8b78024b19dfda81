//! Kademlia-style distributed hash table
//!
//! Keys and nodes share the 160-bit id space. A key is held by the
//! `replica_count` nodes closest to its hash, the local node included as a
//! candidate. RPCs ride over the transport's fire-and-forget `send`; replies
//! are matched to their request through a pending table of oneshot senders.
//!
//! Nothing here fails past its boundary: unreachable peers bump a failure
//! counter and lookups degrade to `None`.

pub mod routing;
pub mod store;

pub use routing::{RoutingTable, TouchOutcome, DEFAULT_BUCKET_SIZE};
pub use store::{LocalStore, StoredEntry, DEFAULT_MAX_ENTRIES};

use crate::events::{DhtEvent, EventBus};
use idmesh_core::crypto::{key_id, node_id_for_peer};
use idmesh_core::time::now_ms;
use idmesh_core::types::*;
use idmesh_net::{DhtMessage, Transport, TransportError, WireMessage};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

/// Default number of nodes responsible for a key
pub const DEFAULT_REPLICA_COUNT: usize = 3;
/// Default lookup parallelism
pub const DEFAULT_ALPHA: usize = 3;
/// Consecutive failures after which a node is evicted
pub const DEFAULT_MAX_NODE_FAILURES: u32 = 3;
/// Default record lifetime
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default per-query timeout
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(3);
/// Default budget for a whole iterative lookup
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default threshold after which a silent node is dropped
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(30 * 60);

const MAX_LOOKUP_ITERATIONS: usize = 20;

/// DHT errors
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Core(#[from] idmesh_core::Error),
    #[error("Reply channel closed")]
    ChannelClosed,
}

/// DHT configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub replica_count: usize,
    pub alpha: usize,
    pub bucket_size: usize,
    pub max_entries: usize,
    pub default_ttl: Duration,
    pub query_timeout: Duration,
    pub lookup_timeout: Duration,
    pub inactivity_threshold: Duration,
    pub max_node_failures: u32,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            replica_count: DEFAULT_REPLICA_COUNT,
            alpha: DEFAULT_ALPHA,
            bucket_size: DEFAULT_BUCKET_SIZE,
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl: DEFAULT_RECORD_TTL,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            inactivity_threshold: DEFAULT_INACTIVITY_THRESHOLD,
            max_node_failures: DEFAULT_MAX_NODE_FAILURES,
        }
    }
}

/// `find` result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundValue {
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Counters from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub inactive: usize,
    pub replicated: usize,
    pub dropped: usize,
}

/// DHT statistics
#[derive(Debug, Clone)]
pub struct DhtStats {
    pub node_count: usize,
    pub buckets_in_use: usize,
    pub entry_count: usize,
    pub pending_queries: usize,
}

pub struct DhtNode {
    config: DhtConfig,
    local: DhtContact,
    transport: Arc<dyn Transport>,
    routing: RwLock<RoutingTable>,
    store: Mutex<LocalStore>,
    pending: Mutex<HashMap<u64, oneshot::Sender<DhtMessage>>>,
    events: EventBus,
}

impl DhtNode {
    pub fn new(config: DhtConfig, transport: Arc<dyn Transport>, events: EventBus) -> Self {
        let peer = transport.local_peer();
        let local = DhtContact {
            id: node_id_for_peer(&peer),
            peer,
            address: transport.local_address(),
            last_seen: 0,
        };
        Self {
            routing: RwLock::new(RoutingTable::new(local.id, config.bucket_size)),
            store: Mutex::new(LocalStore::new(config.max_entries)),
            pending: Mutex::new(HashMap::new()),
            config,
            local,
            transport,
            events,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    /// Our contact, stamped with the current time
    fn contact(&self) -> DhtContact {
        DhtContact {
            last_seen: now_ms(),
            ..self.local.clone()
        }
    }

    // =========================================================================
    // ROUTING TABLE
    // =========================================================================

    /// Insert or refresh a node.
    ///
    /// When its bucket is full the least-recently-seen entry is pinged in
    /// the background and replaced only if it does not answer; the call
    /// itself returns `false` in that case.
    pub fn add_node(self: &Arc<Self>, contact: DhtContact) -> bool {
        if contact.id == self.local.id {
            return false;
        }
        let id = contact.id;
        let outcome = self.routing.write().touch(contact);
        match outcome {
            TouchOutcome::Inserted => {
                debug!(node = %id, "node added to routing table");
                self.events.publish(DhtEvent::NodeAdded { id }.into());
                true
            }
            TouchOutcome::Refreshed => true,
            TouchOutcome::Full { oldest, newcomer } => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let alive = this.is_alive(&oldest).await;
                    let evicted = this.routing.write().apply_ping_result(
                        &oldest.id,
                        newcomer.clone(),
                        alive,
                        now_ms(),
                    );
                    if let Some(id) = evicted {
                        debug!(evicted = %id, added = %newcomer.id, "bucket entry replaced");
                        this.events.publish(DhtEvent::NodeRemoved { id }.into());
                        this.events
                            .publish(DhtEvent::NodeAdded { id: newcomer.id }.into());
                    }
                });
                false
            }
            TouchOutcome::Ignored => false,
        }
    }

    pub fn remove_node(&self, id: &NodeId) -> bool {
        let removed = self.routing.write().remove(id).is_some();
        if removed {
            self.events.publish(DhtEvent::NodeRemoved { id: *id }.into());
        }
        removed
    }

    /// Contact for `peer`, if it is in the routing table
    pub fn contact_for_peer(&self, peer: &PeerId) -> Option<DhtContact> {
        self.routing
            .read()
            .get(&node_id_for_peer(peer))
            .map(|e| e.contact.clone())
    }

    /// The `replica_count` known nodes closest to `key`.
    pub fn closest_nodes(&self, key: &str) -> Vec<DhtContact> {
        self.routing
            .read()
            .closest(&key_id(key), self.config.replica_count)
    }

    /// Responsible set for `target` with the local node as a candidate.
    fn responsible_set(&self, target: &NodeId) -> Vec<DhtContact> {
        let mut set = self
            .routing
            .read()
            .closest(target, self.config.replica_count);
        set.push(self.local.clone());
        set.sort_by_key(|c| c.id.distance(target));
        set.truncate(self.config.replica_count);
        set
    }

    fn note_failure(&self, id: &NodeId) {
        let mut routing = self.routing.write();
        let Some(failures) = routing.record_failure(id) else {
            return;
        };
        if failures >= self.config.max_node_failures {
            routing.remove(id);
            drop(routing);
            warn!(node = %id, failures, "evicting unreliable node");
            self.events.publish(DhtEvent::NodeRemoved { id: *id }.into());
        }
    }

    // =========================================================================
    // RPC PLUMBING
    // =========================================================================

    async fn send_to(&self, contact: &DhtContact, message: DhtMessage) -> Result<(), DhtError> {
        if !self.transport.is_connected(&contact.peer) {
            self.transport.connect(&contact.address).await?;
        }
        self.transport
            .send(&contact.peer, WireMessage::Dht(message))
            .await?;
        Ok(())
    }

    /// Send, recording a failure against the node if it is unreachable.
    async fn send_or_note(&self, contact: &DhtContact, message: DhtMessage) -> bool {
        let label = message.label();
        match self.send_to(contact, message).await {
            Ok(()) => true,
            Err(e) => {
                debug!(node = %contact.id, rpc = label, error = %e, "dht send failed");
                self.note_failure(&contact.id);
                false
            }
        }
    }

    async fn request(
        &self,
        contact: &DhtContact,
        build: impl FnOnce(u64) -> DhtMessage,
    ) -> Result<(u64, oneshot::Receiver<DhtMessage>), DhtError> {
        let request_id = rand::random::<u64>();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        if let Err(e) = self.send_to(contact, build(request_id)).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }
        Ok((request_id, rx))
    }

    async fn await_reply(
        &self,
        request_id: u64,
        rx: oneshot::Receiver<DhtMessage>,
    ) -> Result<DhtMessage, DhtError> {
        match tokio::time::timeout(self.config.query_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DhtError::ChannelClosed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(idmesh_core::Error::Timeout(format!("dht query {}", request_id)).into())
            }
        }
    }

    /// Ping a node; `true` if it answered in time.
    pub async fn ping(&self, contact: &DhtContact) -> bool {
        let alive = self.is_alive(contact).await;
        if !alive {
            self.note_failure(&contact.id);
        }
        alive
    }

    /// Ping without failure accounting (bucket replacement decides on its own).
    async fn is_alive(&self, contact: &DhtContact) -> bool {
        let sender = self.contact();
        let result = match self
            .request(contact, |request_id| DhtMessage::Ping { request_id, sender })
            .await
        {
            Ok((request_id, rx)) => self.await_reply(request_id, rx).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(DhtMessage::Pong { .. }) => true,
            Ok(other) => {
                debug!(node = %contact.id, reply = other.label(), "unexpected ping reply");
                false
            }
            Err(e) => {
                debug!(node = %contact.id, error = %e, "ping failed");
                false
            }
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Dispatch an inbound DHT message from transport peer `from`.
    pub async fn handle_message(self: &Arc<Self>, from: PeerId, message: DhtMessage) {
        let sender = message.sender();
        if sender.peer != from || sender.id != node_id_for_peer(&from) {
            warn!(from = %from, claimed = %sender.id, "dht message with forged sender");
            return;
        }
        let contact = DhtContact {
            last_seen: now_ms(),
            ..sender.clone()
        };
        self.add_node(contact.clone());

        if let Some(request_id) = message.reply_to() {
            match self.pending.lock().remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => trace!(request_id, "late or unknown dht reply"),
            }
            return;
        }

        match message {
            DhtMessage::Ping { request_id, .. } => {
                let reply = DhtMessage::Pong {
                    request_id,
                    sender: self.contact(),
                };
                self.send_or_note(&contact, reply).await;
            }
            DhtMessage::FindValue {
                request_id, key, ..
            } => {
                let record = self.store.lock().get(&key, now_ms()).cloned();
                let closer = if record.is_some() {
                    Vec::new()
                } else {
                    self.routing
                        .read()
                        .closest(&key_id(&key), self.config.bucket_size)
                        .into_iter()
                        .filter(|c| c.id != contact.id)
                        .collect()
                };
                let reply = DhtMessage::FindValueReply {
                    request_id,
                    sender: self.contact(),
                    record,
                    closer,
                };
                self.send_or_note(&contact, reply).await;
            }
            DhtMessage::Store { record, .. } => self.accept_replica(record),
            DhtMessage::Pong { .. } | DhtMessage::FindValueReply { .. } => {}
        }
    }

    fn accept_replica(&self, record: DhtRecord) {
        let now = now_ms();
        if record.is_expired(now) {
            return;
        }
        let replica_set = self
            .responsible_set(&key_id(&record.key))
            .into_iter()
            .map(|c| c.id)
            .collect();
        let mut store = self.store.lock();
        if let Some(existing) = store.get(&record.key, now) {
            if existing.timestamp > record.timestamp {
                return;
            }
        }
        trace!(key = %record.key, "replica stored");
        if let Some(evicted) = store.insert(record, replica_set) {
            debug!(evicted = %evicted, "store at capacity, evicted oldest");
        }
    }

    // =========================================================================
    // PUBLIC CONTRACT
    // =========================================================================

    /// Store `value` under `key`, replicating to the responsible nodes.
    ///
    /// The local node keeps a copy if it is responsible or knows no peers.
    /// Replication is fire-and-forget.
    pub async fn store(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let record = DhtRecord {
            key: key.to_string(),
            value,
            timestamp: now_ms(),
            ttl: ttl.unwrap_or(self.config.default_ttl).as_millis() as u64,
        };
        let responsible = self.responsible_set(&key_id(key));
        let local_responsible = responsible.iter().any(|c| c.id == self.local.id);
        let peers_known = !self.routing.read().is_empty();

        if local_responsible || !peers_known {
            let replica_set = responsible.iter().map(|c| c.id).collect();
            if let Some(evicted) = self.store.lock().insert(record.clone(), replica_set) {
                debug!(evicted = %evicted, "store at capacity, evicted oldest");
            }
        }

        let mut replicas = usize::from(local_responsible || !peers_known);
        for contact in responsible.iter().filter(|c| c.id != self.local.id) {
            let message = DhtMessage::Store {
                sender: self.contact(),
                record: record.clone(),
            };
            if self.send_or_note(contact, message).await {
                replicas += 1;
            }
        }

        debug!(key, replicas, "dht store");
        self.events.publish(
            DhtEvent::ValueStored {
                key: key.to_string(),
                replicas,
            }
            .into(),
        );
    }

    /// Value for `key`: local store first, then an iterative lookup.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(record) = self.store.lock().get(key, now_ms()) {
            return Some(record.value.clone());
        }

        let record = self.lookup(key).await?;
        let now = now_ms();
        let remaining = record
            .timestamp
            .saturating_add(record.ttl)
            .saturating_sub(now);
        let cached = DhtRecord {
            key: record.key.clone(),
            value: record.value.clone(),
            timestamp: now,
            ttl: remaining.min(self.config.default_ttl.as_millis() as u64),
        };
        self.store.lock().insert(cached, Vec::new());
        self.events.publish(
            DhtEvent::ValueFound {
                key: key.to_string(),
            }
            .into(),
        );
        Some(record.value)
    }

    /// Local records whose key matches `pattern` (`*` glob or substring).
    pub fn find(&self, pattern: &str) -> Vec<FoundValue> {
        self.store
            .lock()
            .find(pattern, now_ms())
            .into_iter()
            .map(|r| FoundValue {
                key: r.key,
                value: r.value,
                timestamp: r.timestamp,
            })
            .collect()
    }

    /// Remove a local record.
    pub fn delete(&self, key: &str) -> bool {
        self.store.lock().remove(key).is_some()
    }

    /// Iterative FIND_VALUE.
    ///
    /// Queries `alpha` of the closest unqueried nodes per round. When a round
    /// brings no closer node, one last round queries every remaining
    /// unqueried node in the shortlist before giving up.
    async fn lookup(&self, key: &str) -> Option<DhtRecord> {
        let target = key_id(key);
        let started = Instant::now();

        let mut shortlist = self
            .routing
            .read()
            .closest(&target, self.config.bucket_size);
        let mut best = shortlist.first()?.id.distance(&target);
        let mut seen: HashSet<NodeId> = shortlist.iter().map(|c| c.id).collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut issued: Vec<u64> = Vec::new();
        let mut final_round = false;

        for _ in 0..MAX_LOOKUP_ITERATIONS {
            if started.elapsed() > self.config.lookup_timeout {
                debug!(key, queried = queried.len(), "lookup timed out");
                break;
            }

            let width = if final_round {
                self.config.bucket_size
            } else {
                self.config.alpha
            };
            let candidates: Vec<DhtContact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.id))
                .take(width)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            let mut queries = JoinSet::new();
            for contact in candidates {
                queried.insert(contact.id);
                let sender = self.contact();
                let wanted = key.to_string();
                let sent = self
                    .request(&contact, |request_id| DhtMessage::FindValue {
                        request_id,
                        sender,
                        key: wanted,
                    })
                    .await;
                match sent {
                    Ok((request_id, rx)) => {
                        issued.push(request_id);
                        let timeout = self.config.query_timeout;
                        queries.spawn(async move {
                            let reply = tokio::time::timeout(timeout, rx).await;
                            (contact, request_id, reply)
                        });
                    }
                    Err(e) => {
                        debug!(node = %contact.id, error = %e, "find_value send failed");
                        self.note_failure(&contact.id);
                    }
                }
            }

            while let Some(joined) = queries.join_next().await {
                let Ok((contact, request_id, reply)) = joined else {
                    continue;
                };
                match reply {
                    Ok(Ok(DhtMessage::FindValueReply { record, closer, .. })) => {
                        if let Some(record) =
                            record.filter(|r| r.key == key && !r.is_expired(now_ms()))
                        {
                            debug!(key, from = %contact.id, queried = queried.len(), "lookup hit");
                            let mut pending = self.pending.lock();
                            for id in &issued {
                                pending.remove(id);
                            }
                            return Some(record);
                        }
                        for node in closer {
                            if node.id != self.local.id && seen.insert(node.id) {
                                shortlist.push(node);
                            }
                        }
                    }
                    Ok(Ok(other)) => {
                        debug!(node = %contact.id, reply = other.label(), "unexpected lookup reply");
                    }
                    Ok(Err(_)) | Err(_) => {
                        self.pending.lock().remove(&request_id);
                        self.note_failure(&contact.id);
                    }
                }
            }

            if final_round {
                break;
            }

            shortlist.sort_by_key(|c| c.id.distance(&target));
            shortlist.truncate(self.config.bucket_size);
            let closest = shortlist
                .first()
                .map(|c| c.id.distance(&target))
                .unwrap_or(Distance::MAX);
            if closest < best {
                best = closest;
            } else {
                final_round = true;
            }
        }

        debug!(key, queried = queried.len(), "lookup miss");
        None
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Drop expired local records.
    pub fn purge_expired(&self) -> usize {
        self.store.lock().purge_expired(now_ms())
    }

    /// Drop nodes not heard from within the inactivity threshold.
    pub fn purge_inactive(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.config.inactivity_threshold.as_millis() as u64);
        let stale = self.routing.read().inactive_since(cutoff);
        for id in &stale {
            self.remove_node(id);
        }
        stale.len()
    }

    /// Re-check local records against the current responsible set.
    ///
    /// Newly responsible nodes get a copy. A record the local node is no
    /// longer responsible for is dropped once some responsible node has it.
    /// Returns `(replicated, dropped)`.
    pub async fn rebalance(&self) -> (usize, usize) {
        let now = now_ms();
        let entries = self.store.lock().entries();
        let (mut replicated, mut dropped) = (0, 0);

        for entry in entries {
            if entry.record.is_expired(now) {
                continue;
            }
            let key = entry.record.key.clone();
            let responsible = self.responsible_set(&key_id(&key));
            let mut handed_off = responsible
                .iter()
                .any(|c| c.id != self.local.id && entry.replica_set.contains(&c.id));

            for contact in responsible
                .iter()
                .filter(|c| c.id != self.local.id && !entry.replica_set.contains(&c.id))
            {
                let message = DhtMessage::Store {
                    sender: self.contact(),
                    record: entry.record.clone(),
                };
                if self.send_or_note(contact, message).await {
                    replicated += 1;
                    handed_off = true;
                }
            }

            let local_responsible = responsible.iter().any(|c| c.id == self.local.id);
            if !local_responsible && handed_off {
                self.store.lock().remove(&key);
                dropped += 1;
            } else {
                let ids = responsible.iter().map(|c| c.id).collect();
                self.store.lock().set_replica_set(&key, ids);
            }
        }

        if replicated > 0 || dropped > 0 {
            debug!(replicated, dropped, "dht rebalance");
        }
        (replicated, dropped)
    }

    /// One full maintenance pass.
    pub async fn maintenance(&self) -> MaintenanceReport {
        let expired = self.purge_expired();
        let inactive = self.purge_inactive();
        let (replicated, dropped) = self.rebalance().await;
        MaintenanceReport {
            expired,
            inactive,
            replicated,
            dropped,
        }
    }

    pub fn stats(&self) -> DhtStats {
        let routing = self.routing.read();
        DhtStats {
            node_count: routing.len(),
            buckets_in_use: routing.buckets_in_use(),
            entry_count: self.store.lock().len(),
            pending_queries: self.pending.lock().len(),
        }
    }
}
