//! Node event bus
//!
//! Every component publishes what it did on a shared [`EventBus`]. Events
//! are notifications only: no component relies on another one receiving
//! them, so a lagging or absent subscriber never changes node behaviour.

use idmesh_core::types::*;
use tokio::sync::broadcast;

/// Default buffered events per subscriber before it starts lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Everything observable about a running node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Ledger(LedgerEvent),
    Dht(DhtEvent),
    Gossip(GossipEvent),
    Consensus(ConsensusEvent),
    Sync(SyncEvent),
}

/// Ledger mutations, published after the snapshot has been persisted.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    /// A new identity, or a strictly newer version of a known one, was stored.
    IdentityAdded { id: String, timestamp: Timestamp },
    /// An identity was removed explicitly.
    IdentityRemoved { id: String },
    /// The retention sweep removed `removed` entries.
    Cleaned { removed: usize },
    /// An exported ledger was imported; `merged` entries were accepted.
    Imported { merged: usize },
}

/// Routing table and local store changes.
#[derive(Debug, Clone)]
pub enum DhtEvent {
    /// A node entered the routing table.
    NodeAdded { id: NodeId },
    /// A node left the routing table (explicit removal, failures or inactivity).
    NodeRemoved { id: NodeId },
    /// A value was stored locally and/or replicated.
    ValueStored { key: String, replicas: usize },
    /// A lookup found a value on a remote node.
    ValueFound { key: String },
}

/// Gossip engine activity.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    /// A message passed validation and dedup.
    MessageAccepted {
        id: MessageId,
        from: PeerId,
        kind: GossipKind,
    },
    /// A message failed validation; the sender's trust was lowered.
    MessageRejected { from: PeerId, reason: String },
    /// A locally originated message was sent.
    MessageBroadcast { id: MessageId, kind: GossipKind, sent: usize },
    PeerAdded { peer: PeerId },
    PeerRemoved { peer: PeerId },
}

/// Consensus state machine transitions.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// A proposal was created (re-proposing an open one does not publish).
    Proposed { proposal_id: String, proposer: String },
    /// A vote was recorded.
    Voted {
        proposal_id: String,
        voter: String,
        approve: bool,
    },
    /// A proposal reached quorum; `identities` are the entries that changed
    /// the committed state and should be merged into the ledger.
    Committed {
        proposal_id: String,
        version: u64,
        identities: Vec<Identity>,
    },
    /// A proposal was rejected by the quorum.
    Rejected { proposal_id: String },
    /// A pending proposal was discarded without resolution.
    Discarded { proposal_id: String },
    /// An external state with a higher version was adopted.
    StateAdopted { version: u64 },
}

/// Sync cycle lifecycle.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A cycle began; the request reached `peers` peers.
    Started { last_sync: Timestamp, peers: usize },
    /// One response batch was merged.
    BatchMerged {
        from: String,
        batch_number: u32,
        total_batches: u32,
        merged: usize,
    },
    /// A responder delivered all of its batches.
    Completed { responder: String, merged: usize },
    /// The request could not be sent.
    Failed { reason: String },
    /// No responder finished before the deadline.
    TimedOut,
    /// This node answered a peer's request.
    RequestServed { requester: String, batches: u32 },
}

/// Broadcast channel shared by all components of one node.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; silently dropped when nobody is listening.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl From<LedgerEvent> for NodeEvent {
    fn from(e: LedgerEvent) -> Self {
        NodeEvent::Ledger(e)
    }
}

impl From<DhtEvent> for NodeEvent {
    fn from(e: DhtEvent) -> Self {
        NodeEvent::Dht(e)
    }
}

impl From<GossipEvent> for NodeEvent {
    fn from(e: GossipEvent) -> Self {
        NodeEvent::Gossip(e)
    }
}

impl From<ConsensusEvent> for NodeEvent {
    fn from(e: ConsensusEvent) -> Self {
        NodeEvent::Consensus(e)
    }
}

impl From<SyncEvent> for NodeEvent {
    fn from(e: SyncEvent) -> Self {
        NodeEvent::Sync(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(SyncEvent::TimedOut.into());
    }

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(
            LedgerEvent::IdentityRemoved {
                id: "did:idmesh:00".into(),
            }
            .into(),
        );
        match rx.recv().await.unwrap() {
            NodeEvent::Ledger(LedgerEvent::IdentityRemoved { id }) => {
                assert_eq!(id, "did:idmesh:00")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
