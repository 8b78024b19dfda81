//! Ledger reconciliation between peers
//!
//! A cycle broadcasts `sync_request{lastSync}`; every responder ships the
//! identities newer than that watermark in delayed batches. The cycle
//! completes once one responder has delivered all of its batches, or times
//! out. Merging is idempotent, so duplicate or overlapping batches are safe.

use crate::events::{EventBus, SyncEvent};
use crate::gossip::{GossipEngine, GossipError};
use crate::ledger::{Ledger, LedgerError};
use idmesh_core::time::now_ms;
use idmesh_core::types::*;
use idmesh_net::{Transport, WireMessage};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identities per sync response
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Pause between response batches
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(100);
/// Deadline for a sync cycle
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
/// Periodic sync interval
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Sync errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Sync already in progress")]
    AlreadySyncing,
    #[error("No connected peers")]
    NoPeers,
    #[error("Sync request reached no peer")]
    Undelivered,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            timeout: DEFAULT_SYNC_TIMEOUT,
            interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
}

/// How the last cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed { responder: String, merged: usize },
    Failed(String),
    TimedOut,
}

#[derive(Debug, Default)]
struct ResponderProgress {
    total_batches: u32,
    received: BTreeSet<u32>,
    merged: usize,
    max_timestamp: Timestamp,
}

#[derive(Debug)]
struct SyncSession {
    started_at: Timestamp,
    responders: HashMap<String, ResponderProgress>,
}

#[derive(Debug, Default)]
struct SyncInner {
    session: Option<SyncSession>,
    /// (requester node id, request timestamp) -> when we answered
    handled_requests: HashMap<(String, Timestamp), Timestamp>,
    last_outcome: Option<SyncOutcome>,
    /// Wall-clock time the last cycle started
    last_attempt: Option<Timestamp>,
    cycles: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    requests_served: u64,
    merged_total: u64,
}

/// Sync statistics
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub status: SyncStatus,
    pub last_sync: Timestamp,
    pub last_outcome: Option<SyncOutcome>,
    pub cycles: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub requests_served: u64,
    pub identities_merged: u64,
}

pub struct SyncManager {
    config: SyncConfig,
    node_id: String,
    ledger: Arc<Ledger>,
    gossip: Arc<GossipEngine>,
    transport: Arc<dyn Transport>,
    inner: Mutex<SyncInner>,
    events: EventBus,
}

impl SyncManager {
    pub fn new(
        config: SyncConfig,
        ledger: Arc<Ledger>,
        gossip: Arc<GossipEngine>,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        Self {
            node_id: gossip.local_peer().to_hex(),
            config,
            ledger,
            gossip,
            transport,
            inner: Mutex::new(SyncInner::default()),
            events,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn status(&self) -> SyncStatus {
        match self.inner.lock().session {
            Some(_) => SyncStatus::Syncing,
            None => SyncStatus::Idle,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.status() == SyncStatus::Syncing
    }

    pub fn last_outcome(&self) -> Option<SyncOutcome> {
        self.inner.lock().last_outcome.clone()
    }

    /// No cycle has started within the sync interval.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        let interval = self.config.interval.as_millis() as u64;
        match self.inner.lock().last_attempt {
            Some(at) => now.saturating_sub(at) > interval,
            None => true,
        }
    }

    // =========================================================================
    // REQUESTER
    // =========================================================================

    /// Start a sync cycle. `false` when one is running or no peer is connected.
    pub async fn start_sync(&self) -> bool {
        match self.try_start_sync().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "sync not started");
                false
            }
        }
    }

    pub async fn try_start_sync(&self) -> Result<(), SyncError> {
        // An expired cycle must not block the next one
        self.check_timeout(now_ms());

        let peers = self.transport.connected_peers().len();
        if peers == 0 {
            return Err(SyncError::NoPeers);
        }

        let now = now_ms();
        let last_sync = self.ledger.last_sync();
        {
            let mut inner = self.inner.lock();
            if inner.session.is_some() {
                return Err(SyncError::AlreadySyncing);
            }
            inner.session = Some(SyncSession {
                started_at: now,
                responders: HashMap::new(),
            });
            inner.last_attempt = Some(now);
            inner.cycles += 1;
        }

        let request = SyncRequest {
            last_sync,
            node_id: self.node_id.clone(),
            timestamp: now,
        };
        let delivered = match self.gossip.sign(GossipData::SyncRequest(request)) {
            Ok(message) => self.transport.broadcast(WireMessage::Gossip(message)).await,
            Err(e) => {
                self.fail(e.to_string());
                return Err(e.into());
            }
        };
        if delivered == 0 {
            self.fail("sync request reached no peer".into());
            return Err(SyncError::Undelivered);
        }

        info!(last_sync, peers = delivered, "sync started");
        self.events.publish(
            SyncEvent::Started {
                last_sync,
                peers: delivered,
            }
            .into(),
        );
        Ok(())
    }

    fn fail(&self, reason: String) {
        {
            let mut inner = self.inner.lock();
            inner.session = None;
            inner.failed += 1;
            inner.last_outcome = Some(SyncOutcome::Failed(reason.clone()));
        }
        warn!(reason = %reason, "sync failed");
        self.events.publish(SyncEvent::Failed { reason }.into());
    }

    /// Merge one response batch. Returns how many identities were new.
    ///
    /// Batches are merged whenever they arrive; the watermark only moves for
    /// the cycle this node started.
    pub fn handle_response(&self, response: SyncResponse) -> usize {
        if response.node_id == self.node_id {
            return 0;
        }
        let report = self.ledger.merge_identities_report(response.identities);
        let (merged, max_timestamp) = (report.merged, report.max_timestamp.unwrap_or(0));

        debug!(
            from = %response.node_id,
            batch = response.batch_number,
            total = response.total_batches,
            merged,
            "sync batch merged"
        );
        self.events.publish(
            SyncEvent::BatchMerged {
                from: response.node_id.clone(),
                batch_number: response.batch_number,
                total_batches: response.total_batches,
                merged,
            }
            .into(),
        );

        let completed = {
            let mut inner = self.inner.lock();
            inner.merged_total += merged as u64;
            let Some(session) = inner.session.as_mut() else {
                return merged;
            };
            let progress = session
                .responders
                .entry(response.node_id.clone())
                .or_default();
            progress.total_batches = response.total_batches.max(1);
            progress.received.insert(response.batch_number);
            progress.merged += merged;
            progress.max_timestamp = progress.max_timestamp.max(max_timestamp);

            if progress.received.len() as u32 >= progress.total_batches {
                let done = (progress.merged, progress.max_timestamp);
                inner.session = None;
                inner.completed += 1;
                inner.last_outcome = Some(SyncOutcome::Completed {
                    responder: response.node_id.clone(),
                    merged: done.0,
                });
                Some(done)
            } else {
                None
            }
        };

        if let Some((total_merged, watermark)) = completed {
            if watermark > self.ledger.last_sync() {
                if let Err(e) = self.ledger.set_last_sync(watermark) {
                    warn!(error = %e, "failed to persist sync watermark");
                }
            }
            info!(responder = %response.node_id, merged = total_merged, "sync completed");
            self.events.publish(
                SyncEvent::Completed {
                    responder: response.node_id,
                    merged: total_merged,
                }
                .into(),
            );
        }
        merged
    }

    /// End the running cycle if it is past its deadline.
    pub fn check_timeout(&self, now: Timestamp) -> bool {
        let timeout = self.config.timeout.as_millis() as u64;
        {
            let mut inner = self.inner.lock();
            let expired = inner
                .session
                .as_ref()
                .map_or(false, |s| now.saturating_sub(s.started_at) > timeout);
            if !expired {
                return false;
            }
            inner.session = None;
            inner.timed_out += 1;
            inner.last_outcome = Some(SyncOutcome::TimedOut);
        }
        warn!("sync timed out");
        self.events.publish(SyncEvent::TimedOut.into());
        true
    }

    /// Purge request bookkeeping older than the timeout and reset a cycle
    /// stuck past it. Returns how many entries were cleared.
    pub fn clear_stuck_syncs(&self, now: Timestamp) -> usize {
        let timeout = self.config.timeout.as_millis() as u64;
        let cleared = {
            let mut inner = self.inner.lock();
            let before = inner.handled_requests.len();
            inner
                .handled_requests
                .retain(|_, answered| now.saturating_sub(*answered) <= timeout);
            before - inner.handled_requests.len()
        };
        let reset = self.check_timeout(now);
        if cleared > 0 || reset {
            debug!(cleared, reset, "cleared stuck sync state");
        }
        cleared + reset as usize
    }

    // =========================================================================
    // RESPONDER
    // =========================================================================

    /// Answer a peer's sync request with delayed batches.
    ///
    /// Each batch goes directly to `requester`, falling back to a broadcast
    /// when the direct send fails. Returns the number of batches sent.
    pub async fn handle_request(&self, request: SyncRequest, requester: PeerId) -> u32 {
        match self.try_handle_request(request, requester).await {
            Ok(batches) => batches,
            Err(e) => {
                warn!(requester = %requester, error = %e, "failed to serve sync request");
                0
            }
        }
    }

    pub async fn try_handle_request(
        &self,
        request: SyncRequest,
        requester: PeerId,
    ) -> Result<u32, SyncError> {
        if request.node_id == self.node_id {
            return Ok(0);
        }
        {
            let mut inner = self.inner.lock();
            let key = (request.node_id.clone(), request.timestamp);
            if inner.handled_requests.contains_key(&key) {
                debug!(requester = %request.node_id, "sync request already served");
                return Ok(0);
            }
            inner.handled_requests.insert(key, now_ms());
        }

        let identities = self.ledger.identities_since(request.last_sync);
        let batches: Vec<Vec<Identity>> = if identities.is_empty() {
            vec![Vec::new()]
        } else {
            identities
                .chunks(self.config.batch_size.max(1))
                .map(<[Identity]>::to_vec)
                .collect()
        };
        let total_batches = batches.len() as u32;

        for (i, identities) in batches.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            let response = SyncResponse {
                identities,
                batch_number: i as u32 + 1,
                total_batches,
                node_id: self.node_id.clone(),
                timestamp: now_ms(),
            };
            let message = self.gossip.sign(GossipData::SyncResponse(response))?;
            if let Err(e) = self.gossip.send_direct(&requester, message.clone()).await {
                debug!(requester = %requester, error = %e, "direct sync send failed, broadcasting");
                self.transport.broadcast(WireMessage::Gossip(message)).await;
            }
        }

        self.inner.lock().requests_served += 1;
        debug!(requester = %request.node_id, batches = total_batches, "sync request served");
        self.events.publish(
            SyncEvent::RequestServed {
                requester: request.node_id,
                batches: total_batches,
            }
            .into(),
        );
        Ok(total_batches)
    }

    pub fn stats(&self) -> SyncStats {
        let last_sync = self.ledger.last_sync();
        let inner = self.inner.lock();
        SyncStats {
            status: if inner.session.is_some() {
                SyncStatus::Syncing
            } else {
                SyncStatus::Idle
            },
            last_sync,
            last_outcome: inner.last_outcome.clone(),
            cycles: inner.cycles,
            completed: inner.completed,
            failed: inner.failed,
            timed_out: inner.timed_out,
            requests_served: inner.requests_served,
            identities_merged: inner.merged_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::GossipConfig;
    use crate::ledger::LedgerConfig;
    use crate::storage::MemoryStore;
    use idmesh_core::crypto::{create_identity, KeyPair};
    use idmesh_net::{MemoryNetwork, TransportEvent};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        sync: SyncManager,
        ledger: Arc<Ledger>,
        transport: Arc<dyn Transport>,
        rx: UnboundedReceiver<TransportEvent>,
    }

    fn harness(network: &Arc<MemoryNetwork>, seed: u8, config: SyncConfig) -> Harness {
        let keypair = KeyPair::from_seed(&[seed; 32]);
        let (transport, rx) = network.join(keypair.peer_id(), format!("mem://{}", seed));
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let events = EventBus::default();
        let ledger = Arc::new(
            Ledger::open(Arc::new(MemoryStore::new()), LedgerConfig::default(), events.clone())
                .unwrap(),
        );
        let gossip = Arc::new(GossipEngine::new(
            GossipConfig::default(),
            keypair,
            transport.clone(),
            events.clone(),
        ));
        let sync = SyncManager::new(config, ledger.clone(), gossip, transport.clone(), events);
        Harness {
            sync,
            ledger,
            transport,
            rx,
        }
    }

    fn identity(seed: u8, timestamp: Timestamp) -> Identity {
        create_identity(&KeyPair::from_seed(&[seed; 32]), timestamp, None).unwrap()
    }

    async fn next_gossip(rx: &mut UnboundedReceiver<TransportEvent>) -> (PeerId, GossipMessage) {
        loop {
            match rx.recv().await.unwrap() {
                TransportEvent::MessageReceived {
                    from,
                    message: WireMessage::Gossip(message),
                } => return (from, message),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_start_without_peers() {
        let network = MemoryNetwork::new();
        let h = harness(&network, 1, SyncConfig::default());
        assert!(!h.sync.start_sync().await);
        assert_eq!(h.sync.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_single_cycle_at_a_time() {
        let network = MemoryNetwork::new();
        let a = harness(&network, 1, SyncConfig::default());
        let _b = harness(&network, 2, SyncConfig::default());
        a.transport.connect("mem://2").await.unwrap();

        assert!(a.sync.start_sync().await);
        assert!(a.sync.is_syncing());
        assert!(!a.sync.start_sync().await);
    }

    #[tokio::test]
    async fn test_batched_reconciliation() {
        let network = MemoryNetwork::new();
        let config = SyncConfig {
            batch_size: 2,
            batch_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let mut a = harness(&network, 1, config.clone());
        let mut b = harness(&network, 2, config);
        a.transport.connect("mem://2").await.unwrap();

        for seed in 10..15 {
            assert!(b.ledger.add_identity(identity(seed, 100 + seed as u64)));
        }

        assert!(a.sync.start_sync().await);
        let (from, request) = next_gossip(&mut b.rx).await;
        let GossipData::SyncRequest(request) = request.data else {
            panic!("expected sync request");
        };
        assert_eq!(b.sync.handle_request(request.clone(), from).await, 3);
        // Re-delivery of the same request is not answered again
        assert_eq!(b.sync.handle_request(request, from).await, 0);

        let mut merged = 0;
        for _ in 0..3 {
            let (_, message) = next_gossip(&mut a.rx).await;
            if let GossipData::SyncResponse(response) = message.data {
                merged += a.sync.handle_response(response);
            }
        }
        assert_eq!(merged, 5);
        assert_eq!(a.ledger.len(), 5);
        assert_eq!(a.sync.status(), SyncStatus::Idle);
        assert_eq!(a.ledger.last_sync(), 114);
        assert!(matches!(
            a.sync.last_outcome(),
            Some(SyncOutcome::Completed { merged: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_responder_completes_cycle() {
        let network = MemoryNetwork::new();
        let mut a = harness(&network, 1, SyncConfig::default());
        let mut b = harness(&network, 2, SyncConfig::default());
        a.transport.connect("mem://2").await.unwrap();

        assert!(a.sync.start_sync().await);
        let (from, request) = next_gossip(&mut b.rx).await;
        let GossipData::SyncRequest(request) = request.data else {
            panic!("expected sync request");
        };
        assert_eq!(b.sync.handle_request(request, from).await, 1);

        let (_, message) = next_gossip(&mut a.rx).await;
        let GossipData::SyncResponse(response) = message.data else {
            panic!("expected sync response");
        };
        assert_eq!((response.batch_number, response.total_batches), (1, 1));
        assert_eq!(a.sync.handle_response(response), 0);
        assert_eq!(a.sync.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_timeout_and_stuck_reset() {
        let network = MemoryNetwork::new();
        let a = harness(&network, 1, SyncConfig::default());
        let _b = harness(&network, 2, SyncConfig::default());
        a.transport.connect("mem://2").await.unwrap();

        assert!(a.sync.start_sync().await);
        let now = now_ms();
        assert!(!a.sync.check_timeout(now));
        assert!(a.sync.check_timeout(now + 31_000));
        assert_eq!(a.sync.last_outcome(), Some(SyncOutcome::TimedOut));

        assert!(a.sync.start_sync().await);
        assert_eq!(a.sync.clear_stuck_syncs(now_ms() + 31_000), 1);
        assert_eq!(a.sync.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_expired_cycle_does_not_block_next() {
        let network = MemoryNetwork::new();
        let config = SyncConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let a = harness(&network, 1, config);
        let _b = harness(&network, 2, SyncConfig::default());
        a.transport.connect("mem://2").await.unwrap();

        assert!(a.sync.start_sync().await);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(a.sync.try_start_sync().await.is_ok());
        assert!(a.sync.is_syncing());
        let stats = a.sync.stats();
        assert_eq!((stats.cycles, stats.timed_out), (2, 1));
    }

    #[tokio::test]
    async fn test_forged_identity_does_not_move_watermark() {
        let network = MemoryNetwork::new();
        let a = harness(&network, 1, SyncConfig::default());
        let _b = harness(&network, 2, SyncConfig::default());
        a.transport.connect("mem://2").await.unwrap();
        assert!(a.sync.start_sync().await);

        let mut forged = identity(11, u64::MAX - 1);
        forged.signature[0] ^= 0xff;
        let response = SyncResponse {
            identities: vec![identity(10, 100), forged],
            batch_number: 1,
            total_batches: 1,
            node_id: "responder".into(),
            timestamp: now_ms(),
        };
        assert_eq!(a.sync.handle_response(response), 1);
        assert_eq!(a.ledger.len(), 1);
        assert_eq!(a.ledger.last_sync(), 100);
        assert_eq!(a.sync.status(), SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_unsolicited_response_leaves_watermark() {
        let network = MemoryNetwork::new();
        let a = harness(&network, 1, SyncConfig::default());
        let response = SyncResponse {
            identities: vec![identity(10, 500)],
            batch_number: 1,
            total_batches: 1,
            node_id: "someone".into(),
            timestamp: now_ms(),
        };
        assert_eq!(a.sync.handle_response(response), 1);
        assert_eq!(a.ledger.last_sync(), 0);
    }
}
