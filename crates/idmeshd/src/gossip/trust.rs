//! Per-peer trust scoring

use idmesh_core::time::now_ms;
use idmesh_core::types::*;
use std::collections::HashMap;

/// Score a fresh peer starts with
pub const INITIAL_TRUST: f64 = 0.5;
/// Reward for a valid message
pub const VALID_MESSAGE_REWARD: f64 = 0.01;
/// Penalty for an invalid message
pub const INVALID_MESSAGE_PENALTY: f64 = 0.05;

/// Trust record for a gossip peer
#[derive(Debug, Clone)]
pub struct PeerTrust {
    pub peer: PeerId,
    /// Trust score (0.0-1.0)
    pub score: f64,
    pub added_at: Timestamp,
    pub last_seen: Timestamp,
    pub valid_messages: u64,
    pub invalid_messages: u64,
}

impl PeerTrust {
    fn new(peer: PeerId) -> Self {
        let now = now_ms();
        Self {
            peer,
            score: INITIAL_TRUST,
            added_at: now,
            last_seen: now,
            valid_messages: 0,
            invalid_messages: 0,
        }
    }

    fn adjust(&mut self, delta: f64) {
        self.score = (self.score + delta).clamp(0.0, 1.0);
        self.last_seen = now_ms();
    }
}

/// Peer set with trust scores.
#[derive(Debug, Default)]
pub struct TrustTable {
    peers: HashMap<PeerId, PeerTrust>,
}

impl TrustTable {
    /// Add a peer; `false` if already present.
    pub fn add(&mut self, peer: PeerId) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }
        self.peers.insert(peer, PeerTrust::new(peer));
        true
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn score(&self, peer: &PeerId) -> Option<f64> {
        self.peers.get(peer).map(|p| p.score)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerTrust> {
        self.peers.get(peer)
    }

    /// Reward a valid message. `None` for peers not in the table.
    pub fn record_valid(&mut self, peer: PeerId) -> Option<f64> {
        let entry = self.peers.get_mut(&peer)?;
        entry.valid_messages += 1;
        entry.adjust(VALID_MESSAGE_REWARD);
        Some(entry.score)
    }

    /// Penalize an invalid message. `None` for peers not in the table.
    pub fn record_invalid(&mut self, peer: PeerId) -> Option<f64> {
        let entry = self.peers.get_mut(&peer)?;
        entry.invalid_messages += 1;
        entry.adjust(-INVALID_MESSAGE_PENALTY);
        Some(entry.score)
    }

    /// Peers other than `exclude`, most trusted first. Ties break on peer id.
    pub fn ranked(&self, exclude: &[PeerId]) -> Vec<PeerId> {
        let mut peers: Vec<&PeerTrust> = self
            .peers
            .values()
            .filter(|p| !exclude.contains(&p.peer))
            .collect();
        peers.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.peer.cmp(&b.peer)));
        peers.into_iter().map(|p| p.peer).collect()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn mean_score(&self) -> f64 {
        if self.peers.is_empty() {
            return 0.0;
        }
        self.peers.values().map(|p| p.score).sum::<f64>() / self.peers.len() as f64
    }
}
