//! Threshold-voting consensus over identity proposals
//!
//! ```text
//! Pending ──┬── participation ≥ t and approval ≥ t ──────► Committed
//!           ├── participation > 0.5 and approval < 1 − t ─► Rejected
//!           └── otherwise ───────────────────────────────► Pending
//! ```
//!
//! Resolved proposals never transition again. A proposal that never reaches
//! either bound stays pending until [`ConsensusManager::reset_pending`] or,
//! when a proposal TTL is configured, [`ConsensusManager::expire_stale_proposals`].

use crate::events::{ConsensusEvent, EventBus};
use idmesh_core::crypto::{compute_proposal_id, verify_identity};
use idmesh_core::time::now_ms;
use idmesh_core::types::*;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default commit threshold
pub const DEFAULT_THRESHOLD: f64 = 0.67;
/// Smallest accepted threshold
pub const MIN_THRESHOLD: f64 = 0.5;
/// Resolved proposal ids remembered to refuse late votes
const RESOLVED_HISTORY: usize = 1024;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Invalid identity in proposal: {0}")]
    InvalidIdentity(#[from] idmesh_core::Error),
    #[error("Proposal contains no identities")]
    EmptyProposal,
    #[error("Unknown proposal: {0}")]
    UnknownProposal(String),
    #[error("Proposal {0} is already resolved")]
    AlreadyResolved(String),
    #[error("Not a participant: {0}")]
    NotParticipant(String),
    #[error("Threshold {0} outside [0.5, 1.0]")]
    InvalidThreshold(f64),
    #[error("External state version {incoming} is not newer than {current}")]
    StaleState { current: u64, incoming: u64 },
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub threshold: f64,
    /// Pending proposals older than this are discarded by
    /// [`ConsensusManager::expire_stale_proposals`]. `None` keeps them.
    pub proposal_ttl: Option<Duration>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            proposal_ttl: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalStatus {
    Pending,
    Committed,
    Rejected,
}

/// An open proposal.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub id: String,
    pub identities: Vec<Identity>,
    pub proposer: String,
    /// voter -> approve
    pub votes: BTreeMap<String, bool>,
    /// Participant count at the last evaluation
    pub total_participants: usize,
    pub created_at: Timestamp,
}

impl Proposal {
    fn approvals(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }

    fn evaluate(&self, threshold: f64) -> ProposalStatus {
        let cast = self.votes.len();
        if cast == 0 || self.total_participants == 0 {
            return ProposalStatus::Pending;
        }
        let participation = cast as f64 / self.total_participants as f64;
        let approval = self.approvals() as f64 / cast as f64;

        if participation >= threshold && approval >= threshold {
            ProposalStatus::Committed
        } else if participation > 0.5 && approval < 1.0 - threshold {
            ProposalStatus::Rejected
        } else {
            ProposalStatus::Pending
        }
    }
}

/// Committed registry state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    pub version: u64,
    pub identities: BTreeMap<String, Identity>,
    pub participants: BTreeSet<String>,
    pub timestamp: Timestamp,
}

impl ConsensusState {
    fn new() -> Self {
        Self {
            version: 1,
            identities: BTreeMap::new(),
            participants: BTreeSet::new(),
            timestamp: now_ms(),
        }
    }
}

/// What a vote (or the proposer's implicit vote) did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Recorded; the proposal is still pending.
    Recorded,
    /// The proposal committed. `identities` are the entries that replaced
    /// committed state.
    Committed {
        proposal_id: String,
        version: u64,
        identities: Vec<Identity>,
    },
    Rejected { proposal_id: String },
}

struct Inner {
    threshold: f64,
    state: ConsensusState,
    pending: HashMap<String, Proposal>,
    resolved: LruCache<String, ProposalStatus>,
}

pub struct ConsensusManager {
    proposal_ttl: Option<Duration>,
    inner: Mutex<Inner>,
    events: EventBus,
}

impl ConsensusManager {
    pub fn new(config: ConsensusConfig, events: EventBus) -> Result<Self> {
        validate_threshold(config.threshold)?;
        let history = NonZeroUsize::new(RESOLVED_HISTORY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            proposal_ttl: config.proposal_ttl,
            inner: Mutex::new(Inner {
                threshold: config.threshold,
                state: ConsensusState::new(),
                pending: HashMap::new(),
                resolved: LruCache::new(history),
            }),
            events,
        })
    }

    // =========================================================================
    // PARTICIPANTS
    // =========================================================================

    pub fn add_participant(&self, id: impl Into<String>) -> bool {
        let id = id.into();
        let added = self.inner.lock().state.participants.insert(id.clone());
        if added {
            debug!(participant = %id, "consensus participant added");
        }
        added
    }

    pub fn remove_participant(&self, id: &str) -> bool {
        let removed = self.inner.lock().state.participants.remove(id);
        if removed {
            debug!(participant = %id, "consensus participant removed");
        }
        removed
    }

    pub fn participants(&self) -> Vec<String> {
        self.inner.lock().state.participants.iter().cloned().collect()
    }

    pub fn threshold(&self) -> f64 {
        self.inner.lock().threshold
    }

    pub fn set_threshold(&self, threshold: f64) -> Result<()> {
        validate_threshold(threshold)?;
        self.inner.lock().threshold = threshold;
        Ok(())
    }

    // =========================================================================
    // PROPOSALS
    // =========================================================================

    pub fn propose_identity(&self, identity: Identity, proposer: &str) -> Option<String> {
        self.propose_identities(vec![identity], proposer)
    }

    /// Propose a set of identities; `None` when any of them fails verification
    /// or the proposer is not a participant.
    ///
    /// A commit reached by the proposer's own vote is published as
    /// [`ConsensusEvent::Committed`]; use [`Self::try_propose_identities`] to
    /// act on it directly.
    pub fn propose_identities(&self, identities: Vec<Identity>, proposer: &str) -> Option<String> {
        match self.try_propose_identities(identities, proposer) {
            Ok((id, _)) => Some(id),
            Err(e) => {
                warn!(proposer = %proposer, error = %e, "proposal refused");
                None
            }
        }
    }

    pub fn try_propose_identities(
        &self,
        identities: Vec<Identity>,
        proposer: &str,
    ) -> Result<(String, VoteOutcome)> {
        if identities.is_empty() {
            return Err(ConsensusError::EmptyProposal);
        }
        for identity in &identities {
            verify_identity(identity)?;
        }
        let proposal_id = compute_proposal_id(&identities)?;

        let mut inner = self.inner.lock();
        if !inner.state.participants.contains(proposer) {
            return Err(ConsensusError::NotParticipant(proposer.to_string()));
        }
        if !inner.pending.contains_key(&proposal_id) {
            let proposal = Proposal {
                id: proposal_id.clone(),
                identities,
                proposer: proposer.to_string(),
                votes: BTreeMap::new(),
                total_participants: inner.state.participants.len(),
                created_at: now_ms(),
            };
            inner.resolved.pop(&proposal_id);
            inner.pending.insert(proposal_id.clone(), proposal);
            info!(proposal = %proposal_id, proposer = %proposer, "proposal created");
            self.events.publish(
                ConsensusEvent::Proposed {
                    proposal_id: proposal_id.clone(),
                    proposer: proposer.to_string(),
                }
                .into(),
            );
        }

        let outcome = self.record_vote(&mut inner, &proposal_id, proposer, true)?;
        Ok((proposal_id, outcome))
    }

    // =========================================================================
    // VOTING
    // =========================================================================

    /// Cast a vote. `false` for unknown proposals and non-participants.
    pub fn vote(&self, proposal_id: &str, voter: &str, approve: bool) -> bool {
        match self.try_vote(proposal_id, voter, approve) {
            Ok(_) => true,
            Err(e) => {
                debug!(proposal = %proposal_id, voter = %voter, error = %e, "vote refused");
                false
            }
        }
    }

    pub fn try_vote(&self, proposal_id: &str, voter: &str, approve: bool) -> Result<VoteOutcome> {
        let mut inner = self.inner.lock();
        if !inner.pending.contains_key(proposal_id) {
            return Err(match inner.resolved.peek(proposal_id) {
                Some(_) => ConsensusError::AlreadyResolved(proposal_id.to_string()),
                None => ConsensusError::UnknownProposal(proposal_id.to_string()),
            });
        }
        if !inner.state.participants.contains(voter) {
            return Err(ConsensusError::NotParticipant(voter.to_string()));
        }
        self.record_vote(&mut inner, proposal_id, voter, approve)
    }

    fn record_vote(
        &self,
        inner: &mut Inner,
        proposal_id: &str,
        voter: &str,
        approve: bool,
    ) -> Result<VoteOutcome> {
        let threshold = inner.threshold;
        let total = inner.state.participants.len();
        let status = {
            let proposal = inner
                .pending
                .get_mut(proposal_id)
                .ok_or_else(|| ConsensusError::UnknownProposal(proposal_id.to_string()))?;
            proposal.votes.insert(voter.to_string(), approve);
            proposal.total_participants = total.max(proposal.votes.len());
            debug!(
                proposal = %proposal_id,
                voter = %voter,
                approve,
                votes = proposal.votes.len(),
                total = proposal.total_participants,
                "vote recorded"
            );
            proposal.evaluate(threshold)
        };
        self.events.publish(
            ConsensusEvent::Voted {
                proposal_id: proposal_id.to_string(),
                voter: voter.to_string(),
                approve,
            }
            .into(),
        );

        match status {
            ProposalStatus::Pending => Ok(VoteOutcome::Recorded),
            ProposalStatus::Committed => Ok(self.commit(inner, proposal_id)),
            ProposalStatus::Rejected => {
                inner.pending.remove(proposal_id);
                inner
                    .resolved
                    .put(proposal_id.to_string(), ProposalStatus::Rejected);
                info!(proposal = %proposal_id, "proposal rejected");
                self.events.publish(
                    ConsensusEvent::Rejected {
                        proposal_id: proposal_id.to_string(),
                    }
                    .into(),
                );
                Ok(VoteOutcome::Rejected {
                    proposal_id: proposal_id.to_string(),
                })
            }
        }
    }

    fn commit(&self, inner: &mut Inner, proposal_id: &str) -> VoteOutcome {
        let identities = inner
            .pending
            .remove(proposal_id)
            .map(|p| p.identities)
            .unwrap_or_default();

        let mut applied = Vec::new();
        for identity in identities {
            let newer = match inner.state.identities.get(&identity.id) {
                Some(existing) => identity.timestamp > existing.timestamp,
                None => true,
            };
            if newer {
                inner
                    .state
                    .identities
                    .insert(identity.id.clone(), identity.clone());
                applied.push(identity);
            }
        }
        inner.state.version += 1;
        inner.state.timestamp = now_ms();
        inner
            .resolved
            .put(proposal_id.to_string(), ProposalStatus::Committed);

        let version = inner.state.version;
        info!(proposal = %proposal_id, version, applied = applied.len(), "proposal committed");
        self.events.publish(
            ConsensusEvent::Committed {
                proposal_id: proposal_id.to_string(),
                version,
                identities: applied.clone(),
            }
            .into(),
        );
        VoteOutcome::Committed {
            proposal_id: proposal_id.to_string(),
            version,
            identities: applied,
        }
    }

    // =========================================================================
    // STATE
    // =========================================================================

    pub fn current_state(&self) -> ConsensusState {
        self.inner.lock().state.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().state.version
    }

    pub fn pending_proposals(&self) -> Vec<Proposal> {
        let mut proposals: Vec<Proposal> = self.inner.lock().pending.values().cloned().collect();
        proposals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        proposals
    }

    pub fn proposal_status(&self, proposal_id: &str) -> Option<ProposalStatus> {
        let inner = self.inner.lock();
        if inner.pending.contains_key(proposal_id) {
            return Some(ProposalStatus::Pending);
        }
        inner.resolved.peek(proposal_id).copied()
    }

    /// Adopt an externally supplied state when it is strictly newer and every
    /// identity in it verifies.
    pub fn sync_with_external_state(&self, state: ConsensusState) -> bool {
        match self.try_sync_with_external_state(state) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "external state refused");
                false
            }
        }
    }

    pub fn try_sync_with_external_state(&self, state: ConsensusState) -> Result<()> {
        let current = self.version();
        if state.version <= current {
            return Err(ConsensusError::StaleState {
                current,
                incoming: state.version,
            });
        }
        for (id, identity) in &state.identities {
            if id != &identity.id {
                return Err(idmesh_core::Error::Validation(format!(
                    "state key {} does not match identity {}",
                    id, identity.id
                ))
                .into());
            }
            verify_identity(identity)?;
        }

        let mut inner = self.inner.lock();
        // Re-check under the lock
        if state.version <= inner.state.version {
            return Err(ConsensusError::StaleState {
                current: inner.state.version,
                incoming: state.version,
            });
        }
        let mut participants = std::mem::take(&mut inner.state.participants);
        participants.extend(state.participants);
        inner.state = ConsensusState {
            version: state.version,
            identities: state.identities,
            participants,
            timestamp: state.timestamp,
        };
        info!(version = state.version, "adopted external consensus state");
        self.events
            .publish(ConsensusEvent::StateAdopted { version: state.version }.into());
        Ok(())
    }

    // =========================================================================
    // GARBAGE COLLECTION
    // =========================================================================

    /// Drop every pending proposal.
    pub fn reset_pending(&self) -> usize {
        let drained: Vec<String> = self.inner.lock().pending.drain().map(|(id, _)| id).collect();
        for proposal_id in &drained {
            self.events.publish(
                ConsensusEvent::Discarded {
                    proposal_id: proposal_id.clone(),
                }
                .into(),
            );
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "pending proposals reset");
        }
        drained.len()
    }

    /// Drop pending proposals older than the configured TTL. No-op without one.
    pub fn expire_stale_proposals(&self, now: Timestamp) -> usize {
        let Some(ttl) = self.proposal_ttl else {
            return 0;
        };
        let ttl_ms = ttl.as_millis() as u64;
        let expired: Vec<String> = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner
                .pending
                .values()
                .filter(|p| now.saturating_sub(p.created_at) > ttl_ms)
                .map(|p| p.id.clone())
                .collect();
            for id in &ids {
                inner.pending.remove(id);
            }
            ids
        };
        for proposal_id in &expired {
            debug!(proposal = %proposal_id, "pending proposal expired");
            self.events.publish(
                ConsensusEvent::Discarded {
                    proposal_id: proposal_id.clone(),
                }
                .into(),
            );
        }
        expired.len()
    }
}

fn validate_threshold(threshold: f64) -> Result<()> {
    if !(MIN_THRESHOLD..=1.0).contains(&threshold) {
        return Err(ConsensusError::InvalidThreshold(threshold));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use idmesh_core::crypto::{create_identity, KeyPair};

    fn identity(seed: u8, timestamp: Timestamp) -> Identity {
        create_identity(&KeyPair::from_seed(&[seed; 32]), timestamp, None).unwrap()
    }

    fn manager(participants: &[&str]) -> ConsensusManager {
        let manager = ConsensusManager::new(ConsensusConfig::default(), EventBus::default()).unwrap();
        for p in participants {
            manager.add_participant(*p);
        }
        manager
    }

    #[test]
    fn test_three_node_commit() {
        let manager = manager(&["n1", "n2", "n3"]);
        let i1 = identity(1, 100);
        assert_eq!(manager.version(), 1);

        let (id, outcome) = manager.try_propose_identities(vec![i1.clone()], "n1").unwrap();
        assert_eq!(outcome, VoteOutcome::Recorded);
        // 2/3 participation is below 0.67
        assert_eq!(manager.try_vote(&id, "n2", true).unwrap(), VoteOutcome::Recorded);

        match manager.try_vote(&id, "n3", true).unwrap() {
            VoteOutcome::Committed { version, identities, .. } => {
                assert_eq!(version, 2);
                assert_eq!(identities, vec![i1.clone()]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let state = manager.current_state();
        assert_eq!(state.version, 2);
        assert_eq!(state.identities.get(&i1.id), Some(&i1));
        assert_eq!(manager.proposal_status(&id), Some(ProposalStatus::Committed));
        assert!(manager.pending_proposals().is_empty());
    }

    #[test]
    fn test_rejection() {
        let manager = manager(&["n1", "n2", "n3", "n4", "n5"]);
        let id = manager.propose_identity(identity(1, 100), "n1").unwrap();

        assert!(manager.vote(&id, "n2", false));
        // 3/5 votes, 1/3 approving: not below 0.33 yet
        assert!(manager.vote(&id, "n3", false));
        assert_eq!(manager.proposal_status(&id), Some(ProposalStatus::Pending));
        // 4/5 votes, 1/4 approving
        assert_eq!(
            manager.try_vote(&id, "n4", false).unwrap(),
            VoteOutcome::Rejected {
                proposal_id: id.clone()
            }
        );
        assert_eq!(manager.version(), 1);
        // Resolved proposals take no more votes
        assert!(matches!(
            manager.try_vote(&id, "n5", true),
            Err(ConsensusError::AlreadyResolved(_))
        ));
    }

    #[test]
    fn test_vote_refusals() {
        let manager = manager(&["n1", "n2"]);
        assert!(!manager.vote("missing", "n1", true));
        let id = manager.propose_identity(identity(1, 100), "n1").unwrap();
        assert!(matches!(
            manager.try_vote(&id, "stranger", true),
            Err(ConsensusError::NotParticipant(_))
        ));
    }

    #[test]
    fn test_proposer_must_participate() {
        let manager = manager(&["n1", "n2", "n3"]);
        assert!(matches!(
            manager.try_propose_identities(vec![identity(1, 100)], "outsider"),
            Err(ConsensusError::NotParticipant(_))
        ));
        assert!(manager.propose_identity(identity(1, 100), "outsider").is_none());
        assert!(manager.pending_proposals().is_empty());

        // A participant's proposal counts one vote out of three
        let id = manager.propose_identity(identity(1, 100), "n1").unwrap();
        let pending = manager.pending_proposals();
        assert_eq!(pending[0].votes.len(), 1);
        assert_eq!(pending[0].total_participants, 3);
        assert_eq!(manager.proposal_status(&id), Some(ProposalStatus::Pending));
    }

    #[test]
    fn test_propose_is_idempotent_and_atomic() {
        let manager = manager(&["n1", "n2", "n3"]);
        let a = identity(1, 100);
        let b = identity(2, 100);
        let first = manager.propose_identities(vec![a.clone(), b.clone()], "n1").unwrap();
        let again = manager.propose_identities(vec![b.clone(), a.clone()], "n1").unwrap();
        assert_eq!(first, again);
        assert_eq!(manager.pending_proposals().len(), 1);

        let mut forged = identity(3, 100);
        forged.timestamp += 1;
        assert!(manager.propose_identities(vec![a, forged], "n1").is_none());
        assert_eq!(manager.pending_proposals().len(), 1);
    }

    #[test]
    fn test_commit_keeps_newer_entries() {
        let manager = manager(&["n1"]);
        let newer = identity(1, 200);
        let older = identity(1, 100);

        // A single participant commits on the proposer's own vote
        let (_, outcome) = manager.try_propose_identities(vec![newer.clone()], "n1").unwrap();
        assert!(matches!(outcome, VoteOutcome::Committed { version: 2, .. }));

        let (_, outcome) = manager.try_propose_identities(vec![older], "n1").unwrap();
        match outcome {
            VoteOutcome::Committed { version, identities, .. } => {
                assert_eq!(version, 3);
                assert!(identities.is_empty());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(manager.current_state().identities[&newer.id], newer);
    }

    #[test]
    fn test_threshold_bounds() {
        let manager = manager(&[]);
        assert!(manager.set_threshold(0.49).is_err());
        assert!(manager.set_threshold(1.01).is_err());
        assert!(manager.set_threshold(0.5).is_ok());
        assert!(manager.set_threshold(1.0).is_ok());
        assert!(ConsensusManager::new(
            ConsensusConfig {
                threshold: 0.2,
                ..Default::default()
            },
            EventBus::default()
        )
        .is_err());
    }

    #[test]
    fn test_external_state_adoption() {
        let manager = manager(&["n1"]);
        let i1 = identity(1, 100);
        let mut state = manager.current_state();
        state.identities.insert(i1.id.clone(), i1.clone());

        // Same version is refused
        assert!(!manager.sync_with_external_state(state.clone()));

        state.version = 5;
        state.participants.insert("n9".into());
        assert!(manager.sync_with_external_state(state.clone()));
        let adopted = manager.current_state();
        assert_eq!(adopted.version, 5);
        assert!(adopted.participants.contains("n1"));
        assert!(adopted.participants.contains("n9"));

        let mut bad = adopted.clone();
        bad.version = 6;
        let mut forged = identity(2, 100);
        forged.timestamp = 101;
        bad.identities.insert(forged.id.clone(), forged);
        assert!(!manager.sync_with_external_state(bad));
        assert_eq!(manager.version(), 5);
    }

    #[test]
    fn test_pending_gc() {
        let manager = ConsensusManager::new(
            ConsensusConfig {
                proposal_ttl: Some(Duration::from_secs(60)),
                ..Default::default()
            },
            EventBus::default(),
        )
        .unwrap();
        for p in ["n1", "n2", "n3"] {
            manager.add_participant(p);
        }
        let id = manager.propose_identity(identity(1, 100), "n1").unwrap();
        let now = now_ms();
        assert_eq!(manager.expire_stale_proposals(now), 0);
        assert_eq!(manager.expire_stale_proposals(now + 61_000), 1);
        assert_eq!(manager.proposal_status(&id), None);

        manager.propose_identity(identity(2, 100), "n1").unwrap();
        assert_eq!(manager.reset_pending(), 1);

        // Without a TTL nothing expires
        let untimed = self::manager(&["n1", "n2"]);
        untimed.propose_identity(identity(3, 100), "n1").unwrap();
        assert_eq!(untimed.expire_stale_proposals(u64::MAX), 0);
    }
}
