//! Local identity ledger
//!
//! Durable map of identity id -> [`Identity`] with a monotonic version.
//! Conflicts resolve by timestamp: an identity replaces the stored entry
//! with the same id only if it is strictly newer. The whole state is one
//! postcard snapshot, written before the in-memory state is swapped so a
//! failed write leaves the ledger unchanged.

use crate::events::{EventBus, LedgerEvent};
use crate::storage::{Persistence, StorageError};
use idmesh_core::crypto::verify_identity;
use idmesh_core::time::now_ms;
use idmesh_core::types::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Persistence key of the ledger snapshot
pub const LEDGER_KEY: &str = "ledger";

/// Default retention window for `cleanup_old_identities`
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Identity(#[from] idmesh_core::Error),
    #[error("Snapshot encoding error: {0}")]
    Snapshot(#[from] postcard::Error),
    #[error("Export format error: {0}")]
    Export(#[from] serde_json::Error),
}

/// Ledger configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Entries older than this are removed by the retention sweep
    pub retention: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerState {
    identities: BTreeMap<String, Identity>,
    last_sync: Timestamp,
    version: u64,
}

/// Search filter for [`Ledger::search_identities`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub id_prefix: Option<String>,
    pub public_key: Option<Bytes32>,
    /// Metadata `key == value`
    pub metadata: Option<(String, String)>,
    /// Inclusive lower bound on `timestamp`
    pub since: Option<Timestamp>,
    /// Inclusive upper bound on `timestamp`
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
}

impl SearchCriteria {
    pub fn matches(&self, identity: &Identity) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !identity.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(pk) = &self.public_key {
            if &identity.public_key != pk {
                return false;
            }
        }
        if let Some((key, value)) = &self.metadata {
            if identity.metadata_value(key) != Some(value.as_str()) {
                return false;
            }
        }
        if self.since.map_or(false, |since| identity.timestamp < since) {
            return false;
        }
        if self.until.map_or(false, |until| identity.timestamp > until) {
            return false;
        }
        true
    }
}

/// JSON export document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerExport {
    pub version: u64,
    pub last_sync: Timestamp,
    pub exported_at: Timestamp,
    pub identities: Vec<Identity>,
}

/// Outcome of [`Ledger::import_ledger`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub merged: usize,
    pub skipped: usize,
}

/// Outcome of [`Ledger::merge_identities_report`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: usize,
    /// Newest timestamp among the accepted identities
    pub max_timestamp: Option<Timestamp>,
}

/// Ledger statistics
#[derive(Debug, Clone)]
pub struct LedgerStats {
    pub identity_count: usize,
    pub version: u64,
    pub last_sync: Timestamp,
}

/// The node's durable identity ledger.
pub struct Ledger {
    config: LedgerConfig,
    store: Arc<dyn Persistence>,
    state: RwLock<LedgerState>,
    events: EventBus,
}

impl Ledger {
    /// Open the ledger, loading the persisted snapshot if there is one.
    pub fn open(
        store: Arc<dyn Persistence>,
        config: LedgerConfig,
        events: EventBus,
    ) -> Result<Self, LedgerError> {
        let state = match store.get(LEDGER_KEY)? {
            Some(bytes) => postcard::from_bytes::<LedgerState>(&bytes)?,
            None => LedgerState::default(),
        };
        info!(
            identities = state.identities.len(),
            version = state.version,
            last_sync = state.last_sync,
            "ledger loaded"
        );

        Ok(Self {
            config,
            store,
            state: RwLock::new(state),
            events,
        })
    }

    fn persist(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let bytes = postcard::to_allocvec(state)?;
        self.store.put(LEDGER_KEY, &bytes)?;
        Ok(())
    }

    /// Apply `mutate` to a copy of the state, persist it, then swap it in.
    fn commit<R>(
        &self,
        mutate: impl FnOnce(&mut LedgerState) -> Result<R, LedgerError>,
    ) -> Result<R, LedgerError> {
        let mut state = self.state.write();
        let mut next = state.clone();
        let out = mutate(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    /// Check `identity` against the state without touching it.
    fn admit(state: &LedgerState, identity: &Identity) -> Result<(), LedgerError> {
        verify_identity(identity)?;
        if let Some(existing) = state.identities.get(&identity.id) {
            if !identity.supersedes(existing) {
                return Err(idmesh_core::Error::Conflict {
                    id: identity.id.clone(),
                    existing: existing.timestamp,
                    incoming: identity.timestamp,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Add or replace an identity.
    pub fn try_add_identity(&self, identity: Identity) -> Result<(), LedgerError> {
        let (id, timestamp) = (identity.id.clone(), identity.timestamp);
        self.commit(|state| {
            Self::admit(state, &identity)?;
            state.identities.insert(identity.id.clone(), identity);
            state.version += 1;
            Ok(())
        })?;

        debug!(id = %id, timestamp, "identity stored");
        self.events
            .publish(LedgerEvent::IdentityAdded { id, timestamp }.into());
        Ok(())
    }

    /// Add or replace an identity; `false` if it is invalid or not strictly newer.
    pub fn add_identity(&self, identity: Identity) -> bool {
        let id = identity.id.clone();
        match self.try_add_identity(identity) {
            Ok(()) => true,
            Err(LedgerError::Identity(idmesh_core::Error::Conflict {
                existing, incoming, ..
            })) => {
                debug!(id = %id, existing, incoming, "identity not newer, ignored");
                false
            }
            Err(e) => {
                warn!(id = %id, error = %e, "identity rejected");
                false
            }
        }
    }

    pub fn try_remove_identity(&self, id: &str) -> Result<Identity, LedgerError> {
        let removed = self.commit(|state| {
            let removed = state
                .identities
                .remove(id)
                .ok_or_else(|| idmesh_core::Error::NotFound(id.to_string()))?;
            state.version += 1;
            Ok(removed)
        })?;
        self.events
            .publish(LedgerEvent::IdentityRemoved { id: id.to_string() }.into());
        Ok(removed)
    }

    /// Remove an identity; `false` if it was not present.
    pub fn remove_identity(&self, id: &str) -> bool {
        match self.try_remove_identity(id) {
            Ok(_) => true,
            Err(e) => {
                debug!(id, error = %e, "remove failed");
                false
            }
        }
    }

    pub fn get_identity(&self, id: &str) -> Option<Identity> {
        self.state.read().identities.get(id).cloned()
    }

    pub fn all_identities(&self) -> Vec<Identity> {
        self.state.read().identities.values().cloned().collect()
    }

    pub fn search_identities(&self, criteria: &SearchCriteria) -> Vec<Identity> {
        let state = self.state.read();
        let matches = state
            .identities
            .values()
            .filter(|identity| criteria.matches(identity))
            .cloned();
        match criteria.limit {
            Some(limit) => matches.take(limit).collect(),
            None => matches.collect(),
        }
    }

    /// Merge a batch, applying the add rule per element.
    ///
    /// Returns the number of identities that changed the ledger. The batch
    /// is persisted as one snapshot.
    pub fn merge_identities(&self, identities: Vec<Identity>) -> usize {
        self.merge_identities_report(identities).merged
    }

    /// Like [`Self::merge_identities`], also reporting the newest accepted
    /// timestamp. Rejected identities never contribute to it.
    pub fn merge_identities_report(&self, identities: Vec<Identity>) -> MergeReport {
        let result = self.commit(|state| {
            let mut accepted = Vec::new();
            for identity in identities {
                match Self::admit(state, &identity) {
                    Ok(()) => {
                        accepted.push((identity.id.clone(), identity.timestamp));
                        state.identities.insert(identity.id.clone(), identity);
                        state.version += 1;
                    }
                    Err(LedgerError::Identity(idmesh_core::Error::Conflict { .. })) => {}
                    Err(e) => warn!(id = %identity.id, error = %e, "merge skipped invalid identity"),
                }
            }
            Ok(accepted)
        });

        match result {
            Ok(accepted) => {
                let report = MergeReport {
                    merged: accepted.len(),
                    max_timestamp: accepted.iter().map(|(_, ts)| *ts).max(),
                };
                for (id, timestamp) in accepted {
                    self.events
                        .publish(LedgerEvent::IdentityAdded { id, timestamp }.into());
                }
                if report.merged > 0 {
                    debug!(merged = report.merged, "identities merged");
                }
                report
            }
            Err(e) => {
                warn!(error = %e, "merge failed to persist");
                MergeReport::default()
            }
        }
    }

    /// Remove entries older than the retention window.
    pub fn cleanup_old_identities(&self) -> usize {
        self.cleanup_old_identities_at(now_ms())
    }

    pub fn cleanup_old_identities_at(&self, now: Timestamp) -> usize {
        let retention = self.config.retention.as_millis() as u64;
        let cutoff = now.saturating_sub(retention);
        if !self
            .state
            .read()
            .identities
            .values()
            .any(|i| i.timestamp < cutoff)
        {
            return 0;
        }

        let result = self.commit(|state| {
            let before = state.identities.len();
            state.identities.retain(|_, identity| identity.timestamp >= cutoff);
            let removed = before - state.identities.len();
            state.version += 1;
            Ok(removed)
        });

        match result {
            Ok(removed) => {
                info!(removed, "retention sweep removed identities");
                self.events.publish(LedgerEvent::Cleaned { removed }.into());
                removed
            }
            Err(e) => {
                warn!(error = %e, "retention sweep failed to persist");
                0
            }
        }
    }

    /// Serialize the ledger as a JSON document.
    pub fn export_ledger(&self) -> Result<String, LedgerError> {
        let state = self.state.read();
        let export = LedgerExport {
            version: state.version,
            last_sync: state.last_sync,
            exported_at: now_ms(),
            identities: state.identities.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Import an exported ledger.
    ///
    /// Every identity is verified and merged by the timestamp rule; the
    /// sync watermark is raised to the imported one if that is newer.
    pub fn import_ledger(&self, data: &str) -> Result<ImportSummary, LedgerError> {
        let export: LedgerExport = serde_json::from_str(data)?;
        let total = export.identities.len();
        let merged = self.merge_identities(export.identities);

        if export.last_sync > self.last_sync() {
            self.set_last_sync(export.last_sync)?;
        }

        info!(merged, total, "ledger imported");
        self.events.publish(LedgerEvent::Imported { merged }.into());
        Ok(ImportSummary {
            merged,
            skipped: total - merged,
        })
    }

    /// Watermark of the last completed sync
    pub fn last_sync(&self) -> Timestamp {
        self.state.read().last_sync
    }

    pub fn set_last_sync(&self, timestamp: Timestamp) -> Result<(), LedgerError> {
        self.commit(|state| {
            state.last_sync = timestamp;
            Ok(())
        })
    }

    /// Identities with `timestamp > since`, oldest first.
    pub fn identities_since(&self, since: Timestamp) -> Vec<Identity> {
        let mut out: Vec<Identity> = self
            .state
            .read()
            .identities
            .values()
            .filter(|i| i.timestamp > since)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        out
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn len(&self) -> usize {
        self.state.read().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LedgerStats {
        let state = self.state.read();
        LedgerStats {
            identity_count: state.identities.len(),
            version: state.version,
            last_sync: state.last_sync,
        }
    }
}
