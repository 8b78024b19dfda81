//! Local DHT key/value storage
//!
//! Bounded by a high-water mark with oldest-first eviction. Reads use
//! `peek` so the LRU order stays insertion order. Expiry is lazy: reads
//! skip expired records and the maintenance sweep removes them.

use idmesh_core::types::*;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Default high-water mark for locally stored records
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// A stored record plus the replica set it was last handed to.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub record: DhtRecord,
    /// Responsible node ids at the time the record was (re)replicated
    pub replica_set: Vec<NodeId>,
}

pub struct LocalStore {
    entries: LruCache<String, StoredEntry>,
}

impl LocalStore {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
        }
    }

    /// Insert or replace a record, returning the key evicted to make room.
    pub fn insert(&mut self, record: DhtRecord, replica_set: Vec<NodeId>) -> Option<String> {
        let key = record.key.clone();
        match self.entries.push(key.clone(), StoredEntry { record, replica_set }) {
            Some((evicted, _)) if evicted != key => Some(evicted),
            _ => None,
        }
    }

    /// Non-expired record for `key`
    pub fn get(&self, key: &str, now: Timestamp) -> Option<&DhtRecord> {
        self.entries
            .peek(key)
            .map(|entry| &entry.record)
            .filter(|record| !record.is_expired(now))
    }

    pub fn set_replica_set(&mut self, key: &str, replica_set: Vec<NodeId>) {
        if let Some(entry) = self.entries.peek_mut(key) {
            entry.replica_set = replica_set;
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<DhtRecord> {
        self.entries.pop(key).map(|entry| entry.record)
    }

    /// Drop every expired record, returning how many were removed.
    pub fn purge_expired(&mut self, now: Timestamp) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    /// Non-expired records whose key matches `pattern`.
    ///
    /// A pattern containing `*` is a glob where `*` matches any run of
    /// characters; otherwise it is a substring match.
    pub fn find(&self, pattern: &str, now: Timestamp) -> Vec<DhtRecord> {
        let mut out: Vec<DhtRecord> = self
            .entries
            .iter()
            .filter(|(key, entry)| !entry.record.is_expired(now) && key_matches(pattern, key))
            .map(|(_, entry)| entry.record.clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Snapshot of all entries, expired ones included.
    pub fn entries(&self) -> Vec<StoredEntry> {
        self.entries.iter().map(|(_, entry)| entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn key_matches(pattern: &str, key: &str) -> bool {
    if pattern.contains('*') {
        glob_match(pattern, key)
    } else {
        key.contains(pattern)
    }
}

/// `*`-only glob. Literal segments must appear in order; the first and last
/// segments are anchored unless the pattern starts/ends with `*`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    let last = segments.len() - 1;
    let mut rest = text;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == last {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with `*` (or was all wildcards)
    pattern.ends_with('*') || rest.is_empty()
}
