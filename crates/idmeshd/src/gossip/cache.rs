//! Dedup cache of recently seen gossip messages

use idmesh_core::types::*;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Default cache high-water mark
pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub message: GossipMessage,
    /// Local receive time
    pub received_at: Timestamp,
    /// How many times this node has forwarded the message
    pub propagations: u32,
}

/// Bounded message cache.
///
/// Entries leave either by TTL ([`MessageCache::evict_expired`]) or, once
/// the cache is full, oldest-first on insert.
pub struct MessageCache {
    entries: LruCache<MessageId, CachedMessage>,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&CachedMessage> {
        self.entries.peek(id)
    }

    /// Insert a message; `false` if it was already cached.
    pub fn insert(&mut self, id: MessageId, message: GossipMessage, now: Timestamp) -> bool {
        if self.entries.contains(&id) {
            return false;
        }
        self.entries.push(
            id,
            CachedMessage {
                message,
                received_at: now,
                propagations: 0,
            },
        );
        true
    }

    /// Record one more propagation, returning the new count.
    pub fn bump_propagation(&mut self, id: &MessageId) -> Option<u32> {
        let entry = self.entries.peek_mut(id)?;
        entry.propagations += 1;
        Some(entry.propagations)
    }

    /// Most recently received epidemic messages still below `max_propagations`.
    pub fn regossip_candidates(
        &self,
        limit: usize,
        max_propagations: u32,
    ) -> Vec<(MessageId, GossipMessage)> {
        // LRU iteration runs most recent first
        self.entries
            .iter()
            .filter(|(_, e)| e.message.kind.is_epidemic() && e.propagations < max_propagations)
            .take(limit)
            .map(|(id, e)| (*id, e.message.clone()))
            .collect()
    }

    /// Ids of cached epidemic messages, most recent first.
    pub fn inventory(&self, limit: usize) -> Vec<MessageId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.message.kind.is_epidemic())
            .take(limit)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop entries received more than `ttl_ms` ago.
    pub fn evict_expired(&mut self, now: Timestamp, ttl_ms: u64) -> usize {
        let expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.received_at) > ttl_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.entries.pop(id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
