//! Kademlia routing table
//!
//! One bucket per distance bit. Within a bucket the front is the
//! least-recently-seen contact and the back the most recent.

use idmesh_core::types::*;
use std::collections::VecDeque;

/// Default bucket capacity (Kademlia k)
pub const DEFAULT_BUCKET_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub contact: DhtContact,
    /// Consecutive failed sends or queries
    pub failures: u32,
}

/// Result of touching a bucket with a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchOutcome {
    Inserted,
    Refreshed,
    /// Bucket is full; the caller should ping `oldest` and then call
    /// [`RoutingTable::apply_ping_result`].
    Full {
        oldest: DhtContact,
        newcomer: DhtContact,
    },
    /// The contact is the local node
    Ignored,
}

#[derive(Debug, Default)]
struct KBucket {
    entries: VecDeque<RoutingEntry>,
}

impl KBucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| &e.contact.id == id)
    }

    fn touch(&mut self, contact: DhtContact, k: usize) -> TouchOutcome {
        if let Some(pos) = self.position(&contact.id) {
            if let Some(mut existing) = self.entries.remove(pos) {
                existing.contact = contact;
                existing.failures = 0;
                self.entries.push_back(existing);
            }
            return TouchOutcome::Refreshed;
        }

        if self.entries.len() < k {
            self.entries.push_back(RoutingEntry {
                contact,
                failures: 0,
            });
            return TouchOutcome::Inserted;
        }

        match self.entries.front() {
            Some(oldest) => TouchOutcome::Full {
                oldest: oldest.contact.clone(),
                newcomer: contact,
            },
            // k == 0
            None => TouchOutcome::Ignored,
        }
    }

    /// Move an existing contact to the most-recently-seen end.
    fn refresh(&mut self, id: &NodeId, now: Timestamp) -> bool {
        match self.position(id).and_then(|pos| self.entries.remove(pos)) {
            Some(mut entry) => {
                entry.contact.last_seen = now;
                entry.failures = 0;
                self.entries.push_back(entry);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<RoutingEntry> {
        self.position(id).and_then(|pos| self.entries.remove(pos))
    }
}

pub struct RoutingTable {
    local: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(NODE_ID_BITS);
        buckets.resize_with(NODE_ID_BITS, KBucket::default);
        Self { local, k, buckets }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Bucket index for `id`: bit length of the XOR distance minus one.
    /// `None` for the local id.
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        let bits = self.local.distance(id).bit_length();
        bits.checked_sub(1)
    }

    pub fn touch(&mut self, contact: DhtContact) -> TouchOutcome {
        match self.bucket_index(&contact.id) {
            Some(idx) => self.buckets[idx].touch(contact, self.k),
            None => TouchOutcome::Ignored,
        }
    }

    /// Resolve a [`TouchOutcome::Full`]: keep the oldest if it answered,
    /// otherwise evict it in favour of the newcomer. Returns the evicted id.
    pub fn apply_ping_result(
        &mut self,
        oldest: &NodeId,
        newcomer: DhtContact,
        oldest_alive: bool,
        now: Timestamp,
    ) -> Option<NodeId> {
        let idx = self.bucket_index(oldest)?;
        let bucket = &mut self.buckets[idx];
        if oldest_alive {
            bucket.refresh(oldest, now);
            return None;
        }

        let evicted = bucket.remove(oldest).map(|e| e.contact.id);
        if bucket.position(&newcomer.id).is_none() && bucket.entries.len() < self.k {
            bucket.entries.push_back(RoutingEntry {
                contact: newcomer,
                failures: 0,
            });
        }
        evicted
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<DhtContact> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx].remove(id).map(|e| e.contact)
    }

    pub fn get(&self, id: &NodeId) -> Option<&RoutingEntry> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx].entries.iter().find(|e| &e.contact.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Bump the failure counter, returning the new count.
    pub fn record_failure(&mut self, id: &NodeId) -> Option<u32> {
        let idx = self.bucket_index(id)?;
        let entry = self.buckets[idx]
            .entries
            .iter_mut()
            .find(|e| &e.contact.id == id)?;
        entry.failures += 1;
        Some(entry.failures)
    }

    /// Up to `count` contacts ordered by XOR distance to `target`.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<DhtContact> {
        let mut all: Vec<&DhtContact> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| &e.contact))
            .collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.into_iter().take(count).cloned().collect()
    }

    /// Contacts not seen since `cutoff`.
    pub fn inactive_since(&self, cutoff: Timestamp) -> Vec<NodeId> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .filter(|e| e.contact.last_seen < cutoff)
            .map(|e| e.contact.id)
            .collect()
    }

    pub fn contacts(&self) -> Vec<DhtContact> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.contact.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of non-empty buckets
    pub fn buckets_in_use(&self) -> usize {
        self.buckets.iter().filter(|b| !b.entries.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact_at(local: &NodeId, bucket_bit: usize, salt: u8) -> DhtContact {
        // Flip the bit that puts the id into bucket `bucket_bit`, then vary low bits
        let mut bytes = local.0;
        let byte_idx = NODE_ID_LEN - 1 - bucket_bit / 8;
        bytes[byte_idx] ^= 1 << (bucket_bit % 8);
        if bucket_bit >= 16 {
            bytes[NODE_ID_LEN - 1] ^= salt;
        }
        DhtContact {
            id: NodeId(bytes),
            peer: PeerId([salt; 32]),
            address: format!("mem://{}", salt),
            last_seen: salt as u64,
        }
    }

    #[test]
    fn test_bucket_index() {
        let local = NodeId([0; NODE_ID_LEN]);
        let table = RoutingTable::new(local, 4);
        assert_eq!(table.bucket_index(&local), None);

        let mut far = [0u8; NODE_ID_LEN];
        far[0] = 0x80;
        assert_eq!(table.bucket_index(&NodeId(far)), Some(159));

        let mut near = [0u8; NODE_ID_LEN];
        near[19] = 0x01;
        assert_eq!(table.bucket_index(&NodeId(near)), Some(0));
    }

    #[test]
    fn test_touch_insert_refresh_full() {
        let local = NodeId([0x55; NODE_ID_LEN]);
        let mut table = RoutingTable::new(local, 2);

        let a = contact_at(&local, 100, 1);
        let b = contact_at(&local, 100, 2);
        let c = contact_at(&local, 100, 3);

        assert_eq!(table.touch(a.clone()), TouchOutcome::Inserted);
        assert_eq!(table.touch(b.clone()), TouchOutcome::Inserted);
        assert_eq!(table.touch(a.clone()), TouchOutcome::Refreshed);

        // a was refreshed, so b is now the least recently seen
        match table.touch(c.clone()) {
            TouchOutcome::Full { oldest, newcomer } => {
                assert_eq!(oldest.id, b.id);
                assert_eq!(newcomer.id, c.id);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_ping_result_keeps_live_oldest() {
        let local = NodeId([0x55; NODE_ID_LEN]);
        let mut table = RoutingTable::new(local, 1);
        let old = contact_at(&local, 50, 1);
        let new = contact_at(&local, 50, 2);

        table.touch(old.clone());
        assert!(matches!(table.touch(new.clone()), TouchOutcome::Full { .. }));

        assert_eq!(table.apply_ping_result(&old.id, new.clone(), true, 99), None);
        assert!(table.contains(&old.id));
        assert!(!table.contains(&new.id));
        assert_eq!(table.get(&old.id).unwrap().contact.last_seen, 99);

        assert_eq!(table.apply_ping_result(&old.id, new.clone(), false, 100), Some(old.id));
        assert!(!table.contains(&old.id));
        assert!(table.contains(&new.id));
    }

    #[test]
    fn test_closest_ordering() {
        let local = NodeId([0; NODE_ID_LEN]);
        let mut table = RoutingTable::new(local, 20);
        for bit in [3usize, 40, 90, 150] {
            table.touch(contact_at(&local, bit, bit as u8));
        }

        let target = local;
        let closest = table.closest(&target, 2);
        assert_eq!(closest.len(), 2);
        assert!(closest[0].id.distance(&target) < closest[1].id.distance(&target));
        assert_eq!(table.bucket_index(&closest[0].id), Some(3));
    }

    #[test]
    fn test_failures_and_inactivity() {
        let local = NodeId([0; NODE_ID_LEN]);
        let mut table = RoutingTable::new(local, 20);
        let a = contact_at(&local, 10, 5);
        table.touch(a.clone());

        assert_eq!(table.record_failure(&a.id), Some(1));
        assert_eq!(table.record_failure(&a.id), Some(2));
        table.touch(a.clone());
        assert_eq!(table.get(&a.id).unwrap().failures, 0);

        assert_eq!(table.inactive_since(6), vec![a.id]);
        assert!(table.inactive_since(5).is_empty());
        assert_eq!(table.remove(&a.id).map(|c| c.id), Some(a.id));
        assert!(table.is_empty());
    }
}
