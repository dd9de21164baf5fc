//! Packet pool
//!
//! Frames that arrive while nobody is waiting for them are kept here until a
//! later wait claims them, a newer request supersedes them or the connection
//! closes. Each kind holds at most `limit` packets; the oldest is evicted.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use uuid::Uuid;

/// Packets kept per kind unless configured otherwise
pub const DEFAULT_POOL_LIMIT: usize = 32;

/// A pooled packet with its arrival id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry<P> {
    /// Identifies the entry for [`PacketPool::mark_consumed`]
    pub id: Uuid,
    /// The pooled packet
    pub packet: P,
    arrival: u64,
}

impl<P> PoolEntry<P> {
    pub(crate) fn new(id: Uuid, packet: P) -> Self {
        Self {
            id,
            packet,
            arrival: 0,
        }
    }
}

/// Unclaimed packets grouped by kind, each kind in arrival order
#[derive(Debug)]
pub struct PacketPool<K, P> {
    entries: HashMap<K, VecDeque<PoolEntry<P>>>,
    next_arrival: u64,
    limit: usize,
}

impl<K, P> PacketPool<K, P>
where
    K: Copy + Eq + Hash,
    P: Clone,
{
    /// Empty pool holding [`DEFAULT_POOL_LIMIT`] packets per kind
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_POOL_LIMIT)
    }

    /// Empty pool holding at most `limit` packets per kind
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_arrival: 0,
            limit: limit.max(1),
        }
    }

    /// Add a packet under `kind`. Returns the entry evicted to make room.
    pub fn push(&mut self, kind: K, id: Uuid, packet: P) -> Option<PoolEntry<P>> {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        let queue = self.entries.entry(kind).or_default();
        queue.push_back(PoolEntry { id, packet, arrival });
        if queue.len() > self.limit {
            queue.pop_front()
        } else {
            None
        }
    }

    /// Copies of every pooled packet of the given kinds, oldest first
    pub fn get(&self, kinds: &[K]) -> Vec<PoolEntry<P>> {
        let mut found: Vec<PoolEntry<P>> = kinds
            .iter()
            .filter_map(|kind| self.entries.get(kind))
            .flat_map(|queue| queue.iter().cloned())
            .collect();
        found.sort_by_key(|entry| entry.arrival);
        found
    }

    /// Remove the packet with `id`. Returns whether it was pooled.
    pub fn mark_consumed(&mut self, id: Uuid) -> bool {
        for queue in self.entries.values_mut() {
            if let Some(pos) = queue.iter().position(|entry| entry.id == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove and return the oldest packet of the given kinds accepted by `accept`
    pub fn claim_first<F>(&mut self, kinds: &[K], mut accept: F) -> Option<PoolEntry<P>>
    where
        F: FnMut(&P) -> bool,
    {
        let mut best: Option<(K, usize, u64)> = None;

        for kind in kinds {
            let Some(queue) = self.entries.get(kind) else {
                continue;
            };
            if let Some((pos, entry)) = queue
                .iter()
                .enumerate()
                .find(|(_, entry)| accept(&entry.packet))
            {
                if best.map_or(true, |(_, _, arrival)| entry.arrival < arrival) {
                    best = Some((*kind, pos, entry.arrival));
                }
            }
        }

        let (kind, pos, _) = best?;
        self.entries.get_mut(&kind)?.remove(pos)
    }

    /// Drop every packet of the given kinds accepted by `accept`.
    /// Returns how many were dropped.
    pub fn discard<F>(&mut self, kinds: &[K], mut accept: F) -> usize
    where
        F: FnMut(&P) -> bool,
    {
        let mut dropped = 0;
        for kind in kinds {
            if let Some(queue) = self.entries.get_mut(kind) {
                let before = queue.len();
                queue.retain(|entry| !accept(&entry.packet));
                dropped += before - queue.len();
            }
        }
        dropped
    }

    /// Number of pooled packets
    pub fn len(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    /// Whether nothing is pooled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pooled packet
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K, P> Default for PacketPool<K, P>
where
    K: Copy + Eq + Hash,
    P: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PacketPool<u8, &'static str> {
        let mut pool = PacketPool::new();
        pool.push(1, Uuid::new_v4(), "a");
        pool.push(2, Uuid::new_v4(), "b");
        pool.push(1, Uuid::new_v4(), "c");
        pool
    }

    #[test]
    fn test_get_keeps_arrival_order() {
        let pool = pool();
        let packets: Vec<_> = pool.get(&[2, 1]).into_iter().map(|e| e.packet).collect();
        assert_eq!(packets, vec!["a", "b", "c"]);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_mark_consumed() {
        let mut pool = pool();
        let id = pool.get(&[2])[0].id;
        assert!(pool.mark_consumed(id));
        assert!(!pool.mark_consumed(id));
        assert!(pool.get(&[2]).is_empty());
    }

    #[test]
    fn test_claim_first_takes_oldest_match() {
        let mut pool = pool();
        let claimed = pool.claim_first(&[1, 2], |p| *p != "a").unwrap();
        assert_eq!(claimed.packet, "b");
        assert_eq!(pool.len(), 2);

        assert!(pool.claim_first(&[3], |_| true).is_none());
    }

    #[test]
    fn test_discard_only_matching() {
        let mut pool = pool();
        assert_eq!(pool.discard(&[1], |p| *p == "c"), 1);
        assert_eq!(pool.discard(&[1], |p| *p == "c"), 0);
        let left: Vec<_> = pool.get(&[1, 2]).into_iter().map(|e| e.packet).collect();
        assert_eq!(left, vec!["a", "b"]);
    }

    #[test]
    fn test_limit_evicts_oldest_of_kind() {
        let mut pool = PacketPool::with_limit(2);
        assert!(pool.push(1u8, Uuid::new_v4(), "a").is_none());
        assert!(pool.push(2u8, Uuid::new_v4(), "x").is_none());
        assert!(pool.push(1u8, Uuid::new_v4(), "b").is_none());

        let evicted = pool.push(1u8, Uuid::new_v4(), "c").unwrap();
        assert_eq!(evicted.packet, "a");
        let packets: Vec<_> = pool.get(&[1, 2]).into_iter().map(|e| e.packet).collect();
        assert_eq!(packets, vec!["x", "b", "c"]);
    }

    #[test]
    fn test_clear() {
        let mut pool = pool();
        pool.clear();
        assert!(pool.is_empty());
    }
}
