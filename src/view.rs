//! Sharded routable-view set (spec §4.2, C3): O(1) add/remove/contains and
//! uniform random pick across a 64-shard concurrent set keyed by `H[0] mod 64`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::Rng;

use crate::hash::NodeHash;

const SHARD_COUNT: usize = 64;

fn shard_index(hash: &NodeHash) -> usize {
    (hash.as_bytes()[0] as usize) % SHARD_COUNT
}

struct Shard {
    hashes: Vec<NodeHash>,
    positions: HashMap<NodeHash, usize>,
}

impl Shard {
    fn new() -> Self {
        Shard {
            hashes: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn insert(&mut self, hash: NodeHash) -> bool {
        if self.positions.contains_key(&hash) {
            return false;
        }
        self.positions.insert(hash, self.hashes.len());
        self.hashes.push(hash);
        true
    }

    /// Swap-last removal: O(1), doesn't preserve order.
    fn remove(&mut self, hash: &NodeHash) -> bool {
        let Some(&pos) = self.positions.get(hash) else {
            return false;
        };
        let last = self.hashes.len() - 1;
        self.hashes.swap(pos, last);
        self.hashes.pop();
        self.positions.remove(hash);
        if pos < self.hashes.len() {
            self.positions.insert(self.hashes[pos], pos);
        }
        true
    }
}

/// A 64-shard concurrent set of node hashes a platform may currently route to.
pub struct RoutableView {
    shards: Vec<RwLock<Shard>>,
    size: AtomicUsize,
}

impl Default for RoutableView {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutableView {
    pub fn new() -> Self {
        RoutableView {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(Shard::new())).collect(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn contains(&self, hash: &NodeHash) -> bool {
        self.shards[shard_index(hash)].read().positions.contains_key(hash)
    }

    /// Returns `true` if this added a new entry (idempotent on repeats).
    pub fn insert(&self, hash: NodeHash) -> bool {
        let inserted = self.shards[shard_index(&hash)].write().insert(hash);
        if inserted {
            self.size.fetch_add(1, Ordering::AcqRel);
        }
        inserted
    }

    /// Returns `true` if this removed an existing entry.
    pub fn remove(&self, hash: &NodeHash) -> bool {
        let removed = self.shards[shard_index(hash)].write().remove(hash);
        if removed {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Uniform random pick across all shards. `None` when the view is empty.
    pub fn random_pick(&self) -> Option<NodeHash> {
        let size = self.size();
        if size == 0 {
            return None;
        }
        let mut target = rand::thread_rng().gen_range(0..size);
        for shard in &self.shards {
            let guard = shard.read();
            let len = guard.hashes.len();
            if target < len {
                return Some(guard.hashes[target]);
            }
            target -= len;
        }
        None
    }

    pub fn range<F: FnMut(&NodeHash)>(&self, mut f: F) {
        for shard in &self.shards {
            for hash in &shard.read().hashes {
                f(hash);
            }
        }
    }

    /// Snapshot of every member, for callers that need to iterate without
    /// holding shard locks across other work.
    pub fn snapshot(&self) -> Vec<NodeHash> {
        let mut out = Vec::with_capacity(self.size());
        self.range(|h| out.push(*h));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_with_first_byte(b: u8) -> NodeHash {
        let mut bytes = [0u8; 16];
        bytes[0] = b;
        NodeHash::from_bytes(bytes)
    }

    #[test]
    fn size_matches_shard_lengths_and_membership() {
        let view = RoutableView::new();
        let hashes: Vec<_> = (0..200u16).map(|i| hash_with_first_byte((i % 256) as u8)).collect();
        for h in &hashes {
            view.insert(*h);
        }
        let expected: std::collections::HashSet<_> = hashes.iter().collect();
        let deduped = expected.len();
        assert_eq!(view.size(), deduped);
        let mut seen = std::collections::HashSet::new();
        view.range(|h| {
            assert!(view.contains(h));
            seen.insert(*h);
        });
        assert_eq!(seen.len(), deduped);
    }

    #[test]
    fn insert_is_idempotent() {
        let view = RoutableView::new();
        let h = hash_with_first_byte(5);
        assert!(view.insert(h));
        assert!(!view.insert(h));
        assert_eq!(view.size(), 1);
    }

    #[test]
    fn remove_on_absent_is_noop() {
        let view = RoutableView::new();
        assert!(!view.remove(&hash_with_first_byte(1)));
    }

    #[test]
    fn remove_then_reinsert_works() {
        let view = RoutableView::new();
        let h = hash_with_first_byte(9);
        view.insert(h);
        assert!(view.remove(&h));
        assert!(!view.contains(&h));
        assert!(view.insert(h));
        assert!(view.contains(&h));
    }

    #[test]
    fn random_pick_empty_is_none() {
        let view = RoutableView::new();
        assert!(view.random_pick().is_none());
    }

    #[test]
    fn random_pick_singleton_always_that_hash() {
        let view = RoutableView::new();
        let h = hash_with_first_byte(42);
        view.insert(h);
        for _ in 0..50 {
            assert_eq!(view.random_pick(), Some(h));
        }
    }

    #[test]
    fn random_pick_visits_many_distinct_hashes() {
        let view = RoutableView::new();
        let hashes: Vec<_> = (0..100u32)
            .map(|i| {
                let mut bytes = [0u8; 16];
                bytes[0] = (i % 256) as u8;
                bytes[1] = (i / 256) as u8;
                NodeHash::from_bytes(bytes)
            })
            .collect();
        for h in &hashes {
            view.insert(*h);
        }
        assert_eq!(view.size(), 100);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            if let Some(h) = view.random_pick() {
                seen.insert(h);
            }
        }
        assert!(seen.len() >= 50, "only saw {} distinct hashes", seen.len());
    }
}
