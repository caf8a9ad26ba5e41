// # ARC (Adaptive Replacement Cache) Eviction Policy
//
// Balances recency and frequency with four key lists:
//
// - **T1**: resident keys seen once (recency)
// - **T2**: resident keys seen multiple times (frequency)
// - **B1**: ghost keys recently evicted from T1 (keys only, no values)
// - **B2**: ghost keys recently evicted from T2
//
// The adaptive target `p` sizes T1: a hit in B1 means recency was evicted
// too eagerly and grows `p`; a hit in B2 shrinks it. Victims leave a ghost
// behind in the matching B list.
//
// Reference: Megiddo & Modha, "ARC: A Self-Tuning, Low Overhead
// Replacement Cache", USENIX FAST 2003.

use crate::cache::eviction::{EvictionPolicy, PinCheck};
use crate::cache::CacheKey;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    T1,
    T2,
    B1,
    B2,
}

pub struct ArcPolicy {
    capacity: usize,
    /// Adaptive target size for T1.
    p: usize,
    t1: VecDeque<CacheKey>,
    t2: VecDeque<CacheKey>,
    b1: VecDeque<CacheKey>,
    b2: VecDeque<CacheKey>,
    directory: HashMap<CacheKey, ListKind>,
    adaptations: u64,
}

impl ArcPolicy {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            p: capacity / 2,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            directory: HashMap::new(),
            adaptations: 0,
        }
    }

    pub fn target_t1(&self) -> usize {
        self.p
    }

    pub fn adaptations(&self) -> u64 {
        self.adaptations
    }

    fn detach(&mut self, key: &CacheKey) -> Option<ListKind> {
        let kind = self.directory.remove(key)?;
        match kind {
            ListKind::T1 => self.t1.retain(|k| k != key),
            ListKind::T2 => self.t2.retain(|k| k != key),
            ListKind::B1 => self.b1.retain(|k| k != key),
            ListKind::B2 => self.b2.retain(|k| k != key),
        }
        Some(kind)
    }

    fn push(&mut self, key: CacheKey, kind: ListKind) {
        match kind {
            ListKind::T1 => self.t1.push_back(key.clone()),
            ListKind::T2 => self.t2.push_back(key.clone()),
            ListKind::B1 => self.b1.push_back(key.clone()),
            ListKind::B2 => self.b2.push_back(key.clone()),
        }
        self.directory.insert(key, kind);
    }

    /// Keep a ghost list within capacity by forgetting its oldest keys.
    fn bound_ghosts(&mut self, kind: ListKind) {
        let (list, cap) = match kind {
            ListKind::B1 => (&mut self.b1, self.capacity),
            ListKind::B2 => (&mut self.b2, self.capacity),
            _ => return,
        };
        while list.len() > cap {
            if let Some(old) = list.pop_front() {
                self.directory.remove(&old);
            }
        }
    }

    fn adapt_on_b1_hit(&mut self) {
        let delta = if self.b1.is_empty() {
            1
        } else {
            (self.b2.len() / self.b1.len()).max(1)
        };
        self.p = (self.p + delta).min(self.capacity);
        self.adaptations += 1;
    }

    fn adapt_on_b2_hit(&mut self) {
        let delta = if self.b2.is_empty() {
            1
        } else {
            (self.b1.len() / self.b2.len()).max(1)
        };
        self.p = self.p.saturating_sub(delta);
        self.adaptations += 1;
    }

    /// Pop the first unpinned key off a resident list, keeping pinned keys
    /// in their original order.
    fn pop_unpinned(list: &mut VecDeque<CacheKey>, is_pinned: PinCheck<'_>) -> Option<CacheKey> {
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(key) = list.pop_front() {
            if is_pinned(&key) {
                skipped.push(key);
                continue;
            }
            found = Some(key);
            break;
        }
        for key in skipped.into_iter().rev() {
            list.push_front(key);
        }
        found
    }
}

impl EvictionPolicy for ArcPolicy {
    fn name(&self) -> &'static str {
        "ARC"
    }

    fn on_insert(&mut self, key: &CacheKey) {
        match self.directory.get(key).copied() {
            // Ghost hits steer the adaptive target before the key re-enters
            // the cache as a frequent key.
            Some(ListKind::B1) => {
                self.adapt_on_b1_hit();
                self.detach(key);
                self.push(key.clone(), ListKind::T2);
            }
            Some(ListKind::B2) => {
                self.adapt_on_b2_hit();
                self.detach(key);
                self.push(key.clone(), ListKind::T2);
            }
            Some(ListKind::T1) | Some(ListKind::T2) => self.on_access(key),
            None => self.push(key.clone(), ListKind::T1),
        }
    }

    fn on_access(&mut self, key: &CacheKey) {
        match self.directory.get(key).copied() {
            Some(ListKind::T1) | Some(ListKind::T2) => {
                self.detach(key);
                self.push(key.clone(), ListKind::T2);
            }
            _ => {}
        }
    }

    fn on_remove(&mut self, key: &CacheKey) {
        self.detach(key);
    }

    fn pick_victim(&mut self, is_pinned: PinCheck<'_>) -> Option<CacheKey> {
        let prefer_t1 = !self.t1.is_empty() && (self.t1.len() > self.p || self.t2.is_empty());

        let from_t1 = if prefer_t1 {
            Self::pop_unpinned(&mut self.t1, is_pinned).map(|k| (k, true))
        } else {
            None
        };
        let victim = from_t1.or_else(|| {
            Self::pop_unpinned(&mut self.t2, is_pinned)
                .map(|k| (k, false))
                .or_else(|| Self::pop_unpinned(&mut self.t1, is_pinned).map(|k| (k, true)))
        });

        let (key, from_recent) = victim?;
        self.directory.remove(&key);
        let ghost = if from_recent { ListKind::B1 } else { ListKind::B2 };
        self.push(key.clone(), ghost);
        self.bound_ghosts(ghost);
        Some(key)
    }

    fn reset(&mut self) {
        self.t1.clear();
        self.t2.clear();
        self.b1.clear();
        self.b2.clear();
        self.directory.clear();
        self.p = self.capacity / 2;
        self.adaptations = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> CacheKey {
        CacheKey::Row("t".into(), n)
    }

    fn no_pins(_: &CacheKey) -> bool {
        false
    }

    #[test]
    fn test_first_touch_lands_in_t1() {
        let mut policy = ArcPolicy::new(4);
        policy.on_insert(&key(1));
        assert_eq!(policy.t1.len(), 1);
        assert_eq!(policy.t2.len(), 0);
    }

    #[test]
    fn test_second_access_promotes_to_t2() {
        let mut policy = ArcPolicy::new(4);
        policy.on_insert(&key(1));
        policy.on_access(&key(1));
        assert_eq!(policy.t1.len(), 0);
        assert_eq!(policy.t2.len(), 1);
    }

    #[test]
    fn test_eviction_leaves_ghost() {
        let mut policy = ArcPolicy::new(4);
        policy.on_insert(&key(1));
        let victim = policy.pick_victim(&no_pins).unwrap();
        assert_eq!(victim, key(1));
        assert_eq!(policy.b1.len(), 1);
        // Ghosts are not resident; nothing left to evict.
        assert_eq!(policy.pick_victim(&no_pins), None);
    }

    #[test]
    fn test_ghost_hit_grows_target() {
        let mut policy = ArcPolicy::new(4);
        policy.on_insert(&key(1));
        policy.pick_victim(&no_pins).unwrap(); // key 1 -> B1 ghost
        let p_before = policy.target_t1();

        // Re-inserting the ghost is a B1 hit: adapt and enter T2.
        policy.on_insert(&key(1));
        assert!(policy.target_t1() > p_before);
        assert_eq!(policy.t2.len(), 1);
        assert_eq!(policy.adaptations(), 1);
    }

    #[test]
    fn test_frequent_ghost_hit_shrinks_target() {
        let mut policy = ArcPolicy::new(4);
        policy.on_insert(&key(1));
        policy.on_access(&key(1)); // T2
        policy.pick_victim(&no_pins).unwrap(); // key 1 -> B2 ghost
        let p_before = policy.target_t1();
        policy.on_insert(&key(1));
        assert!(policy.target_t1() < p_before || p_before == 0);
    }

    #[test]
    fn test_pinned_keys_never_picked() {
        let mut policy = ArcPolicy::new(4);
        policy.on_insert(&key(1));
        policy.on_insert(&key(2));
        let pinned = |k: &CacheKey| *k == key(1);
        assert_eq!(policy.pick_victim(&pinned), Some(key(2)));
        assert_eq!(policy.pick_victim(&pinned), None);
    }

    #[test]
    fn test_ghost_lists_are_bounded() {
        let mut policy = ArcPolicy::new(2);
        for i in 0..10 {
            policy.on_insert(&key(i));
            policy.pick_victim(&no_pins);
        }
        assert!(policy.b1.len() <= 2);
    }
}
