// # AURA Eviction Policy
//
// Scores every key with two smoothed signals:
//
// - **stability**: EMA of hit frequency (how reliably the key is re-used)
// - **value**: EMA of access benefit, where tight re-access gaps earn more
//
// The composite score is `alpha * stability + (1 - alpha) * value`; the
// victim is the unpinned key with the lowest composite. `alpha` steers the
// exploitation/exploration balance and comes from the level configuration.
//
// Victim selection uses a lazily-invalidated min-heap keyed by the score's
// bit pattern (composites are non-negative, so the IEEE-754 bits order the
// same way the floats do), giving amortized O(log n) selection without
// scanning the full key set.

use crate::cache::eviction::{EvictionPolicy, PinCheck};
use crate::cache::CacheKey;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

const EMA_WEIGHT: f64 = 0.125;

#[derive(Debug, Clone)]
struct AuraScore {
    stability: f64,
    value: f64,
    last_access: u64,
    /// Stamp of the newest heap record for this key.
    stamp: u64,
}

pub struct AuraPolicy {
    alpha: f64,
    clock: u64,
    scores: HashMap<CacheKey, AuraScore>,
    /// Min-heap of (composite score bits, stamp, key); records whose stamp
    /// no longer matches the score table are stale and skipped.
    heap: BinaryHeap<Reverse<(u64, u64, CacheKey)>>,
}

impl AuraPolicy {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            clock: 0,
            scores: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    fn composite(&self, score: &AuraScore) -> f64 {
        self.alpha * score.stability + (1.0 - self.alpha) * score.value
    }

    fn push_record(&mut self, key: &CacheKey) {
        let Some(score) = self.scores.get(key) else {
            return;
        };
        let bits = self.composite(score).to_bits();
        let stamp = score.stamp;
        self.heap.push(Reverse((bits, stamp, key.clone())));
        if self.heap.len() > 2 * self.scores.len() + 16 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let mut fresh = BinaryHeap::with_capacity(self.scores.len());
        for (key, score) in &self.scores {
            fresh.push(Reverse((
                self.composite(score).to_bits(),
                score.stamp,
                key.clone(),
            )));
        }
        self.heap = fresh;
    }
}

impl EvictionPolicy for AuraPolicy {
    fn name(&self) -> &'static str {
        "AURA"
    }

    fn on_insert(&mut self, key: &CacheKey) {
        self.clock += 1;
        self.scores.insert(
            key.clone(),
            AuraScore {
                stability: 0.0,
                value: 0.5,
                last_access: self.clock,
                stamp: self.clock,
            },
        );
        self.push_record(key);
    }

    fn on_access(&mut self, key: &CacheKey) {
        self.clock += 1;
        let clock = self.clock;
        let Some(score) = self.scores.get_mut(key) else {
            return;
        };
        let gap = clock.saturating_sub(score.last_access) as f64;
        let benefit = 1.0 / (1.0 + gap);
        score.stability = (1.0 - EMA_WEIGHT) * score.stability + EMA_WEIGHT;
        score.value = (1.0 - EMA_WEIGHT) * score.value + EMA_WEIGHT * benefit;
        score.last_access = clock;
        score.stamp = clock;
        self.push_record(key);
    }

    fn on_remove(&mut self, key: &CacheKey) {
        self.scores.remove(key);
    }

    fn pick_victim(&mut self, is_pinned: PinCheck<'_>) -> Option<CacheKey> {
        let mut pinned_records = Vec::new();
        let mut victim = None;
        while let Some(Reverse((bits, stamp, key))) = self.heap.pop() {
            match self.scores.get(&key) {
                Some(score) if score.stamp == stamp => {}
                _ => continue, // stale record
            }
            if is_pinned(&key) {
                pinned_records.push(Reverse((bits, stamp, key)));
                continue;
            }
            self.scores.remove(&key);
            victim = Some(key);
            break;
        }
        for record in pinned_records {
            self.heap.push(record);
        }
        victim
    }

    fn reset(&mut self) {
        self.clock = 0;
        self.scores.clear();
        self.heap.clear();
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
    fn test_unaccessed_key_is_first_victim() {
        let mut policy = AuraPolicy::new(0.5);
        policy.on_insert(&key(1));
        policy.on_insert(&key(2));
        for _ in 0..5 {
            policy.on_access(&key(1));
        }
        assert_eq!(policy.pick_victim(&no_pins), Some(key(2)));
    }

    #[test]
    fn test_accesses_raise_composite_score() {
        let mut policy = AuraPolicy::new(0.5);
        policy.on_insert(&key(1));
        let before = policy.composite(policy.scores.get(&key(1)).unwrap());
        policy.on_access(&key(1));
        let after = policy.composite(policy.scores.get(&key(1)).unwrap());
        assert!(after > before);
    }

    #[test]
    fn test_alpha_weights_stability_against_value() {
        // Pure-stability scoring: an accessed key beats a fresh one whose
        // value component starts at the neutral 0.5.
        let mut stability_only = AuraPolicy::new(1.0);
        stability_only.on_insert(&key(1));
        stability_only.on_access(&key(1));
        stability_only.on_insert(&key(2));
        assert_eq!(stability_only.pick_victim(&no_pins), Some(key(2)));

        // Pure-value scoring ignores stability entirely: a key re-accessed
        // after a long gap scores below the fresh neutral key.
        let mut value_only = AuraPolicy::new(0.0);
        value_only.on_insert(&key(1));
        for n in 10..30 {
            value_only.on_insert(&key(n));
        }
        value_only.on_access(&key(1)); // large gap -> tiny benefit
        let victim = value_only.pick_victim(&no_pins).unwrap();
        assert_eq!(victim, key(1));
    }

    #[test]
    fn test_pinned_keys_skipped_and_kept() {
        let mut policy = AuraPolicy::new(0.5);
        policy.on_insert(&key(1));
        policy.on_insert(&key(2));
        let pinned = |k: &CacheKey| *k == key(1);
        assert_eq!(policy.pick_victim(&pinned), Some(key(2)));
        assert_eq!(policy.pick_victim(&pinned), None);
        assert_eq!(policy.pick_victim(&no_pins), Some(key(1)));
    }

    #[test]
    fn test_alpha_is_clamped() {
        assert_eq!(AuraPolicy::new(7.0).alpha(), 1.0);
        assert_eq!(AuraPolicy::new(-1.0).alpha(), 0.0);
    }
}
