// # Eviction Policies - Cache Entry Replacement Algorithms
//
// One policy instance per cache level, owned by that level and driven
// under its lock. Policies track key order/frequency only; the level owns
// the entry bytes and tells the policy about inserts, accesses and
// removals.
//
// ## Supported Policies
//
// - **LRU**: recency order with lazy-deletion queue, O(1) amortized
// - **LFU**: frequency buckets with a min-frequency pointer, O(1) amortized
// - **ARC**: adaptive recency/frequency lists with ghosts (`arc.rs`)
// - **W-TinyLFU**: windowed admission with a count-min sketch (`tinylfu.rs`)
// - **AURA**: stability/value composite scoring (`aura.rs`)

use crate::cache::CacheKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Predicate the level supplies so policies never select pinned entries.
pub type PinCheck<'a> = &'a dyn Fn(&CacheKey) -> bool;

/// Victim selection over the keys resident in one cache level.
pub trait EvictionPolicy: Send {
    /// Policy name for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// A key was inserted into the level.
    fn on_insert(&mut self, key: &CacheKey);

    /// A resident key was read or updated.
    fn on_access(&mut self, key: &CacheKey);

    /// A key left the level (eviction, removal or migration).
    fn on_remove(&mut self, key: &CacheKey);

    /// Choose an unpinned victim. Returns `None` iff every resident entry
    /// is pinned. The returned key is dropped from the policy's own
    /// tracking (ARC retains it as a ghost); the caller must not follow up
    /// with `on_remove`.
    fn pick_victim(&mut self, is_pinned: PinCheck<'_>) -> Option<CacheKey>;

    /// Drop all tracked state.
    fn reset(&mut self);
}

/// Eviction policy variant selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    Lru,
    Lfu,
    Arc,
    WTinyLfu,
    Aura,
}

/// Create a policy instance for a level with the given entry capacity.
/// `aura_alpha` is only consulted by the AURA variant.
pub fn create_policy(
    kind: PolicyKind,
    capacity_entries: usize,
    aura_alpha: f64,
) -> Box<dyn EvictionPolicy> {
    match kind {
        PolicyKind::Lru => Box::new(LruPolicy::new()),
        PolicyKind::Lfu => Box::new(LfuPolicy::new()),
        PolicyKind::Arc => Box::new(crate::cache::arc::ArcPolicy::new(capacity_entries)),
        PolicyKind::WTinyLfu => {
            Box::new(crate::cache::tinylfu::TinyLfuPolicy::new(capacity_entries))
        }
        PolicyKind::Aura => Box::new(crate::cache::aura::AuraPolicy::new(aura_alpha)),
    }
}

// ============================================================================
// LRU Policy
// ============================================================================

/// LRU with a lazy-deletion recency queue.
///
/// Every insert/access pushes a freshly stamped queue record; stale records
/// are skipped during victim selection. The queue is compacted when stale
/// records outnumber live keys.
pub struct LruPolicy {
    queue: VecDeque<(u64, CacheKey)>,
    stamps: HashMap<CacheKey, u64>,
    clock: u64,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            stamps: HashMap::new(),
            clock: 0,
        }
    }

    fn touch(&mut self, key: &CacheKey) {
        self.clock += 1;
        self.stamps.insert(key.clone(), self.clock);
        self.queue.push_back((self.clock, key.clone()));
        if self.queue.len() > 2 * self.stamps.len() + 16 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let stamps = &self.stamps;
        self.queue
            .retain(|(stamp, key)| stamps.get(key) == Some(stamp));
    }
}

impl Default for LruPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "LRU"
    }

    fn on_insert(&mut self, key: &CacheKey) {
        self.touch(key);
    }

    fn on_access(&mut self, key: &CacheKey) {
        self.touch(key);
    }

    fn on_remove(&mut self, key: &CacheKey) {
        self.stamps.remove(key);
    }

    fn pick_victim(&mut self, is_pinned: PinCheck<'_>) -> Option<CacheKey> {
        let mut pinned_front = Vec::new();
        let mut victim = None;
        while let Some((stamp, key)) = self.queue.pop_front() {
            if self.stamps.get(&key) != Some(&stamp) {
                continue; // stale record
            }
            if is_pinned(&key) {
                pinned_front.push((stamp, key));
                continue;
            }
            self.stamps.remove(&key);
            victim = Some(key);
            break;
        }
        // Preserve the recency order of skipped pinned keys.
        for record in pinned_front.into_iter().rev() {
            self.queue.push_front(record);
        }
        victim
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.stamps.clear();
        self.clock = 0;
    }
}

// ============================================================================
// LFU Policy
// ============================================================================

/// LFU with frequency buckets and a min-frequency pointer.
///
/// Keys live in per-frequency FIFO buckets; within a bucket the front is
/// the least recently accessed, which breaks frequency ties. Bucket records
/// are lazily invalidated when a key's frequency moves on.
pub struct LfuPolicy {
    buckets: HashMap<u64, VecDeque<CacheKey>>,
    freqs: HashMap<CacheKey, u64>,
    min_freq: u64,
    max_freq: u64,
}

impl LfuPolicy {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            freqs: HashMap::new(),
            min_freq: 0,
            max_freq: 0,
        }
    }
}

impl Default for LfuPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "LFU"
    }

    fn on_insert(&mut self, key: &CacheKey) {
        self.freqs.insert(key.clone(), 1);
        self.buckets.entry(1).or_default().push_back(key.clone());
        self.min_freq = 1;
        self.max_freq = self.max_freq.max(1);
    }

    fn on_access(&mut self, key: &CacheKey) {
        let Some(freq) = self.freqs.get_mut(key) else {
            return;
        };
        *freq += 1;
        let freq = *freq;
        self.buckets.entry(freq).or_default().push_back(key.clone());
        self.max_freq = self.max_freq.max(freq);
    }

    fn on_remove(&mut self, key: &CacheKey) {
        self.freqs.remove(key);
    }

    fn pick_victim(&mut self, is_pinned: PinCheck<'_>) -> Option<CacheKey> {
        let mut pinned_front: Vec<(u64, CacheKey)> = Vec::new();
        let mut victim = None;

        let mut freq = self.min_freq.max(1);
        'scan: while freq <= self.max_freq {
            if let Some(bucket) = self.buckets.get_mut(&freq) {
                while let Some(key) = bucket.pop_front() {
                    if self.freqs.get(&key) != Some(&freq) {
                        continue; // stale record
                    }
                    if is_pinned(&key) {
                        pinned_front.push((freq, key));
                        continue;
                    }
                    self.freqs.remove(&key);
                    self.min_freq = freq;
                    victim = Some(key);
                    break 'scan;
                }
                self.buckets.remove(&freq);
            }
            freq += 1;
        }

        for (freq, key) in pinned_front.into_iter().rev() {
            self.buckets.entry(freq).or_default().push_front(key);
        }
        victim
    }

    fn reset(&mut self) {
        self.buckets.clear();
        self.freqs.clear();
        self.min_freq = 0;
        self.max_freq = 0;
    }
}
