// # W-TinyLFU Eviction Policy
//
// Admission-controlled LFU: a small window LRU (about 1% of capacity)
// absorbs new keys, and a main segmented LRU (probation + protected) holds
// the rest. While the main region is under its entry budget, window
// overflow graduates freely into probation. Once it is full, graduation is
// gated by a count-min sketch: the window candidate is admitted only when
// its estimated frequency is strictly greater than that of the main victim
// it would displace, which keeps one-hit wonders from flushing the main
// cache.
//
// Sketch counters saturate at 15 and are halved once the number of
// recorded accesses reaches the sample size, aging out stale frequency.

use crate::cache::eviction::{EvictionPolicy, PinCheck};
use crate::cache::CacheKey;
use std::collections::{HashMap, VecDeque};

const SKETCH_ROWS: usize = 4;
const COUNTER_MAX: u8 = 15;

// ============================================================================
// Count-Min Sketch
// ============================================================================

struct CountMinSketch {
    width_mask: u64,
    rows: Vec<Vec<u8>>,
    additions: u64,
    sample_size: u64,
}

impl CountMinSketch {
    fn new(capacity: usize) -> Self {
        let width = capacity.next_power_of_two().max(64);
        Self {
            width_mask: width as u64 - 1,
            rows: vec![vec![0u8; width]; SKETCH_ROWS],
            additions: 0,
            sample_size: (10 * capacity as u64).max(640),
        }
    }

    fn index(&self, hash: u64, row: usize) -> usize {
        // Per-row mix of the stable key hash (splitmix64 finalizer).
        let mut h = hash ^ (row as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        h ^= h >> 30;
        h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        h ^= h >> 27;
        (h & self.width_mask) as usize
    }

    fn add(&mut self, key: &CacheKey) {
        let hash = key.stable_hash();
        for row in 0..SKETCH_ROWS {
            let idx = self.index(hash, row);
            let counter = &mut self.rows[row][idx];
            if *counter < COUNTER_MAX {
                *counter += 1;
            }
        }
        self.additions += 1;
        if self.additions >= self.sample_size {
            self.halve();
        }
    }

    fn estimate(&self, key: &CacheKey) -> u8 {
        let hash = key.stable_hash();
        (0..SKETCH_ROWS)
            .map(|row| self.rows[row][self.index(hash, row)])
            .min()
            .unwrap_or(0)
    }

    fn halve(&mut self) {
        for row in &mut self.rows {
            for counter in row.iter_mut() {
                *counter >>= 1;
            }
        }
        self.additions /= 2;
    }

    fn clear(&mut self) {
        for row in &mut self.rows {
            row.fill(0);
        }
        self.additions = 0;
    }
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Window,
    Probation,
    Protected,
}

pub struct TinyLfuPolicy {
    window_cap: usize,
    main_cap: usize,
    protected_cap: usize,
    window: VecDeque<CacheKey>,
    probation: VecDeque<CacheKey>,
    protected: VecDeque<CacheKey>,
    segments: HashMap<CacheKey, Segment>,
    sketch: CountMinSketch,
}

impl TinyLfuPolicy {
    pub fn new(capacity_entries: usize) -> Self {
        let capacity = capacity_entries.max(2);
        let window_cap = (capacity / 100).max(1);
        let main_cap = capacity - window_cap;
        Self {
            window_cap,
            main_cap,
            protected_cap: (main_cap * 4 / 5).max(1),
            window: VecDeque::new(),
            probation: VecDeque::new(),
            protected: VecDeque::new(),
            segments: HashMap::new(),
            sketch: CountMinSketch::new(capacity),
        }
    }

    fn main_len(&self) -> usize {
        self.probation.len() + self.protected.len()
    }

    fn detach(&mut self, key: &CacheKey) -> Option<Segment> {
        let segment = self.segments.remove(key)?;
        match segment {
            Segment::Window => self.window.retain(|k| k != key),
            Segment::Probation => self.probation.retain(|k| k != key),
            Segment::Protected => self.protected.retain(|k| k != key),
        }
        Some(segment)
    }

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

    /// First unpinned key of probation, falling back to protected.
    fn main_victim(&mut self, is_pinned: PinCheck<'_>) -> Option<(CacheKey, Segment)> {
        if let Some(key) = Self::pop_unpinned(&mut self.probation, is_pinned) {
            return Some((key, Segment::Probation));
        }
        Self::pop_unpinned(&mut self.protected, is_pinned).map(|k| (k, Segment::Protected))
    }
}

impl EvictionPolicy for TinyLfuPolicy {
    fn name(&self) -> &'static str {
        "W-TinyLFU"
    }

    fn on_insert(&mut self, key: &CacheKey) {
        self.sketch.add(key);
        if self.segments.contains_key(key) {
            self.on_access(key);
            return;
        }
        self.window.push_back(key.clone());
        self.segments.insert(key.clone(), Segment::Window);
    }

    fn on_access(&mut self, key: &CacheKey) {
        self.sketch.add(key);
        match self.segments.get(key).copied() {
            Some(Segment::Window) => {
                self.detach(key);
                self.window.push_back(key.clone());
                self.segments.insert(key.clone(), Segment::Window);
            }
            Some(Segment::Probation) | Some(Segment::Protected) => {
                self.detach(key);
                self.protected.push_back(key.clone());
                self.segments.insert(key.clone(), Segment::Protected);
                // Protected overflow demotes its oldest key to probation.
                while self.protected.len() > self.protected_cap {
                    if let Some(demoted) = self.protected.pop_front() {
                        self.probation.push_back(demoted.clone());
                        self.segments.insert(demoted, Segment::Probation);
                    }
                }
            }
            None => {}
        }
    }

    fn on_remove(&mut self, key: &CacheKey) {
        self.detach(key);
    }

    fn pick_victim(&mut self, is_pinned: PinCheck<'_>) -> Option<CacheKey> {
        // Free graduations while the main region is under budget.
        while self.window.len() > self.window_cap && self.main_len() < self.main_cap {
            let Some(key) = Self::pop_unpinned(&mut self.window, is_pinned) else {
                break;
            };
            self.probation.push_back(key.clone());
            self.segments.insert(key, Segment::Probation);
        }

        // Main full and the window still overflowing: run the admission
        // filter between the window candidate and the main victim.
        if self.window.len() > self.window_cap {
            if let Some(candidate) = Self::pop_unpinned(&mut self.window, is_pinned) {
                self.segments.remove(&candidate);
                let Some((victim, victim_segment)) = self.main_victim(is_pinned) else {
                    return Some(candidate);
                };
                if self.sketch.estimate(&candidate) > self.sketch.estimate(&victim) {
                    self.segments.remove(&victim);
                    self.probation.push_back(candidate.clone());
                    self.segments.insert(candidate, Segment::Probation);
                    return Some(victim);
                }
                // Candidate rejected: the main victim keeps its place.
                match victim_segment {
                    Segment::Probation => self.probation.push_front(victim.clone()),
                    Segment::Protected => self.protected.push_front(victim.clone()),
                    Segment::Window => {}
                }
                return Some(candidate);
            }
        }

        if let Some((victim, _)) = self.main_victim(is_pinned) {
            self.segments.remove(&victim);
            return Some(victim);
        }
        Self::pop_unpinned(&mut self.window, is_pinned).map(|key| {
            self.segments.remove(&key);
            key
        })
    }

    fn reset(&mut self) {
        self.window.clear();
        self.probation.clear();
        self.protected.clear();
        self.segments.clear();
        self.sketch.clear();
    }
}
