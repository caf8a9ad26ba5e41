// # Cache Engine
//
// Ordered sequence of cache levels (level 0 fastest) behind one global
// operation lock. Lookups scan levels in order; a hit in a slower level is
// promoted to level 0 before the lock is released, so a key is resident in
// exactly one level at any instant. Insertion pressure cascades: victims
// evicted from a level spill into the next one, and only the last level
// drops them.
//
// Capacity auto-tuning runs under its own mutex and touches only per-level
// capacity fields: levels missing their hit-ratio target grow by 10%,
// levels comfortably above it shrink by 5%, clamped to the configured
// floor and the engine-wide ceiling.

use crate::cache::level::{CacheEntry, CacheLevel, CacheLevelConfig};
use crate::cache::stats::{EngineStats, LevelStats};
use crate::cache::CacheKey;
use crate::common::{unix_time_secs, MAX_CACHE_LEVELS};
use crate::error::{DbError, Result};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Dead zone around the hit-ratio target inside which capacity is left
/// alone.
const TUNE_EPSILON: f64 = 0.05;

const TUNE_GROWTH: f64 = 1.1;
const TUNE_SHRINK: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct CacheEngineConfig {
    pub name: String,
    pub levels: Vec<CacheLevelConfig>,
    pub auto_tune: bool,
    pub target_hit_ratio: f64,
    pub tune_interval: Duration,
    /// Ceiling on the summed byte capacity across all levels.
    pub max_total_bytes: usize,
    /// Floor on any single level's byte capacity.
    pub min_level_bytes: usize,
}

impl Default for CacheEngineConfig {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            levels: vec![
                CacheLevelConfig::default(),
                CacheLevelConfig {
                    capacity_bytes: 64 * 1024 * 1024,
                    capacity_entries: 16_384,
                    policy: crate::cache::eviction::PolicyKind::Lfu,
                    ..CacheLevelConfig::default()
                },
            ],
            auto_tune: true,
            target_hit_ratio: 0.85,
            tune_interval: Duration::from_secs(300),
            max_total_bytes: 1024 * 1024 * 1024,
            min_level_bytes: 1024 * 1024,
        }
    }
}

impl CacheEngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() || self.levels.len() > MAX_CACHE_LEVELS {
            return Err(DbError::InvalidConfig(format!(
                "cache must have between 1 and {} levels, got {}",
                MAX_CACHE_LEVELS,
                self.levels.len()
            )));
        }
        if !(0.0..=1.0).contains(&self.target_hit_ratio) {
            return Err(DbError::InvalidConfig(format!(
                "target_hit_ratio {} outside [0, 1]",
                self.target_hit_ratio
            )));
        }
        for level in &self.levels {
            level.validate()?;
        }
        Ok(())
    }
}

/// Tiered cache with write-through-to-L0 and promotion on hit.
pub struct CacheEngine {
    name: String,
    levels: Vec<CacheLevel>,
    /// Serializes multi-level traversals.
    op_lock: Mutex<()>,
    /// Serializes tuning, independent of the operation lock.
    tune_lock: Mutex<()>,
    stats: Mutex<EngineStats>,
    last_tune: Mutex<Option<Instant>>,
    auto_tune: bool,
    target_hit_ratio: f64,
    tune_interval: Duration,
    max_total_bytes: usize,
    min_level_bytes: usize,
}

impl CacheEngine {
    pub fn new(config: CacheEngineConfig) -> Result<Self> {
        config.validate()?;
        let levels = config
            .levels
            .into_iter()
            .enumerate()
            .map(|(index, level_config)| CacheLevel::new(index, level_config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: config.name,
            levels,
            op_lock: Mutex::new(()),
            tune_lock: Mutex::new(()),
            stats: Mutex::new(EngineStats::default()),
            last_tune: Mutex::new(None),
            auto_tune: config.auto_tune,
            target_hit_ratio: config.target_hit_ratio,
            tune_interval: config.tune_interval,
            max_total_bytes: config.max_total_bytes,
            min_level_bytes: config.min_level_bytes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn auto_tune_enabled(&self) -> bool {
        self.auto_tune
    }

    pub fn tune_interval(&self) -> Duration {
        self.tune_interval
    }

    /// Look up a key across levels. A hit below level 0 migrates the entry
    /// to level 0 before returning.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let _guard = self.op_lock.lock();
        for index in 0..self.levels.len() {
            let Some(value) = self.levels[index].get(key) else {
                continue;
            };
            if index > 0 {
                self.promote(key, index);
            }
            self.stats.lock().record_hit();
            return Some(value);
        }
        self.stats.lock().record_miss();
        None
    }

    /// Insert or update a value. New keys land in level 0; victims cascade
    /// toward the last level.
    pub fn put(&self, key: &CacheKey, value: Vec<u8>, pin: bool) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.stats.lock().puts += 1;

        // A resident key is updated in place at its current level.
        for index in 0..self.levels.len() {
            if self.levels[index].contains(key) {
                let victims = self.levels[index].put(key, value, pin)?;
                self.spill_victims(index + 1, victims);
                return Ok(());
            }
        }

        // Fresh key: level 0, spilling the new entry downward if a level
        // is fully pinned.
        match self.levels[0].put(key, value.clone(), pin) {
            Ok(victims) => {
                self.spill_victims(1, victims);
                Ok(())
            }
            Err(DbError::EvictionBlocked(_)) => {
                for index in 1..self.levels.len() {
                    match self.levels[index].put(key, value.clone(), pin) {
                        Ok(victims) => {
                            self.spill_victims(index + 1, victims);
                            return Ok(());
                        }
                        Err(DbError::EvictionBlocked(_)) | Err(DbError::EntryTooLarge(_)) => {
                            continue
                        }
                        Err(other) => return Err(other),
                    }
                }
                Err(DbError::EvictionBlocked(
                    "every cache level is fully pinned".to_string(),
                ))
            }
            Err(other) => Err(other),
        }
    }

    /// Remove a key wherever it is resident.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let _guard = self.op_lock.lock();
        self.stats.lock().removes += 1;
        self.levels.iter().any(|level| level.remove(key))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let _guard = self.op_lock.lock();
        self.levels.iter().any(|level| level.contains(key))
    }

    /// Adjust the pin count of a resident key.
    pub fn pin(&self, key: &CacheKey, pinned: bool) -> bool {
        let _guard = self.op_lock.lock();
        self.levels.iter().any(|level| level.pin(key, pinned))
    }

    /// Remove every resident key matching the predicate.
    pub fn invalidate_matching(&self, predicate: &dyn Fn(&CacheKey) -> bool) -> usize {
        let _guard = self.op_lock.lock();
        self.levels
            .iter()
            .map(|level| level.remove_matching(predicate))
            .sum()
    }

    pub fn clear(&self) {
        let _guard = self.op_lock.lock();
        for level in &self.levels {
            level.clear();
        }
    }

    /// Which level a key is resident in, if any.
    pub fn resident_level(&self, key: &CacheKey) -> Option<usize> {
        let _guard = self.op_lock.lock();
        self.levels
            .iter()
            .position(|level| level.contains(key))
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    pub fn level_stats(&self) -> Vec<LevelStats> {
        self.levels.iter().map(CacheLevel::stats).collect()
    }

    pub fn level_capacity_bytes(&self, index: usize) -> Option<usize> {
        self.levels.get(index).map(CacheLevel::capacity_bytes)
    }

    pub fn record_checkpoint(&self) {
        self.stats.lock().checkpoints += 1;
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Migrate a hit entry from `from_index` into level 0. The entry
    /// adopts the current time as its access time. On failure the entry is
    /// put back where it came from.
    fn promote(&self, key: &CacheKey, from_index: usize) {
        let Some(mut entry) = self.levels[from_index].take(key) else {
            return;
        };
        entry.last_access_time = unix_time_secs();
        match self.levels[0].insert_entry(key.clone(), entry.clone()) {
            Ok(victims) => {
                self.stats.lock().promotions += 1;
                self.spill_victims(1, victims);
            }
            Err(_) => {
                // Level 0 is fully pinned or too small; leave the entry at
                // its original level.
                if self.levels[from_index].insert_entry(key.clone(), entry).is_err() {
                    warn!(key = ?key, "promotion failed and entry could not be restored");
                }
            }
        }
    }

    /// Spill evicted entries into `start_index` and deeper. Victims of the
    /// last level are dropped.
    fn spill_victims(&self, start_index: usize, victims: Vec<(CacheKey, CacheEntry)>) {
        for (key, entry) in victims {
            self.place_entry(start_index, key, entry);
        }
    }

    fn place_entry(&self, start_index: usize, key: CacheKey, entry: CacheEntry) {
        for index in start_index..self.levels.len() {
            match self.levels[index].insert_entry(key.clone(), entry.clone()) {
                Ok(victims) => {
                    self.stats.lock().spills += 1;
                    self.spill_victims(index + 1, victims);
                    return;
                }
                Err(DbError::EvictionBlocked(_)) | Err(DbError::EntryTooLarge(_)) => continue,
                Err(other) => {
                    warn!(key = ?key, error = %other, "spill failed; dropping entry");
                    return;
                }
            }
        }
        // Fell off the last level.
        debug!(key = ?key, "victim dropped past the last level");
    }

    // ------------------------------------------------------------------
    // Auto-tuning
    // ------------------------------------------------------------------

    /// One tuning pass. Holds the tune mutex for the duration, excluding
    /// concurrent tuning but not cache traffic.
    pub fn tune(&self) {
        let _guard = self.tune_lock.lock();
        let total: usize = self
            .levels
            .iter()
            .map(|level| level.capacity_bytes())
            .sum();
        let mut budget = self.max_total_bytes.saturating_sub(total);

        for level in &self.levels {
            let stats = level.stats();
            if stats.total_requests == 0 {
                continue; // no signal yet
            }
            let ratio = stats.hit_ratio();
            let capacity = level.capacity_bytes();
            if ratio < self.target_hit_ratio - TUNE_EPSILON {
                let grown = ((capacity as f64 * TUNE_GROWTH) as usize).max(capacity + 1);
                let new_capacity = grown.min(capacity + budget);
                budget -= new_capacity - capacity;
                if new_capacity != capacity {
                    debug!(
                        level = level.index(),
                        ratio, capacity, new_capacity, "growing under-performing level"
                    );
                    level.set_capacity_bytes(new_capacity);
                }
            } else if ratio > self.target_hit_ratio + TUNE_EPSILON {
                let shrunk = ((capacity as f64 * TUNE_SHRINK) as usize).max(self.min_level_bytes);
                if shrunk < capacity {
                    budget += capacity - shrunk;
                    debug!(
                        level = level.index(),
                        ratio, capacity, shrunk, "shrinking over-provisioned level"
                    );
                    level.set_capacity_bytes(shrunk);
                }
            }
        }
        *self.last_tune.lock() = Some(Instant::now());
    }

    /// Seconds since the last tuning pass, if one has run.
    pub fn last_tune_elapsed(&self) -> Option<Duration> {
        self.last_tune.lock().map(|at| at.elapsed())
    }
}
