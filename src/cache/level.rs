// # Cache Level
//
// One bounded tier of the cache engine: an entry map, one eviction policy
// and per-level statistics, all guarded by a single lock. Quotas are
// enforced on both entry count and byte footprint (key bytes + value
// bytes). Eviction victims are handed back to the engine so they can spill
// into the next level instead of being dropped.

use crate::cache::eviction::{create_policy, EvictionPolicy, PolicyKind};
use crate::cache::stats::LevelStats;
use crate::cache::CacheKey;
use crate::common::unix_time_secs;
use crate::error::{DbError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for one cache level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheLevelConfig {
    pub capacity_bytes: usize,
    pub capacity_entries: usize,
    pub policy: PolicyKind,
    /// Placement hint for hosts that back slower levels with disk; entry
    /// storage itself is identical for both settings.
    pub on_disk: bool,
    /// Hit-ratio target consulted by engine auto-tuning.
    pub hit_ratio_threshold: f64,
    /// Write-buffer sizing hint for disk-backed levels.
    pub write_buffer_bytes: usize,
    /// Exploration/exploitation weight for the AURA policy.
    pub aura_alpha: f64,
}

impl Default for CacheLevelConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 16 * 1024 * 1024,
            capacity_entries: 4096,
            policy: PolicyKind::Lru,
            on_disk: false,
            hit_ratio_threshold: 0.85,
            write_buffer_bytes: 1024 * 1024,
            aura_alpha: 0.5,
        }
    }
}

impl CacheLevelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 || self.capacity_entries == 0 {
            return Err(DbError::InvalidConfig(
                "level capacities must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.hit_ratio_threshold) {
            return Err(DbError::InvalidConfig(format!(
                "hit_ratio_threshold {} outside [0, 1]",
                self.hit_ratio_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.aura_alpha) {
            return Err(DbError::InvalidConfig(format!(
                "aura_alpha {} outside [0, 1]",
                self.aura_alpha
            )));
        }
        Ok(())
    }
}

/// One resident entry. The bytes are owned exclusively by the level that
/// currently holds the entry; migrations move them.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub level: u32,
    pub last_access_time: u64,
    pub access_count: u64,
    /// EMA-smoothed access frequency: (7 * prev + access_count) / 8.
    pub access_frequency: f64,
    /// EMA-smoothed hit indicator.
    pub access_score: f64,
    pub dirty: bool,
    pub pin_count: u32,
    pub ref_count: u32,
}

impl CacheEntry {
    fn new(level: u32, value: Vec<u8>, pinned: bool) -> Self {
        Self {
            value,
            level,
            last_access_time: unix_time_secs(),
            access_count: 0,
            access_frequency: 0.0,
            access_score: 0.0,
            dirty: false,
            pin_count: u32::from(pinned),
            ref_count: 0,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    fn touch(&mut self) {
        self.last_access_time = unix_time_secs();
        self.access_count += 1;
        self.access_frequency = (7.0 * self.access_frequency + self.access_count as f64) / 8.0;
        self.access_score = (7.0 * self.access_score + 1.0) / 8.0;
    }
}

struct LevelInner {
    config: CacheLevelConfig,
    entries: HashMap<CacheKey, CacheEntry>,
    policy: Box<dyn EvictionPolicy>,
    current_bytes: usize,
    stats: LevelStats,
}

impl LevelInner {
    fn entry_size(key: &CacheKey, value_len: usize) -> usize {
        key.size_bytes() + value_len
    }

    /// Evict until `extra_bytes`/one more entry fit. Returns the victims.
    /// If selection fails with every candidate pinned, the already-taken
    /// victims are restored so no partial effect is visible.
    fn make_room(
        &mut self,
        extra_bytes: usize,
        extra_entries: usize,
        protect: Option<&CacheKey>,
    ) -> Result<Vec<(CacheKey, CacheEntry)>> {
        let mut victims: Vec<(CacheKey, CacheEntry)> = Vec::new();
        while self.current_bytes + extra_bytes > self.config.capacity_bytes
            || self.entries.len() + extra_entries > self.config.capacity_entries
        {
            let Self {
                entries, policy, ..
            } = self;
            let picked = policy.pick_victim(&|k| {
                Some(k) == protect || entries.get(k).map(CacheEntry::is_pinned).unwrap_or(false)
            });
            let Some(victim_key) = picked else {
                // Roll back: reinsert taken victims.
                for (key, entry) in victims {
                    self.current_bytes += Self::entry_size(&key, entry.value.len());
                    self.policy.on_insert(&key);
                    self.entries.insert(key, entry);
                }
                self.refresh_gauges();
                return Err(DbError::EvictionBlocked(
                    "all cache entries are pinned".to_string(),
                ));
            };
            // The policy already dropped (or ghosted) the victim from its
            // own tracking as part of selection.
            let Some(entry) = self.entries.remove(&victim_key) else {
                continue;
            };
            self.current_bytes -= Self::entry_size(&victim_key, entry.value.len());
            self.stats.evictions += 1;
            victims.push((victim_key, entry));
        }
        Ok(victims)
    }

    fn refresh_gauges(&mut self) {
        self.stats.current_entries = self.entries.len();
        self.stats.current_size_bytes = self.current_bytes;
    }
}

/// A single cache tier with its own lock, policy and statistics.
pub struct CacheLevel {
    index: usize,
    inner: Mutex<LevelInner>,
}

impl CacheLevel {
    pub fn new(index: usize, config: CacheLevelConfig) -> Result<Self> {
        config.validate()?;
        let policy = create_policy(config.policy, config.capacity_entries, config.aura_alpha);
        Ok(Self {
            index,
            inner: Mutex::new(LevelInner {
                config,
                entries: HashMap::new(),
                policy,
                current_bytes: 0,
                stats: LevelStats::new(),
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Look up a key. A hit refreshes the entry's access bookkeeping and
    /// notifies the policy.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.touch();
            let value = entry.value.clone();
            inner.policy.on_access(key);
            inner.stats.record_hit();
            Some(value)
        } else {
            inner.stats.record_miss();
            None
        }
    }

    /// Insert or replace a value. Returns evicted victims for the engine
    /// to spill into the next level.
    pub fn put(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        pin: bool,
    ) -> Result<Vec<(CacheKey, CacheEntry)>> {
        let mut inner = self.inner.lock();
        let entry_size = LevelInner::entry_size(key, value.len());
        if entry_size > inner.config.capacity_bytes {
            return Err(DbError::EntryTooLarge(format!(
                "entry of {} bytes exceeds level {} capacity of {} bytes",
                entry_size,
                self.index,
                inner.config.capacity_bytes
            )));
        }

        if let Some(existing) = inner.entries.get_mut(key) {
            // Replace in place: swap the bytes and restart the clock.
            let old_len = existing.value.len();
            existing.value = value;
            existing.last_access_time = unix_time_secs();
            existing.access_count = 0;
            existing.access_frequency = 0.0;
            existing.access_score = 0.0;
            if pin {
                existing.pin_count += 1;
            }
            inner.current_bytes = inner.current_bytes + entry_size
                - LevelInner::entry_size(key, old_len);
            inner.policy.on_access(key);
            // The replacement may have grown the entry past a quota; the
            // replaced key itself is off limits while making room.
            let victims = inner.make_room(0, 0, Some(key))?;
            inner.refresh_gauges();
            return Ok(victims);
        }

        let victims = inner.make_room(entry_size, 1, None)?;
        inner
            .entries
            .insert(key.clone(), CacheEntry::new(self.index as u32, value, pin));
        inner.current_bytes += entry_size;
        inner.policy.on_insert(key);
        inner.refresh_gauges();
        Ok(victims)
    }

    /// Install a migrated entry (spill or promotion), keeping its
    /// bookkeeping. Victims are returned as with `put`.
    pub fn insert_entry(
        &self,
        key: CacheKey,
        mut entry: CacheEntry,
    ) -> Result<Vec<(CacheKey, CacheEntry)>> {
        let mut inner = self.inner.lock();
        let entry_size = LevelInner::entry_size(&key, entry.value.len());
        if entry_size > inner.config.capacity_bytes {
            return Err(DbError::EntryTooLarge(format!(
                "entry of {} bytes exceeds level {} capacity of {} bytes",
                entry_size,
                self.index,
                inner.config.capacity_bytes
            )));
        }
        let victims = inner.make_room(entry_size, 1, None)?;
        entry.level = self.index as u32;
        inner.policy.on_insert(&key);
        inner.entries.insert(key, entry);
        inner.current_bytes += entry_size;
        inner.refresh_gauges();
        Ok(victims)
    }

    /// Remove and return an entry without counting an eviction (used for
    /// promotion to a faster level).
    pub fn take(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(key)?;
        inner.current_bytes -= LevelInner::entry_size(key, entry.value.len());
        inner.policy.on_remove(key);
        inner.refresh_gauges();
        Some(entry)
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.take(key).is_some()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Adjust the pin counter. Returns false for non-resident keys.
    pub fn pin(&self, key: &CacheKey, pinned: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(key) else {
            return false;
        };
        if pinned {
            entry.pin_count += 1;
        } else {
            entry.pin_count = entry.pin_count.saturating_sub(1);
        }
        true
    }

    /// Remove every key matching the predicate. Returns how many went.
    pub fn remove_matching(&self, predicate: &dyn Fn(&CacheKey) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let doomed: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|k| predicate(k))
            .cloned()
            .collect();
        for key in &doomed {
            if let Some(entry) = inner.entries.remove(key) {
                inner.current_bytes -= LevelInner::entry_size(key, entry.value.len());
            }
            inner.policy.on_remove(key);
        }
        inner.refresh_gauges();
        doomed.len()
    }

    /// Drop all entries. Monotonic counters survive; `reset_stats` clears
    /// them on request.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.policy.reset();
        inner.current_bytes = 0;
        inner.refresh_gauges();
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats.reset_counters();
    }

    pub fn stats(&self) -> LevelStats {
        let mut inner = self.inner.lock();
        inner.refresh_gauges();
        inner.stats.clone()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().current_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.inner.lock().config.capacity_bytes
    }

    /// Capacity adjustment from the auto-tuner. Resident entries above a
    /// lowered quota are tolerated until the next insertion.
    pub fn set_capacity_bytes(&self, capacity: usize) {
        self.inner.lock().config.capacity_bytes = capacity;
    }

    pub fn config(&self) -> CacheLevelConfig {
        self.inner.lock().config.clone()
    }

    /// Snapshot of one entry's bookkeeping, for diagnostics and tests.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key).cloned()
    }
}
