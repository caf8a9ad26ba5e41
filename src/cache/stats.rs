// Cache statistics, per level and engine-wide.
// Mutated under the owning lock; snapshots are plain clones.

use crate::common::unix_time_secs;
use serde::{Deserialize, Serialize};

/// Counters for one cache level. `total_requests == hits + misses` holds by
/// construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LevelStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size_bytes: usize,
    pub current_entries: usize,
    pub last_reset: u64,
}

impl LevelStats {
    pub fn new() -> Self {
        Self {
            last_reset: unix_time_secs(),
            ..Self::default()
        }
    }

    pub fn record_hit(&mut self) {
        self.total_requests += 1;
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.total_requests += 1;
        self.misses += 1;
    }

    pub fn hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.hits as f64 / self.total_requests as f64
    }

    /// Reset the monotonic counters; the size gauges are left to reflect
    /// the current contents.
    pub fn reset_counters(&mut self) {
        self.total_requests = 0;
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        self.last_reset = unix_time_secs();
    }
}

/// Engine-wide counters across all levels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removes: u64,
    pub promotions: u64,
    pub spills: u64,
    pub checkpoints: u64,
}

impl EngineStats {
    pub fn record_hit(&mut self) {
        self.total_requests += 1;
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.total_requests += 1;
        self.misses += 1;
    }

    pub fn hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.hits as f64 / self.total_requests as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_equal_hits_plus_misses() {
        let mut stats = LevelStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert_eq!(stats.total_requests, stats.hits + stats.misses);
        assert!((stats.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_keeps_gauges() {
        let mut stats = LevelStats::new();
        stats.record_miss();
        stats.current_entries = 5;
        stats.current_size_bytes = 100;
        stats.reset_counters();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.current_entries, 5);
        assert_eq!(stats.current_size_bytes, 100);
    }

    #[test]
    fn test_empty_ratio_is_zero() {
        assert_eq!(LevelStats::new().hit_ratio(), 0.0);
        assert_eq!(EngineStats::default().hit_ratio(), 0.0);
    }
}
