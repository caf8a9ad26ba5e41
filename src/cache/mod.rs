// # Tiered Caching System
//
// Multi-level cache with pluggable per-level eviction policies.
//
// ## Overview
//
// - **CacheKey**: tagged keys for tables, rows, indexes and query results,
//   with a hash that is stable across process restarts
// - **EvictionPolicy**: LRU, LFU, ARC, W-TinyLFU and AURA victim selection
// - **CacheLevel**: bounded entry store with one policy and its own lock
// - **CacheEngine**: ordered levels with promotion, cascading spill and
//   capacity auto-tuning
//
// Level 0 is the fastest tier and the insertion target; victims cascade
// into slower levels instead of being dropped, and hits in slower levels
// promote back to level 0.

pub mod arc;
pub mod aura;
pub mod engine;
pub mod eviction;
pub mod level;
pub mod stats;
pub mod tinylfu;

pub use engine::{CacheEngine, CacheEngineConfig};
pub use eviction::{create_policy, EvictionPolicy, PolicyKind};
pub use level::{CacheEntry, CacheLevel, CacheLevelConfig};
pub use stats::{EngineStats, LevelStats};

use crate::common::RowId;
use crate::storage::checksum::Fnv64;
use std::hash::{Hash, Hasher};

// Key tag bytes in the encoded form.
const TAG_TABLE: u8 = 1;
const TAG_ROW: u8 = 2;
const TAG_INDEX: u8 = 3;
const TAG_QUERY: u8 = 4;

/// Tagged cache key. Equality is structural and the hash is derived from
/// the encoded bytes, so it is identical across process restarts for the
/// same content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheKey {
    /// Table schema/metadata entry.
    Table(String),
    /// A single row of a table.
    Row(String, RowId),
    /// A named index of a table.
    Index(String, String),
    /// A query result, keyed by its normalized hash.
    Query(u64),
}

impl CacheKey {
    /// The byte form of the key. Its length participates in cache byte
    /// accounting alongside the value bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            CacheKey::Table(table) => {
                out.push(TAG_TABLE);
                out.extend_from_slice(table.as_bytes());
            }
            CacheKey::Row(table, row_id) => {
                out.push(TAG_ROW);
                out.extend_from_slice(table.as_bytes());
                out.push(0);
                out.extend_from_slice(&row_id.to_le_bytes());
            }
            CacheKey::Index(table, index) => {
                out.push(TAG_INDEX);
                out.extend_from_slice(table.as_bytes());
                out.push(0);
                out.extend_from_slice(index.as_bytes());
            }
            CacheKey::Query(hash) => {
                out.push(TAG_QUERY);
                out.extend_from_slice(&hash.to_le_bytes());
            }
        }
        out
    }

    pub fn size_bytes(&self) -> usize {
        self.encode().len()
    }

    /// FNV-1a hash of the encoded bytes; stable across restarts.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = Fnv64::new();
        hasher.update(&self.encode());
        hasher.finish()
    }

    /// The table this key belongs to, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            CacheKey::Table(t) | CacheKey::Row(t, _) | CacheKey::Index(t, _) => Some(t),
            CacheKey::Query(_) => None,
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, CacheKey::Query(_))
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.stable_hash());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodings_are_distinct() {
        let keys = [
            CacheKey::Table("users".into()),
            CacheKey::Row("users".into(), 1),
            CacheKey::Row("users".into(), 2),
            CacheKey::Index("users".into(), "by_name".into()),
            CacheKey::Query(42),
        ];
        for (i, a) in keys.iter().enumerate() {
            for (j, b) in keys.iter().enumerate() {
                if i != j {
                    assert_ne!(a.encode(), b.encode(), "{:?} vs {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_stable_hash_is_deterministic() {
        let a = CacheKey::Row("users".into(), 7);
        let b = CacheKey::Row("users".into(), 7);
        assert_eq!(a.stable_hash(), b.stable_hash());
        assert_ne!(
            a.stable_hash(),
            CacheKey::Row("users".into(), 8).stable_hash()
        );
    }

    #[test]
    fn test_table_accessor() {
        assert_eq!(CacheKey::Table("t".into()).table(), Some("t"));
        assert_eq!(CacheKey::Row("t".into(), 1).table(), Some("t"));
        assert_eq!(CacheKey::Query(1).table(), None);
        assert!(CacheKey::Query(1).is_query());
    }
}
