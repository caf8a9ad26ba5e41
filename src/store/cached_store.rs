// # CachedStore
//
// Table, row and query operations routed through the cache engine with
// write-ahead logging and persistence underneath.
//
// Write protocol: validate, append to the WAL, apply to the in-memory
// database, then maintain the cache (populate row entries, invalidate
// query results). Table and row keys touched by a read-modify-write are
// pinned for its duration so concurrent eviction cannot race the
// mutation. Query results carry a TTL of one tune interval and are the
// first entries sacrificed on any write.

use crate::cache::{
    CacheEngine, CacheEngineConfig, CacheKey, CacheLevelConfig, EngineStats, LevelStats,
    PolicyKind,
};
use crate::common::{
    ColumnDef, Condition, Database, Row, RowId, Table, Value, MAX_CACHE_LEVELS,
    MAX_TABLE_NAME_LEN,
};
use crate::error::{DbError, Result};
use crate::storage::checksum::Fnv64;
use crate::storage::persist::{
    PersistenceConfig, PersistenceEngine, PersistenceMode, PersistenceStats,
};
use crate::storage::serial;
use crate::storage::wal::WalEntryType;
use crate::store::tuner::Tuner;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Construction knobs for a [`CachedStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of cache levels (1..=8).
    pub cache_levels: usize,
    /// Per-level configuration; empty = defaults derived per level.
    pub per_level: Vec<CacheLevelConfig>,
    pub persistence_mode: PersistenceMode,
    pub data_dir: PathBuf,
    pub query_cache_enabled: bool,
    pub auto_tune_enabled: bool,
    pub target_hit_ratio: f64,
    pub tune_interval_secs: u64,
    pub checkpoint_interval_secs: u64,
    pub max_wal_size_bytes: usize,
    /// Ceiling for auto-tuned total cache capacity.
    pub max_total_cache_bytes: usize,
    /// Floor for any single level's capacity.
    pub min_level_cache_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_levels: 2,
            per_level: Vec::new(),
            persistence_mode: PersistenceMode::Full,
            data_dir: PathBuf::from("./rdb_data"),
            query_cache_enabled: true,
            auto_tune_enabled: true,
            target_hit_ratio: 0.85,
            tune_interval_secs: 300,
            checkpoint_interval_secs: 3600,
            max_wal_size_bytes: 16 * 1024 * 1024,
            max_total_cache_bytes: 1024 * 1024 * 1024,
            min_level_cache_bytes: 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_levels == 0 || self.cache_levels > MAX_CACHE_LEVELS {
            return Err(DbError::InvalidConfig(format!(
                "cache_levels must be between 1 and {}, got {}",
                MAX_CACHE_LEVELS, self.cache_levels
            )));
        }
        if !self.per_level.is_empty() && self.per_level.len() != self.cache_levels {
            return Err(DbError::InvalidConfig(format!(
                "per_level has {} entries for {} levels",
                self.per_level.len(),
                self.cache_levels
            )));
        }
        if !(0.0..=1.0).contains(&self.target_hit_ratio) {
            return Err(DbError::InvalidConfig(format!(
                "target_hit_ratio {} outside [0, 1]",
                self.target_hit_ratio
            )));
        }
        if self.tune_interval_secs == 0 || self.checkpoint_interval_secs == 0 {
            return Err(DbError::InvalidConfig(
                "intervals must be positive".to_string(),
            ));
        }
        if self.max_wal_size_bytes == 0 {
            return Err(DbError::InvalidConfig(
                "max_wal_size_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Level configurations, synthesizing defaults when none were given:
    /// each deeper level is four times larger and frequency-managed.
    fn level_configs(&self) -> Vec<CacheLevelConfig> {
        if !self.per_level.is_empty() {
            return self.per_level.clone();
        }
        (0..self.cache_levels)
            .map(|index| {
                let base = CacheLevelConfig::default();
                CacheLevelConfig {
                    capacity_bytes: base.capacity_bytes << (2 * index),
                    capacity_entries: base.capacity_entries << (2 * index),
                    policy: if index == 0 {
                        PolicyKind::Lru
                    } else {
                        PolicyKind::Lfu
                    },
                    on_disk: index > 0,
                    hit_ratio_threshold: self.target_hit_ratio,
                    ..base
                }
            })
            .collect()
    }
}

/// Façade over the database, the tiered cache and the persistence engine.
pub struct CachedStore {
    config: StoreConfig,
    db: RwLock<Database>,
    engine: Arc<CacheEngine>,
    persistence: Arc<PersistenceEngine>,
    /// Insertion instants of live query-cache entries, for TTL checks.
    query_times: Mutex<HashMap<u64, Instant>>,
    last_checkpoint: Mutex<Instant>,
    shutdown: AtomicBool,
    tuner: Mutex<Option<Tuner>>,
}

impl std::fmt::Debug for CachedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedStore").field("config", &self.config).finish_non_exhaustive()
    }
}

impl CachedStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(CacheEngine::new(CacheEngineConfig {
            name: "store-cache".to_string(),
            levels: config.level_configs(),
            auto_tune: config.auto_tune_enabled,
            target_hit_ratio: config.target_hit_ratio,
            tune_interval: Duration::from_secs(config.tune_interval_secs),
            max_total_bytes: config.max_total_cache_bytes,
            min_level_bytes: config.min_level_cache_bytes,
        })?);

        let persistence = Arc::new(PersistenceEngine::new(PersistenceConfig {
            data_dir: config.data_dir.clone(),
            mode: config.persistence_mode,
            max_wal_size: config.max_wal_size_bytes,
            ..PersistenceConfig::default()
        })?);

        let tuner = if config.auto_tune_enabled {
            Some(Tuner::spawn(
                Arc::clone(&engine),
                Duration::from_secs(config.tune_interval_secs),
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            db: RwLock::new(Database::new()),
            engine,
            persistence,
            query_times: Mutex::new(HashMap::new()),
            last_checkpoint: Mutex::new(Instant::now()),
            shutdown: AtomicBool::new(false),
            tuner: Mutex::new(tuner),
        })
    }

    /// Load persisted state (table files, foreign keys, WAL replay).
    pub fn open(&self) -> Result<()> {
        self.guard()?;
        let mut db = self.db.write();
        self.persistence.open(&mut db)
    }

    fn guard(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DbError::Shutdown);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    pub fn create_table(&self, name: &str, columns: Vec<ColumnDef>) -> Result<()> {
        self.guard()?;
        if name.is_empty() || name.len() > MAX_TABLE_NAME_LEN {
            return Err(DbError::InvalidConfig(format!(
                "table name must be 1..={} bytes",
                MAX_TABLE_NAME_LEN
            )));
        }
        if columns.is_empty() {
            return Err(DbError::InvalidConfig(
                "a table needs at least one column".to_string(),
            ));
        }

        let mut db = self.db.write();
        if db.contains_table(name) {
            return Err(DbError::InvalidConfig(format!(
                "table {} already exists",
                name
            )));
        }
        let table = Table::new(name, columns);
        let payload = serial::encode_table(&table)?;
        self.persistence
            .append(WalEntryType::CreateTable, 0, name, 0, &payload)?;
        db.create_table(table);
        drop(db);

        self.cache_put(&CacheKey::Table(name.to_string()), payload, false);
        self.maybe_checkpoint();
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.guard()?;
        let mut db = self.db.write();
        if !db.contains_table(name) {
            return Err(DbError::NotFound(format!("table {}", name)));
        }
        self.persistence
            .append(WalEntryType::DropTable, 0, name, 0, &[])?;
        db.drop_table(name);
        drop(db);

        // Coarse invalidation: everything belonging to the table, plus all
        // cached query results.
        let table = name.to_string();
        self.engine
            .invalidate_matching(&|key| key.table() == Some(table.as_str()) || key.is_query());
        self.query_times.lock().clear();
        self.maybe_checkpoint();
        Ok(())
    }

    // ------------------------------------------------------------------
    // DML
    // ------------------------------------------------------------------

    pub fn insert_row(&self, name: &str, values: Vec<Value>) -> Result<RowId> {
        self.guard()?;
        let table_key = CacheKey::Table(name.to_string());
        let pinned = self.engine.pin(&table_key, true);
        let result = self.insert_row_locked(name, values);
        if pinned {
            self.engine.pin(&table_key, false);
        }
        result
    }

    fn insert_row_locked(&self, name: &str, values: Vec<Value>) -> Result<RowId> {
        let mut db = self.db.write();
        let table = db
            .table(name)
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))?;
        table.validate_values(&values)?;
        table.check_unique(&values, 0)?;
        let row_id = table.next_row_id;
        Self::validate_foreign_keys(&db, name, &values)?;

        let row = Row::new(row_id, values);
        let payload = serial::encode_row_bytes(&row);
        self.persistence
            .append(WalEntryType::Insert, 0, name, row_id, &payload)?;
        db.insert_row(name, row)?;
        drop(db);

        self.cache_put(&CacheKey::Row(name.to_string(), row_id), payload, false);
        self.invalidate_queries();
        self.maybe_checkpoint();
        Ok(row_id)
    }

    pub fn update_rows(
        &self,
        name: &str,
        set: &[(String, Value)],
        condition: Option<&Condition>,
    ) -> Result<usize> {
        self.guard()?;
        let table_key = CacheKey::Table(name.to_string());
        let pinned = self.engine.pin(&table_key, true);
        let result = self.update_rows_locked(name, set, condition);
        if pinned {
            self.engine.pin(&table_key, false);
        }
        result
    }

    fn update_rows_locked(
        &self,
        name: &str,
        set: &[(String, Value)],
        condition: Option<&Condition>,
    ) -> Result<usize> {
        let mut db = self.db.write();
        let table = db
            .table(name)
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))?;

        let mut assignments = Vec::with_capacity(set.len());
        for (column, value) in set {
            let idx = table.column_index(column).ok_or_else(|| {
                DbError::NotFound(format!("column {}.{}", name, column))
            })?;
            assignments.push((idx, value.clone()));
        }

        let mut updated: Vec<Row> = Vec::new();
        for row in &table.rows {
            if !table.matches(row, condition) {
                continue;
            }
            let mut values = row.values.clone();
            for (idx, value) in &assignments {
                values[*idx] = value.clone();
            }
            table.validate_values(&values)?;
            table.check_unique(&values, row.id)?;
            updated.push(Row::new(row.id, values));
        }
        for row in &updated {
            Self::validate_foreign_keys(&db, name, &row.values)?;
        }

        for row in &updated {
            let payload = serial::encode_row_bytes(row);
            self.persistence
                .append(WalEntryType::Update, 0, name, row.id, &payload)?;
            db.update_row(name, row.clone())?;
        }
        drop(db);

        for row in &updated {
            self.engine
                .remove(&CacheKey::Row(name.to_string(), row.id));
        }
        self.invalidate_queries();
        self.maybe_checkpoint();
        Ok(updated.len())
    }

    pub fn delete_rows(&self, name: &str, condition: Option<&Condition>) -> Result<usize> {
        self.guard()?;
        let table_key = CacheKey::Table(name.to_string());
        let pinned = self.engine.pin(&table_key, true);
        let result = self.delete_rows_locked(name, condition);
        if pinned {
            self.engine.pin(&table_key, false);
        }
        result
    }

    fn delete_rows_locked(&self, name: &str, condition: Option<&Condition>) -> Result<usize> {
        let mut db = self.db.write();
        let table = db
            .table(name)
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))?;
        let doomed: Vec<RowId> = table
            .rows
            .iter()
            .filter(|row| table.matches(row, condition))
            .map(|row| row.id)
            .collect();

        for row_id in &doomed {
            self.persistence
                .append(WalEntryType::Delete, 0, name, *row_id, &[])?;
            db.delete_row(name, *row_id)?;
        }
        drop(db);

        for row_id in &doomed {
            self.engine
                .remove(&CacheKey::Row(name.to_string(), *row_id));
        }
        self.invalidate_queries();
        self.maybe_checkpoint();
        Ok(doomed.len())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Point lookup by row id, read through the row cache.
    pub fn get_row(&self, name: &str, row_id: RowId) -> Result<Row> {
        self.guard()?;
        let key = CacheKey::Row(name.to_string(), row_id);
        if let Some(bytes) = self.engine.get(&key) {
            return serial::decode_row_bytes(&bytes);
        }
        let db = self.db.read();
        let table = db
            .table(name)
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))?;
        let row = table
            .find(row_id)
            .ok_or_else(|| DbError::NotFound(format!("row {} in table {}", row_id, name)))?
            .clone();
        drop(db);

        self.cache_put(&key, serial::encode_row_bytes(&row), false);
        Ok(row)
    }

    /// Select with projection and predicate, through the query cache.
    pub fn select_rows(
        &self,
        name: &str,
        columns: &[String],
        condition: Option<&Condition>,
    ) -> Result<Vec<Row>> {
        self.guard()?;
        let hash = Self::query_hash(name, columns, condition);
        let query_key = CacheKey::Query(hash);

        if self.config.query_cache_enabled {
            if self.query_entry_expired(hash) {
                self.engine.remove(&query_key);
                self.query_times.lock().remove(&hash);
            } else if let Some(bytes) = self.engine.get(&query_key) {
                return serial::decode_row_set(&bytes);
            }
        }

        let rows = self.db.read().select(name, columns, condition)?;

        if self.config.query_cache_enabled {
            self.cache_put(&query_key, serial::encode_row_set(&rows), false);
            self.query_times.lock().insert(hash, Instant::now());
        }
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Persistence control
    // ------------------------------------------------------------------

    pub fn save(&self) -> Result<()> {
        self.guard()?;
        self.persistence.save(&self.db.read())
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.guard()?;
        self.persistence.checkpoint(&self.db.read())?;
        self.engine.record_checkpoint();
        *self.last_checkpoint.lock() = Instant::now();
        Ok(())
    }

    /// Stop the tuner, persist everything, mark the store closed.
    pub fn close(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(()); // already closed
        }
        self.stop_tuner();
        let db = self.db.read();
        self.persistence.close(&db)?;
        drop(db);
        self.db.write().set_open(false);
        Ok(())
    }

    /// Close with a deadline on the final save. On overrun the store is
    /// marked closed and `Timeout` is returned; the detached writer keeps
    /// its own snapshot and the engine stays safely stoppable.
    pub fn close_within(&self, timeout: Duration) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_tuner();

        let snapshot = self.db.read().clone();
        let persistence = Arc::clone(&self.persistence);
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(persistence.close(&snapshot));
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => {
                self.db.write().set_open(false);
                result
            }
            Err(_) => {
                self.db.write().set_open(false);
                Err(DbError::Timeout(format!(
                    "close did not finish within {:?}",
                    timeout
                )))
            }
        }
    }

    fn stop_tuner(&self) {
        if let Some(mut tuner) = self.tuner.lock().take() {
            tuner.stop();
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn engine_stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn level_stats(&self) -> Vec<LevelStats> {
        self.engine.level_stats()
    }

    pub fn persistence_stats(&self) -> PersistenceStats {
        self.persistence.stats()
    }

    /// Bytes of WAL currently appended.
    pub fn wal_logical_size(&self) -> usize {
        self.persistence.wal_logical_size()
    }

    /// Sequence number the WAL will assign next.
    pub fn wal_sequence(&self) -> u64 {
        self.persistence.wal_sequence()
    }

    pub fn cache_engine(&self) -> &CacheEngine {
        &self.engine
    }

    pub fn table_names(&self) -> Vec<String> {
        self.db.read().table_names()
    }

    pub fn row_count(&self, name: &str) -> Result<usize> {
        self.db
            .read()
            .table(name)
            .map(|t| t.rows.len())
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn validate_foreign_keys(db: &Database, name: &str, values: &[Value]) -> Result<()> {
        let Some(table) = db.table(name) else {
            return Ok(());
        };
        for fk in db.foreign_keys(name) {
            let Some(idx) = table.column_index(&fk.column) else {
                continue;
            };
            let value = &values[idx];
            if value.is_null() {
                continue;
            }
            let found = db
                .find_by_column(&fk.referenced_table, &fk.referenced_column, value)
                .map_err(|_| {
                    DbError::Constraint(format!(
                        "foreign key {}.{} references missing table {}",
                        name, fk.column, fk.referenced_table
                    ))
                })?;
            if found.is_none() {
                return Err(DbError::Constraint(format!(
                    "foreign key {}.{}: no row in {}.{} equals {}",
                    name, fk.column, fk.referenced_table, fk.referenced_column, value
                )));
            }
        }
        Ok(())
    }

    /// Best-effort cache population; failures are logged, not surfaced.
    fn cache_put(&self, key: &CacheKey, bytes: Vec<u8>, pin: bool) {
        if let Err(e) = self.engine.put(key, bytes, pin) {
            warn!(key = ?key, error = %e, "cache population skipped");
        }
    }

    fn invalidate_queries(&self) {
        let removed = self.engine.invalidate_matching(&CacheKey::is_query);
        if removed > 0 {
            debug!(removed, "query cache invalidated");
        }
        self.query_times.lock().clear();
    }

    fn query_entry_expired(&self, hash: u64) -> bool {
        let ttl = Duration::from_secs(self.config.tune_interval_secs);
        self.query_times
            .lock()
            .get(&hash)
            .map(|at| at.elapsed() > ttl)
            .unwrap_or(false)
    }

    /// Stable hash of the normalized query shape.
    fn query_hash(name: &str, columns: &[String], condition: Option<&Condition>) -> u64 {
        let mut hasher = Fnv64::new();
        hasher.update(name.to_lowercase().as_bytes());
        hasher.update(&[0x1f]);
        for column in columns {
            hasher.update(column.to_lowercase().as_bytes());
            hasher.update(b",");
        }
        hasher.update(&[0x1f]);
        if let Some(cond) = condition {
            hasher.update(cond.column.to_lowercase().as_bytes());
            hasher.update(b"=");
            hasher.update(cond.value.to_string().as_bytes());
        }
        hasher.finish()
    }

    /// Checkpoint opportunistically once the configured interval has
    /// passed. Busy/failed checkpoints are logged and retried later.
    fn maybe_checkpoint(&self) {
        if !self.config.persistence_mode.checkpoint_enabled() {
            return;
        }
        let due = {
            let last = self.last_checkpoint.lock();
            last.elapsed() >= Duration::from_secs(self.config.checkpoint_interval_secs)
        };
        if !due {
            return;
        }
        match self.checkpoint() {
            Ok(()) => {}
            Err(DbError::Busy(_)) => {}
            Err(e) => warn!(error = %e, "periodic checkpoint failed"),
        }
    }
}

impl Drop for CachedStore {
    fn drop(&mut self) {
        self.stop_tuner();
    }
}
