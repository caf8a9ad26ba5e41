// # Persistence Engine
//
// Makes the in-memory database survive process restart. Owns the data
// directory: a header + page store (`database.rdb`), the memory-mapped WAL
// (`wal.log`), one whole-file image per table (`table_<name>.rdb`) and the
// concatenated foreign-key records (`foreign_keys.rdb`).
//
// Lock layout: one reader-writer lock serializes save/open, a dedicated
// mutex guards WAL appends, and a separate checkpoint mutex enforces a
// single checkpoint in progress (`Busy` when contended).
//
// Save ordering is crash-aware: pages first, then table files (written to a
// temp file and renamed), the header last. A crash mid-save leaves the old
// header pointing at a consistent previous layout.

use crate::common::{unix_time_secs, Database, PageId, RowId, SequenceNumber, TransactionId};
use crate::error::{DbError, Result};
use crate::storage::checksum::fnv1a_32;
use crate::storage::page::{Page, PAGE_SIZE};
use crate::storage::page_cache::{PageCache, PageCacheStats};
use crate::storage::serial;
use crate::storage::wal::{Wal, WalEntry, WalEntryType};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes opening the data file header.
pub const MAGIC: &[u8; 16] = b"FI_RDB_PERSIST\0\0";

/// Fixed size of the data file header.
pub const HEADER_SIZE: usize = 512;

/// Header format version.
pub const HEADER_VERSION: u32 = 1;

const DATA_FILE: &str = "database.rdb";
const WAL_FILE: &str = "wal.log";
const FOREIGN_KEY_FILE: &str = "foreign_keys.rdb";
const TABLE_FILE_PREFIX: &str = "table_";
const TABLE_FILE_SUFFIX: &str = ".rdb";

// ============================================================================
// Header
// ============================================================================

/// Decoded 512-byte data file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentHeader {
    pub version: u32,
    pub created_time: u64,
    pub last_checkpoint: u64,
    pub next_page_id: u64,
    pub total_pages: u64,
    pub wal_sequence: u64,
    pub table_count: u32,
}

impl PersistentHeader {
    pub fn new() -> Self {
        Self {
            version: HEADER_VERSION,
            created_time: unix_time_secs(),
            last_checkpoint: 0,
            next_page_id: 0,
            total_pages: 0,
            wal_sequence: 1,
            table_count: 0,
        }
    }

    /// Serialize to the fixed 512-byte layout. The checksum is FNV-1a over
    /// everything before the checksum field.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0..16].copy_from_slice(MAGIC);
        buf[16..20].copy_from_slice(&self.version.to_le_bytes());
        buf[20..28].copy_from_slice(&self.created_time.to_le_bytes());
        buf[28..36].copy_from_slice(&self.last_checkpoint.to_le_bytes());
        buf[36..44].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf[44..52].copy_from_slice(&self.total_pages.to_le_bytes());
        buf[52..60].copy_from_slice(&self.wal_sequence.to_le_bytes());
        buf[60..64].copy_from_slice(&self.table_count.to_le_bytes());
        let checksum = fnv1a_32(&buf[0..64]);
        buf[64..68].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(DbError::Corruption(format!(
                "header is {} bytes, expected {}",
                buf.len(),
                HEADER_SIZE
            )));
        }
        if &buf[0..16] != MAGIC {
            return Err(DbError::Corruption(
                "bad magic in data file header".to_string(),
            ));
        }
        let version = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        if version != HEADER_VERSION {
            return Err(DbError::Corruption(format!(
                "unsupported header version {}",
                version
            )));
        }
        let stored = u32::from_le_bytes(buf[64..68].try_into().unwrap());
        let computed = fnv1a_32(&buf[0..64]);
        if stored != computed {
            return Err(DbError::Corruption(format!(
                "header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }
        Ok(Self {
            version,
            created_time: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            last_checkpoint: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
            next_page_id: u64::from_le_bytes(buf[36..44].try_into().unwrap()),
            total_pages: u64::from_le_bytes(buf[44..52].try_into().unwrap()),
            wal_sequence: u64::from_le_bytes(buf[52..60].try_into().unwrap()),
            table_count: u32::from_le_bytes(buf[60..64].try_into().unwrap()),
        })
    }
}

impl Default for PersistentHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Modes, Metadata, Config
// ============================================================================

/// What the engine persists and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceMode {
    MemoryOnly,
    WalOnly,
    CheckpointOnly,
    Full,
}

impl PersistenceMode {
    pub fn wal_enabled(&self) -> bool {
        matches!(self, PersistenceMode::WalOnly | PersistenceMode::Full)
    }

    pub fn checkpoint_enabled(&self) -> bool {
        matches!(self, PersistenceMode::CheckpointOnly | PersistenceMode::Full)
    }

    pub fn disk_enabled(&self) -> bool {
        !matches!(self, PersistenceMode::MemoryOnly)
    }
}

/// Per-table bookkeeping for the page store. Rebuilt deterministically at
/// every save (tables in name order, pages allocated densely from 0), so a
/// restart reconstructs the same mapping from the table files alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub first_page: PageId,
    pub last_page: PageId,
    pub row_count: u64,
    pub total_pages: u64,
    pub created_time: u64,
    pub modified_time: u64,
    pub compressed: bool,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    pub mode: PersistenceMode,
    pub max_wal_size: usize,
    pub page_cache_capacity: usize,
    /// Read every allocated page back through the cache on open, surfacing
    /// torn pages as `Corruption` before the database is used.
    pub verify_pages_on_open: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./rdb_data"),
            mode: PersistenceMode::Full,
            max_wal_size: 16 * 1024 * 1024,
            page_cache_capacity: 256,
            verify_pages_on_open: true,
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_wal_size == 0 {
            return Err(DbError::InvalidConfig(
                "max_wal_size must be positive".to_string(),
            ));
        }
        if self.page_cache_capacity == 0 {
            return Err(DbError::InvalidConfig(
                "page_cache_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceStats {
    pub saves: u64,
    pub checkpoints: u64,
    pub wal_appends: u64,
    pub replayed_entries: u64,
}

// ============================================================================
// Engine
// ============================================================================

struct DiskState {
    file: Arc<Mutex<File>>,
    header: RwLock<PersistentHeader>,
    page_cache: PageCache,
    wal: Option<Mutex<Wal>>,
}

/// Crash-recoverable persistence for a [`Database`].
pub struct PersistenceEngine {
    config: PersistenceConfig,
    disk: Option<DiskState>,
    io_lock: RwLock<()>,
    checkpoint_lock: Mutex<()>,
    tables: RwLock<HashMap<String, TableMetadata>>,
    stats: Mutex<PersistenceStats>,
}

impl std::fmt::Debug for PersistenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceEngine").field("config", &self.config).finish_non_exhaustive()
    }
}

impl PersistenceEngine {
    /// Create the data directory and open (or create) the data file, WAL
    /// and page cache. Validates magic and header checksum of an existing
    /// file; a mismatch is fatal.
    pub fn new(config: PersistenceConfig) -> Result<Self> {
        config.validate()?;

        let disk = if config.mode.disk_enabled() {
            std::fs::create_dir_all(&config.data_dir)?;
            let data_path = config.data_dir.join(DATA_FILE);
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&data_path)?;

            let len = file.metadata()?.len();
            let header = if len == 0 {
                let header = PersistentHeader::new();
                file.write_all(&header.encode())?;
                file.sync_data()?;
                header
            } else {
                let mut buf = vec![0u8; HEADER_SIZE];
                file.seek(SeekFrom::Start(0))?;
                file.read_exact(&mut buf).map_err(|e| {
                    DbError::Corruption(format!("data file header unreadable: {}", e))
                })?;
                PersistentHeader::decode(&buf)?
            };

            let file = Arc::new(Mutex::new(file));
            let page_cache = PageCache::new(
                Arc::clone(&file),
                HEADER_SIZE as u64,
                config.page_cache_capacity,
            )?;

            let wal = if config.mode.wal_enabled() {
                Some(Mutex::new(Wal::open(
                    &config.data_dir.join(WAL_FILE),
                    config.max_wal_size,
                )?))
            } else {
                None
            };

            Some(DiskState {
                file,
                header: RwLock::new(header),
                page_cache,
                wal,
            })
        } else {
            None
        };

        Ok(Self {
            config,
            disk,
            io_lock: RwLock::new(()),
            checkpoint_lock: Mutex::new(()),
            tables: RwLock::new(HashMap::new()),
            stats: Mutex::new(PersistenceStats::default()),
        })
    }

    pub fn mode(&self) -> PersistenceMode {
        self.config.mode
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn header(&self) -> PersistentHeader {
        self.disk
            .as_ref()
            .map(|d| d.header.read().clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> PersistenceStats {
        self.stats.lock().clone()
    }

    pub fn page_cache_stats(&self) -> PageCacheStats {
        self.disk
            .as_ref()
            .map(|d| d.page_cache.stats())
            .unwrap_or_default()
    }

    pub fn table_metadata(&self, name: &str) -> Option<TableMetadata> {
        self.tables.read().get(name).cloned()
    }

    /// Sequence number the WAL will assign next (0 without a WAL).
    pub fn wal_sequence(&self) -> SequenceNumber {
        self.with_wal(|wal| wal.next_sequence()).unwrap_or(0)
    }

    /// Bytes of WAL currently appended (0 without a WAL).
    pub fn wal_logical_size(&self) -> usize {
        self.with_wal(|wal| wal.logical_size()).unwrap_or(0)
    }

    fn with_wal<T>(&self, f: impl FnOnce(&mut Wal) -> T) -> Option<T> {
        let disk = self.disk.as_ref()?;
        let wal = disk.wal.as_ref()?;
        Some(f(&mut wal.lock()))
    }

    fn table_file_path(&self, name: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}{}{}", TABLE_FILE_PREFIX, name, TABLE_FILE_SUFFIX))
    }

    // ------------------------------------------------------------------
    // WAL append
    // ------------------------------------------------------------------

    /// Append one operation to the WAL and return its sequence number.
    /// A no-op returning 0 when the mode has no WAL.
    pub fn append(
        &self,
        entry_type: WalEntryType,
        transaction_id: TransactionId,
        table_name: &str,
        row_id: RowId,
        payload: &[u8],
    ) -> Result<SequenceNumber> {
        match self.with_wal(|wal| {
            wal.append(entry_type, transaction_id, table_name, row_id, payload)
        }) {
            None => Ok(0),
            Some(result) => {
                let seq = result?;
                self.stats.lock().wal_appends += 1;
                Ok(seq)
            }
        }
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    /// Persist the full database state: page store, per-table files,
    /// foreign keys, then the header. Does not touch the WAL.
    pub fn save(&self, db: &Database) -> Result<()> {
        let Some(disk) = self.disk.as_ref() else {
            return Ok(());
        };
        let _guard = self.io_lock.write();

        let names = db.table_names();
        let mut images = Vec::with_capacity(names.len());
        for name in &names {
            let Some(table) = db.table(name) else {
                continue;
            };
            images.push((name.clone(), serial::encode_table(table)?, table.rows.len() as u64));
        }

        // Deterministic page layout: tables in name order, pages dense
        // from 0. A restart rebuilds the identical assignment.
        let mut metadata = HashMap::with_capacity(images.len());
        let mut cursor: PageId = 0;
        let now = unix_time_secs();
        for (name, bytes, row_count) in &images {
            let first = cursor;
            for chunk in bytes.chunks(PAGE_SIZE) {
                let mut page = Page::new(cursor);
                page.write_data(chunk)?;
                disk.page_cache.write_page(page)?;
                cursor += 1;
            }
            let pages = cursor - first;
            let created = self
                .tables
                .read()
                .get(name)
                .map(|m| m.created_time)
                .unwrap_or(now);
            metadata.insert(
                name.clone(),
                TableMetadata {
                    name: name.clone(),
                    first_page: first,
                    last_page: cursor.saturating_sub(1),
                    row_count: *row_count,
                    total_pages: pages,
                    created_time: created,
                    modified_time: now,
                    compressed: false,
                },
            );
        }
        disk.page_cache.flush()?;

        // Whole-file table images, written atomically via temp + rename.
        for (name, bytes, _) in &images {
            let tmp = self.config.data_dir.join(format!(".{}.tmp", name));
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, self.table_file_path(name))?;
        }
        self.remove_stale_table_files(&names)?;

        let mut fk_bytes = Vec::new();
        for fk in db.all_foreign_keys() {
            fk_bytes.extend_from_slice(&serial::encode_foreign_key(&fk)?);
        }
        let fk_tmp = self.config.data_dir.join(".foreign_keys.tmp");
        std::fs::write(&fk_tmp, &fk_bytes)?;
        std::fs::rename(&fk_tmp, self.config.data_dir.join(FOREIGN_KEY_FILE))?;

        // Header last, so a crash above leaves the old header valid.
        {
            let mut header = disk.header.write();
            header.next_page_id = cursor;
            header.total_pages = cursor;
            header.table_count = names.len() as u32;
            header.wal_sequence = self.wal_sequence().max(1);
            self.write_header(disk, &header)?;
        }

        *self.tables.write() = metadata;
        self.stats.lock().saves += 1;
        debug!(tables = names.len(), pages = cursor, "database saved");
        Ok(())
    }

    fn write_header(&self, disk: &DiskState, header: &PersistentHeader) -> Result<()> {
        let mut file = disk.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_data()?;
        Ok(())
    }

    fn remove_stale_table_files(&self, live: &[String]) -> Result<()> {
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(table) = table_name_from_file(name) {
                if !live.iter().any(|n| n == table) {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------

    /// Load the persisted state into `db`: table files, foreign keys, then
    /// forward WAL replay past the last checkpoint marker.
    pub fn open(&self, db: &mut Database) -> Result<()> {
        let Some(disk) = self.disk.as_ref() else {
            db.set_open(true);
            return Ok(());
        };
        let _guard = self.io_lock.write();

        let mut images = Vec::new();
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if table_name_from_file(name).is_none() {
                continue;
            }
            let bytes = std::fs::read(entry.path())?;
            let table = serial::decode_table(&bytes).map_err(|e| {
                DbError::Corruption(format!("table file {} unreadable: {}", name, e))
            })?;
            images.push((table.name.clone(), bytes.len(), table.rows.len() as u64));
            db.create_table(table);
        }
        images.sort_by(|a, b| a.0.cmp(&b.0));

        let fk_path = self.config.data_dir.join(FOREIGN_KEY_FILE);
        if fk_path.exists() {
            let bytes = std::fs::read(&fk_path)?;
            for fk in serial::decode_foreign_keys(&bytes)? {
                db.add_foreign_key(fk);
            }
        }

        self.rebuild_metadata(&images);
        if self.config.verify_pages_on_open {
            self.verify_pages(disk)?;
        }

        let replayed = self.replay_wal(db)?;
        if replayed > 0 {
            info!(entries = replayed, "WAL replay complete");
        }
        self.stats.lock().replayed_entries += replayed;
        db.set_open(true);
        Ok(())
    }

    /// Recompute the deterministic page assignment from the table images on
    /// disk (same order and chunking as `save`).
    fn rebuild_metadata(&self, images: &[(String, usize, u64)]) {
        let now = unix_time_secs();
        let mut metadata = HashMap::with_capacity(images.len());
        let mut cursor: PageId = 0;
        for (name, len, row_count) in images {
            let pages = len.div_ceil(PAGE_SIZE) as u64;
            metadata.insert(
                name.clone(),
                TableMetadata {
                    name: name.clone(),
                    first_page: cursor,
                    last_page: cursor + pages.saturating_sub(1),
                    row_count: *row_count,
                    total_pages: pages,
                    created_time: now,
                    modified_time: now,
                    compressed: false,
                },
            );
            cursor += pages;
        }
        *self.tables.write() = metadata;
    }

    fn verify_pages(&self, disk: &DiskState) -> Result<()> {
        let total = disk.header.read().total_pages;
        for id in 0..total {
            disk.page_cache.read_page(id).map_err(|e| match e {
                DbError::NotFound(msg) => DbError::Corruption(msg),
                other => other,
            })?;
        }
        Ok(())
    }

    /// Apply WAL entries recorded after the last checkpoint marker. Entries
    /// at or before the marker were materialized by the save that preceded
    /// it and are already present in the loaded table files.
    fn replay_wal(&self, db: &mut Database) -> Result<u64> {
        let entries = match self.with_wal(|wal| wal.entries()) {
            None => return Ok(0),
            Some(result) => result?,
        };
        let start = entries
            .iter()
            .rposition(|e| e.entry_type == WalEntryType::Checkpoint)
            .map(|pos| pos + 1)
            .unwrap_or(0);

        let mut applied = 0u64;
        for entry in &entries[start..] {
            self.apply_entry(db, entry)?;
            applied += 1;
        }
        Ok(applied)
    }

    fn apply_entry(&self, db: &mut Database, entry: &WalEntry) -> Result<()> {
        match entry.entry_type {
            WalEntryType::Insert => {
                let row = serial::decode_row_bytes(&entry.payload)?;
                if db.contains_table(&entry.table_name) {
                    db.insert_row(&entry.table_name, row)?;
                } else {
                    warn!(table = %entry.table_name, "replayed insert for missing table");
                }
            }
            WalEntryType::Update => {
                let row = serial::decode_row_bytes(&entry.payload)?;
                if db.contains_table(&entry.table_name) {
                    db.update_row(&entry.table_name, row)?;
                }
            }
            WalEntryType::Delete => {
                if db.contains_table(&entry.table_name) {
                    db.delete_row(&entry.table_name, entry.row_id)?;
                }
            }
            WalEntryType::CreateTable => {
                let table = serial::decode_table(&entry.payload)?;
                db.create_table(table);
            }
            WalEntryType::DropTable => {
                db.drop_table(&entry.table_name);
            }
            WalEntryType::CreateIndex
            | WalEntryType::DropIndex
            | WalEntryType::Commit
            | WalEntryType::Rollback => {
                debug!(entry_type = ?entry.entry_type, "skipping non-materialized entry");
            }
            WalEntryType::Checkpoint => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpoint / Close
    // ------------------------------------------------------------------

    /// Save the database, then truncate the WAL down to a single fresh
    /// `Checkpoint` marker. Rejected with `Busy` while another checkpoint
    /// is running.
    pub fn checkpoint(&self, db: &Database) -> Result<()> {
        let Some(disk) = self.disk.as_ref() else {
            return Ok(());
        };
        let Some(_guard) = self.checkpoint_lock.try_lock() else {
            return Err(DbError::Busy("checkpoint already in progress".to_string()));
        };

        self.save(db)?;

        if let Some(result) = self.with_wal(|wal| wal.reset()) {
            result?;
        }

        {
            let mut header = disk.header.write();
            header.last_checkpoint = unix_time_secs();
            header.wal_sequence = self.wal_sequence().max(1);
            self.write_header(disk, &header)?;
        }
        self.stats.lock().checkpoints += 1;
        info!("checkpoint complete");
        Ok(())
    }

    /// Final save, plus a checkpoint when the mode takes them.
    pub fn close(&self, db: &Database) -> Result<()> {
        self.save(db)?;
        if self.config.mode.checkpoint_enabled() {
            self.checkpoint(db)?;
        }
        Ok(())
    }
}

fn table_name_from_file(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(TABLE_FILE_PREFIX)?
        .strip_suffix(TABLE_FILE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ColumnDef, DataType, Row, Table, Value};
    use tempfile::tempdir;

    fn config(dir: &Path, mode: PersistenceMode) -> PersistenceConfig {
        PersistenceConfig {
            data_dir: dir.to_path_buf(),
            mode,
            max_wal_size: 1024 * 1024,
            page_cache_capacity: 16,
            verify_pages_on_open: true,
        }
    }

    fn seeded_db() -> Database {
        let mut db = Database::new();
        db.create_table(Table::new(
            "users",
            vec![
                ColumnDef::new("id", DataType::Int).primary_key(),
                ColumnDef::new("name", DataType::Varchar).max_length(64),
            ],
        ));
        db.insert_row(
            "users",
            Row::new(1, vec![Value::Int(1), Value::Varchar("Alice".into())]),
        )
        .unwrap();
        db.insert_row(
            "users",
            Row::new(2, vec![Value::Int(2), Value::Varchar("Bob".into())]),
        )
        .unwrap();
        db
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = PersistentHeader::new();
        header.table_count = 3;
        header.total_pages = 17;
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(PersistentHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_corruption_detected() {
        let header = PersistentHeader::new();
        let mut bytes = header.encode();
        bytes[20] ^= 0xFF;
        assert!(matches!(
            PersistentHeader::decode(&bytes),
            Err(DbError::Corruption(_))
        ));

        let mut bad_magic = header.encode();
        bad_magic[0] = b'X';
        assert!(matches!(
            PersistentHeader::decode(&bad_magic),
            Err(DbError::Corruption(_))
        ));
    }

    #[test]
    fn test_save_then_open_round_trip() {
        let dir = tempdir().unwrap();
        let db = seeded_db();
        {
            let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
            engine.save(&db).unwrap();
        }

        let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let mut restored = Database::new();
        engine.open(&mut restored).unwrap();
        assert!(restored.is_open());
        let users = restored.table("users").unwrap();
        assert_eq!(users.rows.len(), 2);
        assert_eq!(users.rows[0].values[1], Value::Varchar("Alice".into()));
        assert_eq!(users.rows[1].values[1], Value::Varchar("Bob".into()));
    }

    #[test]
    fn test_wal_replay_after_crash() {
        let dir = tempdir().unwrap();
        {
            let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
            let mut db = Database::new();
            let table = Table::new("t", vec![ColumnDef::new("n", DataType::Int)]);
            engine
                .append(
                    WalEntryType::CreateTable,
                    0,
                    "t",
                    0,
                    &serial::encode_table(&table).unwrap(),
                )
                .unwrap();
            db.create_table(table);
            for i in 0..10 {
                let row = Row::new(i + 1, vec![Value::Int(i as i64)]);
                engine
                    .append(
                        WalEntryType::Insert,
                        0,
                        "t",
                        row.id,
                        &serial::encode_row_bytes(&row),
                    )
                    .unwrap();
                db.insert_row("t", row).unwrap();
            }
            // Engine dropped without save or close: simulated crash.
        }

        let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let seq_before_open = engine.wal_sequence();
        let mut db = Database::new();
        engine.open(&mut db).unwrap();
        assert_eq!(db.table("t").unwrap().rows.len(), 10);
        // 1 create + 10 inserts already appended.
        assert_eq!(seq_before_open, 12);
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let dir = tempdir().unwrap();
        let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let mut db = Database::new();
        let table = Table::new("t", vec![ColumnDef::new("n", DataType::Int)]);
        db.create_table(table);
        for i in 0..100 {
            let row = Row::new(i + 1, vec![Value::Int(i as i64)]);
            engine
                .append(
                    WalEntryType::Insert,
                    0,
                    "t",
                    row.id,
                    &serial::encode_row_bytes(&row),
                )
                .unwrap();
            db.insert_row("t", row).unwrap();
        }

        engine.checkpoint(&db).unwrap();
        assert_eq!(
            engine.wal_logical_size(),
            crate::storage::wal::WAL_ENTRY_HEADER_SIZE
        );
        // Marker took sequence 1; the next append gets 2.
        assert_eq!(engine.wal_sequence(), 2);

        // Reopen needs no replay: the marker is the last (and only) entry.
        let engine2 = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let mut restored = Database::new();
        engine2.open(&mut restored).unwrap();
        assert_eq!(restored.table("t").unwrap().rows.len(), 100);
        assert_eq!(engine2.stats().replayed_entries, 0);
    }

    #[test]
    fn test_post_checkpoint_traffic_replays() {
        let dir = tempdir().unwrap();
        let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let mut db = Database::new();
        db.create_table(Table::new("t", vec![ColumnDef::new("n", DataType::Int)]));
        engine.checkpoint(&db).unwrap();

        // Mutations after the checkpoint, then a crash.
        let row = Row::new(1, vec![Value::Int(7)]);
        engine
            .append(
                WalEntryType::Insert,
                0,
                "t",
                1,
                &serial::encode_row_bytes(&row),
            )
            .unwrap();
        db.insert_row("t", row).unwrap();
        drop(engine);

        let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let mut restored = Database::new();
        engine.open(&mut restored).unwrap();
        assert_eq!(restored.table("t").unwrap().rows.len(), 1);
        assert_eq!(engine.stats().replayed_entries, 1);
    }

    #[test]
    fn test_corrupted_header_fails_open() {
        let dir = tempdir().unwrap();
        {
            let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
            engine.save(&seeded_db()).unwrap();
        }
        // Flip a byte inside the covered header range.
        let path = dir.path().join(DATA_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[40] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap_err();
        assert!(matches!(err, DbError::Corruption(_)));
    }

    #[test]
    fn test_drop_table_removes_file_on_save() {
        let dir = tempdir().unwrap();
        let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let mut db = seeded_db();
        engine.save(&db).unwrap();
        assert!(dir.path().join("table_users.rdb").exists());

        db.drop_table("users");
        engine.save(&db).unwrap();
        assert!(!dir.path().join("table_users.rdb").exists());
    }

    #[test]
    fn test_memory_only_touches_no_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested");
        let engine =
            PersistenceEngine::new(config(&path, PersistenceMode::MemoryOnly)).unwrap();
        let db = seeded_db();
        engine.save(&db).unwrap();
        engine.checkpoint(&db).unwrap();
        assert_eq!(engine.append(WalEntryType::Insert, 0, "t", 1, b"x").unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_checkpoint_is_busy() {
        let dir = tempdir().unwrap();
        let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let db = seeded_db();

        let _in_progress = engine.checkpoint_lock.lock();
        let err = engine.checkpoint(&db).unwrap_err();
        assert!(matches!(err, DbError::Busy(_)));
        drop(_in_progress);

        // The flag is clear again; a retry goes through.
        engine.checkpoint(&db).unwrap();
    }

    #[test]
    fn test_metadata_assignment_is_deterministic() {
        let dir = tempdir().unwrap();
        let engine = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let db = seeded_db();
        engine.save(&db).unwrap();
        let before = engine.table_metadata("users").unwrap();

        let engine2 = PersistenceEngine::new(config(dir.path(), PersistenceMode::Full)).unwrap();
        let mut restored = Database::new();
        engine2.open(&mut restored).unwrap();
        let after = engine2.table_metadata("users").unwrap();
        assert_eq!(before.first_page, after.first_page);
        assert_eq!(before.total_pages, after.total_pages);
        assert_eq!(before.row_count, after.row_count);
    }
}
