// # Write-Ahead Log
//
// Append-only, memory-mapped operation log. The file is preallocated at its
// configured maximum size and mapped once; appends write a fixed 100-byte
// entry header plus payload at the current offset and flush that range.
// Sequence numbers increase strictly from 1 within one file generation; a
// checkpoint resets the generation.
//
// Recovery scans from offset 0 and stops at the first entry whose header
// fails validation. Because truncation zeroes the head of the region and
// appends land contiguously, a crash-truncated tail always decodes as an
// invalid header (sequence 0) and terminates the scan.

use crate::common::{unix_time_secs, RowId, SequenceNumber, TransactionId, MAX_TABLE_NAME_LEN};
use crate::error::{DbError, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Fixed size of the on-disk entry header.
pub const WAL_ENTRY_HEADER_SIZE: usize = 100;

const NAME_FIELD: usize = 64;

// ============================================================================
// Entry Types
// ============================================================================

/// Operation kind recorded by a WAL entry, with its wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalEntryType {
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    CreateIndex,
    DropIndex,
    Checkpoint,
    Commit,
    Rollback,
}

impl WalEntryType {
    pub fn code(&self) -> u32 {
        match self {
            WalEntryType::Insert => 1,
            WalEntryType::Update => 2,
            WalEntryType::Delete => 3,
            WalEntryType::CreateTable => 4,
            WalEntryType::DropTable => 5,
            WalEntryType::CreateIndex => 6,
            WalEntryType::DropIndex => 7,
            WalEntryType::Checkpoint => 8,
            WalEntryType::Commit => 9,
            WalEntryType::Rollback => 10,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(WalEntryType::Insert),
            2 => Some(WalEntryType::Update),
            3 => Some(WalEntryType::Delete),
            4 => Some(WalEntryType::CreateTable),
            5 => Some(WalEntryType::DropTable),
            6 => Some(WalEntryType::CreateIndex),
            7 => Some(WalEntryType::DropIndex),
            8 => Some(WalEntryType::Checkpoint),
            9 => Some(WalEntryType::Commit),
            10 => Some(WalEntryType::Rollback),
            _ => None,
        }
    }
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub sequence: SequenceNumber,
    pub timestamp: u64,
    pub entry_type: WalEntryType,
    pub transaction_id: TransactionId,
    pub table_name: String,
    pub row_id: RowId,
    pub payload: Vec<u8>,
}

impl WalEntry {
    pub fn encoded_len(&self) -> usize {
        WAL_ENTRY_HEADER_SIZE + self.payload.len()
    }
}

// ============================================================================
// WAL
// ============================================================================

/// Memory-mapped write-ahead log. Not internally synchronized: the
/// persistence engine serializes access through its WAL mutex.
pub struct Wal {
    path: PathBuf,
    map: MmapMut,
    capacity: usize,
    offset: usize,
    next_sequence: SequenceNumber,
}

impl Wal {
    /// Open or create the log file, preallocate it to `capacity` bytes, map
    /// it and recover the append offset by scanning existing entries.
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        if capacity < WAL_ENTRY_HEADER_SIZE {
            return Err(DbError::InvalidConfig(format!(
                "WAL capacity {} is smaller than one entry header",
                capacity
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len != capacity as u64 {
            // Fresh file, or the configured size changed; preallocate. The
            // zero fill is what terminates recovery scans.
            file.set_len(capacity as u64)?;
        }
        // SAFETY: the file is open read-write and sized to `capacity`, so
        // the mapping covers fully allocated file space.
        let map = unsafe { MmapMut::map_mut(&file)? };

        let mut wal = Self {
            path: path.to_path_buf(),
            map,
            capacity,
            offset: 0,
            next_sequence: 1,
        };
        let entries = wal.entries()?;
        if let Some(last) = entries.last() {
            wal.next_sequence = last.sequence + 1;
            wal.offset = entries.iter().map(WalEntry::encoded_len).sum();
        }
        Ok(wal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of log currently appended (the file itself stays preallocated
    /// at its maximum size).
    pub fn logical_size(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number the next append will be assigned.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    /// Append one entry and flush its mapped range. Returns the assigned
    /// sequence number.
    pub fn append(
        &mut self,
        entry_type: WalEntryType,
        transaction_id: TransactionId,
        table_name: &str,
        row_id: RowId,
        payload: &[u8],
    ) -> Result<SequenceNumber> {
        if table_name.len() > MAX_TABLE_NAME_LEN {
            return Err(DbError::InvalidConfig(format!(
                "table name '{}' exceeds {} bytes",
                table_name, MAX_TABLE_NAME_LEN
            )));
        }
        let needed = WAL_ENTRY_HEADER_SIZE + payload.len();
        if self.offset + needed > self.capacity {
            return Err(DbError::WalFull(format!(
                "append of {} bytes exceeds WAL capacity {} at offset {}",
                needed, self.capacity, self.offset
            )));
        }

        let sequence = self.next_sequence;
        let timestamp = unix_time_secs();
        let base = self.offset;
        let buf = &mut self.map[base..base + needed];

        buf[0..8].copy_from_slice(&sequence.to_le_bytes());
        buf[8..16].copy_from_slice(&timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&entry_type.code().to_le_bytes());
        buf[20..24].copy_from_slice(&transaction_id.to_le_bytes());
        buf[24..28].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[28..28 + NAME_FIELD].fill(0);
        buf[28..28 + table_name.len()].copy_from_slice(table_name.as_bytes());
        buf[92..100].copy_from_slice(&row_id.to_le_bytes());
        buf[WAL_ENTRY_HEADER_SIZE..].copy_from_slice(payload);

        self.map
            .flush_range(base, needed)
            .map_err(|e| DbError::IoMsg(format!("WAL flush failed: {}", e)))?;

        self.offset += needed;
        self.next_sequence += 1;
        Ok(sequence)
    }

    /// Decode all valid entries from the head of the region. The scan stops
    /// at the first slot whose header does not validate.
    pub fn entries(&self) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        let mut last_sequence = 0u64;

        while offset + WAL_ENTRY_HEADER_SIZE <= self.capacity {
            let header = &self.map[offset..offset + WAL_ENTRY_HEADER_SIZE];
            let sequence = u64::from_le_bytes(header[0..8].try_into().unwrap());
            if sequence == 0 || sequence <= last_sequence {
                break;
            }
            let type_code = u32::from_le_bytes(header[16..20].try_into().unwrap());
            let entry_type = match WalEntryType::from_code(type_code) {
                Some(t) => t,
                None => break,
            };
            let payload_len =
                u32::from_le_bytes(header[24..28].try_into().unwrap()) as usize;
            if offset + WAL_ENTRY_HEADER_SIZE + payload_len > self.capacity {
                break;
            }
            let name_field = &header[28..28 + NAME_FIELD];
            let name_end = match name_field.iter().position(|&b| b == 0) {
                Some(end) => end,
                None => break,
            };
            let table_name = match std::str::from_utf8(&name_field[..name_end]) {
                Ok(s) => s.to_owned(),
                Err(_) => break,
            };

            let timestamp = u64::from_le_bytes(header[8..16].try_into().unwrap());
            let transaction_id = u32::from_le_bytes(header[20..24].try_into().unwrap());
            let row_id = u64::from_le_bytes(header[92..100].try_into().unwrap());
            let payload_start = offset + WAL_ENTRY_HEADER_SIZE;
            let payload = self.map[payload_start..payload_start + payload_len].to_vec();

            entries.push(WalEntry {
                sequence,
                timestamp,
                entry_type,
                transaction_id,
                table_name,
                row_id,
                payload,
            });
            last_sequence = sequence;
            offset += WAL_ENTRY_HEADER_SIZE + payload_len;
        }
        Ok(entries)
    }

    /// Checkpoint truncation: zero the used region, reset the offset and
    /// sequence to 1, and write a fresh `Checkpoint` marker as the sole
    /// entry of the new generation. Returns the marker's sequence number.
    pub fn reset(&mut self) -> Result<SequenceNumber> {
        let used = self.offset.max(WAL_ENTRY_HEADER_SIZE).min(self.capacity);
        self.map[..used].fill(0);
        self.map
            .flush_range(0, used)
            .map_err(|e| DbError::IoMsg(format!("WAL flush failed: {}", e)))?;
        self.offset = 0;
        self.next_sequence = 1;
        self.append(WalEntryType::Checkpoint, 0, "", 0, &[])
    }

    pub fn flush(&self) -> Result<()> {
        self.map
            .flush()
            .map_err(|e| DbError::IoMsg(format!("WAL flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CAP: usize = 64 * 1024;

    #[test]
    fn test_append_assigns_monotonic_sequences() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(&dir.path().join("wal.log"), CAP).unwrap();
        let s1 = wal
            .append(WalEntryType::Insert, 0, "users", 1, b"row-1")
            .unwrap();
        let s2 = wal
            .append(WalEntryType::Insert, 0, "users", 2, b"row-2")
            .unwrap();
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
        assert_eq!(wal.next_sequence(), 3);
        assert_eq!(
            wal.logical_size(),
            2 * (WAL_ENTRY_HEADER_SIZE + 5)
        );
    }

    #[test]
    fn test_entries_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path, CAP).unwrap();
        wal.append(WalEntryType::CreateTable, 0, "users", 0, b"schema")
            .unwrap();
        wal.append(WalEntryType::Insert, 7, "users", 3, b"payload")
            .unwrap();

        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_type, WalEntryType::CreateTable);
        assert_eq!(entries[1].transaction_id, 7);
        assert_eq!(entries[1].row_id, 3);
        assert_eq!(entries[1].payload, b"payload");
    }

    #[test]
    fn test_reopen_recovers_offset_and_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path, CAP).unwrap();
            for i in 0..5 {
                wal.append(WalEntryType::Insert, 0, "t", i, b"x").unwrap();
            }
            // Dropped without any explicit close: simulated crash.
        }
        let mut wal = Wal::open(&path, CAP).unwrap();
        assert_eq!(wal.entries().unwrap().len(), 5);
        assert_eq!(wal.next_sequence(), 6);
        let seq = wal.append(WalEntryType::Insert, 0, "t", 9, b"y").unwrap();
        assert_eq!(seq, 6);
    }

    #[test]
    fn test_scan_stops_at_corrupted_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path, CAP).unwrap();
        wal.append(WalEntryType::Insert, 0, "t", 1, b"ok").unwrap();
        let second = wal.append(WalEntryType::Insert, 0, "t", 2, b"gone").unwrap();
        assert_eq!(second, 2);

        // Tear the second entry's header: garbage type code.
        let torn_at = WAL_ENTRY_HEADER_SIZE + 2;
        wal.map[torn_at + 16..torn_at + 20].copy_from_slice(&999u32.to_le_bytes());
        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].row_id, 1);
    }

    #[test]
    fn test_reset_leaves_single_checkpoint_marker() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(&dir.path().join("wal.log"), CAP).unwrap();
        for i in 0..10 {
            wal.append(WalEntryType::Insert, 0, "t", i, b"payload").unwrap();
        }
        let marker_seq = wal.reset().unwrap();
        assert_eq!(marker_seq, 1);
        assert_eq!(wal.logical_size(), WAL_ENTRY_HEADER_SIZE);

        let entries = wal.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, WalEntryType::Checkpoint);
        assert_eq!(wal.next_sequence(), 2);
    }

    #[test]
    fn test_wal_full() {
        let dir = tempdir().unwrap();
        let cap = WAL_ENTRY_HEADER_SIZE + 8;
        let mut wal = Wal::open(&dir.path().join("wal.log"), cap).unwrap();
        wal.append(WalEntryType::Insert, 0, "t", 1, b"12345678").unwrap();
        let err = wal
            .append(WalEntryType::Insert, 0, "t", 2, b"")
            .unwrap_err();
        assert!(matches!(err, DbError::WalFull(_)));
    }

    #[test]
    fn test_long_table_name_rejected() {
        let dir = tempdir().unwrap();
        let mut wal = Wal::open(&dir.path().join("wal.log"), CAP).unwrap();
        let name = "n".repeat(64);
        let err = wal
            .append(WalEntryType::Insert, 0, &name, 1, b"")
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidConfig(_)));
    }
}
