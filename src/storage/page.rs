// Fixed-size data pages backing the page store in the main data file.
// Each page cell carries a checksum over its full data region.

use crate::common::{unix_time_secs, PageId};
use crate::error::{DbError, Result};
use crate::storage::checksum::fnv1a_32;

/// Size of a page's data region. Fixed by the file format.
pub const PAGE_SIZE: usize = 4096;

/// On-disk cell: checksum u32 | version u32 | data_len u32 | reserved u32 |
/// data[PAGE_SIZE].
pub const PAGE_CELL_SIZE: usize = 16 + PAGE_SIZE;

/// A fixed-size block of data plus its bookkeeping metadata.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,
    pub checksum: u32,
    pub version: u32,
    pub data_len: u32,
    pub last_modified: u64,
    pub dirty: bool,
    pub pinned: bool,
    pub ref_count: u32,
    pub data: Vec<u8>,
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            checksum: fnv1a_32(&[0u8; PAGE_SIZE]),
            version: 1,
            data_len: 0,
            last_modified: unix_time_secs(),
            dirty: false,
            pinned: false,
            ref_count: 0,
            data: vec![0u8; PAGE_SIZE],
        }
    }

    /// Replace the page's payload. Bumps the version, recomputes the
    /// checksum and marks the page dirty.
    pub fn write_data(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > PAGE_SIZE {
            return Err(DbError::EntryTooLarge(format!(
                "payload of {} bytes exceeds page size {}",
                payload.len(),
                PAGE_SIZE
            )));
        }
        self.data.fill(0);
        self.data[..payload.len()].copy_from_slice(payload);
        self.data_len = payload.len() as u32;
        self.version = self.version.wrapping_add(1);
        self.last_modified = unix_time_secs();
        self.checksum = fnv1a_32(&self.data);
        self.dirty = true;
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.data_len as usize]
    }

    /// Serialize into an on-disk cell.
    pub fn to_cell(&self) -> Vec<u8> {
        let mut cell = Vec::with_capacity(PAGE_CELL_SIZE);
        cell.extend_from_slice(&fnv1a_32(&self.data).to_le_bytes());
        cell.extend_from_slice(&self.version.to_le_bytes());
        cell.extend_from_slice(&self.data_len.to_le_bytes());
        cell.extend_from_slice(&0u32.to_le_bytes());
        cell.extend_from_slice(&self.data);
        cell
    }

    /// Decode an on-disk cell, validating the stored checksum against the
    /// data region.
    pub fn from_cell(id: PageId, cell: &[u8]) -> Result<Self> {
        if cell.len() != PAGE_CELL_SIZE {
            return Err(DbError::Corruption(format!(
                "page {} cell has {} bytes, expected {}",
                id,
                cell.len(),
                PAGE_CELL_SIZE
            )));
        }
        let checksum = u32::from_le_bytes(cell[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(cell[4..8].try_into().unwrap());
        let data_len = u32::from_le_bytes(cell[8..12].try_into().unwrap());
        let data = cell[16..].to_vec();
        if data_len as usize > PAGE_SIZE {
            return Err(DbError::Corruption(format!(
                "page {} declares data_len {}",
                id, data_len
            )));
        }
        let actual = fnv1a_32(&data);
        if actual != checksum {
            return Err(DbError::Corruption(format!(
                "page {} checksum mismatch: stored {:#010x}, computed {:#010x}",
                id, checksum, actual
            )));
        }
        Ok(Self {
            id,
            checksum,
            version,
            data_len,
            last_modified: unix_time_secs(),
            dirty: false,
            pinned: false,
            ref_count: 0,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_marks_dirty_and_bumps_version() {
        let mut page = Page::new(1);
        let v = page.version;
        page.write_data(b"hello").unwrap();
        assert!(page.dirty);
        assert_eq!(page.version, v + 1);
        assert_eq!(page.payload(), b"hello");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut page = Page::new(1);
        let big = vec![0u8; PAGE_SIZE + 1];
        assert!(matches!(
            page.write_data(&big),
            Err(DbError::EntryTooLarge(_))
        ));
    }

    #[test]
    fn test_cell_round_trip() {
        let mut page = Page::new(9);
        page.write_data(b"page payload").unwrap();
        let cell = page.to_cell();
        assert_eq!(cell.len(), PAGE_CELL_SIZE);
        let decoded = Page::from_cell(9, &cell).unwrap();
        assert_eq!(decoded.payload(), b"page payload");
        assert_eq!(decoded.version, page.version);
        assert!(!decoded.dirty);
    }

    #[test]
    fn test_corrupted_cell_detected() {
        let mut page = Page::new(3);
        page.write_data(b"data").unwrap();
        let mut cell = page.to_cell();
        cell[40] ^= 0xFF;
        assert!(matches!(
            Page::from_cell(3, &cell),
            Err(DbError::Corruption(_))
        ));
    }
}
