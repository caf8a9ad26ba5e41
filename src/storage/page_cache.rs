// # Page Cache
//
// Bounded LRU cache of fixed-size pages over the main data file.
// Read-through on miss with checksum validation; dirty pages are written
// back on eviction and on flush. One mutex guards the page map, the
// recency list and the statistics.

use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::storage::page::{Page, PAGE_CELL_SIZE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

struct PageCacheInner {
    pages: HashMap<PageId, Page>,
    recency: VecDeque<PageId>,
    stats: PageCacheStats,
}

/// Bounded LRU page cache with read-through over the data file.
pub struct PageCache {
    file: Arc<Mutex<File>>,
    /// File offset of page cell 0 (the region after the header).
    base_offset: u64,
    capacity: usize,
    inner: Mutex<PageCacheInner>,
}

impl PageCache {
    pub fn new(file: Arc<Mutex<File>>, base_offset: u64, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DbError::InvalidConfig(
                "page cache capacity must be at least 1 page".to_string(),
            ));
        }
        Ok(Self {
            file,
            base_offset,
            capacity,
            inner: Mutex::new(PageCacheInner {
                pages: HashMap::with_capacity(capacity),
                recency: VecDeque::with_capacity(capacity),
                stats: PageCacheStats::default(),
            }),
        })
    }

    fn cell_offset(&self, id: PageId) -> u64 {
        self.base_offset + id * PAGE_CELL_SIZE as u64
    }

    fn touch(inner: &mut PageCacheInner, id: PageId) {
        if let Some(pos) = inner.recency.iter().position(|&p| p == id) {
            inner.recency.remove(pos);
        }
        inner.recency.push_back(id);
    }

    fn write_cell(&self, page: &Page) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.cell_offset(page.id)))?;
        file.write_all(&page.to_cell())?;
        Ok(())
    }

    fn read_cell(&self, id: PageId) -> Result<Page> {
        let mut cell = vec![0u8; PAGE_CELL_SIZE];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.cell_offset(id)))?;
        file.read_exact(&mut cell).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DbError::NotFound(format!("page {} is beyond the end of the data file", id))
            } else {
                DbError::Io(e)
            }
        })?;
        Page::from_cell(id, &cell)
    }

    /// Make room for one more page, writing back dirty victims. Pinned
    /// pages are skipped.
    fn evict_for_space(&self, inner: &mut PageCacheInner) -> Result<()> {
        while inner.pages.len() >= self.capacity {
            let mut victim = None;
            for (pos, &candidate) in inner.recency.iter().enumerate() {
                let pinned = inner
                    .pages
                    .get(&candidate)
                    .map(|p| p.pinned || p.ref_count > 0)
                    .unwrap_or(false);
                if !pinned {
                    victim = Some((pos, candidate));
                    break;
                }
            }
            let Some((pos, id)) = victim else {
                return Err(DbError::EvictionBlocked(
                    "all cached pages are pinned".to_string(),
                ));
            };
            inner.recency.remove(pos);
            if let Some(page) = inner.pages.remove(&id) {
                if page.dirty {
                    self.write_cell(&page)?;
                    inner.stats.write_backs += 1;
                }
                inner.stats.evictions += 1;
            }
        }
        Ok(())
    }

    /// Fetch a page, reading through to the data file on miss.
    pub fn read_page(&self, id: PageId) -> Result<Page> {
        let mut inner = self.inner.lock();
        if let Some(page) = inner.pages.get(&id).cloned() {
            inner.stats.hits += 1;
            Self::touch(&mut inner, id);
            return Ok(page);
        }
        inner.stats.misses += 1;
        let page = self.read_cell(id)?;
        self.evict_for_space(&mut inner)?;
        inner.pages.insert(id, page.clone());
        Self::touch(&mut inner, id);
        Ok(page)
    }

    /// Install a (dirty) page in the cache. It reaches the file on flush or
    /// when evicted.
    pub fn write_page(&self, mut page: Page) -> Result<()> {
        page.dirty = true;
        let mut inner = self.inner.lock();
        let id = page.id;
        if !inner.pages.contains_key(&id) {
            self.evict_for_space(&mut inner)?;
        }
        inner.pages.insert(id, page);
        Self::touch(&mut inner, id);
        Ok(())
    }

    pub fn pin_page(&self, id: PageId, pinned: bool) {
        let mut inner = self.inner.lock();
        if let Some(page) = inner.pages.get_mut(&id) {
            page.pinned = pinned;
        }
    }

    /// Write every dirty page back to the data file.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut dirty_ids: Vec<PageId> = inner
            .pages
            .values()
            .filter(|p| p.dirty)
            .map(|p| p.id)
            .collect();
        // Sequential writes.
        dirty_ids.sort_unstable();
        for id in dirty_ids {
            let Some(page) = inner.pages.get(&id).cloned() else {
                continue;
            };
            self.write_cell(&page)?;
            inner.stats.write_backs += 1;
            if let Some(p) = inner.pages.get_mut(&id) {
                p.dirty = false;
            }
        }
        Ok(())
    }

    /// Drop all cached pages without writing them back.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.pages.clear();
        inner.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PageCacheStats {
        self.inner.lock().stats.clone()
    }
}
