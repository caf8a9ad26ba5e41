// # Storage Layer
//
// Crash-recoverable persistence for the in-memory database:
//
// - `checksum`: FNV-1a hashing shared by the header, pages and cache keys
// - `serial`: hand-encoded binary layouts for values, rows, tables and
//   foreign keys
// - `wal`: memory-mapped append-only operation log
// - `page` / `page_cache`: fixed-size page store with a bounded LRU cache
// - `persist`: the engine composing header, WAL, pages and table files

pub mod checksum;
pub mod page;
pub mod page_cache;
pub mod persist;
pub mod serial;
pub mod wal;

pub use page::{Page, PAGE_SIZE};
pub use page_cache::PageCache;
pub use persist::{PersistenceConfig, PersistenceEngine, PersistenceMode, PersistentHeader};
pub use wal::{Wal, WalEntry, WalEntryType};
