// # Cached Store
//
// The façade that ties the pieces together: table, row and query
// operations flow through the tiered cache, writes go WAL-first into the
// in-memory database, and persistence (save/checkpoint/close) is driven
// from here. A background worker re-tunes the cache capacities on a fixed
// interval.

pub mod cached_store;
pub mod tuner;

pub use cached_store::{CachedStore, StoreConfig};
pub use tuner::Tuner;
