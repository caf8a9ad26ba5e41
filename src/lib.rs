// TierDB - tiered cache engine over an in-memory relational store with
// crash-recoverable persistence.
//
// The host program constructs a `CachedStore` and drives everything
// through it; there are no module-level singletons.

pub mod cache;
pub mod common;
pub mod error;
pub mod storage;
pub mod store;

pub use cache::{CacheEngine, CacheEngineConfig, CacheKey, CacheLevelConfig, PolicyKind};
pub use common::{
    ColumnDef, Condition, DataType, Database, ForeignKey, Row, RowId, Table, Value,
};
pub use error::{DbError, Result};
pub use storage::{PersistenceEngine, PersistenceMode};
pub use store::{CachedStore, StoreConfig};
