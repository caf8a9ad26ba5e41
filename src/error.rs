use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error: {0}")]
    IoMsg(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Eviction blocked: {0}")]
    EvictionBlocked(String),

    #[error("Entry too large: {0}")]
    EntryTooLarge(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("WAL full: {0}")]
    WalFull(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Shutdown in progress")]
    Shutdown,
}

impl DbError {
    /// Whether the caller can reasonably retry the failed operation without
    /// reconstructing the engine.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::Busy(_) | DbError::EvictionBlocked(_) | DbError::WalFull(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
