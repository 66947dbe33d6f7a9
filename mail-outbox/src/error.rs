use thiserror::Error;

/// Persistence read/write failure.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted snapshot: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("snapshot too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage task failed: {0}")]
    TaskJoin(String),

    #[error("lock acquisition failed")]
    LockFailed,
}

impl From<ciborium::de::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StorageError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::TaskJoin(e.to_string())
    }
}

/// Failure reported by a [`Sender`](crate::dispatch::Sender).
///
/// Absorbed into the item's retry state, never raised further.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("transport error: {description}")]
pub struct TransportError {
    pub description: String,
}

impl TransportError {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
