//! Durability mirror for the queue.
//!
//! Adapters hold no truth of their own: the manager reads them once at open
//! and writes the whole ordered snapshot after every mutation.

mod file;
mod memory;
pub mod snapshot;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use self::file::FileStorage;
pub use self::memory::MemoryStorage;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStorage;

use crate::error::StorageError;
use crate::item::QueueItem;

#[async_trait::async_trait]
pub trait QueueStorage: Send + Sync {
    /// Read the persisted snapshot in stored order. An absent store is empty.
    async fn load(&self) -> Result<Vec<QueueItem>, StorageError>;

    /// Replace the persisted snapshot with `items`.
    async fn save(&self, items: &[QueueItem]) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<S: QueueStorage + ?Sized> QueueStorage for std::sync::Arc<S> {
    async fn load(&self) -> Result<Vec<QueueItem>, StorageError> {
        (**self).load().await
    }

    async fn save(&self, items: &[QueueItem]) -> Result<(), StorageError> {
        (**self).save(items).await
    }
}
