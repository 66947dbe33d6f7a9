use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{snapshot, QueueStorage};
use crate::error::StorageError;
use crate::item::QueueItem;

/// Process-local storage. Keeps the encoded snapshot, so everything written
/// goes through the same codec as the file adapter.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    bytes: Mutex<Option<Vec<u8>>>,
    saves: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with `items`, as if a previous process had saved them.
    pub fn with_items(items: &[QueueItem]) -> Result<Self, StorageError> {
        Ok(Self {
            bytes: Mutex::new(Some(snapshot::encode(items)?)),
            saves: AtomicU64::new(0),
        })
    }

    /// Number of successful saves since construction.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn snapshot_bytes(&self) -> Option<Vec<u8>> {
        self.bytes.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl QueueStorage for MemoryStorage {
    async fn load(&self) -> Result<Vec<QueueItem>, StorageError> {
        match self.bytes.lock().await.as_deref() {
            Some(bytes) => snapshot::decode(bytes),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, items: &[QueueItem]) -> Result<(), StorageError> {
        let encoded = snapshot::encode(items)?;
        *self.bytes.lock().await = Some(encoded);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
