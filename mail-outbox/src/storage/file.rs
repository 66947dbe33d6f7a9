use std::ffi::OsString;
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{snapshot, QueueStorage};
use crate::error::StorageError;
use crate::item::QueueItem;

/// Single-file snapshot storage with atomic replace.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling temp file: the full file name plus `.tmp`.
    fn tmp_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map_or_else(OsString::new, OsString::from);
        name.push(".tmp");
        path.with_file_name(name)
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp_path = Self::tmp_path(path);

        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }

    fn read(path: &Path) -> Result<Vec<QueueItem>, StorageError> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let size = usize::try_from(metadata.len()).unwrap_or(usize::MAX);
        if size > snapshot::MAX_SNAPSHOT_BYTES {
            return Err(StorageError::StoreTooLarge {
                size,
                max: snapshot::MAX_SNAPSHOT_BYTES,
            });
        }

        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            return Err(StorageError::Corrupted {
                reason: "empty file",
            });
        }

        snapshot::decode(&bytes)
    }
}

#[async_trait::async_trait]
impl QueueStorage for FileStorage {
    async fn load(&self) -> Result<Vec<QueueItem>, StorageError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::read(&path)).await?
    }

    async fn save(&self, items: &[QueueItem]) -> Result<(), StorageError> {
        let bytes = snapshot::encode(items)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &bytes)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UnixTimeMs;
    use crate::item::{Payload, Priority};
    use tempfile::tempdir;

    fn sample_item() -> QueueItem {
        QueueItem::new(
            Payload::new(b"subject: hi".to_vec()),
            Priority::Normal,
            3,
            UnixTimeMs(1_000),
        )
    }

    #[tokio::test]
    async fn file_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("queue.bin"));
        let items = vec![sample_item(), sample_item()];

        storage.save(&items).await.unwrap();
        let loaded = storage.load().await.unwrap();

        assert_eq!(loaded, items);
    }

    #[tokio::test]
    async fn load_nonexistent_returns_empty() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("missing.bin"));

        assert!(storage.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let result = FileStorage::new(&path).load().await;

        assert!(matches!(result, Err(StorageError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn truncated_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let storage = FileStorage::new(&path);
        storage.save(&[sample_item()]).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(storage.load().await.is_err());
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.bin");
        let tmp_path = dir.path().join("queue.bin.tmp");

        FileStorage::new(&path).save(&[]).await.unwrap();

        assert!(path.exists());
        assert!(!tmp_path.exists());
    }

    #[test]
    fn tmp_path_keeps_full_file_name() {
        assert_eq!(
            FileStorage::tmp_path(Path::new("/var/spool/queue.bin")),
            PathBuf::from("/var/spool/queue.bin.tmp")
        );
        assert_eq!(
            FileStorage::tmp_path(Path::new("outbox.tmp")),
            PathBuf::from("outbox.tmp.tmp")
        );
    }

    #[tokio::test]
    async fn snapshots_sharing_a_stem_do_not_clash() {
        let dir = tempdir().unwrap();
        let bin = FileStorage::new(dir.path().join("queue.bin"));
        let dat = FileStorage::new(dir.path().join("queue.dat"));

        bin.save(&[sample_item()]).await.unwrap();
        dat.save(&[sample_item(), sample_item()]).await.unwrap();

        assert_eq!(bin.load().await.unwrap().len(), 1);
        assert_eq!(dat.load().await.unwrap().len(), 2);
        assert!(!dir.path().join("queue.tmp").exists());
    }

    #[tokio::test]
    async fn snapshot_named_tmp_round_trips() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("outbox.tmp"));
        let items = vec![sample_item()];

        storage.save(&items).await.unwrap();

        assert_eq!(storage.load().await.unwrap(), items);
        assert!(!dir.path().join("outbox.tmp.tmp").exists());
    }

    #[tokio::test]
    async fn non_missing_stat_error_is_not_empty() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"plain file").unwrap();

        // A path below a regular file fails to stat with something other
        // than NotFound.
        let result = FileStorage::new(blocker.join("queue.bin")).load().await;

        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[tokio::test]
    async fn save_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nope").join("queue.bin"));

        assert!(matches!(
            storage.save(&[sample_item()]).await,
            Err(StorageError::Io(_))
        ));
    }
}
