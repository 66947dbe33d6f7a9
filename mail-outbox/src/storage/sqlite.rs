use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{snapshot, QueueStorage};
use crate::error::StorageError;
use crate::item::QueueItem;

/// SQLite storage: one row per item, keyed by snapshot position.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    const SCHEMA: &'static str = r#"
        CREATE TABLE IF NOT EXISTS queue_items (
            position INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            data BLOB NOT NULL
        );
    "#;

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(Self::SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn read_all(conn: &Connection) -> Result<Vec<QueueItem>, StorageError> {
        let mut stmt = conn.prepare("SELECT data FROM queue_items ORDER BY position ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut items = Vec::new();
        for row in rows {
            items.push(snapshot::decode_item(&row?)?);
        }
        Ok(items)
    }

    fn replace_all(conn: &mut Connection, rows: &[(String, Vec<u8>)]) -> Result<(), StorageError> {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM queue_items", [])?;
        {
            let mut insert =
                tx.prepare("INSERT INTO queue_items (position, id, data) VALUES (?1, ?2, ?3)")?;
            for (position, (id, data)) in rows.iter().enumerate() {
                let position = i64::try_from(position).unwrap_or(i64::MAX);
                insert.execute(params![position, id, data])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueStorage for SqliteStorage {
    async fn load(&self) -> Result<Vec<QueueItem>, StorageError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StorageError::LockFailed)?;
            Self::read_all(&guard)
        })
        .await?
    }

    async fn save(&self, items: &[QueueItem]) -> Result<(), StorageError> {
        let rows = items
            .iter()
            .map(|item| Ok((item.id.as_str().to_string(), snapshot::encode_item(item)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::LockFailed)?;
            Self::replace_all(&mut guard, &rows)
        })
        .await?
    }
}
