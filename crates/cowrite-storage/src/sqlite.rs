//! SQLite cache backend

use crate::{CacheStore, StorageError, StorageStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

/// SQLite cache backend
///
/// Embedded persistence for the client's update logs. Opening the same file
/// again (for example when a document view remounts) sees the same logs.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let storage = Self {
            conn: Mutex::new(conn),
        };

        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS updates (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_key TEXT NOT NULL,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
            );

            CREATE INDEX IF NOT EXISTS idx_updates_doc_key ON updates(doc_key, seq);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl CacheStore for SqliteStorage {
    async fn append(&self, key: &str, update: &[u8]) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO updates (doc_key, data) VALUES (?1, ?2)",
            params![key, update],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<Vec<u8>>, StorageError> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare("SELECT data FROM updates WHERE doc_key = ?1 ORDER BY seq ASC")
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let log = stmt
            .query_map(params![key], |row| row.get::<_, Vec<u8>>(0))
            .map_err(|e| StorageError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        Ok(log)
    }

    async fn replace(&self, key: &str, snapshot: &[u8]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();

        let tx = conn
            .transaction()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        tx.execute("DELETE FROM updates WHERE doc_key = ?1", params![key])
            .map_err(|e| StorageError::Database(e.to_string()))?;
        tx.execute(
            "INSERT INTO updates (doc_key, data) VALUES (?1, ?2)",
            params![key, snapshot],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;
        tx.commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.conn.lock();

        let affected = conn
            .execute("DELETE FROM updates WHERE doc_key = ?1", params![key])
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(affected > 0)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock();

        let (document_count, update_count, total_size): (usize, usize, usize) = conn
            .query_row(
                "SELECT COUNT(DISTINCT doc_key), COUNT(*), COALESCE(SUM(LENGTH(data)), 0) FROM updates",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(StorageStats {
            document_count,
            update_count,
            total_size_bytes: total_size,
        })
    }
}
