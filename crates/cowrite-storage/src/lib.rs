//! cowrite local cache
//!
//! Persists each document's update log on the client so a session can
//! resume offline-first:
//! - Memory (default): volatile, for development and tests
//! - SQLite: embedded on-disk persistence
//!
//! [`DocumentCache`] binds a store to a live document handle.

pub mod cache;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use std::sync::Arc;

/// Update-log store keyed by a document cache key
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Append one encoded update to the log for `key`
    async fn append(&self, key: &str, update: &[u8]) -> Result<(), StorageError>;

    /// Load the log for `key` in append order (empty when unknown)
    async fn load(&self, key: &str) -> Result<Vec<Vec<u8>>, StorageError>;

    /// Replace the whole log for `key` with a single merged snapshot
    async fn replace(&self, key: &str, snapshot: &[u8]) -> Result<(), StorageError>;

    /// Drop the log for `key`
    async fn clear(&self, key: &str) -> Result<bool, StorageError>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub document_count: usize,
    pub update_count: usize,
    pub total_size_bytes: usize,
}

/// How a session obtains its cache store
#[derive(Clone)]
pub enum CacheBackend {
    /// An already opened store, shared between sessions
    Store(Arc<dyn CacheStore>),
    /// SQLite database file, opened per session
    #[cfg(feature = "sqlite")]
    Sqlite(std::path::PathBuf),
}

impl CacheBackend {
    /// Open the store; failure means the client-local store is unavailable
    pub fn open(&self) -> Result<Arc<dyn CacheStore>, StorageError> {
        match self {
            CacheBackend::Store(store) => Ok(store.clone()),
            #[cfg(feature = "sqlite")]
            CacheBackend::Sqlite(path) => Ok(Arc::new(SqliteStorage::new(path)?)),
        }
    }
}

impl std::fmt::Debug for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheBackend::Store(_) => f.write_str("CacheBackend::Store"),
            #[cfg(feature = "sqlite")]
            CacheBackend::Sqlite(path) => write!(f, "CacheBackend::Sqlite({})", path.display()),
        }
    }
}

pub use cache::{CacheOptions, DocumentCache, SyncState};
pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
