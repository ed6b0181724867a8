//! In-memory cache backend

use crate::{CacheStore, StorageError, StorageStats};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory cache backend
///
/// Fast, volatile storage suitable for development and testing.
/// Data is lost when the process exits; it survives remounts within one
/// process, which is what offline-first resume needs in tests.
pub struct MemoryStorage {
    /// Update logs: cache key -> updates in append order
    logs: DashMap<String, Vec<Vec<u8>>>,
    /// Total size tracking
    total_size: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
            total_size: AtomicUsize::new(0),
        }
    }

    /// Number of updates currently logged for `key`
    pub fn log_len(&self, key: &str) -> usize {
        self.logs.get(key).map(|log| log.len()).unwrap_or(0)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStorage {
    async fn append(&self, key: &str, update: &[u8]) -> Result<(), StorageError> {
        self.total_size.fetch_add(update.len(), Ordering::Relaxed);
        self.logs
            .entry(key.to_string())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<Vec<u8>>, StorageError> {
        Ok(self
            .logs
            .get(key)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }

    async fn replace(&self, key: &str, snapshot: &[u8]) -> Result<(), StorageError> {
        let old = self.logs.insert(key.to_string(), vec![snapshot.to_vec()]);
        if let Some(old) = old {
            let old_size: usize = old.iter().map(Vec::len).sum();
            self.total_size.fetch_sub(old_size, Ordering::Relaxed);
        }
        self.total_size.fetch_add(snapshot.len(), Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<bool, StorageError> {
        match self.logs.remove(key) {
            Some((_, log)) => {
                let size: usize = log.iter().map(Vec::len).sum();
                self.total_size.fetch_sub(size, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        Ok(StorageStats {
            document_count: self.logs.len(),
            update_count: self.logs.iter().map(|log| log.len()).sum(),
            total_size_bytes: self.total_size.load(Ordering::Relaxed),
        })
    }
}
