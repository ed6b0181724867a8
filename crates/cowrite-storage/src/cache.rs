//! Binding between a cache store and a live document

use crate::{CacheStore, StorageError};
use cowrite_core::{ChangeOrigin, SharedDocument, Subscription};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cache tuning
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Collapse the update log into one snapshot past this many entries
    pub compact_threshold: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            compact_threshold: 500,
        }
    }
}

/// Progress of the initial load
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Loading,
    Synced,
    Failed(String),
}

/// A document's local durable cache.
///
/// On attach the persisted log is loaded into the document; every later
/// change that did not come from the cache is appended to the log by a
/// background writer.
pub struct DocumentCache {
    key: String,
    sync_state: watch::Receiver<SyncState>,
    subscription: Mutex<Option<Subscription>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl DocumentCache {
    /// Attach `store` to `doc` under the document's cache key.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn attach(store: Arc<dyn CacheStore>, doc: Arc<SharedDocument>, options: CacheOptions) -> Self {
        let key = doc.id().cache_key();
        let (update_tx, update_rx) = mpsc::unbounded_channel::<Arc<[u8]>>();

        let subscription = doc.subscribe(move |change| {
            if change.origin != ChangeOrigin::Cache {
                let _ = update_tx.send(change.update.clone());
            }
        });

        let (state_tx, state_rx) = watch::channel(SyncState::Loading);
        let writer = tokio::spawn(run_writer(
            store,
            doc,
            key.clone(),
            update_rx,
            state_tx,
            options,
        ));

        Self {
            key,
            sync_state: state_rx,
            subscription: Mutex::new(Some(subscription)),
            writer: Mutex::new(Some(writer)),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state.borrow().clone()
    }

    /// Wait until the persisted state has been loaded into the document
    pub async fn when_synced(&self) -> Result<(), StorageError> {
        let mut rx = self.sync_state.clone();
        let state = rx
            .wait_for(|state| *state != SyncState::Loading)
            .await
            .map_err(|_| StorageError::Io("cache writer stopped before loading".into()))?;

        match &*state {
            SyncState::Failed(reason) => Err(StorageError::Io(reason.clone())),
            _ => Ok(()),
        }
    }

    /// Stop persisting and wait for pending writes to flush.
    /// Calling this more than once is a no-op.
    pub async fn destroy(&self) -> Result<(), StorageError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the subscription closes the update channel; the writer
        // drains what is queued and exits.
        drop(self.subscription.lock().take());

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            writer
                .await
                .map_err(|e| StorageError::Io(format!("cache writer failed: {}", e)))?;
        }

        debug!(key = %self.key, "Document cache destroyed");
        Ok(())
    }
}

async fn run_writer(
    store: Arc<dyn CacheStore>,
    doc: Arc<SharedDocument>,
    key: String,
    mut updates: mpsc::UnboundedReceiver<Arc<[u8]>>,
    state: watch::Sender<SyncState>,
    options: CacheOptions,
) {
    let mut log_len = match load_into(store.as_ref(), &doc, &key).await {
        Ok(count) => {
            info!(key = %key, updates = count, "Loaded cached document state");
            state.send_replace(SyncState::Synced);
            count
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to load cached document state");
            state.send_replace(SyncState::Failed(e.to_string()));
            0
        }
    };

    if log_len > options.compact_threshold {
        log_len = compact(store.as_ref(), &doc, &key, log_len).await;
    }

    while let Some(update) = updates.recv().await {
        if let Err(e) = store.append(&key, &update).await {
            warn!(key = %key, error = %e, "Failed to persist update");
            continue;
        }
        log_len += 1;

        if log_len > options.compact_threshold {
            log_len = compact(store.as_ref(), &doc, &key, log_len).await;
        }
    }
}

async fn load_into(store: &dyn CacheStore, doc: &SharedDocument, key: &str) -> Result<usize, StorageError> {
    let log = store.load(key).await?;
    for update in &log {
        if let Err(e) = doc.apply_update(ChangeOrigin::Cache, update) {
            warn!(key = %key, error = %e, "Skipping unreadable cached update");
        }
    }
    Ok(log.len())
}

/// Returns the log length after the attempt
async fn compact(store: &dyn CacheStore, doc: &SharedDocument, key: &str, log_len: usize) -> usize {
    if doc.is_destroyed() {
        return log_len;
    }
    match store.replace(key, &doc.encode_state()).await {
        Ok(()) => {
            debug!(key = %key, previous = log_len, "Compacted cached update log");
            1
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Cache compaction failed");
            log_len
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;
    use async_trait::async_trait;
    use cowrite_core::DocumentId;

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn append(&self, _key: &str, _update: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Io("disk full".into()))
        }
        async fn load(&self, _key: &str) -> Result<Vec<Vec<u8>>, StorageError> {
            Err(StorageError::Io("disk gone".into()))
        }
        async fn replace(&self, _key: &str, _snapshot: &[u8]) -> Result<(), StorageError> {
            Err(StorageError::Io("disk full".into()))
        }
        async fn clear(&self, _key: &str) -> Result<bool, StorageError> {
            Ok(false)
        }
        async fn stats(&self) -> Result<crate::StorageStats, StorageError> {
            Ok(Default::default())
        }
    }

    fn document() -> Arc<SharedDocument> {
        Arc::new(SharedDocument::new(DocumentId::new("notes:cache").unwrap()))
    }

    #[tokio::test]
    async fn test_changes_persist_and_reload() {
        let store = Arc::new(MemoryStorage::new());

        let doc = document();
        let cache = DocumentCache::attach(store.clone(), doc.clone(), CacheOptions::default());
        cache.when_synced().await.unwrap();
        doc.insert(0, "offline ").unwrap();
        doc.insert(8, "draft").unwrap();
        cache.destroy().await.unwrap();

        let reopened = document();
        let cache = DocumentCache::attach(store.clone(), reopened.clone(), CacheOptions::default());
        cache.when_synced().await.unwrap();
        assert_eq!(reopened.text(), "offline draft");

        // Restored updates are not written back
        assert_eq!(store.log_len("cowrite-doc:notes:cache"), 2);
        cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_log_is_compacted() {
        let store = Arc::new(MemoryStorage::new());
        let doc = document();
        let cache = DocumentCache::attach(
            store.clone(),
            doc.clone(),
            CacheOptions { compact_threshold: 3 },
        );
        cache.when_synced().await.unwrap();

        for (i, ch) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            doc.insert(i as u32, ch).unwrap();
        }
        cache.destroy().await.unwrap();

        assert!(store.log_len(cache.key()) <= 3);

        let reopened = document();
        let cache = DocumentCache::attach(store, reopened.clone(), CacheOptions::default());
        cache.when_synced().await.unwrap();
        assert_eq!(reopened.text(), "abcde");
        cache.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_store_reports_failure_without_panicking() {
        let doc = document();
        let cache = DocumentCache::attach(Arc::new(BrokenStore), doc.clone(), CacheOptions::default());

        assert!(cache.when_synced().await.is_err());
        assert!(matches!(cache.sync_state(), SyncState::Failed(_)));

        doc.insert(0, "still editable").unwrap();
        cache.destroy().await.unwrap();
        assert_eq!(doc.text(), "still editable");
    }

    #[tokio::test]
    async fn test_destroy_twice_detaches_listener() {
        let doc = document();
        let cache = DocumentCache::attach(Arc::new(MemoryStorage::new()), doc.clone(), CacheOptions::default());
        assert_eq!(doc.listener_count(), 1);

        cache.destroy().await.unwrap();
        cache.destroy().await.unwrap();
        assert_eq!(doc.listener_count(), 0);
    }
}
