//! Document identity and the replicated document handle

use crate::error::{Error, Result};
use crate::listeners::{ListenerSet, Subscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact};

/// Name of the shared text region every document exposes
pub const CONTENT_REGION: &str = "content";

/// Prefix of the local cache key derived from a document ID
const CACHE_NAMESPACE: &str = "cowrite-doc";

/// Replica identifier; one per document handle
pub type ClientId = u64;

/// Client IDs stay within 53 bits so browser peers can represent them
const CLIENT_ID_MASK: u128 = (1 << 53) - 1;

/// Document identifier - UTF-8 string, max 512 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a new document ID, validating the format
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidDocumentId("Document ID cannot be empty".into()));
        }

        if id.len() > 512 {
            return Err(Error::InvalidDocumentId("Document ID exceeds 512 bytes".into()));
        }

        // Validate pattern: [a-zA-Z0-9:_-]+
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-') {
            return Err(Error::InvalidDocumentId(
                "Document ID must match pattern [a-zA-Z0-9:_-]+".into()
            ));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespaced key under which the local cache stores this document
    pub fn cache_key(&self) -> String {
        format!("{}:{}", CACHE_NAMESPACE, self.0)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a document change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Edit made through this handle, tagged with its client ID
    Local(ClientId),
    /// Update received from the relay
    Remote,
    /// State restored from the local cache
    Cache,
}

/// Notification delivered to document listeners after every committed change
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub origin: ChangeOrigin,
    /// Encoded v1 update carrying exactly this change
    pub update: Arc<[u8]>,
}

/// Handle over a replicated document with one shared text region.
///
/// All transactions are serialized through an internal lock so the handle can
/// be shared between the transport task and the editing surface. Listeners
/// run after the transaction has committed.
pub struct SharedDocument {
    id: DocumentId,
    client_id: ClientId,
    ydoc: Doc,
    txn_lock: Mutex<()>,
    listeners: ListenerSet<DocumentChange>,
    destroyed: AtomicBool,
}

impl SharedDocument {
    /// Create a document handle with a fresh random client ID
    pub fn new(id: DocumentId) -> Self {
        let client_id = (uuid::Uuid::new_v4().as_u128() & CLIENT_ID_MASK) as ClientId;
        Self::with_client_id(id, client_id)
    }

    pub fn with_client_id(id: DocumentId, client_id: ClientId) -> Self {
        Self {
            id,
            client_id,
            ydoc: Doc::with_client_id(client_id),
            txn_lock: Mutex::new(()),
            listeners: ListenerSet::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Current plain text of the content region
    pub fn text(&self) -> String {
        let _guard = self.txn_lock.lock();
        let text = self.ydoc.get_or_insert_text(CONTENT_REGION);
        let txn = self.ydoc.transact();
        text.get_string(&txn)
    }

    /// Insert `chunk` at byte offset `index`
    pub fn insert(&self, index: u32, chunk: &str) -> Result<()> {
        self.edit(index, 0, chunk)
    }

    /// Remove `len` bytes starting at byte offset `index`
    pub fn remove(&self, index: u32, len: u32) -> Result<()> {
        self.edit(index, len, "")
    }

    /// Replace `delete_len` bytes at `index` with `insert` in one transaction.
    ///
    /// Offsets are UTF-8 byte offsets and must fall on character boundaries.
    pub fn edit(&self, index: u32, delete_len: u32, insert: &str) -> Result<()> {
        self.edit_with(|_| (index, delete_len, insert.to_string()))
    }

    /// Like [`edit`](Self::edit), with the range planned from the text as it
    /// stands inside the same transaction.
    ///
    /// `plan` returns `(index, delete_len, insert)`; no other change can land
    /// between reading the text and applying the edit.
    pub fn edit_with<F>(&self, plan: F) -> Result<()>
    where
        F: FnOnce(&str) -> (u32, u32, String),
    {
        self.ensure_live()?;

        let update = {
            let _guard = self.txn_lock.lock();
            let text = self.ydoc.get_or_insert_text(CONTENT_REGION);
            let (before, (index, delete_len, insert)) = {
                let txn = self.ydoc.transact();
                let current = text.get_string(&txn);
                let planned = plan(&current);
                check_range(&current, planned.0, planned.1)?;
                (txn.state_vector(), planned)
            };
            if delete_len == 0 && insert.is_empty() {
                return Ok(());
            }
            {
                let mut txn = self.ydoc.transact_mut();
                if delete_len > 0 {
                    text.remove_range(&mut txn, index, delete_len);
                }
                if !insert.is_empty() {
                    text.insert(&mut txn, index, &insert);
                }
            }
            let txn = self.ydoc.transact();
            txn.encode_state_as_update_v1(&before)
        };

        self.listeners.emit(&DocumentChange {
            origin: ChangeOrigin::Local(self.client_id),
            update: update.into(),
        });
        Ok(())
    }

    /// Apply an encoded v1 update received from a peer or the cache.
    ///
    /// Updates are idempotent and commutative; re-applying one is harmless.
    pub fn apply_update(&self, origin: ChangeOrigin, update: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let decoded = yrs::Update::decode_v1(update)
            .map_err(|e: yrs::encoding::read::Error| Error::Crdt(e.to_string()))?;

        {
            let _guard = self.txn_lock.lock();
            let mut txn = self.ydoc.transact_mut();
            txn.apply_update(decoded);
        }

        self.listeners.emit(&DocumentChange {
            origin,
            update: Arc::from(update),
        });
        Ok(())
    }

    /// Full document state as one v1 update
    pub fn encode_state(&self) -> Vec<u8> {
        let _guard = self.txn_lock.lock();
        let txn = self.ydoc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector, sent to peers to request what we are missing
    pub fn state_vector(&self) -> Vec<u8> {
        let _guard = self.txn_lock.lock();
        let txn = self.ydoc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks
    pub fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e: yrs::encoding::read::Error| Error::Crdt(e.to_string()))?;
        let _guard = self.txn_lock.lock();
        let txn = self.ydoc.transact();
        Ok(txn.encode_state_as_update_v1(&remote))
    }

    /// Observe every committed change, local or remote
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            return Subscription::noop();
        }
        self.listeners.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Release the handle: detach listeners and reject further changes.
    /// Calling this more than once is a no-op.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.listeners.clear();
            tracing::debug!(doc_id = %self.id, "Document handle destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::DocumentDestroyed(self.id.to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

fn check_range(current: &str, index: u32, delete_len: u32) -> Result<()> {
    let len = current.len() as u32;
    let end = index.saturating_add(delete_len);
    if end > len {
        return Err(Error::InvalidRange { start: index, end, len });
    }
    if !current.is_char_boundary(index as usize) {
        return Err(Error::NotCharBoundary(index));
    }
    if !current.is_char_boundary(end as usize) {
        return Err(Error::NotCharBoundary(end));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn doc(client_id: ClientId) -> SharedDocument {
        SharedDocument::with_client_id(DocumentId::new("test:doc").unwrap(), client_id)
    }

    #[test]
    fn test_document_id_valid() {
        assert!(DocumentId::new("note:123").is_ok());
        assert!(DocumentId::new("draft_items-456").is_ok());
    }

    #[test]
    fn test_document_id_invalid() {
        assert!(DocumentId::new("").is_err());
        assert!(DocumentId::new("note/123").is_err()); // invalid char
        assert!(DocumentId::new("a".repeat(513)).is_err()); // too long
    }

    #[test]
    fn test_cache_key_is_namespaced() {
        let id = DocumentId::new("abc").unwrap();
        assert_eq!(id.cache_key(), "cowrite-doc:abc");
    }

    #[test]
    fn test_edit_and_read() {
        let d = doc(1);
        d.insert(0, "hello world").unwrap();
        d.edit(0, 5, "howdy").unwrap();
        d.remove(5, 6).unwrap();
        assert_eq!(d.text(), "howdy");
    }

    #[test]
    fn test_edit_rejects_bad_ranges() {
        let d = doc(1);
        d.insert(0, "héllo").unwrap();
        assert!(matches!(d.remove(4, 10), Err(Error::InvalidRange { .. })));
        // 'é' occupies bytes 1..3
        assert!(matches!(d.insert(2, "x"), Err(Error::NotCharBoundary(2))));
    }

    #[test]
    fn test_edit_with_plans_against_current_text() {
        let d = doc(1);
        d.insert(0, "world").unwrap();
        d.edit_with(|current| (current.len() as u32, 0, "!".to_string())).unwrap();
        d.edit_with(|current| {
            assert_eq!(current, "world!");
            (0, 0, "hello ".to_string())
        })
        .unwrap();
        assert_eq!(d.text(), "hello world!");
        assert!(matches!(
            d.edit_with(|_| (99, 1, String::new())),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_local_changes_are_tagged() {
        let d = doc(7);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = d.subscribe(move |change| seen_clone.lock().push(change.origin));

        d.insert(0, "x").unwrap();
        assert_eq!(*seen.lock(), vec![ChangeOrigin::Local(7)]);
    }

    #[test]
    fn test_convergence_with_duplicates_and_reordering() {
        let a = doc(1);
        let b = doc(2);
        let updates = Arc::new(Mutex::new(Vec::new()));

        let sink = updates.clone();
        let _sa = a.subscribe(move |c| sink.lock().push(c.update.to_vec()));
        let sink = updates.clone();
        let _sb = b.subscribe(move |c| sink.lock().push(c.update.to_vec()));

        a.insert(0, "alpha ").unwrap();
        b.insert(0, "beta ").unwrap();
        a.insert(6, "one").unwrap();
        b.remove(0, 2).unwrap();

        let all = updates.lock().clone();

        let forward = doc(3);
        for u in &all {
            forward.apply_update(ChangeOrigin::Remote, u).unwrap();
        }

        let shuffled = doc(4);
        for u in all.iter().rev().chain(all.iter()) {
            shuffled.apply_update(ChangeOrigin::Remote, u).unwrap();
        }

        a.apply_update(ChangeOrigin::Remote, &b.encode_state()).unwrap();
        b.apply_update(ChangeOrigin::Remote, &a.encode_state()).unwrap();

        assert_eq!(a.text(), b.text());
        assert_eq!(forward.text(), a.text());
        assert_eq!(shuffled.text(), a.text());
    }

    #[test]
    fn test_diff_against_state_vector() {
        let a = doc(1);
        let b = doc(2);
        a.insert(0, "shared").unwrap();
        b.apply_update(ChangeOrigin::Remote, &a.encode_state()).unwrap();

        a.insert(6, " text").unwrap();
        let missing = a.diff(&b.state_vector()).unwrap();
        b.apply_update(ChangeOrigin::Remote, &missing).unwrap();

        assert_eq!(b.text(), "shared text");
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let d = doc(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let sub = d.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(d.listener_count(), 1);

        d.destroy();
        d.destroy();
        drop(sub);

        assert_eq!(d.listener_count(), 0);
        assert!(matches!(d.insert(0, "x"), Err(Error::DocumentDestroyed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_update_is_rejected() {
        let d = doc(1);
        assert!(matches!(
            d.apply_update(ChangeOrigin::Remote, &[0xff, 0xff, 0xff]),
            Err(Error::Crdt(_))
        ));
    }
}
