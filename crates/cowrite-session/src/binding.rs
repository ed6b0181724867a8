//! Editor binding
//!
//! Connects a text-editing surface to the document's content region. Local
//! surface edits become document edits; remote document changes are applied
//! to the surface. A re-entrant guard keeps each side from hearing its own
//! change echoed back.
//!
//! Both directions run under the surface's edit gate, so a remote resync
//! never lands between a user edit and its delivery to the document. A user
//! edit is made against the text the surface last showed; when remote
//! changes committed since then, the edit is moved past them before it is
//! applied.

use crate::{SessionError, SessionResult};
use cowrite_core::{ListenerSet, SharedDocument, Subscription};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Replace `delete_len` bytes at byte offset `index` with `insert`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub index: u32,
    pub delete_len: u32,
    pub insert: String,
}

impl TextEdit {
    pub fn insert(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            delete_len: 0,
            insert: text.into(),
        }
    }

    pub fn delete(index: u32, len: u32) -> Self {
        Self {
            index,
            delete_len: len,
            insert: String::new(),
        }
    }

    /// Smallest edit turning `from` into `to`, found by trimming the common
    /// prefix and suffix. `None` when the texts are equal.
    pub fn between(from: &str, to: &str) -> Option<Self> {
        if from == to {
            return None;
        }

        let mut prefix = from
            .bytes()
            .zip(to.bytes())
            .take_while(|(a, b)| a == b)
            .count();
        while !from.is_char_boundary(prefix) || !to.is_char_boundary(prefix) {
            prefix -= 1;
        }

        let max_suffix = (from.len() - prefix).min(to.len() - prefix);
        let mut suffix = from
            .bytes()
            .rev()
            .zip(to.bytes().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();
        while !from.is_char_boundary(from.len() - suffix) || !to.is_char_boundary(to.len() - suffix) {
            suffix -= 1;
        }

        Some(Self {
            index: prefix as u32,
            delete_len: (from.len() - prefix - suffix) as u32,
            insert: to[prefix..to.len() - suffix].to_string(),
        })
    }

    /// Move this edit, made against `base`, onto `current`, a later version
    /// of the same text. Positions inside the region that changed in between
    /// land after it.
    pub fn rebase(&self, base: &str, current: &str) -> Self {
        let Some(change) = TextEdit::between(base, current) else {
            return self.clone();
        };
        let start = change.index;
        let end = change.index + change.delete_len;
        let grown = change.insert.len() as u32;
        let map = |pos: u32| {
            if pos <= start {
                pos
            } else if pos >= end {
                pos - change.delete_len + grown
            } else {
                start + grown
            }
        };

        let from = map(self.index);
        let to = map(self.index + self.delete_len).max(from);
        Self {
            index: from,
            delete_len: to - from,
            insert: self.insert.clone(),
        }
    }

    fn apply_to(&self, text: &mut String) -> SessionResult<()> {
        let start = self.index as usize;
        let end = start + self.delete_len as usize;
        if end > text.len() || !text.is_char_boundary(start) || !text.is_char_boundary(end) {
            return Err(SessionError::Document(cowrite_core::Error::InvalidRange {
                start: self.index,
                end: end as u32,
                len: text.len() as u32,
            }));
        }
        text.replace_range(start..end, &self.insert);
        Ok(())
    }
}

/// A text-editing surface's model.
///
/// Like a real editor model, the surface reports every change to its
/// listeners, including changes applied programmatically.
pub trait TextSurface: Send + Sync {
    fn text(&self) -> String;

    /// Apply an edit that did not originate from the user
    fn apply_edit(&self, edit: &TextEdit) -> SessionResult<()>;

    fn on_change(&self, listener: Box<dyn Fn(&TextEdit) + Send + Sync>) -> Subscription;

    fn set_read_only(&self, read_only: bool);

    fn is_read_only(&self) -> bool;

    /// Run `f` with the surface's edit gate held.
    ///
    /// User edits must change the model and notify listeners while holding
    /// the same gate, so no other edit can land in between.
    fn exclusive(&self, f: &mut dyn FnMut());

    /// Release the model; later edits are rejected
    fn dispose(&self);
}

/// In-memory text surface used by the terminal client and tests
pub struct BufferSurface {
    gate: ReentrantMutex<()>,
    buffer: Mutex<String>,
    read_only: AtomicBool,
    disposed: AtomicBool,
    changes: ListenerSet<TextEdit>,
}

impl BufferSurface {
    pub fn new() -> Self {
        Self {
            gate: ReentrantMutex::new(()),
            buffer: Mutex::new(String::new()),
            read_only: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            changes: ListenerSet::new(),
        }
    }

    /// A user edit: refused while the surface is read-only
    pub fn edit(&self, edit: TextEdit) -> SessionResult<()> {
        if self.is_read_only() {
            return Err(SessionError::ReadOnly);
        }
        self.apply_edit(&edit)
    }

    /// Append at the end, as a user typing
    pub fn append(&self, text: &str) -> SessionResult<()> {
        let _gate = self.gate.lock();
        let end = self.buffer.lock().len() as u32;
        self.edit(TextEdit::insert(end, text))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.changes.len()
    }
}

impl Default for BufferSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl TextSurface for BufferSurface {
    fn text(&self) -> String {
        self.buffer.lock().clone()
    }

    fn apply_edit(&self, edit: &TextEdit) -> SessionResult<()> {
        let _gate = self.gate.lock();
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        edit.apply_to(&mut self.buffer.lock())?;
        self.changes.emit(edit);
        Ok(())
    }

    fn on_change(&self, listener: Box<dyn Fn(&TextEdit) + Send + Sync>) -> Subscription {
        self.changes.subscribe(move |edit| listener(edit))
    }

    fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn exclusive(&self, f: &mut dyn FnMut()) {
        let _gate = self.gate.lock();
        f();
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.changes.clear();
        }
    }
}

struct BindingState {
    /// True while the binding itself is writing to one side
    applying: ReentrantMutex<Cell<bool>>,
    read_only: Arc<AtomicBool>,
    snapshots: ListenerSet<String>,
    /// Surface text as of the last sync in either direction
    shadow: Mutex<String>,
}

impl BindingState {
    /// Run `f` unless the binding is already mid-write on this thread
    fn guarded(&self, f: impl FnOnce()) {
        let guard = self.applying.lock();
        if guard.get() {
            return;
        }
        guard.set(true);
        f();
        guard.set(false);
    }
}

pub struct EditorBinding {
    doc: Mutex<Option<Arc<SharedDocument>>>,
    surface: Arc<dyn TextSurface>,
    state: Arc<BindingState>,
    subscriptions: Mutex<Vec<Subscription>>,
    disposed: AtomicBool,
}

impl EditorBinding {
    /// Bind `surface` to `doc`. The surface is first reset to the document text.
    ///
    /// While `read_only` is set, surface edits are not applied to the document
    /// and the surface is put back in step with it.
    pub fn attach(doc: Arc<SharedDocument>, surface: Arc<dyn TextSurface>, read_only: Arc<AtomicBool>) -> Self {
        let state = Arc::new(BindingState {
            applying: ReentrantMutex::new(Cell::new(false)),
            read_only,
            snapshots: ListenerSet::new(),
            shadow: Mutex::new(String::new()),
        });
        surface.set_read_only(state.read_only.load(Ordering::SeqCst));

        surface.exclusive(&mut || state.guarded(|| resync(&doc, surface.as_ref(), &state)));

        let surface_sub = {
            let doc = doc.clone();
            let state = state.clone();
            let weak_surface: Weak<dyn TextSurface> = Arc::downgrade(&surface);
            surface.on_change(Box::new(move |edit| {
                let Some(surface) = weak_surface.upgrade() else {
                    return;
                };
                state.guarded(|| on_local_edit(&doc, surface.as_ref(), &state, edit));
            }))
        };

        let doc_sub = {
            let weak_doc = Arc::downgrade(&doc);
            let state = state.clone();
            let surface = surface.clone();
            doc.subscribe(move |_| {
                let Some(doc) = weak_doc.upgrade() else {
                    return;
                };
                // Skipped while the change is the surface's own edit
                surface.exclusive(&mut || state.guarded(|| resync(&doc, surface.as_ref(), &state)));
                state.snapshots.emit(&doc.text());
            })
        };

        debug!(doc_id = %doc.id(), "Editor bound");
        Self {
            doc: Mutex::new(Some(doc)),
            surface,
            state,
            subscriptions: Mutex::new(vec![surface_sub, doc_sub]),
            disposed: AtomicBool::new(false),
        }
    }

    /// Current plain text of the bound region; empty after dispose
    pub fn text(&self) -> String {
        self.doc
            .lock()
            .as_ref()
            .map(|doc| doc.text())
            .unwrap_or_default()
    }

    /// Observe plain-text snapshots after every local or remote change
    pub fn on_text<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        if self.is_disposed() {
            return Subscription::noop();
        }
        self.state.snapshots.subscribe(listener)
    }

    pub fn surface(&self) -> &Arc<dyn TextSurface> {
        &self.surface
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Tear down the binding, then the surface model, then release the
    /// document. Calling this more than once is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.subscriptions.lock().clear();
        self.state.snapshots.clear();
        self.surface.dispose();
        if let Some(doc) = self.doc.lock().take() {
            debug!(doc_id = %doc.id(), "Editor unbound");
        }
    }
}

impl Drop for EditorBinding {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for EditorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorBinding")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Runs under the surface gate, right after the surface applied `edit`
fn on_local_edit(doc: &SharedDocument, surface: &dyn TextSurface, state: &BindingState, edit: &TextEdit) {
    if state.read_only.load(Ordering::SeqCst) {
        debug!(doc_id = %doc.id(), "Rejected edit on read-only document");
        surface.set_read_only(true);
        resync(doc, surface, state);
        return;
    }

    let base = state.shadow.lock().clone();
    let applied = doc.edit_with(|current| {
        let edit = edit.rebase(&base, current);
        (edit.index, edit.delete_len, edit.insert)
    });
    // Only a destroyed document refuses a rebased edit; the surface keeps
    // the user's text
    if let Err(e) = applied {
        warn!(doc_id = %doc.id(), error = %e, "Surface edit did not reach the document");
    }
    *state.shadow.lock() = surface.text();
}

/// Bring the surface in line with the document with one minimal edit
fn resync(doc: &SharedDocument, surface: &dyn TextSurface, state: &BindingState) {
    let text = doc.text();
    if let Some(edit) = TextEdit::between(&surface.text(), &text) {
        if let Err(e) = surface.apply_edit(&edit) {
            warn!(doc_id = %doc.id(), error = %e, "Failed to update surface");
            return;
        }
    }
    *state.shadow.lock() = text;
}
