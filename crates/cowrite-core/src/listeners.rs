//! Listener registries with disposer subscriptions
//!
//! Every event source in cowrite (document changes, transport status,
//! awareness updates, network signals, surface edits) hands out a
//! [`Subscription`] instead of expecting callers to remember which closure
//! to detach. Dropping or disposing the subscription removes the listener.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by every `subscribe`/`on_*` call. Disposes on drop.
#[must_use = "dropping a Subscription immediately detaches the listener"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A subscription with nothing to release
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    /// Detach the listener now
    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

struct Registry<E> {
    next_id: u64,
    entries: Vec<(u64, Listener<E>)>,
}

/// A set of listeners for events of type `E`
pub struct ListenerSet<E> {
    inner: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> ListenerSet<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a listener; it stays attached while the subscription lives
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.inner.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().entries.retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Invoke every listener with `event`.
    ///
    /// The registry lock is released before listeners run, so a listener may
    /// subscribe or dispose without deadlocking.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    /// Number of attached listeners
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach every listener
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

impl<E: 'static> Default for ListenerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for ListenerSet<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
