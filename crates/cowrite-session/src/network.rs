//! Host network reachability signals
//!
//! The controller never asks the environment whether it is online; it is
//! handed a [`NetworkMonitor`] and subscribes to it, so tests (and the
//! terminal client's `:offline`/`:online` commands) drive transitions.

use cowrite_core::{ListenerSet, Subscription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
    Online,
    Offline,
}

struct MonitorInner {
    online: AtomicBool,
    signals: ListenerSet<NetworkSignal>,
}

/// Injected source of online/offline transitions
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                online: AtomicBool::new(online),
                signals: ListenerSet::new(),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Record reachability; subscribers hear about actual transitions only
    pub fn set_online(&self, online: bool) {
        if self.inner.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let signal = if online {
            NetworkSignal::Online
        } else {
            NetworkSignal::Offline
        };
        info!(?signal, "Network reachability changed");
        self.inner.signals.emit(&signal);
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&NetworkSignal) + Send + Sync + 'static,
    {
        self.inner.signals.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.signals.len()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .finish()
    }
}
