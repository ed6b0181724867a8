//! Collaboration session controller
//!
//! [`SessionController::mount`] resolves access, opens a session through the
//! [`ConnectionManager`] and hands back a [`CollabSession`]. Each mounted
//! session runs one actor task that owns the state machine:
//!
//! ```text
//! connecting --> connected --> disconnected --> connecting
//!      \_____________________________^
//! ```
//!
//! Transport events, network signals, awareness updates and commands are all
//! funneled into the actor's queue, so state transitions are serialized.
//! Observers read the latest [`CollabState`] from a watch channel and
//! discrete [`CollabEvent`]s from a broadcast channel.

use crate::binding::{EditorBinding, TextSurface};
use crate::collaborators::{
    AccessResolver, DocumentMetadata, MetadataSource, Permission, StaticAccess, StaticMetadata, StyleSink,
};
use crate::manager::{ConnectionManager, OpenOptions, Session};
use crate::network::{NetworkMonitor, NetworkSignal};
use crate::presence::{LocalIdentity, PresenceBroadcaster};
use crate::{SessionError, SessionResult};
use cowrite_core::{DocumentId, PresenceRoster, RosterTracker, SharedDocument, Subscription};
use cowrite_transport::{ConnectionStatus, TransportEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Everything a view renders about its collaboration session
#[derive(Debug, Clone, PartialEq)]
pub struct CollabState {
    pub document_id: Option<DocumentId>,
    pub status: ConnectionStatus,
    pub permission: Option<Permission>,
    pub read_only: bool,
    /// Retryable, user-visible failure
    pub error: Option<String>,
    /// Transient, user-visible warning
    pub warning: Option<String>,
    pub roster: PresenceRoster,
    pub participant_count: usize,
    pub title: Option<String>,
    /// The relay's state has been merged at least once
    pub synced: bool,
}

impl Default for CollabState {
    fn default() -> Self {
        Self {
            document_id: None,
            status: ConnectionStatus::Disconnected,
            permission: None,
            read_only: false,
            error: None,
            warning: None,
            roster: PresenceRoster::default(),
            participant_count: 0,
            title: None,
            synced: false,
        }
    }
}

/// One-time, user-visible notices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Share access could not be resolved; the document is read-only
    AccessDegraded(String),
    /// The relay link dropped while the network was reachable
    Disconnected,
    /// The session could not be established
    ConnectionFailed(String),
    /// The relay rejected the access token
    PermissionDenied(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    Status(ConnectionStatus),
    Roster { roster: PresenceRoster, count: usize },
    Notice(Notice),
    Metadata(DocumentMetadata),
    Synced,
}

enum Input {
    Transport(TransportEvent),
    Network(NetworkSignal),
    Awareness,
    Metadata(SessionResult<DocumentMetadata>),
    Reconnect,
}

/// Mounts collaboration sessions for document views
pub struct SessionController {
    manager: Arc<ConnectionManager>,
    network: NetworkMonitor,
    access: Arc<dyn AccessResolver>,
    metadata: Arc<dyn MetadataSource>,
    presence: Option<(LocalIdentity, Arc<dyn StyleSink>)>,
}

impl SessionController {
    pub fn new(manager: Arc<ConnectionManager>, network: NetworkMonitor) -> Self {
        Self {
            manager,
            network,
            access: Arc::new(StaticAccess::default()),
            metadata: Arc::new(StaticMetadata::new()),
            presence: None,
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessResolver>) -> Self {
        self.access = access;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataSource>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Publish `identity` on every mounted session and style remote carets into `sink`
    pub fn with_presence(mut self, identity: LocalIdentity, sink: Arc<dyn StyleSink>) -> Self {
        self.presence = Some((identity, sink));
        self
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Mount a session for `document_id`.
    ///
    /// Never fails: if the session cannot be established the returned
    /// session is disconnected and carries the error.
    pub async fn mount(&self, document_id: DocumentId, token: Option<String>) -> CollabSession {
        let mut state = CollabState {
            document_id: Some(document_id.clone()),
            status: ConnectionStatus::Connecting,
            ..Default::default()
        };
        let mut notices = Vec::new();

        let read_only = Arc::new(AtomicBool::new(false));
        match &token {
            Some(token) => match self.access.resolve(&document_id, token).await {
                Ok(access) => {
                    state.permission = Some(access.permission);
                    state.read_only = access.permission != Permission::Edit;
                }
                Err(e) => {
                    warn!(doc_id = %document_id, error = %e, "Share access unresolved; opening read-only");
                    state.read_only = true;
                    state.warning = Some(format!("Could not verify access ({}); document is read-only", e));
                    notices.push(Notice::AccessDegraded(e.to_string()));
                }
            },
            None => state.permission = Some(Permission::Edit),
        }
        read_only.store(state.read_only, Ordering::SeqCst);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let options = OpenOptions {
            token: token.clone(),
            auto_connect: false,
        };

        let session = match self.manager.open(document_id.clone(), options).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(doc_id = %document_id, error = %e, "Failed to establish session");
                state.status = ConnectionStatus::Disconnected;
                state.error = Some(format!("Unable to connect: {}", e));
                notices.push(Notice::ConnectionFailed(e.to_string()));
                let (state_tx, _) = watch::channel(state);
                return CollabSession::failed(Arc::new(state_tx), events, read_only, notices);
            }
        };

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::new();
        {
            let tx = input_tx.clone();
            subscriptions.push(session.transport().on_event(move |event| {
                let _ = tx.send(Input::Transport(event.clone()));
            }));
        }
        {
            let tx = input_tx.clone();
            subscriptions.push(self.network.subscribe(move |signal| {
                let _ = tx.send(Input::Network(*signal));
            }));
        }
        {
            let tx = input_tx.clone();
            subscriptions.push(session.awareness().on_update(move |_| {
                let _ = tx.send(Input::Awareness);
            }));
        }

        let presence = self
            .presence
            .as_ref()
            .map(|(identity, sink)| PresenceBroadcaster::attach(session.awareness().clone(), identity, sink.clone()));

        let online = self.network.is_online();
        if online {
            session.transport().connect();
        } else {
            state.status = ConnectionStatus::Disconnected;
            info!(doc_id = %document_id, "Network offline; deferring connect");
        }

        let state_tx = Arc::new(watch::channel(state).0);
        let cancel = CancellationToken::new();
        let actor = Actor {
            session: session.clone(),
            online,
            disconnect_notified: false,
            metadata_requested: false,
            tracker: RosterTracker::new(),
            state: state_tx.clone(),
            events: events.clone(),
            read_only: read_only.clone(),
            metadata: self.metadata.clone(),
            inputs: input_tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run(input_rx));

        for notice in notices {
            let _ = events.send(CollabEvent::Notice(notice));
        }
        info!(doc_id = %document_id, online, "Collaboration session mounted");

        CollabSession {
            state: state_tx,
            events,
            commands: Some(input_tx),
            session: Some(session),
            read_only,
            subscriptions: Mutex::new(subscriptions),
            presence: Mutex::new(presence),
            bindings: Mutex::new(Vec::new()),
            task: Mutex::new(Some(task)),
            cancel,
            unmounted: AtomicBool::new(false),
        }
    }

    /// Unmount `current` and mount `document_id` in its place
    pub async fn switch(&self, current: &CollabSession, document_id: DocumentId, token: Option<String>) -> CollabSession {
        current.unmount().await;
        self.mount(document_id, token).await
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("manager", &self.manager)
            .field("network", &self.network)
            .field("presence", &self.presence.as_ref().map(|(identity, _)| identity))
            .finish()
    }
}

/// A mounted collaboration session
pub struct CollabSession {
    state: Arc<watch::Sender<CollabState>>,
    events: broadcast::Sender<CollabEvent>,
    commands: Option<mpsc::UnboundedSender<Input>>,
    session: Option<Arc<Session>>,
    read_only: Arc<AtomicBool>,
    subscriptions: Mutex<Vec<Subscription>>,
    presence: Mutex<Option<PresenceBroadcaster>>,
    bindings: Mutex<Vec<Arc<EditorBinding>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    unmounted: AtomicBool,
}

impl CollabSession {
    fn failed(
        state: Arc<watch::Sender<CollabState>>,
        events: broadcast::Sender<CollabEvent>,
        read_only: Arc<AtomicBool>,
        notices: Vec<Notice>,
    ) -> Self {
        for notice in notices {
            let _ = events.send(CollabEvent::Notice(notice));
        }
        Self {
            state,
            events,
            commands: None,
            session: None,
            read_only,
            subscriptions: Mutex::new(Vec::new()),
            presence: Mutex::new(None),
            bindings: Mutex::new(Vec::new()),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
            unmounted: AtomicBool::new(false),
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> CollabState {
        self.state.borrow().clone()
    }

    /// Follow state changes
    pub fn subscribe(&self) -> watch::Receiver<CollabState> {
        self.state.subscribe()
    }

    /// Follow discrete events (status edges, roster changes, notices)
    pub fn events(&self) -> broadcast::Receiver<CollabEvent> {
        self.events.subscribe()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for(&self, mut predicate: impl FnMut(&CollabState) -> bool) -> CollabState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| predicate(state)).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    pub fn document(&self) -> Option<&Arc<SharedDocument>> {
        self.session.as_ref().map(|session| session.document())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::SeqCst)
    }

    /// Ask for a fresh connection attempt after a disconnect
    pub fn reconnect(&self) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(Input::Reconnect);
        }
    }

    /// Bind a text surface to the session's document
    pub fn bind_editor(&self, surface: Arc<dyn TextSurface>) -> SessionResult<Arc<EditorBinding>> {
        if self.is_unmounted() {
            return Err(SessionError::NotEstablished);
        }
        let doc = self.document().ok_or(SessionError::NotEstablished)?;
        let binding = Arc::new(EditorBinding::attach(doc.clone(), surface, self.read_only.clone()));
        self.bindings.lock().push(binding.clone());
        Ok(binding)
    }

    /// Tear the session down and reset observable state.
    /// Calling this more than once is a no-op.
    pub async fn unmount(&self) {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }

        self.subscriptions.lock().clear();
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Session actor ended abnormally");
            }
        }

        let bindings: Vec<Arc<EditorBinding>> = self.bindings.lock().drain(..).collect();
        for binding in bindings {
            binding.dispose();
        }
        if let Some(presence) = self.presence.lock().take() {
            presence.detach();
        }
        if let Some(session) = &self.session {
            session.close().await;
        }

        self.state.send_replace(CollabState::default());
        let _ = self.events.send(CollabEvent::Status(ConnectionStatus::Disconnected));
        debug!("Collaboration session unmounted");
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        if self.is_unmounted() {
            return;
        }
        // Dropped without unmount: tear down what can be done synchronously,
        // then hand the async close to the runtime if there is one
        self.cancel.cancel();
        self.subscriptions.get_mut().clear();
        for binding in self.bindings.get_mut().drain(..) {
            binding.dispose();
        }
        if let Some(presence) = self.presence.get_mut().take() {
            presence.detach();
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        session.transport().disconnect();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { session.close().await });
            }
            Err(_) => {
                warn!(doc_id = %session.document_id(), "Session dropped outside a runtime; call unmount to release it");
                session.document().destroy();
            }
        }
    }
}

impl std::fmt::Debug for CollabSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabSession")
            .field("state", &*self.state.borrow())
            .field("unmounted", &self.is_unmounted())
            .finish()
    }
}

struct Actor {
    session: Arc<Session>,
    online: bool,
    /// Set after the disconnect notice; cleared once connected again
    disconnect_notified: bool,
    metadata_requested: bool,
    tracker: RosterTracker,
    state: Arc<watch::Sender<CollabState>>,
    events: broadcast::Sender<CollabEvent>,
    read_only: Arc<AtomicBool>,
    metadata: Arc<dyn MetadataSource>,
    inputs: mpsc::UnboundedSender<Input>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        self.refresh_roster();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                input = inputs.recv() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
            }
        }
        debug!(doc_id = %self.session.document_id(), "Session actor stopped");
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Transport(TransportEvent::Status(status)) => self.on_transport_status(status),
            Input::Transport(TransportEvent::Synced) => {
                self.state.send_modify(|state| state.synced = true);
                let _ = self.events.send(CollabEvent::Synced);
            }
            Input::Transport(TransportEvent::PermissionDenied(reason)) => {
                self.read_only.store(true, Ordering::SeqCst);
                self.state.send_modify(|state| {
                    state.read_only = true;
                    state.error = Some(format!("Access denied: {}", reason));
                });
                let _ = self.events.send(CollabEvent::Notice(Notice::PermissionDenied(reason)));
            }
            Input::Network(NetworkSignal::Offline) => {
                self.online = false;
                self.session.transport().disconnect();
                self.set_status(ConnectionStatus::Disconnected);
            }
            Input::Network(NetworkSignal::Online) => {
                self.online = true;
                self.session.transport().connect();
                self.set_status(ConnectionStatus::Connecting);
            }
            Input::Awareness => self.refresh_roster(),
            Input::Metadata(result) => {
                if self.cancel.is_cancelled() {
                    return;
                }
                match result {
                    Ok(metadata) => {
                        self.state.send_modify(|state| state.title = metadata.title.clone());
                        let _ = self.events.send(CollabEvent::Metadata(metadata));
                    }
                    Err(e) => debug!(doc_id = %self.session.document_id(), error = %e, "Metadata unavailable"),
                }
            }
            Input::Reconnect => {
                if !self.online {
                    debug!(doc_id = %self.session.document_id(), "Reconnect ignored while offline");
                    return;
                }
                if self.session.transport().status() == ConnectionStatus::Disconnected {
                    self.session.transport().connect();
                    self.set_status(ConnectionStatus::Connecting);
                }
            }
        }
    }

    fn on_transport_status(&mut self, status: ConnectionStatus) {
        // Queued before a connect/disconnect this actor has since issued
        if status != self.session.transport().status() {
            debug!(doc_id = %self.session.document_id(), %status, "Ignoring stale transport status");
            return;
        }

        match status {
            ConnectionStatus::Connected => {
                self.disconnect_notified = false;
                self.state.send_modify(|state| state.error = None);
                self.set_status(ConnectionStatus::Connected);
                self.request_metadata();
            }
            ConnectionStatus::Connecting => {
                if self.online {
                    self.set_status(ConnectionStatus::Connecting);
                }
            }
            ConnectionStatus::Disconnected => {
                let previous = self.state.borrow().status;
                self.set_status(ConnectionStatus::Disconnected);
                if previous != ConnectionStatus::Disconnected && self.online && !self.disconnect_notified {
                    self.disconnect_notified = true;
                    info!(doc_id = %self.session.document_id(), "Lost connection to relay");
                    let _ = self.events.send(CollabEvent::Notice(Notice::Disconnected));
                }
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.state.send_if_modified(|state| {
            if state.status == status {
                return false;
            }
            state.status = status;
            true
        });
        if changed {
            debug!(doc_id = %self.session.document_id(), %status, "Session status changed");
            let _ = self.events.send(CollabEvent::Status(status));
        }
    }

    fn refresh_roster(&mut self) {
        let roster = PresenceRoster::from_entries(self.session.awareness().entries());
        if let Some(roster) = self.tracker.update(roster) {
            let roster = roster.clone();
            let count = roster.len();
            self.state.send_modify(|state| {
                state.roster = roster.clone();
                state.participant_count = count;
            });
            let _ = self.events.send(CollabEvent::Roster { roster, count });
        }
    }

    /// Fetch metadata once per mount; a result arriving after unmount is dropped
    fn request_metadata(&mut self) {
        if self.metadata_requested {
            return;
        }
        self.metadata_requested = true;

        let source = self.metadata.clone();
        let document_id = self.session.document_id().clone();
        let token = self.session.token().map(String::from);
        let inputs = self.inputs.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = source.fetch(&document_id, token.as_deref()).await;
            if !cancel.is_cancelled() {
                let _ = inputs.send(Input::Metadata(result));
            }
        });
    }
}
