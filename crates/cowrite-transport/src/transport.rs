//! Session transport
//!
//! Owns the link to the relay for one document: connect/disconnect on
//! demand, the sync handshake on every (re)connect, forwarding of local
//! document and awareness changes, and reconnection with backoff.

use crate::awareness::Awareness;
use crate::connector::{Connector, Link};
use crate::handler::FrameHandler;
use crate::Endpoint;
use cowrite_core::{ChangeOrigin, ListenerSet, SharedDocument, Subscription};
use cowrite_protocol::Message;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Link status as seen by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Events published by a [`SessionTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Status changed (never repeated for the same status)
    Status(ConnectionStatus),
    /// The relay's state has been merged after a (re)connect
    Synced,
    /// The relay rejected the access token; the transport stops reconnecting
    PermissionDenied(String),
}

/// Reconnect tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Re-establish lost links automatically
    pub reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2500),
        }
    }
}

impl TransportConfig {
    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// State shared between the transport handle, its link task and its listeners
struct Shared {
    status: Mutex<ConnectionStatus>,
    /// Bumped on every connect/disconnect; stale link tasks compare against it
    generation: AtomicU64,
    /// Keeps status updates and their events in the same order
    emit_order: ReentrantMutex<()>,
    events: ListenerSet<TransportEvent>,
    outbound: Mutex<Option<(u64, mpsc::UnboundedSender<Message>)>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Record `status` and publish it when it differs from the current one.
    /// Updates from a stale link task are dropped.
    fn set_status(&self, generation: Option<u64>, status: ConnectionStatus) {
        let _order = self.emit_order.lock();
        {
            let mut current = self.status.lock();
            if let Some(generation) = generation {
                if !self.is_current(generation) {
                    return;
                }
            }
            if *current == status {
                return;
            }
            *current = status;
        }
        self.events.emit(&TransportEvent::Status(status));
    }

    fn emit(&self, generation: u64, event: TransportEvent) {
        let _order = self.emit_order.lock();
        if self.is_current(generation) {
            self.events.emit(&event);
        }
    }

    /// Queue a frame on the live link; dropped while disconnected
    fn send(&self, message: Message) {
        if let Some((_, tx)) = self.outbound.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    fn install_outbound(&self, generation: u64, tx: mpsc::UnboundedSender<Message>) {
        if self.is_current(generation) {
            *self.outbound.lock() = Some((generation, tx));
        }
    }

    fn clear_outbound(&self, generation: Option<u64>) {
        let mut outbound = self.outbound.lock();
        let matches = match (generation, outbound.as_ref()) {
            (None, _) => true,
            (Some(generation), Some((installed, _))) => *installed == generation,
            (Some(_), None) => false,
        };
        if matches {
            *outbound = None;
        }
    }
}

#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Everything a link task needs
struct LinkContext {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    doc: Arc<SharedDocument>,
    awareness: Arc<Awareness>,
    handler: FrameHandler,
    config: TransportConfig,
    shared: Arc<Shared>,
}

enum LinkOutcome {
    Cancelled,
    Lost,
    Denied,
}

/// Network transport binding one document to its relay room
pub struct SessionTransport {
    context: Arc<LinkContext>,
    control: Mutex<Control>,
    subscriptions: Mutex<Vec<Subscription>>,
    destroyed: AtomicBool,
}

impl SessionTransport {
    /// Create a transport for `doc`. Nothing connects until [`connect`](Self::connect).
    pub fn new(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        doc: Arc<SharedDocument>,
        config: TransportConfig,
    ) -> Self {
        let awareness = Arc::new(Awareness::new(doc.client_id()));
        let shared = Arc::new(Shared {
            status: Mutex::new(ConnectionStatus::Disconnected),
            generation: AtomicU64::new(0),
            emit_order: ReentrantMutex::new(()),
            events: ListenerSet::new(),
            outbound: Mutex::new(None),
        });

        let doc_sub = {
            let shared = shared.clone();
            doc.subscribe(move |change| {
                if let ChangeOrigin::Local(_) = change.origin {
                    shared.send(Message::Update(change.update.to_vec()));
                }
            })
        };

        let awareness_sub = {
            let shared = shared.clone();
            let weak: Weak<Awareness> = Arc::downgrade(&awareness);
            awareness.on_update(move |change| {
                if !change.local {
                    return;
                }
                if let Some(update) = weak.upgrade().and_then(|a| a.local_update()) {
                    shared.send(Message::Awareness(update));
                }
            })
        };

        let context = Arc::new(LinkContext {
            handler: FrameHandler::new(doc.clone(), awareness.clone()),
            endpoint,
            connector,
            doc,
            awareness,
            config,
            shared,
        });

        Self {
            context,
            control: Mutex::new(Control::default()),
            subscriptions: Mutex::new(vec![doc_sub, awareness_sub]),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.context.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.context.shared.status.lock()
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.context.awareness
    }

    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            return Subscription::noop();
        }
        self.context.shared.events.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.context.shared.events.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Start (or keep) a link to the relay. Idempotent while a link task runs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        if self.is_destroyed() {
            return;
        }

        let mut control = self.control.lock();
        let running = control.task.as_ref().map_or(false, |task| !task.is_finished());
        if running {
            return;
        }

        let generation = self.context.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        control.task = Some(tokio::spawn(run_link(
            self.context.clone(),
            generation,
            cancel.clone(),
        )));
        control.cancel = Some(cancel);
        debug!(endpoint = %self.context.endpoint, generation, "Transport connect requested");
    }

    /// Suspend the link without destroying the transport.
    /// The status becomes `Disconnected` before this returns.
    pub fn disconnect(&self) {
        let task = {
            let mut control = self.control.lock();
            if let Some(cancel) = control.cancel.take() {
                cancel.cancel();
            }
            control.task.take()
        };

        self.context.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.context.shared.clear_outbound(None);
        self.context.awareness.remove_remote_states();
        self.context.shared.set_status(None, ConnectionStatus::Disconnected);

        // The cancelled task winds down on its own
        drop(task);
    }

    /// Disconnect and release everything. Calling this more than once is a no-op.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let task = {
            let mut control = self.control.lock();
            if let Some(cancel) = control.cancel.take() {
                cancel.cancel();
            }
            control.task.take()
        };
        self.disconnect();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(endpoint = %self.context.endpoint, error = %e, "Link task ended abnormally");
            }
        }

        self.subscriptions.lock().clear();
        self.context.shared.events.clear();
        self.context.awareness.clear_local_state();
        info!(endpoint = %self.context.endpoint, "Transport destroyed");
    }
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("endpoint", &self.context.endpoint.to_string())
            .field("status", &self.status())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

async fn run_link(ctx: Arc<LinkContext>, generation: u64, cancel: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        ctx.shared.set_status(Some(generation), ConnectionStatus::Connecting);

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = ctx.connector.connect(&ctx.endpoint) => result,
        };

        match connected {
            Ok(link) => {
                attempt = 0;
                let outcome = drive_link(&ctx, generation, link, &cancel).await;

                ctx.shared.clear_outbound(Some(generation));
                if ctx.shared.is_current(generation) {
                    ctx.awareness.remove_remote_states();
                }
                ctx.shared.set_status(Some(generation), ConnectionStatus::Disconnected);

                match outcome {
                    LinkOutcome::Cancelled => break,
                    LinkOutcome::Denied => {
                        info!(endpoint = %ctx.endpoint, "Relay denied access; not reconnecting");
                        break;
                    }
                    LinkOutcome::Lost => {
                        info!(endpoint = %ctx.endpoint, "Relay link lost");
                    }
                }
            }
            Err(e) => {
                warn!(endpoint = %ctx.endpoint, attempt, error = %e, "Failed to reach relay");
                ctx.shared.set_status(Some(generation), ConnectionStatus::Disconnected);
            }
        }

        if !ctx.config.reconnect {
            break;
        }

        let delay = ctx.config.backoff(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    ctx.shared.set_status(Some(generation), ConnectionStatus::Disconnected);
    debug!(endpoint = %ctx.endpoint, generation, "Link task finished");
}

async fn drive_link(ctx: &LinkContext, generation: u64, link: Link, cancel: &CancellationToken) -> LinkOutcome {
    let Link { outgoing, mut incoming } = link;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    ctx.shared.install_outbound(generation, out_tx.clone());
    ctx.shared.set_status(Some(generation), ConnectionStatus::Connected);
    info!(endpoint = %ctx.endpoint, "Connected to relay");

    // Handshake: ask for what we lack, announce ourselves, ask who is here
    let _ = out_tx.send(Message::SyncStep1(ctx.doc.state_vector()));
    if let Some(local) = ctx.awareness.renew_local() {
        let _ = out_tx.send(Message::Awareness(local));
    }
    let _ = out_tx.send(Message::QueryAwareness);
    drop(out_tx);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return LinkOutcome::Cancelled,

            frame = incoming.recv() => {
                let Some(frame) = frame else {
                    return LinkOutcome::Lost;
                };

                let outcome = ctx.handler.process(&frame);
                for reply in outcome.replies {
                    if outgoing.send(reply.encode().to_vec()).is_err() {
                        return LinkOutcome::Lost;
                    }
                }
                if outcome.synced {
                    ctx.shared.emit(generation, TransportEvent::Synced);
                }
                if let Some(reason) = outcome.denied {
                    warn!(endpoint = %ctx.endpoint, reason = %reason, "Permission denied by relay");
                    ctx.shared.emit(generation, TransportEvent::PermissionDenied(reason));
                    return LinkOutcome::Denied;
                }
            }

            Some(message) = out_rx.recv() => {
                if outgoing.send(message.encode().to_vec()).is_err() {
                    return LinkOutcome::Lost;
                }
            }
        }
    }
}
