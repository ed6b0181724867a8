#![allow(dead_code)]

use cowrite_core::DocumentId;
use cowrite_session::{
    CollabEvent, CollabSession, CollabState, ConnectionManager, LocalIdentity, ManagerConfig, MemoryStyleSink,
    NetworkMonitor, Notice, SessionController,
};
use cowrite_transport::{ConnectionStatus, MemoryRelay, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn doc(id: &str) -> DocumentId {
    DocumentId::new(id).unwrap()
}

pub fn transport_config(reconnect: bool) -> TransportConfig {
    TransportConfig {
        reconnect,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
    }
}

pub fn manager(relay: &MemoryRelay, config: ManagerConfig) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(config, Arc::new(relay.clone())))
}

pub fn memory_config(reconnect: bool) -> ManagerConfig {
    ManagerConfig {
        transport: transport_config(reconnect),
        ..ManagerConfig::with_relay("memory://relay")
    }
}

/// A client: its own network signal source, identity and style sink
pub struct Client {
    pub network: NetworkMonitor,
    pub styles: Arc<MemoryStyleSink>,
    pub controller: SessionController,
}

impl Client {
    pub fn new(manager: Arc<ConnectionManager>, identity: LocalIdentity) -> Self {
        let network = NetworkMonitor::new(true);
        let styles = Arc::new(MemoryStyleSink::new());
        let controller = SessionController::new(manager, network.clone()).with_presence(identity, styles.clone());
        Self {
            network,
            styles,
            controller,
        }
    }
}

pub async fn settle(session: &CollabSession, what: &str, predicate: impl FnMut(&CollabState) -> bool) -> CollabState {
    tokio::time::timeout(WAIT, session.wait_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}: {:?}", what, session.state()))
}

pub async fn connected(session: &CollabSession) {
    settle(session, "connected", |s| s.status == ConnectionStatus::Connected).await;
}

pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn next_status(events: &mut broadcast::Receiver<CollabEvent>) -> ConnectionStatus {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for a status event")
            .expect("event channel closed");
        if let CollabEvent::Status(status) = event {
            return status;
        }
    }
}

/// Everything already queued on `events`
pub fn drain(events: &mut broadcast::Receiver<CollabEvent>) -> Vec<CollabEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn disconnect_notices(events: &[CollabEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, CollabEvent::Notice(Notice::Disconnected)))
        .count()
}
