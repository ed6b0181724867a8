mod common;

use async_trait::async_trait;
use common::*;
use cowrite_core::DocumentId;
use cowrite_session::{
    BufferSurface, CollabEvent, CollabState, DocumentMetadata, LocalIdentity, ManagerConfig, MetadataSource,
    NetworkMonitor, Permission, SessionController, SessionError, SessionResult, StaticAccess, StaticMetadata,
};
use cowrite_storage::{CacheBackend, MemoryStorage};
use cowrite_transport::{ConnectionStatus, MemoryRelay};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_mount_starts_connecting_then_connects() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));

    let session = client.controller.mount(doc("mount"), None).await;
    let state = session.state();
    assert!(matches!(
        state.status,
        ConnectionStatus::Connecting | ConnectionStatus::Connected
    ));
    assert_eq!(state.permission, Some(Permission::Edit));
    assert!(!state.read_only);

    connected(&session).await;
    settle(&session, "synced", |s| s.synced).await;
    session.unmount().await;
}

#[tokio::test]
async fn test_mount_while_offline_does_not_connect() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    client.network.set_online(false);

    let session = client.controller.mount(doc("offline-mount"), None).await;
    assert_eq!(session.state().status, ConnectionStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.peer_count(&doc("offline-mount")), 0);
    assert_eq!(session.state().status, ConnectionStatus::Disconnected);

    client.network.set_online(true);
    connected(&session).await;
    session.unmount().await;
}

#[tokio::test]
async fn test_offline_then_online_status_sequence() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    let session = client.controller.mount(doc("sequence"), None).await;
    connected(&session).await;
    let mut events = session.events();

    client.network.set_online(false);
    assert_eq!(next_status(&mut events).await, ConnectionStatus::Disconnected);
    assert_eq!(session.state().status, ConnectionStatus::Disconnected);

    client.network.set_online(true);
    assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
    assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);

    session.unmount().await;
}

#[tokio::test]
async fn test_going_offline_is_silent() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    let session = client.controller.mount(doc("silent"), None).await;
    connected(&session).await;
    let mut events = session.events();

    client.network.set_online(false);
    settle(&session, "disconnected", |s| s.status == ConnectionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(disconnect_notices(&drain(&mut events)), 0);
    session.unmount().await;
}

#[tokio::test]
async fn test_disconnect_notice_is_edge_triggered() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    let session = client.controller.mount(doc("edge"), None).await;
    connected(&session).await;
    let mut events = session.events();

    relay.set_available(false);
    relay.drop_connections();
    settle(&session, "disconnected", |s| s.status == ConnectionStatus::Disconnected).await;

    // Several failed reconnect attempts go by
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(disconnect_notices(&drain(&mut events)), 1);

    relay.set_available(true);
    connected(&session).await;
    drain(&mut events);

    relay.drop_connections();
    settle(&session, "disconnected again", |s| s.status != ConnectionStatus::Connected).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(disconnect_notices(&drain(&mut events)), 1);

    session.unmount().await;
}

#[tokio::test]
async fn test_manual_reconnect() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(false)), LocalIdentity::new("u1", "Uma"));
    let session = client.controller.mount(doc("manual"), None).await;
    connected(&session).await;

    relay.drop_connections();
    settle(&session, "disconnected", |s| s.status == ConnectionStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state().status, ConnectionStatus::Disconnected);

    session.reconnect();
    connected(&session).await;
    session.unmount().await;
}

#[tokio::test]
async fn test_access_failure_degrades_to_read_only() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    let controller = client.controller.with_access(Arc::new(StaticAccess::failing("lookup failed")));

    let session = controller.mount(doc("degraded"), Some("share-token".into())).await;
    let state = session.state();
    assert!(state.read_only);
    assert!(state.warning.as_deref().unwrap_or_default().contains("read-only"));

    // Establishment is not blocked
    connected(&session).await;
    session.unmount().await;
}

#[tokio::test]
async fn test_view_permission_blocks_surface_edits() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    let controller = client
        .controller
        .with_access(Arc::new(StaticAccess::granting(Permission::View)));

    let session = controller.mount(doc("view-only"), Some("viewer".into())).await;
    assert_eq!(session.state().permission, Some(Permission::View));
    assert!(session.is_read_only());

    let surface = Arc::new(BufferSurface::new());
    let _binding = session.bind_editor(surface.clone()).unwrap();

    assert!(matches!(surface.append("nope"), Err(SessionError::ReadOnly)));
    assert_eq!(session.document().unwrap().text(), "");
    session.unmount().await;
}

#[tokio::test]
async fn test_relay_permission_denied_sets_error() {
    let relay = MemoryRelay::new();
    relay.deny_token("revoked");
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));

    let session = client.controller.mount(doc("denied"), Some("revoked".into())).await;
    let state = settle(&session, "denied", |s| s.error.is_some()).await;

    assert!(state.read_only);
    assert!(session.is_read_only());
    settle(&session, "disconnected", |s| s.status == ConnectionStatus::Disconnected).await;
    session.unmount().await;
}

#[tokio::test]
async fn test_unreachable_relay_url_fails_mount() {
    let relay = MemoryRelay::new();
    let config = ManagerConfig {
        relay_url: "definitely not a url".into(),
        ..memory_config(true)
    };
    let client = Client::new(manager(&relay, config), LocalIdentity::new("u1", "Uma"));

    let session = client.controller.mount(doc("broken"), None).await;
    let state = session.state();
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(state.error.is_some());
    assert!(session.document().is_none());
    assert!(matches!(
        session.bind_editor(Arc::new(BufferSurface::new())),
        Err(SessionError::NotEstablished)
    ));

    session.unmount().await;
    session.unmount().await;
    assert_eq!(session.state(), CollabState::default());
}

#[tokio::test]
async fn test_metadata_fetched_after_connect() {
    let relay = MemoryRelay::new();
    let metadata = Arc::new(StaticMetadata::new());
    metadata.insert(
        doc("titled"),
        DocumentMetadata {
            title: Some("Quarterly plan".into()),
        },
    );
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    let controller = client.controller.with_metadata(metadata);

    let session = controller.mount(doc("titled"), None).await;
    let state = settle(&session, "title", |s| s.title.is_some()).await;
    assert_eq!(state.title.as_deref(), Some("Quarterly plan"));
    session.unmount().await;
}

struct SlowMetadata {
    calls: AtomicUsize,
}

#[async_trait]
impl MetadataSource for SlowMetadata {
    async fn fetch(&self, _document_id: &DocumentId, _token: Option<&str>) -> SessionResult<DocumentMetadata> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(DocumentMetadata {
            title: Some("late".into()),
        })
    }
}

#[tokio::test]
async fn test_metadata_after_unmount_is_discarded() {
    let relay = MemoryRelay::new();
    let metadata = Arc::new(SlowMetadata {
        calls: AtomicUsize::new(0),
    });
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    let controller = client.controller.with_metadata(metadata.clone());

    let session = controller.mount(doc("late"), None).await;
    connected(&session).await;
    eventually("fetch started", || metadata.calls.load(Ordering::SeqCst) == 1).await;
    session.unmount().await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(session.state().title, None);
}

#[tokio::test]
async fn test_unmount_releases_everything() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    let session = client.controller.mount(doc("teardown"), None).await;
    connected(&session).await;

    let surface = Arc::new(BufferSurface::new());
    let binding = session.bind_editor(surface.clone()).unwrap();
    surface.append("bye").unwrap();

    let doc_handle = session.document().unwrap().clone();
    let transport = session.session().unwrap().transport().clone();
    let awareness = transport.awareness().clone();
    assert!(client.network.listener_count() > 0);
    assert!(!client.styles.is_empty());

    session.unmount().await;
    session.unmount().await;

    assert_eq!(session.state(), CollabState::default());
    assert!(doc_handle.is_destroyed());
    assert_eq!(doc_handle.listener_count(), 0);
    assert_eq!(transport.listener_count(), 0);
    assert_eq!(awareness.listener_count(), 0);
    assert_eq!(client.network.listener_count(), 0);
    assert!(client.styles.is_empty());
    assert!(binding.is_disposed());
    assert!(surface.is_disposed());
    eventually("relay released", || relay.peer_count(&doc("teardown")) == 0).await;
}

#[tokio::test]
async fn test_drop_without_unmount_still_releases_session() {
    let relay = MemoryRelay::new();
    let storage = Arc::new(MemoryStorage::new());
    let config = memory_config(true).with_cache(CacheBackend::Store(storage.clone()));
    let client = Client::new(manager(&relay, config), LocalIdentity::new("u1", "Uma"));
    let session = client.controller.mount(doc("dropped"), None).await;
    connected(&session).await;

    let surface = Arc::new(BufferSurface::new());
    let binding = session.bind_editor(surface.clone()).unwrap();
    surface.append("left behind").unwrap();
    let doc_handle = session.document().unwrap().clone();
    assert!(!client.styles.is_empty());

    drop(session);

    assert!(binding.is_disposed());
    assert!(client.styles.is_empty());
    eventually("document destroyed", || doc_handle.is_destroyed()).await;
    assert_eq!(doc_handle.listener_count(), 0);
    assert!(storage.log_len(&doc("dropped").cache_key()) > 0);
    eventually("relay released", || relay.peer_count(&doc("dropped")) == 0).await;
}

#[tokio::test]
async fn test_switch_remounts_for_new_document() {
    let relay = MemoryRelay::new();
    let client = Client::new(manager(&relay, memory_config(true)), LocalIdentity::new("u1", "Uma"));
    let first = client.controller.mount(doc("first"), None).await;
    connected(&first).await;

    let second = client.controller.switch(&first, doc("second"), None).await;

    assert!(first.is_unmounted());
    assert_eq!(first.state(), CollabState::default());
    assert_eq!(second.state().document_id, Some(doc("second")));
    connected(&second).await;
    second.unmount().await;
}

#[tokio::test]
async fn test_unsupported_relay_scheme_reports_failure() {
    let relay = MemoryRelay::new();
    let config = ManagerConfig {
        relay_url: "http://wrong-scheme".into(),
        ..memory_config(true)
    };
    let controller = SessionController::new(manager(&relay, config), NetworkMonitor::default());

    let session = controller.mount(doc("nope"), None).await;
    let state = session.state();
    assert!(state.error.as_deref().unwrap_or_default().starts_with("Unable to connect"));
    assert_eq!(state.status, ConnectionStatus::Disconnected);

    // No actor runs, so nothing else is emitted
    let mut events = session.events();
    session.reconnect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(drain(&mut events).is_empty());
    session.unmount().await;
    assert!(matches!(
        drain(&mut events).as_slice(),
        [CollabEvent::Status(ConnectionStatus::Disconnected)]
    ));
}
