//! Two editors on one document through an in-process relay.
//!
//! Three connections join: two tabs of the same user and one other user.
//! The roster counts two people, and text typed in either editor shows up
//! in the other.
//!
//! ```bash
//! cargo run --example two_editors
//! ```

use std::sync::Arc;
use std::time::Duration;

use cowrite_core::DocumentId;
use cowrite_session::{
    BufferSurface, CollabSession, ConnectionManager, LocalIdentity, ManagerConfig, MemoryStyleSink, NetworkMonitor,
    SessionController, TextSurface,
};
use cowrite_transport::{ConnectionStatus, MemoryRelay};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let relay = MemoryRelay::new();
    let manager = Arc::new(ConnectionManager::new(
        ManagerConfig::with_relay("memory://demo"),
        Arc::new(relay.clone()),
    ));
    let document = DocumentId::new("demo-notes")?;

    let controller = |identity: LocalIdentity| {
        SessionController::new(manager.clone(), NetworkMonitor::default())
            .with_presence(identity, Arc::new(MemoryStyleSink::new()))
    };
    let ada = controller(LocalIdentity::new("ada", "Ada"));
    let ada_tab = controller(LocalIdentity::new("ada", "Ada"));
    let bo = controller(LocalIdentity::new("bo", "Bo"));

    let left = ada.mount(document.clone(), None).await;
    let other_tab = ada_tab.mount(document.clone(), None).await;
    let right = bo.mount(document.clone(), None).await;
    for session in [&left, &other_tab, &right] {
        session.wait_for(|s| s.status == ConnectionStatus::Connected).await;
    }

    let state = left
        .wait_for(|s| s.roster.participants().map(|p| p.client_ids.len()).sum::<usize>() == 3)
        .await;
    info!(
        connections = 3,
        participants = state.participant_count,
        "Roster deduplicated by user"
    );

    let left_editor = Arc::new(BufferSurface::new());
    let right_editor = Arc::new(BufferSurface::new());
    let _left_binding = left.bind_editor(left_editor.clone())?;
    let _right_binding = right.bind_editor(right_editor.clone())?;

    left_editor.append("Agenda: ")?;
    wait_until(|| right_editor.text() == "Agenda: ").await;
    right_editor.append("ship it")?;
    wait_until(|| left_editor.text() == "Agenda: ship it").await;

    info!(left = %left_editor.text(), right = %right_editor.text(), "Editors converged");
    info!(relay = ?relay.document_text(&document), "Relay replica");

    shutdown([left, other_tab, right]).await;
    Ok(())
}

async fn wait_until(check: impl Fn() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn shutdown(sessions: [CollabSession; 3]) {
    for session in &sessions {
        session.unmount().await;
    }
}
