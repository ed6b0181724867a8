//! In-process relay
//!
//! A relay that lives in the same process as its clients. It keeps one
//! replica per room, answers the sync handshake, fans updates and awareness
//! out to the other peers of the room, and announces departures. Tests and
//! the demo use its controls to simulate outages and revoked tokens.

use crate::connector::{Connector, Link};
use crate::{Endpoint, TransportError, TransportResult};
use async_trait::async_trait;
use cowrite_core::{ChangeOrigin, ClientId, DocumentId, SharedDocument};
use cowrite_protocol::{AwarenessState, AwarenessUpdate, Message};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Peer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Awareness client IDs announced over this link
    clients: HashSet<ClientId>,
}

struct Room {
    doc: SharedDocument,
    peers: HashMap<u64, Peer>,
    awareness: HashMap<ClientId, AwarenessState>,
}

impl Room {
    fn new(id: DocumentId) -> Self {
        Self {
            doc: SharedDocument::new(id),
            peers: HashMap::new(),
            awareness: HashMap::new(),
        }
    }

    fn send_to(&self, peer_id: u64, message: &Message) {
        if let Some(peer) = self.peers.get(&peer_id) {
            let _ = peer.tx.send(message.encode().to_vec());
        }
    }

    fn broadcast(&self, from: u64, message: &Message) {
        let frame = message.encode().to_vec();
        for (peer_id, peer) in &self.peers {
            if *peer_id != from {
                let _ = peer.tx.send(frame.clone());
            }
        }
    }
}

struct RelayInner {
    rooms: Mutex<HashMap<DocumentId, Room>>,
    available: AtomicBool,
    denied_tokens: Mutex<HashSet<String>>,
    next_peer: AtomicU64,
}

/// Relay reachable without a network
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                rooms: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                denied_tokens: Mutex::new(HashSet::new()),
                next_peer: AtomicU64::new(1),
            }),
        }
    }

    /// While unavailable, every connect attempt fails
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        info!(available, "Memory relay availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Sever every open link; clients see the link drop
    pub fn drop_connections(&self) {
        let mut rooms = self.inner.rooms.lock();
        for room in rooms.values_mut() {
            room.peers.clear();
            room.awareness.clear();
        }
        info!("Memory relay dropped all links");
    }

    /// Answer connects presenting `token` with a permission-denied frame
    pub fn deny_token(&self, token: impl Into<String>) {
        self.inner.denied_tokens.lock().insert(token.into());
    }

    pub fn allow_token(&self, token: &str) {
        self.inner.denied_tokens.lock().remove(token);
    }

    /// The relay replica's text for a room
    pub fn document_text(&self, id: &DocumentId) -> Option<String> {
        self.inner.rooms.lock().get(id).map(|room| room.doc.text())
    }

    pub fn peer_count(&self, id: &DocumentId) -> usize {
        self.inner
            .rooms
            .lock()
            .get(id)
            .map(|room| room.peers.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("available", &self.is_available())
            .field("rooms", &self.inner.rooms.lock().len())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryRelay {
    async fn connect(&self, endpoint: &Endpoint) -> TransportResult<Link> {
        if !self.is_available() {
            return Err(TransportError::Connect("relay unreachable".into()));
        }

        // client -> relay
        let (client_tx, mut relay_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        // relay -> client
        let (relay_tx, client_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let denied = endpoint
            .token()
            .map_or(false, |token| self.inner.denied_tokens.lock().contains(token));
        if denied {
            let _ = relay_tx.send(Message::PermissionDenied("token rejected".into()).encode().to_vec());
            // Swallow whatever the client sends before it reads the denial
            tokio::spawn(async move { while relay_rx.recv().await.is_some() {} });
            return Ok(Link::new(client_tx, client_rx));
        }

        let peer_id = self.inner.next_peer.fetch_add(1, Ordering::Relaxed);
        let doc_id = endpoint.document_id().clone();
        {
            let mut rooms = self.inner.rooms.lock();
            let room = rooms
                .entry(doc_id.clone())
                .or_insert_with(|| Room::new(doc_id.clone()));
            let _ = relay_tx.send(Message::SyncStep1(room.doc.state_vector()).encode().to_vec());
            room.peers.insert(
                peer_id,
                Peer {
                    tx: relay_tx,
                    clients: HashSet::new(),
                },
            );
        }
        debug!(doc_id = %doc_id, peer_id, "Peer joined memory relay");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(frame) = relay_rx.recv().await {
                match Message::decode(&frame) {
                    Ok(message) => {
                        if !inner.route(&doc_id, peer_id, message) {
                            break;
                        }
                    }
                    Err(e) => warn!(doc_id = %doc_id, peer_id, error = %e, "Relay dropped malformed frame"),
                }
            }
            inner.leave(&doc_id, peer_id);
        });

        Ok(Link::new(client_tx, client_rx))
    }
}

impl RelayInner {
    /// Returns false once the peer is no longer part of the room
    fn route(&self, doc_id: &DocumentId, peer_id: u64, message: Message) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(doc_id) else {
            return false;
        };
        if !room.peers.contains_key(&peer_id) {
            return false;
        }

        match message {
            Message::SyncStep1(state_vector) => match room.doc.diff(&state_vector) {
                Ok(diff) => room.send_to(peer_id, &Message::SyncStep2(diff)),
                Err(e) => warn!(doc_id = %doc_id, error = %e, "Bad state vector from peer"),
            },
            Message::SyncStep2(update) | Message::Update(update) => {
                match room.doc.apply_update(ChangeOrigin::Remote, &update) {
                    Ok(()) => room.broadcast(peer_id, &Message::Update(update)),
                    Err(e) => warn!(doc_id = %doc_id, error = %e, "Bad update from peer"),
                }
            }
            Message::Awareness(update) => {
                for state in &update.states {
                    if let Some(peer) = room.peers.get_mut(&peer_id) {
                        peer.clients.insert(state.client_id);
                    }
                    match state.state {
                        Some(_) => {
                            room.awareness.insert(state.client_id, state.clone());
                        }
                        None => {
                            room.awareness.remove(&state.client_id);
                        }
                    }
                }
                room.broadcast(peer_id, &Message::Awareness(update));
            }
            Message::QueryAwareness => {
                let states: Vec<AwarenessState> = room.awareness.values().cloned().collect();
                if !states.is_empty() {
                    room.send_to(peer_id, &Message::Awareness(AwarenessUpdate::new(states)));
                }
            }
            Message::PermissionDenied(_) => {}
        }
        true
    }

    /// Forget a peer and tell the room its clients left
    fn leave(&self, doc_id: &DocumentId, peer_id: u64) {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(doc_id) else {
            return;
        };
        let Some(peer) = room.peers.remove(&peer_id) else {
            return;
        };

        let mut departed = Vec::new();
        for client_id in peer.clients {
            // Already re-announced over a newer link
            if room.peers.values().any(|p| p.clients.contains(&client_id)) {
                continue;
            }
            if let Some(last) = room.awareness.remove(&client_id) {
                departed.push(AwarenessState {
                    client_id,
                    clock: last.clock,
                    state: None,
                });
            }
        }

        if !departed.is_empty() {
            room.broadcast(peer_id, &Message::Awareness(AwarenessUpdate::new(departed)));
        }
        debug!(doc_id = %doc_id, peer_id, "Peer left memory relay");
    }
}
