//! Frame handler - applies relay frames to the document and awareness

use crate::awareness::Awareness;
use cowrite_core::{ChangeOrigin, SharedDocument};
use cowrite_protocol::Message;
use std::sync::Arc;
use tracing::{debug, warn};

/// What processing one frame produced
#[derive(Debug, Default)]
pub struct FrameOutcome {
    /// Frames to send back on the same link
    pub replies: Vec<Message>,
    /// The relay answered our state vector; the replica is caught up
    pub synced: bool,
    /// The relay refused the token
    pub denied: Option<String>,
}

/// Handles frames for one document session
pub struct FrameHandler {
    doc: Arc<SharedDocument>,
    awareness: Arc<Awareness>,
}

impl FrameHandler {
    pub fn new(doc: Arc<SharedDocument>, awareness: Arc<Awareness>) -> Self {
        Self { doc, awareness }
    }

    /// Decode and apply one frame. Malformed frames are logged and skipped.
    pub fn process(&self, data: &[u8]) -> FrameOutcome {
        match Message::decode(data) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                warn!(doc_id = %self.doc.id(), error = %e, "Dropping malformed frame");
                FrameOutcome::default()
            }
        }
    }

    pub fn handle_message(&self, message: Message) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();
        debug!(doc_id = %self.doc.id(), kind = message.kind(), "Frame received");

        match message {
            Message::SyncStep1(state_vector) => match self.doc.diff(&state_vector) {
                Ok(diff) => outcome.replies.push(Message::SyncStep2(diff)),
                Err(e) => warn!(doc_id = %self.doc.id(), error = %e, "Bad state vector from relay"),
            },
            Message::SyncStep2(update) => {
                self.apply(&update);
                outcome.synced = true;
            }
            Message::Update(update) => self.apply(&update),
            Message::Awareness(update) => self.awareness.apply_remote(&update),
            Message::QueryAwareness => {
                let states = self.awareness.full_update();
                if !states.is_empty() {
                    outcome.replies.push(Message::Awareness(states));
                }
            }
            Message::PermissionDenied(reason) => outcome.denied = Some(reason),
        }

        outcome
    }

    fn apply(&self, update: &[u8]) {
        if let Err(e) = self.doc.apply_update(ChangeOrigin::Remote, update) {
            warn!(doc_id = %self.doc.id(), error = %e, "Failed to apply remote update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::DocumentId;
    use serde_json::json;

    fn handler() -> (Arc<SharedDocument>, Arc<Awareness>, FrameHandler) {
        let doc = Arc::new(SharedDocument::with_client_id(DocumentId::new("h").unwrap(), 1));
        let awareness = Arc::new(Awareness::new(1));
        let handler = FrameHandler::new(doc.clone(), awareness.clone());
        (doc, awareness, handler)
    }

    #[test]
    fn test_sync_step1_replies_with_diff() {
        let (doc, _, handler) = handler();
        doc.insert(0, "hello").unwrap();

        let peer = SharedDocument::with_client_id(DocumentId::new("h").unwrap(), 2);
        let outcome = handler.handle_message(Message::SyncStep1(peer.state_vector()));

        match outcome.replies.as_slice() {
            [Message::SyncStep2(diff)] => {
                peer.apply_update(ChangeOrigin::Remote, diff).unwrap();
                assert_eq!(peer.text(), "hello");
            }
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[test]
    fn test_sync_step2_marks_synced() {
        let (doc, _, handler) = handler();
        let peer = SharedDocument::with_client_id(DocumentId::new("h").unwrap(), 2);
        peer.insert(0, "remote").unwrap();

        let outcome = handler.handle_message(Message::SyncStep2(peer.encode_state()));
        assert!(outcome.synced);
        assert_eq!(doc.text(), "remote");
    }

    #[test]
    fn test_query_awareness_and_denial() {
        let (_, awareness, handler) = handler();
        assert!(handler.handle_message(Message::QueryAwareness).replies.is_empty());

        awareness.set_local_state(json!({"user": {"id": "me"}}));
        assert_eq!(handler.handle_message(Message::QueryAwareness).replies.len(), 1);

        let outcome = handler.handle_message(Message::PermissionDenied("expired".into()));
        assert_eq!(outcome.denied.as_deref(), Some("expired"));
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let (_, _, handler) = handler();
        let outcome = handler.process(&[0xff, 1, 2]);
        assert!(outcome.replies.is_empty());
        assert!(!outcome.synced);
    }
}
