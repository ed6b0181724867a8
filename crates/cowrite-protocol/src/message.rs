//! Relay frames

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{BufMut, BytesMut};
use cowrite_core::ClientId;
use serde::{Deserialize, Serialize};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const TAG_SYNC_STEP1: u8 = 0;
const TAG_SYNC_STEP2: u8 = 1;
const TAG_UPDATE: u8 = 2;
const TAG_AWARENESS: u8 = 3;
const TAG_QUERY_AWARENESS: u8 = 4;
const TAG_PERMISSION_DENIED: u8 = 5;

/// One awareness state as carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    pub client_id: ClientId,
    pub clock: u32,
    /// `None` announces that the client left
    pub state: Option<serde_json::Value>,
}

/// A batch of awareness states
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AwarenessUpdate {
    pub states: Vec<AwarenessState>,
}

impl AwarenessUpdate {
    pub fn new(states: Vec<AwarenessState>) -> Self {
        Self { states }
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// A relay frame
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Sender's state vector; the receiver answers with `SyncStep2`
    SyncStep1(Vec<u8>),
    /// Update containing what the `SyncStep1` sender was missing
    SyncStep2(Vec<u8>),
    /// Incremental document update
    Update(Vec<u8>),
    /// Awareness states
    Awareness(AwarenessUpdate),
    /// Ask the peer to send all awareness states it knows
    QueryAwareness,
    /// The relay refused the access token
    PermissionDenied(String),
}

impl Message {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SyncStep1(_) => "sync-step1",
            Message::SyncStep2(_) => "sync-step2",
            Message::Update(_) => "update",
            Message::Awareness(_) => "awareness",
            Message::QueryAwareness => "query-awareness",
            Message::PermissionDenied(_) => "permission-denied",
        }
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the frame into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Message::SyncStep1(state_vector) => {
                buf.put_u8(TAG_SYNC_STEP1);
                buf.put_slice(state_vector);
            }
            Message::SyncStep2(update) => {
                buf.put_u8(TAG_SYNC_STEP2);
                buf.put_slice(update);
            }
            Message::Update(update) => {
                buf.put_u8(TAG_UPDATE);
                buf.put_slice(update);
            }
            Message::Awareness(update) => {
                buf.put_u8(TAG_AWARENESS);
                // Serializing plain structs and JSON values cannot fail
                let json = serde_json::to_vec(update).unwrap_or_else(|_| b"[]".to_vec());
                buf.put_slice(&json);
            }
            Message::QueryAwareness => {
                buf.put_u8(TAG_QUERY_AWARENESS);
            }
            Message::PermissionDenied(reason) => {
                buf.put_u8(TAG_PERMISSION_DENIED);
                buf.put_slice(reason.as_bytes());
            }
        }
    }

    /// Decode one complete frame
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let (&tag, payload) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;

        match tag {
            TAG_SYNC_STEP1 => Ok(Message::SyncStep1(payload.to_vec())),
            TAG_SYNC_STEP2 => Ok(Message::SyncStep2(payload.to_vec())),
            TAG_UPDATE => Ok(Message::Update(payload.to_vec())),
            TAG_AWARENESS => {
                let update: AwarenessUpdate = serde_json::from_slice(payload)
                    .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
                Ok(Message::Awareness(update))
            }
            TAG_QUERY_AWARENESS => Ok(Message::QueryAwareness),
            TAG_PERMISSION_DENIED => {
                let reason = std::str::from_utf8(payload)
                    .map_err(|e| ProtocolError::InvalidUtf8(e.to_string()))?;
                Ok(Message::PermissionDenied(reason.to_string()))
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_frame_layout() {
        let encoded = Message::Update(vec![1, 2, 3]).encode();
        assert_eq!(&encoded[..], &[TAG_UPDATE, 1, 2, 3]);

        let decoded = Message::decode(&[TAG_SYNC_STEP1, 9, 9]).unwrap();
        assert_eq!(decoded, Message::SyncStep1(vec![9, 9]));
    }

    #[test]
    fn test_awareness_wire_shape() {
        let msg = Message::Awareness(AwarenessUpdate::new(vec![
            AwarenessState {
                client_id: 12,
                clock: 3,
                state: Some(json!({"user": {"id": "a", "name": "Alice"}})),
            },
            AwarenessState {
                client_id: 13,
                clock: 8,
                state: None,
            },
        ]));
        let encoded = msg.encode();

        assert_eq!(encoded[0], TAG_AWARENESS);
        let payload: serde_json::Value = serde_json::from_slice(&encoded[1..]).unwrap();
        assert_eq!(payload[0]["clientId"], 12);
        assert_eq!(payload[1]["state"], serde_json::Value::Null);

        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_permission_denied_carries_reason() {
        let encoded = Message::PermissionDenied("token expired".into()).encode();
        match Message::decode(&encoded).unwrap() {
            Message::PermissionDenied(reason) => assert_eq!(reason, "token expired"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(Message::decode(&[]), Err(ProtocolError::EmptyFrame)));
        assert!(matches!(Message::decode(&[42]), Err(ProtocolError::UnknownTag(42))));
        assert!(matches!(
            Message::decode(&[TAG_AWARENESS, b'{']),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            Message::decode(&[TAG_PERMISSION_DENIED, 0xff]),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }
}
