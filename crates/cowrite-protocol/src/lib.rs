//! Relay wire protocol
//!
//! One channel per document carries two interleaved sub-protocols:
//! document sync (state vectors and updates) and awareness broadcast.
//!
//! ## Frame Format
//! ```text
//! <tag: u8><payload>
//!
//! 0  SyncStep1         encoded state vector
//! 1  SyncStep2         update answering a SyncStep1
//! 2  Update            incremental update
//! 3  Awareness         JSON array of {clientId, clock, state|null}
//! 4  QueryAwareness    empty
//! 5  PermissionDenied  UTF-8 reason
//! ```

pub mod error;
pub mod message;

pub use error::{ProtocolError, ProtocolResult};
pub use message::{AwarenessState, AwarenessUpdate, Message, MAX_FRAME_SIZE};
