//! cowrite core - replicated document handle and presence model
//!
//! This crate provides the transport-agnostic building blocks:
//! - A CRDT document handle exposing the shared "content" text region
//! - Validated awareness entries and the deduplicated presence roster
//! - Deterministic per-participant presence colors
//! - Listener registries returning disposer subscriptions

pub mod awareness;
pub mod color;
pub mod document;
pub mod error;
pub mod listeners;

pub use awareness::{AwarenessEntry, AwarenessUser, Participant, PresenceRoster, RosterTracker};
pub use color::{hash_identity, PresenceColor};
pub use document::{ChangeOrigin, ClientId, DocumentChange, DocumentId, SharedDocument, CONTENT_REGION};
pub use error::{Error, Result};
pub use listeners::{ListenerSet, Subscription};
