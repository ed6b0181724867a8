//! cowrite collaboration sessions
//!
//! Composes the document handle, the local cache and the relay transport
//! into sessions, and drives them for a document view:
//! - [`ConnectionManager`]: opens and closes one session per document
//! - [`SessionController`]: access, connection lifecycle, presence roster
//! - [`PresenceBroadcaster`]: local identity and remote caret styles
//! - [`EditorBinding`]: keeps a text surface and the document in step

pub mod binding;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod manager;
pub mod network;
pub mod presence;

pub use binding::{BufferSurface, EditorBinding, TextEdit, TextSurface};
pub use collaborators::{
    AccessResolver, DocumentMetadata, MemoryStyleSink, MetadataSource, Permission, ShareAccess, StaticAccess,
    StaticMetadata, StyleSink,
};
pub use config::ManagerConfig;
pub use controller::{CollabEvent, CollabSession, CollabState, Notice, SessionController};
pub use error::{SessionError, SessionResult};
pub use manager::{ConnectionManager, OpenOptions, Session};
pub use network::{NetworkMonitor, NetworkSignal};
pub use presence::{render_stylesheet, LocalIdentity, PresenceBroadcaster};
