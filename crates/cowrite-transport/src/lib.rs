//! cowrite transport layer
//!
//! Connects a document to its relay room:
//! - Session transport: link lifecycle, sync handshake, reconnect with backoff
//! - Awareness: per-connection presence states with clock ordering
//! - WebSocket: `ws://`/`wss://` connector (default feature)
//! - Memory: in-process relay for tests, demos and offline development

pub mod awareness;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod memory;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use awareness::{Awareness, AwarenessChange};
pub use connector::{Connector, Link};
pub use endpoint::Endpoint;
pub use error::{TransportError, TransportResult};
pub use handler::{FrameHandler, FrameOutcome};
pub use memory::MemoryRelay;
pub use transport::{ConnectionStatus, SessionTransport, TransportConfig, TransportEvent};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
