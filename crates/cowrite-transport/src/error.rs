//! Transport errors

use cowrite_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid relay endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Link closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport task failed: {0}")]
    Task(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
