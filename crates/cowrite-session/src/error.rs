//! Session errors

use cowrite_storage::StorageError;
use cowrite_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Document(#[from] cowrite_core::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Access resolution failed: {0}")]
    Access(String),

    #[error("Metadata unavailable: {0}")]
    Metadata(String),

    #[error("Document is read-only")]
    ReadOnly,

    #[error("No session is established")]
    NotEstablished,

    #[error("Surface has been disposed")]
    Disposed,
}

pub type SessionResult<T> = Result<T, SessionError>;
