//! Error types for cowrite core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid document ID: {0}")]
    InvalidDocumentId(String),

    #[error("Document destroyed: {0}")]
    DocumentDestroyed(String),

    #[error("Range {start}..{end} exceeds text length {len}")]
    InvalidRange { start: u32, end: u32, len: u32 },

    #[error("Offset {0} does not fall on a character boundary")]
    NotCharBoundary(u32),

    #[error("CRDT error: {0}")]
    Crdt(String),
}

/// Result type alias for cowrite core operations
pub type Result<T> = std::result::Result<T, Error>;
