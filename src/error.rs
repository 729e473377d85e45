//! Error taxonomy for the ingestion and retrieval core.
//!
//! Only structurally invalid input (bad file type, unknown job, dimension
//! mismatch) is meant to reach callers. Parse and generation failures are
//! absorbed by their components into degraded text.

use thiserror::Error;

use crate::models::JobStatus;

/// Errors raised by the library modules.
#[derive(Debug, Error)]
pub enum RagError {
    /// File extension is neither `pdf` nor `txt`.
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// Text extraction failed. Recovered inside the parser, never fatal.
    #[error("failed to parse document: {0}")]
    ParseFailure(String),

    /// A vector's length disagrees with the index dimension.
    #[error("embedding dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Attempted to move a job backwards or out of a terminal state.
    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Persisted index and metadata disagree, or a file failed its checksum.
    #[error("index data is corrupt: {0}")]
    Corrupt(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
