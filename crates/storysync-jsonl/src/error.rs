//! Error types for storysync-jsonl operations.

use std::io;
use thiserror::Error;

/// The error type for storysync-jsonl operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred while reading or writing.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A strict read hit a line that could not be decoded.
    #[error("Invalid JSONL at line {line_number}: {message}")]
    InvalidLine {
        /// The 1-based line number of the offending line.
        line_number: usize,
        /// The decoder's message.
        message: String,
    },
}

/// A specialized Result type for storysync-jsonl operations.
pub type Result<T> = std::result::Result<T, Error>;
