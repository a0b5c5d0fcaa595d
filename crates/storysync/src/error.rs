//! Error types for storysync.
//!
//! The taxonomy follows the engine's failure classes: setup failures surface
//! as [`Error`] and abort a run, per-item tracker failures are
//! [`TrackerError`]s that the orchestrator downgrades to failed operations,
//! and local persistence problems are [`StoreError`]s.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The top-level error type for storysync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The document could not be parsed.
    #[error("Document parse error: {0}")]
    Parse(String),

    /// The document parsed but failed validation.
    #[error("Document validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A tracker call failed where the caller cannot continue.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// Local store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A conflict was met under the abort strategy.
    #[error("Sync aborted on conflict in {story_id}.{field}")]
    ConflictAbort {
        /// Story holding the conflicting field.
        story_id: String,
        /// Name of the conflicting field.
        field: String,
    },

    /// No session with the given id exists.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// No backup with the given id exists.
    #[error("Backup not found: {0}")]
    BackupNotFound(String),
}

impl From<storysync_jsonl::Error> for Error {
    fn from(err: storysync_jsonl::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// Closed error taxonomy raised by [`IssueTracker`](crate::ports::IssueTracker)
/// implementations.
///
/// Implementations retry transient failures themselves before surfacing
/// them; the orchestrator treats every error it sees as final for that unit
/// of work.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    /// Credentials were rejected.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The target issue, transition or resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The credentials lack permission for the operation.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The tracker throttled the request and retries were exhausted.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Tracker message.
        message: String,
        /// Server-advertised wait, when known.
        retry_after: Option<Duration>,
    },

    /// A transient failure (timeout, 5xx) persisted through retries.
    #[error("Transient tracker failure: {0}")]
    Transient(String),

    /// Any other failure, including rejected payloads.
    #[error("Tracker error: {0}")]
    Other(String),
}

impl TrackerError {
    /// Whether re-running the same operation later may succeed without
    /// operator intervention.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient(_) | Self::Other(_)
        )
    }

    /// Whether the failure means the tracker cannot be used at all.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    /// Short machine-readable kind, used in logs and failure records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::NotFound(_) => "not_found",
            Self::Permission(_) => "permission",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient(_) => "transient",
            Self::Other(_) => "other",
        }
    }
}

/// Errors from the on-disk stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error in the store directory.
    #[error("Store IO error: {0}")]
    Io(#[from] io::Error),

    /// Error from the JSONL persistence layer.
    #[error("Store persistence error: {0}")]
    Jsonl(#[from] storysync_jsonl::Error),

    /// A store file decoded but its contents are unusable.
    #[error("Corrupt store file {}: {message}", path.display())]
    Corrupt {
        /// The offending file.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Cannot read config {}: {source}", path.display())]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid YAML for the schema.
    #[error("Invalid config syntax: {0}")]
    Syntax(String),

    /// A value is out of range or inconsistent.
    #[error("Invalid config value for {field}: {message}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong.
        message: String,
    },
}

/// A specialized Result type for storysync operations.
pub type Result<T> = std::result::Result<T, Error>;
