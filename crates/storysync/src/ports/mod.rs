//! Ports to the engine's external collaborators.
//!
//! The engine never touches a document format or a tracker API directly. It
//! talks to three traits:
//!
//! - [`DocumentParser`]: document source text to domain entities
//! - [`IssueTracker`]: domain operations to remote mutations
//! - [`DocumentFormatter`]: markdown to the tracker's rich-text payload
//!
//! # Backends shipped with the crate
//!
//! - [`memory::InMemoryTracker`]: a tracker held in memory, with failure
//!   injection, used by the test-suite and for dry experiments
//! - [`document::StaticDocument`]: a parser over an already-built [`Epic`]
//! - [`document::PlainTextFormatter`]: wraps markdown in a minimal JSON payload
//!
//! # Error Handling
//!
//! Tracker methods return [`TrackerError`], a closed taxonomy. Implementations
//! must retry transient failures themselves; the orchestrator treats every
//! error it receives as final for that unit of work.

pub mod document;
pub mod memory;

use crate::domain::{
    CommitRef, Epic, IssueFieldUpdate, IssueKey, NewStory, NewSubtask, RemoteComment,
    RemoteIssue, Status, SubtaskUpdate, UserStory,
};
use crate::error::{Result, TrackerError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Heading every commits-table comment must contain.
///
/// The comments phase looks for it in existing comments to avoid posting the
/// same table twice. [`DocumentFormatter::format_commits_table`]
/// implementations must keep it in the plain-text rendering of their output.
pub const COMMITS_MARKER: &str = "Related Commits";

/// Result type of tracker operations.
pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A formatted rich-text document.
///
/// `source` is the markdown the document was produced from and is what the
/// engine compares; `body` is the tracker-native payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichDoc {
    /// Markdown source.
    pub source: String,
    /// Tracker-native payload.
    pub body: serde_json::Value,
}

impl RichDoc {
    /// A document carrying plain text as-is, for values that were already
    /// read back from the tracker (e.g. when restoring a backup).
    pub fn plain(text: impl Into<String>) -> Self {
        let source = text.into();
        let body = serde_json::json!({ "type": "text", "text": source });
        Self { source, body }
    }
}

/// Converts document source into domain entities.
///
/// Implementations must be deterministic: identical input yields identical
/// output.
pub trait DocumentParser: Send + Sync {
    /// Parse every story of the document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Parse` if the source is not a valid document.
    fn parse_stories(&self, source: &str) -> Result<Vec<UserStory>>;

    /// Parse the epic, if the document declares one.
    ///
    /// # Errors
    ///
    /// Returns `Error::Parse` if the source is not a valid document.
    fn parse_epic(&self, source: &str) -> Result<Option<Epic>>;

    /// Structural problems of the document; empty when valid.
    fn validate(&self, source: &str) -> Vec<String>;
}

/// Converts markdown into the tracker's rich-text representation.
pub trait DocumentFormatter: Send + Sync {
    /// Format a markdown fragment.
    fn format_text(&self, markdown: &str) -> RichDoc;

    /// Format a table of commits. The plain-text rendering must contain
    /// [`COMMITS_MARKER`].
    fn format_commits_table(&self, commits: &[CommitRef]) -> RichDoc;
}

/// Remote issue tracker.
///
/// All methods take `&self` so one client can serve concurrent batch
/// operations; implementations use interior mutability where needed.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Human-readable tracker name, for logs.
    fn name(&self) -> &str;

    /// Verify connectivity and credentials.
    async fn test_connection(&self) -> TrackerResult<()>;

    /// Stories under an epic, in tracker order, with their subtasks.
    async fn get_epic_children(&self, epic_key: &IssueKey) -> TrackerResult<Vec<RemoteIssue>>;

    /// Fetch one issue with its subtasks.
    async fn get_issue(&self, key: &IssueKey) -> TrackerResult<RemoteIssue>;

    /// Create a story under an epic. Fails when the issue type is not
    /// accepted by the project.
    async fn create_story(&self, story: NewStory) -> TrackerResult<IssueKey>;

    /// Update plain fields of an issue or subtask.
    async fn update_issue_fields(
        &self,
        key: &IssueKey,
        update: IssueFieldUpdate,
    ) -> TrackerResult<()>;

    /// Replace an issue's description.
    async fn update_description(&self, key: &IssueKey, description: RichDoc)
    -> TrackerResult<()>;

    /// Create a subtask under a story.
    async fn create_subtask(&self, subtask: NewSubtask) -> TrackerResult<IssueKey>;

    /// Update a subtask.
    async fn update_subtask(&self, key: &IssueKey, update: SubtaskUpdate) -> TrackerResult<()>;

    /// Post a comment.
    async fn add_comment(&self, key: &IssueKey, body: RichDoc) -> TrackerResult<()>;

    /// Comments of an issue, oldest first.
    async fn get_issue_comments(&self, key: &IssueKey) -> TrackerResult<Vec<RemoteComment>>;

    /// Move an issue or subtask to the given workflow status.
    async fn transition_issue(&self, key: &IssueKey, target: Status) -> TrackerResult<()>;

    /// Raw status name of an issue or subtask.
    async fn get_issue_status(&self, key: &IssueKey) -> TrackerResult<String>;
}
