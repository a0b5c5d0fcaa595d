//! Outcome of a sync run.

use crate::conflict::{ConflictField, FieldValue};
use crate::domain::{IssueKey, StoryId};
use crate::error::TrackerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A unit of work that failed without stopping the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOperation {
    /// What was attempted (`update_description`, `create_subtask`, ...).
    pub operation: String,
    /// Remote item the operation targeted, when known.
    pub target_key: Option<IssueKey>,
    /// Document story the operation served, when any.
    pub story_id: Option<StoryId>,
    /// Error message.
    pub message: String,
    /// Whether retrying later may succeed without intervention.
    pub recoverable: bool,
}

impl FailedOperation {
    /// Failure record for a tracker error.
    pub fn from_tracker(
        operation: impl Into<String>,
        target_key: Option<&IssueKey>,
        story_id: Option<&StoryId>,
        error: &TrackerError,
    ) -> Self {
        Self {
            operation: operation.into(),
            target_key: target_key.cloned(),
            story_id: story_id.cloned(),
            message: error.to_string(),
            recoverable: error.is_recoverable(),
        }
    }
}

impl fmt::Display for FailedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        if let Some(key) = &self.target_key {
            write!(f, " on {key}")?;
        }
        if let Some(story) = &self.story_id {
            write!(f, " (story {story})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// A tracker-side value the document should adopt.
///
/// The engine never edits the document; callers apply these themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullChange {
    /// Document story.
    pub story_id: StoryId,
    /// Remote issue holding the value.
    pub issue_key: IssueKey,
    /// Field to update in the document.
    pub field: ConflictField,
    /// Current document value.
    pub local: FieldValue,
    /// Value to adopt.
    pub value: FieldValue,
}

/// Append-only record of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Session the run belonged to.
    pub session_id: String,
    /// Whether no remote mutation was performed.
    pub dry_run: bool,
    /// Whether a conflict under the abort strategy stopped the run.
    pub aborted: bool,
    /// Backup taken before mutating, if any.
    pub backup_id: Option<String>,

    /// Stories matched to an existing remote issue.
    pub stories_matched: usize,
    /// Remote stories created.
    pub stories_created: usize,
    /// Stories whose remote fields were updated.
    pub stories_updated: usize,
    /// Stories left alone because their fingerprint did not change.
    pub stories_skipped: usize,
    /// Subtasks created.
    pub subtasks_created: usize,
    /// Subtasks updated.
    pub subtasks_updated: usize,
    /// Commit comments posted.
    pub comments_added: usize,
    /// Status transitions performed.
    pub statuses_updated: usize,
    /// Whether the epic issue itself was updated.
    pub epic_updated: bool,
    /// Conflicts found.
    pub conflicts_detected: usize,
    /// Conflicts decided other than by skipping.
    pub conflicts_resolved: usize,

    /// Final match table.
    pub matched: BTreeMap<StoryId, IssueKey>,
    /// Stories with no remote counterpart.
    pub unmatched_stories: Vec<StoryId>,
    /// Tracker values the document should adopt.
    pub pull_changes: Vec<PullChange>,
    /// Per-item failures.
    pub failed_operations: Vec<FailedOperation>,
    /// Error messages, one per failure.
    pub errors: Vec<String>,
    /// Non-fatal notes.
    pub warnings: Vec<String>,
}

impl SyncResult {
    /// No failure was recorded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Some units succeeded and some failed.
    #[must_use]
    pub fn partial_success(&self) -> bool {
        self.successes() > 0 && self.failures() > 0
    }

    /// Successful remote mutations.
    #[must_use]
    pub fn successes(&self) -> usize {
        self.stories_created
            + self.stories_updated
            + self.subtasks_created
            + self.subtasks_updated
            + self.comments_added
            + self.statuses_updated
            + usize::from(self.epic_updated)
    }

    /// Failed units.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failed_operations.len()
    }

    /// Record a failed unit.
    pub fn record_failure(&mut self, failure: FailedOperation) {
        self.errors.push(failure.to_string());
        self.failed_operations.push(failure);
    }

    /// Record an error that is not tied to a unit of work.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Record a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// One-line human summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let outcome = if self.aborted {
            "aborted"
        } else if self.success() {
            "succeeded"
        } else if self.partial_success() {
            "partially succeeded"
        } else {
            "failed"
        };
        format!(
            "sync {outcome}{}: {} matched, {} created, {} updated, {} skipped, \
             {} subtasks created, {} subtasks updated, {} comments, {} transitions, \
             {} conflicts ({} resolved), {} failures",
            if self.dry_run { " (dry run)" } else { "" },
            self.stories_matched,
            self.stories_created,
            self.stories_updated,
            self.stories_skipped,
            self.subtasks_created,
            self.subtasks_updated,
            self.comments_added,
            self.statuses_updated,
            self.conflicts_detected,
            self.conflicts_resolved,
            self.failures(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_tracks_errors() {
        let mut result = SyncResult::default();
        assert!(result.success());
        assert!(!result.partial_success());

        result.stories_updated = 2;
        result.record_failure(FailedOperation::from_tracker(
            "update_description",
            Some(&IssueKey::new("PROJ-3")),
            Some(&StoryId::new("US-002")),
            &TrackerError::NotFound("PROJ-3".into()),
        ));
        assert!(!result.success());
        assert!(result.partial_success());
        assert_eq!(
            result.errors[0],
            "update_description on PROJ-3 (story US-002): Not found: PROJ-3"
        );
    }

    #[test]
    fn failures_alone_are_not_partial() {
        let mut result = SyncResult::default();
        result.record_error("tracker unreachable");
        assert!(!result.success());
        assert!(!result.partial_success());
        assert!(result.summary().starts_with("sync failed"));
    }
}
