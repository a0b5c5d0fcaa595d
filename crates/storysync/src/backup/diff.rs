//! Comparison of a backup with the live tracker.

use super::{Backup, IssueSnapshot, SubtaskSnapshot};
use crate::domain::{IssueKey, RemoteIssue, RemoteSubtask, Status, normalize_whitespace, points_equal};
use crate::error::{Result, TrackerError};
use crate::ports::IssueTracker;
use crate::sync::FailedOperation;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One field that differs between backup and live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    /// Field name.
    pub field: String,
    /// Subtask the field belongs to; `None` for the issue itself.
    pub subtask_key: Option<IssueKey>,
    /// Value in the backup.
    pub backup_value: Option<String>,
    /// Live value.
    pub current_value: Option<String>,
}

/// Differences of one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDiff {
    /// Issue key.
    pub issue_key: IssueKey,
    /// Summary as captured.
    pub summary: String,
    /// Differing fields.
    pub field_diffs: Vec<FieldDiff>,
}

/// Backup versus live tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    /// Backup compared.
    pub backup_id: String,
    /// Issues with at least one differing field.
    pub issue_diffs: Vec<IssueDiff>,
    /// Issues and subtasks in the backup that no longer exist.
    pub missing_issues: Vec<IssueKey>,
    /// Issues identical to the backup.
    pub unchanged_issues: usize,
    /// Issues whose live state could not be read.
    #[serde(default)]
    pub unreadable_issues: Vec<FailedOperation>,
}

impl DiffResult {
    /// Whether anything differs.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.issue_diffs.is_empty() || !self.missing_issues.is_empty()
    }

    /// Whether every backed-up issue was compared.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.unreadable_issues.is_empty()
    }

    /// Number of differing fields.
    #[must_use]
    pub fn total_field_diffs(&self) -> usize {
        self.issue_diffs.iter().map(|d| d.field_diffs.len()).sum()
    }
}

pub(crate) fn same_text(a: Option<&str>, b: Option<&str>) -> bool {
    normalize_whitespace(a.unwrap_or_default()) == normalize_whitespace(b.unwrap_or_default())
}

/// Equal names, ignoring case, or two aliases of one known status.
/// A custom workflow state only equals itself.
pub(crate) fn same_status(a: &str, b: &str) -> bool {
    if a.trim().eq_ignore_ascii_case(b.trim()) {
        return true;
    }
    matches!(
        (Status::recognize(a), Status::recognize(b)),
        (Some(a), Some(b)) if a == b
    )
}

fn points_text(points: Option<f64>) -> Option<String> {
    points.map(|p| p.to_string())
}

struct DiffBuilder {
    subtask_key: Option<IssueKey>,
    diffs: Vec<FieldDiff>,
}

impl DiffBuilder {
    fn push(&mut self, field: &str, equal: bool, backup: Option<String>, current: Option<String>) {
        if !equal {
            self.diffs.push(FieldDiff {
                field: field.to_string(),
                subtask_key: self.subtask_key.clone(),
                backup_value: backup,
                current_value: current,
            });
        }
    }
}

fn issue_field_diffs(backup: &IssueSnapshot, current: &RemoteIssue) -> DiffBuilder {
    let mut b = DiffBuilder {
        subtask_key: None,
        diffs: Vec::new(),
    };
    b.push(
        "summary",
        backup.summary == current.summary,
        Some(backup.summary.clone()),
        Some(current.summary.clone()),
    );
    b.push(
        "description",
        same_text(backup.description.as_deref(), current.description.as_deref()),
        backup.description.clone(),
        current.description.clone(),
    );
    b.push(
        "status",
        same_status(&backup.status, &current.status),
        Some(backup.status.clone()),
        Some(current.status.clone()),
    );
    b.push(
        "story_points",
        points_equal(backup.story_points, current.story_points),
        points_text(backup.story_points),
        points_text(current.story_points),
    );
    if backup.priority.is_some() {
        b.push(
            "priority",
            backup.priority == current.priority,
            backup.priority.map(|p| p.to_string()),
            current.priority.map(|p| p.to_string()),
        );
    }
    b.push(
        "assignee",
        backup.assignee == current.assignee,
        backup.assignee.clone(),
        current.assignee.clone(),
    );
    b
}

fn subtask_field_diffs(backup: &SubtaskSnapshot, current: &RemoteSubtask, out: &mut DiffBuilder) {
    out.subtask_key = Some(backup.key.clone());
    out.push(
        "summary",
        backup.summary == current.summary,
        Some(backup.summary.clone()),
        Some(current.summary.clone()),
    );
    out.push(
        "description",
        same_text(backup.description.as_deref(), current.description.as_deref()),
        backup.description.clone(),
        current.description.clone(),
    );
    out.push(
        "status",
        same_status(&backup.status, &current.status),
        Some(backup.status.clone()),
        Some(current.status.clone()),
    );
    out.push(
        "story_points",
        points_equal(backup.story_points, current.story_points),
        points_text(backup.story_points),
        points_text(current.story_points),
    );
    out.push(
        "assignee",
        backup.assignee == current.assignee,
        backup.assignee.clone(),
        current.assignee.clone(),
    );
}

/// Compare a backup with the live tracker. Read-only.
///
/// # Errors
///
/// Returns an error only when the tracker rejects the credentials. Missing
/// issues and other read failures are reported in the result.
pub async fn compare_backup_to_current<T: IssueTracker + ?Sized>(
    tracker: &T,
    backup: &Backup,
) -> Result<DiffResult> {
    let mut result = DiffResult {
        backup_id: backup.backup_id.clone(),
        ..DiffResult::default()
    };
    for snapshot in &backup.issues {
        let current = match tracker.get_issue(&snapshot.key).await {
            Ok(issue) => issue,
            Err(TrackerError::NotFound(_)) => {
                result.missing_issues.push(snapshot.key.clone());
                continue;
            }
            Err(e) if e.is_connectivity() => return Err(e.into()),
            Err(e) => {
                warn!(issue_key = %snapshot.key, error = %e, "could not read issue for comparison");
                result.unreadable_issues.push(FailedOperation::from_tracker(
                    "get_issue",
                    Some(&snapshot.key),
                    None,
                    &e,
                ));
                continue;
            }
        };

        let mut builder = issue_field_diffs(snapshot, &current);
        for subtask in &snapshot.subtasks {
            match current.subtasks.iter().find(|s| s.key == subtask.key) {
                Some(live) => subtask_field_diffs(subtask, live, &mut builder),
                None => result.missing_issues.push(subtask.key.clone()),
            }
        }

        if builder.diffs.is_empty() {
            result.unchanged_issues += 1;
        } else {
            debug!(issue_key = %snapshot.key, fields = builder.diffs.len(), "issue differs from backup");
            result.issue_diffs.push(IssueDiff {
                issue_key: snapshot.key.clone(),
                summary: snapshot.summary.clone(),
                field_diffs: builder.diffs,
            });
        }
    }
    Ok(result)
}
