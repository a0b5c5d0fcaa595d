//! Tracker-side shapes: what the tracker port returns and accepts.

use super::{IssueKey, Priority, Status};
use serde::{Deserialize, Serialize};

/// A work item as fetched from the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteIssue {
    /// Tracker key.
    pub key: IssueKey,
    /// Summary line (the story title on the tracker).
    pub summary: String,
    /// Description rendered to plain text/markdown by the tracker client.
    pub description: Option<String>,
    /// Raw workflow status name.
    pub status: String,
    /// Issue type name (`Story`, `Task`, ...).
    pub issue_type: String,
    /// Estimate.
    pub story_points: Option<f64>,
    /// Priority, when the tracker exposes one.
    pub priority: Option<Priority>,
    /// Assignee account name.
    pub assignee: Option<String>,
    /// Child subtasks in tracker order.
    pub subtasks: Vec<RemoteSubtask>,
}

impl RemoteIssue {
    /// Parsed workflow status.
    #[must_use]
    pub fn status(&self) -> Status {
        Status::from_tracker_name(&self.status)
    }
}

/// A subtask as fetched from the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSubtask {
    /// Tracker key.
    pub key: IssueKey,
    /// Summary line (the subtask name).
    pub summary: String,
    /// Description as plain text.
    pub description: Option<String>,
    /// Raw workflow status name.
    pub status: String,
    /// Estimate.
    pub story_points: Option<f64>,
    /// Assignee account name.
    pub assignee: Option<String>,
}

impl RemoteSubtask {
    /// Parsed workflow status.
    #[must_use]
    pub fn status(&self) -> Status {
        Status::from_tracker_name(&self.status)
    }
}

/// A comment on a remote issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteComment {
    /// Tracker comment id.
    pub id: String,
    /// Author account name.
    pub author: Option<String>,
    /// Body as plain text.
    pub body: String,
}

/// Data for creating a story under an epic.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStory {
    /// Parent epic.
    pub epic_key: IssueKey,
    /// Summary line.
    pub summary: String,
    /// Formatted description.
    pub description: crate::ports::RichDoc,
    /// Issue type name to request.
    pub issue_type: String,
    /// Estimate.
    pub story_points: Option<f64>,
    /// Priority.
    pub priority: Priority,
}

/// Data for creating a subtask under a story.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubtask {
    /// Parent story.
    pub parent_key: IssueKey,
    /// Summary line.
    pub summary: String,
    /// Formatted description.
    pub description: crate::ports::RichDoc,
    /// Estimate.
    pub story_points: Option<f64>,
    /// Assignee account name.
    pub assignee: Option<String>,
}

/// Partial update of plain issue fields; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueFieldUpdate {
    /// New summary.
    pub summary: Option<String>,
    /// New estimate (`Some(None)` clears it).
    pub story_points: Option<Option<f64>>,
    /// New priority.
    pub priority: Option<Priority>,
    /// New assignee (`Some(None)` unassigns).
    pub assignee: Option<Option<String>>,
}

impl IssueFieldUpdate {
    /// Whether the update would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.story_points.is_none()
            && self.priority.is_none()
            && self.assignee.is_none()
    }
}

/// Partial update of a subtask; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubtaskUpdate {
    /// New summary.
    pub summary: Option<String>,
    /// New description.
    pub description: Option<crate::ports::RichDoc>,
    /// New estimate (`Some(None)` clears it).
    pub story_points: Option<Option<f64>>,
    /// New assignee (`Some(None)` unassigns).
    pub assignee: Option<Option<String>>,
}

impl SubtaskUpdate {
    /// Whether the update would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.summary.is_none()
            && self.description.is_none()
            && self.story_points.is_none()
            && self.assignee.is_none()
    }
}
