//! Domain types for epic synchronization.
//!
//! The document side is an [`Epic`] holding [`UserStory`] entries, each with
//! [`Subtask`]s. These are produced by a
//! [`DocumentParser`](crate::ports::DocumentParser) and never mutated by the
//! engine. The tracker side lives in [`remote`].

pub mod remote;

pub use remote::{
    IssueFieldUpdate, NewStory, NewSubtask, RemoteComment, RemoteIssue, RemoteSubtask,
    SubtaskUpdate,
};

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a story within its document (e.g. `US-001`).
    StoryId
);

string_id!(
    /// Key of a remote work item (e.g. `PROJ-123`).
    IssueKey
);

/// Priority of a story.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Drop everything.
    Highest,
    /// Important.
    High,
    /// Normal.
    #[default]
    Medium,
    /// Nice to have.
    Low,
    /// Someday.
    Lowest,
}

impl Priority {
    /// The tracker-facing priority name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Highest => "Highest",
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
            Self::Lowest => "Lowest",
        }
    }

    /// Parse a priority name as trackers and documents write it.
    ///
    /// Accepts `P0`..`P4` and the usual words (`critical`, `blocker`,
    /// `minor`, `trivial`). Unknown names fall back to `Medium`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "highest" | "critical" | "blocker" | "p0" => Self::Highest,
            "high" | "major" | "p1" => Self::High,
            "low" | "minor" | "p3" => Self::Low,
            "lowest" | "trivial" | "p4" => Self::Lowest,
            _ => Self::Medium,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow status shared by stories and subtasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Not yet scheduled.
    Planned,
    /// Ready to start.
    #[default]
    Open,
    /// Being worked on.
    InProgress,
    /// Awaiting review.
    InReview,
    /// Finished.
    Done,
    /// Abandoned.
    Cancelled,
}

impl Status {
    /// Terminal states never receive further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// The transition target name sent to trackers.
    #[must_use]
    pub fn tracker_name(self) -> &'static str {
        match self {
            Self::Planned => "Backlog",
            Self::Open => "To Do",
            Self::InProgress => "In Progress",
            Self::InReview => "In Review",
            Self::Done => "Done",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Lenient parse of a tracker or document status name.
    ///
    /// Unknown names map to `Open`.
    #[must_use]
    pub fn from_tracker_name(name: &str) -> Self {
        Self::recognize(name).unwrap_or(Self::Open)
    }

    /// Parse a status name, or `None` for a workflow state outside the
    /// known set.
    #[must_use]
    pub fn recognize(name: &str) -> Option<Self> {
        let normalized = name
            .trim()
            .to_ascii_lowercase()
            .replace(['-', '_'], " ");
        let status = match normalized.as_str() {
            "done" | "closed" | "resolved" | "complete" | "completed" | "fixed" => Self::Done,
            "cancelled" | "canceled" | "won't do" | "wont do" | "rejected" => Self::Cancelled,
            "in progress" | "doing" | "started" | "active" => Self::InProgress,
            "in review" | "review" | "code review" | "testing" | "qa" => Self::InReview,
            "planned" | "backlog" => Self::Planned,
            "open" | "to do" | "todo" | "new" | "selected for development" => Self::Open,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tracker_name())
    }
}

/// The role/want/benefit triple of a user story.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    /// Who wants it.
    pub role: String,
    /// What they want.
    pub want: String,
    /// Why.
    pub benefit: String,
}

impl Description {
    /// Render as the single markdown sentence used in tracker descriptions.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        format!(
            "**As a** {} **I want** {} **so that** {}",
            self.role.trim(),
            self.want.trim(),
            self.benefit.trim()
        )
    }
}

/// One item of a story's acceptance checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    /// Criterion text.
    pub text: String,
    /// Whether it has been met.
    pub done: bool,
}

/// A commit referenced from a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    /// Commit hash (short or full).
    pub hash: String,
    /// First line of the commit message.
    pub message: String,
}

/// A subtask of a story.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Subtask name, also its identity within the story.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Estimate.
    pub story_points: Option<f64>,
    /// Workflow status.
    pub status: Status,
    /// Assignee account name.
    pub assignee: Option<String>,
}

/// A user story as written in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStory {
    /// Identifier, stable within the document.
    pub id: StoryId,
    /// Story title.
    pub title: String,
    /// Role/want/benefit description.
    pub description: Option<Description>,
    /// Ordered acceptance checklist.
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    /// Estimate.
    pub story_points: Option<f64>,
    /// Priority.
    pub priority: Priority,
    /// Workflow status.
    pub status: Status,
    /// Subtasks, in document order.
    pub subtasks: Vec<Subtask>,
    /// Free-text technical notes.
    pub technical_notes: String,
    /// Related commits.
    pub commits: Vec<CommitRef>,
    /// Remote key, once the document records a match.
    pub external_key: Option<IssueKey>,
}

impl UserStory {
    /// A story with only id and title set.
    pub fn new(id: impl Into<StoryId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            acceptance_criteria: Vec::new(),
            story_points: None,
            priority: Priority::default(),
            status: Status::default(),
            subtasks: Vec::new(),
            technical_notes: String::new(),
            commits: Vec::new(),
            external_key: None,
        }
    }

    /// The tracker description body for this story, as markdown.
    ///
    /// Combines the role/want/benefit sentence, the acceptance checklist and
    /// the technical notes, skipping empty sections.
    #[must_use]
    pub fn body_markdown(&self) -> String {
        let mut sections = Vec::new();
        if let Some(description) = &self.description {
            sections.push(description.to_markdown());
        }
        if !self.acceptance_criteria.is_empty() {
            let mut checklist = String::from("#### Acceptance Criteria\n");
            for criterion in &self.acceptance_criteria {
                let mark = if criterion.done { 'x' } else { ' ' };
                checklist.push_str(&format!("- [{mark}] {}\n", criterion.text.trim()));
            }
            sections.push(checklist.trim_end().to_string());
        }
        if !self.technical_notes.trim().is_empty() {
            sections.push(format!(
                "#### Technical Notes\n{}",
                self.technical_notes.trim()
            ));
        }
        sections.join("\n\n")
    }
}

/// The document root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    /// Remote epic key, when the document names one.
    pub key: Option<IssueKey>,
    /// Epic title.
    pub title: String,
    /// Epic description, as markdown.
    pub description: String,
    /// Stories in document order.
    pub stories: Vec<UserStory>,
}

/// Normalize a title for matching.
///
/// Lowercases, collapses every run of non-alphanumeric characters into a
/// single space and trims, so `"Login  page!"` and `"login-page"` compare
/// equal.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_space = false;
    for c in title.chars() {
        if c.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Collapse whitespace runs to single spaces and trim.
#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compare two optional estimates with a small tolerance.
#[must_use]
pub fn points_equal(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() < 1e-9,
        (None, None) => true,
        _ => false,
    }
}
