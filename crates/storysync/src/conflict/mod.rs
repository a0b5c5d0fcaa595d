//! Three-way conflict detection and resolution.
//!
//! For every matched story that has a [`StorySnapshot`] from the last
//! successful run, each tracked field is compared across three values:
//!
//! - **base**: the value both sides agreed on after the last run
//! - **local**: the value the document holds now
//! - **remote**: the value the tracker holds now
//!
//! A [`Conflict`] exists only when all three differ
//! (`local != base && remote != base && local != remote`). A field changed on
//! one side only is a [`FieldChange`] in that direction and flows through
//! the normal apply phases. Stories without a snapshot produce nothing: the
//! first sync of a story is a plain push.
//!
//! Resolution lives in [`resolver`], merging in [`merge`] and baselines in
//! [`snapshot`].

pub mod merge;
pub mod resolver;
pub mod snapshot;

pub use merge::{MergeOptions, NumericPolicy, TextGranularity};
pub use resolver::{
    ConflictPrompt, ConflictResolver, Resolution, ResolutionSet, ResolutionStrategy,
};
pub use snapshot::{
    FieldSnapshot, InMemorySnapshotStore, JsonlSnapshotStore, SnapshotStore, StorySnapshot,
    SyncSnapshot,
};

use crate::domain::{IssueKey, RemoteIssue, Status, StoryId, UserStory, normalize_whitespace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// A comparable field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Text; compared with whitespace runs collapsed.
    Text(String),
    /// A number; compared with a small tolerance.
    Number(f64),
    /// No value.
    Empty,
}

impl FieldValue {
    /// Text value; blank text is [`FieldValue::Empty`].
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Self::Empty
        } else {
            Self::Text(value)
        }
    }

    /// Numeric value from an optional estimate.
    #[must_use]
    pub fn from_points(points: Option<f64>) -> Self {
        points.map_or(Self::Empty, Self::Number)
    }

    /// Semantic equality.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => normalize_whitespace(a) == normalize_whitespace(b),
            (Self::Number(a), Self::Number(b)) => (a - b).abs() < 1e-9,
            (Self::Empty, Self::Empty) => true,
            _ => false,
        }
    }

    /// Whether this is a number.
    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    /// The number, if any.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The text, or `""` for non-text values.
    #[must_use]
    pub fn as_text(&self) -> &str {
        match self {
            Self::Text(s) => s,
            _ => "",
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
            Self::Empty => f.write_str("(empty)"),
        }
    }
}

/// Story fields subject to three-way comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictField {
    /// Story title / issue summary.
    Title,
    /// Rendered story body / issue description.
    Description,
    /// Estimate.
    StoryPoints,
    /// Workflow status.
    Status,
}

impl ConflictField {
    /// Every tracked field.
    pub const ALL: [Self; 4] = [
        Self::Title,
        Self::Description,
        Self::StoryPoints,
        Self::Status,
    ];

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::StoryPoints => "story_points",
            Self::Status => "status",
        }
    }

    /// The document's value of this field.
    #[must_use]
    pub fn local_value(self, story: &UserStory) -> FieldValue {
        match self {
            Self::Title => FieldValue::text(story.title.clone()),
            Self::Description => FieldValue::text(story.body_markdown()),
            Self::StoryPoints => FieldValue::from_points(story.story_points),
            Self::Status => FieldValue::text(story.status.tracker_name()),
        }
    }

    /// The tracker's value of this field. Status names are canonicalized so
    /// that `Closed` and `Done` compare equal.
    #[must_use]
    pub fn remote_value(self, issue: &RemoteIssue) -> FieldValue {
        match self {
            Self::Title => FieldValue::text(issue.summary.clone()),
            Self::Description => FieldValue::text(issue.description.clone().unwrap_or_default()),
            Self::StoryPoints => FieldValue::from_points(issue.story_points),
            Self::Status => FieldValue::text(Status::from_tracker_name(&issue.status).tracker_name()),
        }
    }
}

impl fmt::Display for ConflictField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one field moved since the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Nobody changed it.
    Unchanged,
    /// Only the document changed it.
    LocalOnly,
    /// Only the tracker changed it.
    RemoteOnly,
    /// Both changed it to the same value.
    Converged,
    /// Both changed it, differently.
    Conflict,
}

/// Classify a (base, local, remote) triple.
#[must_use]
pub fn classify(base: &FieldValue, local: &FieldValue, remote: &FieldValue) -> Divergence {
    let local_changed = !local.same_as(base);
    let remote_changed = !remote.same_as(base);
    match (local_changed, remote_changed) {
        (false, false) => Divergence::Unchanged,
        (true, false) => Divergence::LocalOnly,
        (false, true) => Divergence::RemoteOnly,
        (true, true) if local.same_as(remote) => Divergence::Converged,
        (true, true) => Divergence::Conflict,
    }
}

/// A field both sides changed differently since the base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Document story.
    pub story_id: StoryId,
    /// Matched remote issue.
    pub issue_key: IssueKey,
    /// Conflicting field.
    pub field: ConflictField,
    /// Last agreed value.
    pub base: FieldValue,
    /// Document value.
    pub local: FieldValue,
    /// Tracker value.
    pub remote: FieldValue,
}

/// A field changed on one side only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Document story.
    pub story_id: StoryId,
    /// Matched remote issue.
    pub issue_key: IssueKey,
    /// Changed field.
    pub field: ConflictField,
    /// Last agreed value.
    pub base: FieldValue,
    /// New value on the changing side.
    pub value: FieldValue,
}

/// Outcome of a detection pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictReport {
    /// Genuine three-way divergences.
    pub conflicts: Vec<Conflict>,
    /// Fields only the document changed.
    pub local_changes: Vec<FieldChange>,
    /// Fields only the tracker changed.
    pub remote_changes: Vec<FieldChange>,
}

impl ConflictReport {
    /// Whether any conflict was found.
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// The conflict on a (story, field), if any.
    #[must_use]
    pub fn conflict(&self, story_id: &StoryId, field: ConflictField) -> Option<&Conflict> {
        self.conflicts
            .iter()
            .find(|c| &c.story_id == story_id && c.field == field)
    }
}

/// Compares document, tracker and snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Detect conflicts and one-sided changes for every matched story that
    /// has a snapshot.
    #[must_use]
    pub fn detect(
        stories: &[UserStory],
        remote: &[RemoteIssue],
        matches: &BTreeMap<StoryId, IssueKey>,
        snapshot: &SyncSnapshot,
    ) -> ConflictReport {
        let by_key: HashMap<&IssueKey, &RemoteIssue> =
            remote.iter().map(|issue| (&issue.key, issue)).collect();
        let mut report = ConflictReport::default();

        for story in stories {
            let Some(key) = matches.get(&story.id) else {
                continue;
            };
            let (Some(issue), Some(story_snapshot)) =
                (by_key.get(key), snapshot.stories.get(&story.id))
            else {
                continue;
            };
            for field in ConflictField::ALL {
                let Some(base) = story_snapshot.base(field) else {
                    continue;
                };
                let local = field.local_value(story);
                let remote = field.remote_value(issue);
                match classify(base, &local, &remote) {
                    Divergence::Unchanged | Divergence::Converged => {}
                    Divergence::LocalOnly => report.local_changes.push(FieldChange {
                        story_id: story.id.clone(),
                        issue_key: key.clone(),
                        field,
                        base: base.clone(),
                        value: local,
                    }),
                    Divergence::RemoteOnly => report.remote_changes.push(FieldChange {
                        story_id: story.id.clone(),
                        issue_key: key.clone(),
                        field,
                        base: base.clone(),
                        value: remote,
                    }),
                    Divergence::Conflict => {
                        debug!(story_id = %story.id, %field, "conflict detected");
                        report.conflicts.push(Conflict {
                            story_id: story.id.clone(),
                            issue_key: key.clone(),
                            field,
                            base: base.clone(),
                            local,
                            remote,
                        });
                    }
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(key: &str, summary: &str, points: Option<f64>) -> RemoteIssue {
        RemoteIssue {
            key: IssueKey::new(key),
            summary: summary.into(),
            description: None,
            status: "To Do".into(),
            issue_type: "Story".into(),
            story_points: points,
            priority: None,
            assignee: None,
            subtasks: Vec::new(),
        }
    }

    #[test]
    fn text_comparison_ignores_whitespace_runs() {
        assert!(FieldValue::text("a  b\n").same_as(&FieldValue::text("a b")));
        assert_eq!(FieldValue::text("   "), FieldValue::Empty);
    }

    #[test]
    fn remote_status_names_are_canonical() {
        let mut issue = remote("PROJ-2", "A", None);
        issue.status = "Closed".into();
        assert_eq!(
            ConflictField::Status.remote_value(&issue),
            FieldValue::text("Done")
        );
    }

    #[test]
    fn detects_conflict_and_one_sided_changes() {
        let mut story = UserStory::new("US-001", "Renamed locally");
        story.story_points = Some(5.0);
        let issue = remote("PROJ-2", "Original", Some(8.0));
        let matches = BTreeMap::from([(story.id.clone(), issue.key.clone())]);

        let base_story = {
            let mut s = UserStory::new("US-001", "Original");
            s.story_points = Some(3.0);
            s
        };
        let base_issue = remote("PROJ-2", "Original", Some(3.0));
        let snapshot = SyncSnapshot::capture(
            "PROJ-1",
            "epic.md",
            std::slice::from_ref(&base_story),
            std::slice::from_ref(&base_issue),
            &matches,
            None,
        );

        let report = ConflictDetector::detect(&[story], &[issue], &matches, &snapshot);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].field, ConflictField::StoryPoints);
        assert_eq!(report.local_changes.len(), 1);
        assert_eq!(report.local_changes[0].field, ConflictField::Title);
        assert!(report.remote_changes.is_empty());
    }

    #[test]
    fn stories_without_snapshot_produce_nothing() {
        let story = UserStory::new("US-001", "A");
        let issue = remote("PROJ-2", "B", None);
        let matches = BTreeMap::from([(story.id.clone(), issue.key.clone())]);
        let report = ConflictDetector::detect(
            &[story],
            &[issue],
            &matches,
            &SyncSnapshot::empty("PROJ-1", "epic.md"),
        );
        assert_eq!(report, ConflictReport::default());
    }
}
