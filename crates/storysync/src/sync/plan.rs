//! Per-field push decisions.
//!
//! Combines the conflict snapshot and the run's resolutions into a single
//! question the apply phases ask for every field: what, if anything, should
//! be written to the tracker?

use super::result::PullChange;
use crate::conflict::{ConflictField, FieldValue, Resolution, ResolutionSet, SyncSnapshot};
use crate::domain::{IssueKey, StoryId};
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct FieldPlanner {
    snapshot: Option<SyncSnapshot>,
    resolutions: ResolutionSet,
    pull_changes: Vec<PullChange>,
}

impl FieldPlanner {
    pub(crate) fn new(snapshot: SyncSnapshot, resolutions: ResolutionSet) -> Self {
        Self {
            snapshot: Some(snapshot),
            resolutions,
            pull_changes: Vec::new(),
        }
    }

    fn base(&self, story_id: &StoryId, field: ConflictField) -> Option<&FieldValue> {
        self.snapshot
            .as_ref()?
            .stories
            .get(story_id)?
            .base(field)
    }

    fn pull(
        &mut self,
        story_id: &StoryId,
        issue_key: &IssueKey,
        field: ConflictField,
        local: FieldValue,
        value: FieldValue,
    ) {
        self.pull_changes.push(PullChange {
            story_id: story_id.clone(),
            issue_key: issue_key.clone(),
            field,
            local,
            value,
        });
    }

    /// The value to write for a field, or `None` to leave the tracker alone.
    ///
    /// Empty document values are never pushed: a field the document leaves
    /// blank does not clear the tracker. Remote-only changes are left alone
    /// here; they are reported from the conflict report instead.
    pub(crate) fn push_value(
        &mut self,
        story_id: &StoryId,
        issue_key: &IssueKey,
        field: ConflictField,
        local: FieldValue,
        remote: &FieldValue,
    ) -> Option<FieldValue> {
        if local.same_as(remote) {
            return None;
        }

        if let Some(resolution) = self.resolutions.take(story_id, field) {
            return match resolution {
                Resolution::UseLocal => (local != FieldValue::Empty).then_some(local),
                Resolution::UseRemote => {
                    self.pull(story_id, issue_key, field, local, remote.clone());
                    None
                }
                Resolution::UseValue(value) => {
                    if !value.same_as(&local) {
                        self.pull(story_id, issue_key, field, local, value.clone());
                    }
                    (!value.same_as(remote) && value != FieldValue::Empty).then_some(value)
                }
                Resolution::Skip => None,
            };
        }
        if self.resolutions.is_unresolved(story_id, field) {
            debug!(%story_id, %field, "unresolved conflict; leaving field");
            return None;
        }

        if self.base(story_id, field).is_some_and(|base| local.same_as(base)) {
            debug!(%story_id, %field, "remote-only change; not pushing");
            return None;
        }

        (local != FieldValue::Empty).then_some(local)
    }

    /// Pull changes collected so far, leaving the planner's list empty.
    pub(crate) fn take_pull_changes(&mut self) -> Vec<PullChange> {
        std::mem::take(&mut self.pull_changes)
    }
}
