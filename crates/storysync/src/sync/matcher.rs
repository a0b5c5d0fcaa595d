//! Matching document stories to remote issues.
//!
//! A story whose `external_key` names a fetched issue is matched to it
//! directly. Every other story takes the first remote issue, in fetch order,
//! whose normalized summary equals its normalized title. Remote issues stay
//! in the candidate pool, so two stories with the same title match the same
//! issue; that is recorded as-is.

use crate::domain::{IssueKey, RemoteIssue, StoryId, UserStory, normalize_title};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Match table and leftovers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    /// Story to remote key.
    pub matched: BTreeMap<StoryId, IssueKey>,
    /// Stories without a counterpart, in document order.
    pub unmatched: Vec<StoryId>,
}

/// Match stories against the epic's remote children.
#[must_use]
pub fn match_stories(stories: &[UserStory], remote: &[RemoteIssue]) -> MatchOutcome {
    let normalized: Vec<String> = remote.iter().map(|r| normalize_title(&r.summary)).collect();
    let mut outcome = MatchOutcome::default();

    for story in stories {
        let by_key = story
            .external_key
            .as_ref()
            .and_then(|key| remote.iter().find(|r| &r.key == key));
        let by_title = || {
            let title = normalize_title(&story.title);
            normalized
                .iter()
                .position(|candidate| !title.is_empty() && *candidate == title)
                .map(|index| &remote[index])
        };

        match by_key.or_else(by_title) {
            Some(issue) => {
                debug!(story_id = %story.id, issue_key = %issue.key, "matched");
                outcome.matched.insert(story.id.clone(), issue.key.clone());
            }
            None => outcome.unmatched.push(story.id.clone()),
        }
    }

    let mut seen: BTreeMap<&IssueKey, &StoryId> = BTreeMap::new();
    for (story_id, key) in &outcome.matched {
        if let Some(first) = seen.insert(key, story_id) {
            warn!(issue_key = %key, first = %first, second = %story_id, "two stories matched the same issue");
        }
    }
    outcome
}
