//! Document-side backends: a parser over a prebuilt epic and a plain-text
//! formatter.

use super::{COMMITS_MARKER, DocumentFormatter, DocumentParser, RichDoc};
use crate::domain::{CommitRef, Epic, UserStory};
use crate::error::Result;
use std::collections::HashSet;

/// A [`DocumentParser`] that ignores its input and returns a fixed epic.
///
/// Callers that already hold domain entities (tests, embedders with their own
/// parser) hand them to the orchestrator through this type.
#[derive(Debug, Clone)]
pub struct StaticDocument {
    epic: Epic,
}

impl StaticDocument {
    /// Wrap an epic.
    #[must_use]
    pub fn new(epic: Epic) -> Self {
        Self { epic }
    }

    /// The wrapped epic.
    #[must_use]
    pub fn epic(&self) -> &Epic {
        &self.epic
    }
}

impl DocumentParser for StaticDocument {
    fn parse_stories(&self, _source: &str) -> Result<Vec<UserStory>> {
        Ok(self.epic.stories.clone())
    }

    fn parse_epic(&self, _source: &str) -> Result<Option<Epic>> {
        Ok(Some(self.epic.clone()))
    }

    fn validate(&self, _source: &str) -> Vec<String> {
        validate_epic(&self.epic)
    }
}

/// Structural checks every parser is expected to apply.
///
/// Story ids must be non-empty and unique, titles non-empty, estimates
/// non-negative and subtask names non-empty.
#[must_use]
pub fn validate_epic(epic: &Epic) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    for story in &epic.stories {
        if story.id.as_str().trim().is_empty() {
            problems.push(format!("story '{}' has an empty id", story.title));
        } else if !seen.insert(story.id.clone()) {
            problems.push(format!("duplicate story id {}", story.id));
        }
        if story.title.trim().is_empty() {
            problems.push(format!("story {} has an empty title", story.id));
        }
        if story.story_points.is_some_and(|p| p < 0.0 || p.is_nan()) {
            problems.push(format!("story {} has invalid story points", story.id));
        }
        for (index, subtask) in story.subtasks.iter().enumerate() {
            if subtask.name.trim().is_empty() {
                problems.push(format!(
                    "story {} subtask #{} has an empty name",
                    story.id,
                    index + 1
                ));
            }
        }
    }
    problems
}

/// A [`DocumentFormatter`] producing a minimal JSON payload around the
/// markdown source.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextFormatter;

impl DocumentFormatter for PlainTextFormatter {
    fn format_text(&self, markdown: &str) -> RichDoc {
        RichDoc {
            source: markdown.to_string(),
            body: serde_json::json!({
                "type": "doc",
                "content": [{ "type": "markdown", "text": markdown }],
            }),
        }
    }

    fn format_commits_table(&self, commits: &[CommitRef]) -> RichDoc {
        let mut table = format!("#### {COMMITS_MARKER}\n| Commit | Message |\n|---|---|\n");
        for commit in commits {
            let message = commit.message.replace('|', "\\|");
            table.push_str(&format!("| `{}` | {} |\n", commit.hash, message.trim()));
        }
        self.format_text(table.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Subtask, UserStory};

    fn epic(stories: Vec<UserStory>) -> Epic {
        Epic {
            key: None,
            title: "Epic".into(),
            description: String::new(),
            stories,
        }
    }

    #[test]
    fn valid_epic_has_no_problems() {
        let doc = epic(vec![UserStory::new("US-001", "A"), UserStory::new("US-002", "B")]);
        assert!(validate_epic(&doc).is_empty());
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut bad_points = UserStory::new("US-002", "B");
        bad_points.story_points = Some(-1.0);
        bad_points.subtasks.push(Subtask::default());
        let doc = epic(vec![
            UserStory::new("US-001", "A"),
            UserStory::new("US-001", " "),
            bad_points,
        ]);

        let problems = validate_epic(&doc);
        assert_eq!(problems.len(), 4, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("duplicate story id US-001")));
    }

    #[test]
    fn commits_table_carries_marker_and_escapes_pipes() {
        let doc = PlainTextFormatter.format_commits_table(&[CommitRef {
            hash: "abc123".into(),
            message: "fix a|b".into(),
        }]);
        assert!(doc.source.contains(COMMITS_MARKER));
        assert!(doc.source.contains("| `abc123` | fix a\\|b |"));
    }
}
