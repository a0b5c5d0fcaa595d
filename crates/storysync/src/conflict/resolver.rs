//! Conflict resolution strategies.

use super::merge::{MergeOptions, merge_values};
use super::{Conflict, ConflictField, ConflictReport, FieldValue};
use crate::domain::StoryId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Per-run strategy for conflicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Ask a [`ConflictPrompt`] for every conflict.
    Ask,
    /// The document wins.
    ForceLocal,
    /// The tracker wins.
    ForceRemote,
    /// Leave both sides untouched and warn.
    #[default]
    Skip,
    /// Stop the run at the first conflict.
    Abort,
    /// Three-way merge; ambiguous fields stay unresolved.
    Merge,
    /// Three-way merge; ambiguous fields go to the prompt.
    SmartMerge,
}

/// Decision for one conflicting field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    /// Push the document's value.
    UseLocal,
    /// Keep the tracker's value.
    UseRemote,
    /// Use this value on both sides.
    UseValue(FieldValue),
    /// Leave both sides untouched.
    Skip,
}

/// Operator callback for [`ResolutionStrategy::Ask`].
///
/// This is the only place a run blocks on outside input. There is no
/// timeout; implementations that need one provide it.
pub trait ConflictPrompt: Send + Sync {
    /// Decide a conflict.
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

impl<F> ConflictPrompt for F
where
    F: Fn(&Conflict) -> Resolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        self(conflict)
    }
}

/// Resolutions of one run, each usable once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionSet {
    resolved: BTreeMap<(StoryId, ConflictField), Resolution>,
    /// Conflicts no decision was reached for.
    pub unresolved: Vec<Conflict>,
    /// Messages about skipped and unresolved conflicts.
    pub warnings: Vec<String>,
}

impl ResolutionSet {
    /// Take the resolution for a (story, field); a second call returns `None`.
    pub fn take(&mut self, story_id: &StoryId, field: ConflictField) -> Option<Resolution> {
        self.resolved.remove(&(story_id.clone(), field))
    }

    /// Peek at a resolution without consuming it.
    #[must_use]
    pub fn get(&self, story_id: &StoryId, field: ConflictField) -> Option<&Resolution> {
        self.resolved.get(&(story_id.clone(), field))
    }

    /// Whether the (story, field) conflict was left unresolved.
    #[must_use]
    pub fn is_unresolved(&self, story_id: &StoryId, field: ConflictField) -> bool {
        self.unresolved
            .iter()
            .any(|c| &c.story_id == story_id && c.field == field)
    }

    /// Decisions other than [`Resolution::Skip`].
    #[must_use]
    pub fn resolved_count(&self) -> usize {
        self.resolved
            .values()
            .filter(|r| **r != Resolution::Skip)
            .count()
    }

    /// Number of decisions, skips included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    /// Whether there are no decisions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

/// Applies a [`ResolutionStrategy`] to a [`ConflictReport`].
pub struct ConflictResolver<'a> {
    strategy: ResolutionStrategy,
    merge: MergeOptions,
    prompt: Option<&'a dyn ConflictPrompt>,
}

impl fmt::Debug for ConflictResolver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("strategy", &self.strategy)
            .field("merge", &self.merge)
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}

impl<'a> ConflictResolver<'a> {
    /// Resolver without a prompt; `Ask` then degrades to `Skip`.
    #[must_use]
    pub fn new(strategy: ResolutionStrategy, merge: MergeOptions) -> Self {
        Self {
            strategy,
            merge,
            prompt: None,
        }
    }

    /// Attach the operator prompt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: &'a dyn ConflictPrompt) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Decide every conflict of the report.
    ///
    /// Each (story, field) is decided once, even if the report lists it
    /// twice.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConflictAbort` at the first conflict under
    /// [`ResolutionStrategy::Abort`].
    pub fn resolve(&self, report: &ConflictReport) -> Result<ResolutionSet> {
        let mut set = ResolutionSet::default();
        for conflict in &report.conflicts {
            let slot = (conflict.story_id.clone(), conflict.field);
            if set.resolved.contains_key(&slot) || set.is_unresolved(&slot.0, slot.1) {
                continue;
            }
            let decision = match self.strategy {
                ResolutionStrategy::Abort => {
                    return Err(Error::ConflictAbort {
                        story_id: conflict.story_id.to_string(),
                        field: conflict.field.to_string(),
                    });
                }
                ResolutionStrategy::ForceLocal => Some(Resolution::UseLocal),
                ResolutionStrategy::ForceRemote => Some(Resolution::UseRemote),
                ResolutionStrategy::Skip => Some(Resolution::Skip),
                ResolutionStrategy::Ask => Some(self.ask(conflict)),
                ResolutionStrategy::Merge => self.merge(conflict),
                ResolutionStrategy::SmartMerge => {
                    Some(self.merge(conflict).unwrap_or_else(|| self.ask(conflict)))
                }
            };
            match decision {
                Some(resolution) => {
                    if resolution == Resolution::Skip {
                        set.warnings.push(format!(
                            "conflict on {}.{} skipped; both sides left unchanged",
                            conflict.story_id, conflict.field
                        ));
                    }
                    debug!(
                        story_id = %conflict.story_id,
                        field = %conflict.field,
                        ?resolution,
                        "conflict resolved"
                    );
                    set.resolved.insert(slot, resolution);
                }
                None => {
                    warn!(
                        story_id = %conflict.story_id,
                        field = %conflict.field,
                        "conflict could not be merged; leaving it unresolved"
                    );
                    set.warnings.push(format!(
                        "conflict on {}.{} could not be merged; left unresolved",
                        conflict.story_id, conflict.field
                    ));
                    set.unresolved.push(conflict.clone());
                }
            }
        }
        Ok(set)
    }

    fn merge(&self, conflict: &Conflict) -> Option<Resolution> {
        merge_values(&conflict.base, &conflict.local, &conflict.remote, self.merge)
            .map(Resolution::UseValue)
    }

    fn ask(&self, conflict: &Conflict) -> Resolution {
        match self.prompt {
            Some(prompt) => prompt.resolve(conflict),
            None => {
                warn!(
                    story_id = %conflict.story_id,
                    field = %conflict.field,
                    "no conflict prompt configured; skipping"
                );
                Resolution::Skip
            }
        }
    }
}
