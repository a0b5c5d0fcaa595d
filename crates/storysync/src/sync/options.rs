//! Run options and store handles.

use crate::backup::{BackupManager, InMemoryBackupStore};
use crate::conflict::{InMemorySnapshotStore, MergeOptions, ResolutionStrategy, SnapshotStore};
use crate::fingerprint::{FingerprintStore, InMemoryFingerprintStore};
use crate::state::{InMemoryStateStore, StateStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Issue type names tried, in order, when creating a story.
pub const DEFAULT_STORY_ISSUE_TYPES: [&str; 3] = ["Story", "User Story", "Task"];

/// Which optional phases run. Matching always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct PhaseToggles {
    /// Snapshot remote state before mutating.
    pub backup: bool,
    /// Push epic-level fields.
    pub update_epic: bool,
    /// Create remote stories for unmatched document stories.
    pub create_stories: bool,
    /// Push story bodies, titles and estimates.
    pub descriptions: bool,
    /// Create and update subtasks.
    pub subtasks: bool,
    /// Post commit tables.
    pub comments: bool,
    /// Transition finished work.
    pub statuses: bool,
}

impl Default for PhaseToggles {
    fn default() -> Self {
        Self {
            backup: true,
            update_epic: true,
            create_stories: true,
            descriptions: true,
            subtasks: true,
            comments: true,
            statuses: true,
        }
    }
}

/// Limits for batched subtask creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Operations in flight at once.
    pub max_concurrency: usize,
    /// Sustained request rate; `0` disables limiting.
    pub requests_per_second: f64,
    /// Requests allowed back to back.
    pub burst: u32,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            requests_per_second: 10.0,
            burst: 5,
        }
    }
}

/// Options of one run.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct SyncOptions {
    /// Compute everything, mutate nothing, persist no baseline.
    pub dry_run: bool,
    /// Skip stories whose fingerprint did not change.
    pub incremental: bool,
    /// Treat every story as changed even in incremental mode.
    pub force_full_sync: bool,
    /// Report remote-only changes as pull changes.
    pub bidirectional: bool,
    /// Optional phases.
    pub phases: PhaseToggles,
    /// Issue type names tried, in order, when creating a story.
    pub story_issue_types: Vec<String>,
    /// Run three-way conflict detection and keep a snapshot.
    pub conflict_detection: bool,
    /// How conflicts are decided.
    pub strategy: ResolutionStrategy,
    /// Merge settings for the merge strategies.
    pub merge: MergeOptions,
    /// Create missing subtasks through the batch executor.
    pub batch: Option<BatchOptions>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            incremental: false,
            force_full_sync: false,
            bidirectional: false,
            phases: PhaseToggles::default(),
            story_issue_types: DEFAULT_STORY_ISSUE_TYPES
                .iter()
                .map(ToString::to_string)
                .collect(),
            conflict_detection: true,
            strategy: ResolutionStrategy::default(),
            merge: MergeOptions::default(),
            batch: None,
        }
    }
}

/// Store handles a run reads and writes.
///
/// Opened by the caller and passed in, so tests can hand over isolated
/// in-memory stores.
#[derive(Clone)]
pub struct SyncStores {
    /// Fingerprint baselines.
    pub fingerprints: Arc<dyn FingerprintStore>,
    /// Conflict snapshots.
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Session records.
    pub sessions: Arc<dyn StateStore>,
    /// Backups; `None` disables the backup phase.
    pub backups: Option<BackupManager>,
}

impl std::fmt::Debug for SyncStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStores")
            .field("backups", &self.backups)
            .finish_non_exhaustive()
    }
}

impl SyncStores {
    /// Fresh in-memory stores, backups included (unlimited retention).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            fingerprints: Arc::new(InMemoryFingerprintStore::new()),
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            sessions: Arc::new(InMemoryStateStore::new()),
            backups: Some(BackupManager::new(Arc::new(InMemoryBackupStore::new()), 0)),
        }
    }
}
