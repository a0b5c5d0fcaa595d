//! Resumable session state.
//!
//! A session is identified by a deterministic id derived from (document
//! path, epic), so re-running against the same inputs finds the same record.
//! Resuming does not replay individual steps: every apply operation is
//! idempotent, so a resumed session simply runs the whole pipeline again
//! with its previous match table and counters available for inspection.

use crate::domain::{IssueKey, StoryId};
use crate::error::{Error, Result};
use crate::keys::session_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Snapshot remote state before mutating it.
    Backup,
    /// Match local stories to remote issues.
    Matching,
    /// Push epic-level fields.
    UpdateEpic,
    /// Create remote issues for unmatched stories.
    CreateStories,
    /// Fingerprint and conflict analysis.
    DetectChanges,
    /// Push story bodies and estimates.
    Descriptions,
    /// Create and update subtasks.
    Subtasks,
    /// Post commit tables.
    Comments,
    /// Transition finished work.
    Statuses,
    /// Save fingerprints and the conflict snapshot.
    PersistBaselines,
    /// Terminal: run finished.
    Completed,
    /// Terminal: setup failed or the run was aborted.
    Failed,
}

impl SyncPhase {
    /// Whether the session is over.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Matching => "matching",
            Self::UpdateEpic => "update_epic",
            Self::CreateStories => "create_stories",
            Self::DetectChanges => "detect_changes",
            Self::Descriptions => "descriptions",
            Self::Subtasks => "subtasks",
            Self::Comments => "comments",
            Self::Statuses => "statuses",
            Self::PersistBaselines => "persist_baselines",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit-of-work counters of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    /// Units that succeeded.
    pub succeeded: usize,
    /// Units that failed.
    pub failed: usize,
    /// Units skipped (unchanged, already in place, dry run).
    pub skipped: usize,
}

/// Persisted record of a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Deterministic id, see [`session_id`].
    pub session_id: String,
    /// Document path the session syncs.
    pub document_path: String,
    /// Target epic key.
    pub epic_key: String,
    /// Current phase.
    pub phase: SyncPhase,
    /// Whether the session runs without remote mutations.
    pub dry_run: bool,
    /// Match table as of the last checkpoint.
    pub matched: BTreeMap<StoryId, IssueKey>,
    /// Counters keyed by phase name.
    pub progress: BTreeMap<String, PhaseProgress>,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// Last checkpoint.
    pub updated_at: DateTime<Utc>,
    /// Failure message of a `Failed` session.
    pub error: Option<String>,
    /// How many times the session was picked up again after an interruption.
    pub resume_count: u32,
}

impl SyncState {
    /// Fresh session at the first phase.
    #[must_use]
    pub fn new(document_path: &str, epic_key: &str, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id(document_path, epic_key),
            document_path: document_path.to_string(),
            epic_key: epic_key.to_string(),
            phase: SyncPhase::Backup,
            dry_run,
            matched: BTreeMap::new(),
            progress: BTreeMap::new(),
            started_at: now,
            updated_at: now,
            error: None,
            resume_count: 0,
        }
    }

    /// Mutable counters of a phase.
    pub fn progress_mut(&mut self, phase: SyncPhase) -> &mut PhaseProgress {
        self.progress.entry(phase.as_str().to_string()).or_default()
    }
}

/// Persistence for session records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a session.
    async fn save(&self, state: &SyncState) -> Result<()>;

    /// Load a session by id.
    async fn load(&self, session_id: &str) -> Result<Option<SyncState>>;

    /// Delete a session. Returns whether it existed.
    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// Every stored session, most recently updated first.
    async fn list(&self) -> Result<Vec<SyncState>>;
}

/// One single-line JSONL file per session under a directory.
#[derive(Debug, Clone)]
pub struct JsonlStateStore {
    dir: PathBuf,
}

impl JsonlStateStore {
    /// Store rooted at `dir`; created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    async fn read_file(&self, path: &std::path::Path) -> Result<Option<SyncState>> {
        let (mut records, warnings) =
            storysync_jsonl::read_jsonl_resilient::<SyncState, _>(path).await?;
        for warning in &warnings {
            warn!(path = %path.display(), %warning, "skipping damaged session record");
        }
        Ok(records.pop())
    }
}

#[async_trait]
impl StateStore for JsonlStateStore {
    async fn save(&self, state: &SyncState) -> Result<()> {
        storysync_jsonl::write_jsonl_atomic(self.file_path(&state.session_id), &[state]).await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SyncState>> {
        self.read_file(&self.file_path(session_id)).await
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(storysync_jsonl::remove_if_exists(self.file_path(session_id)).await?)
    }

    async fn list(&self) -> Result<Vec<SyncState>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut states = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl")
                && let Some(state) = self.read_file(&path).await?
            {
                states.push(state);
            }
        }
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }
}

/// Session store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    sessions: Mutex<HashMap<String, SyncState>>,
}

impl InMemoryStateStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, state: &SyncState) -> Result<()> {
        self.sessions
            .lock()
            .await
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SyncState>> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.lock().await.remove(session_id).is_some())
    }

    async fn list(&self) -> Result<Vec<SyncState>> {
        let mut states: Vec<SyncState> = self.sessions.lock().await.values().cloned().collect();
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }
}

/// Session lifecycle on top of a [`StateStore`].
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn StateStore>,
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager").finish_non_exhaustive()
    }
}

impl StateManager {
    /// Manager over a store.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Resume the in-flight session for (document, epic) or start a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn begin(
        &self,
        document_path: &str,
        epic_key: &str,
        dry_run: bool,
    ) -> Result<SyncState> {
        let id = session_id(document_path, epic_key);
        let state = match self.store.load(&id).await? {
            Some(mut previous) if !previous.phase.is_terminal() => {
                previous.resume_count += 1;
                previous.dry_run = dry_run;
                previous.updated_at = Utc::now();
                info!(
                    session_id = %id,
                    phase = %previous.phase,
                    resume_count = previous.resume_count,
                    "resuming interrupted session"
                );
                previous
            }
            _ => {
                debug!(session_id = %id, "starting new session");
                SyncState::new(document_path, epic_key, dry_run)
            }
        };
        self.store.save(&state).await?;
        Ok(state)
    }

    /// Move a session to `phase` and checkpoint it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn transition(&self, state: &mut SyncState, phase: SyncPhase) -> Result<()> {
        debug!(session_id = %state.session_id, from = %state.phase, to = %phase, "phase transition");
        state.phase = phase;
        self.checkpoint(state).await
    }

    /// Persist the session as it is.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn checkpoint(&self, state: &mut SyncState) -> Result<()> {
        state.updated_at = Utc::now();
        self.store.save(state).await
    }

    /// Mark a session failed with a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn fail(&self, state: &mut SyncState, message: impl Into<String>) -> Result<()> {
        state.error = Some(message.into());
        self.transition(state, SyncPhase::Failed).await
    }

    /// Load a session by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if there is no such session.
    pub async fn load(&self, session_id: &str) -> Result<SyncState> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Every stored session, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list(&self) -> Result<Vec<SyncState>> {
        self.store.list().await
    }

    /// Delete every terminal session. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn cleanup_completed(&self) -> Result<usize> {
        let mut removed = 0;
        for state in self.store.list().await? {
            if state.phase.is_terminal() && self.store.delete(&state.session_id).await? {
                removed += 1;
            }
        }
        info!(removed, "cleaned up finished sessions");
        Ok(removed)
    }
}
