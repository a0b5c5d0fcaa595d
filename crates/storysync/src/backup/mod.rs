//! Point-in-time backups of remote state.
//!
//! Before a mutating run the orchestrator snapshots every issue under the
//! epic, subtasks included, into an immutable [`Backup`]. Backups can be
//! compared with the live tracker ([`diff`]) and pushed back onto it field by
//! field ([`restore`]). Retention keeps the newest `max_backups` per epic and
//! drops backups older than `retention_days`.

pub mod diff;
pub mod restore;
pub mod store;

pub use diff::{DiffResult, FieldDiff, IssueDiff, compare_backup_to_current};
pub use restore::{RestoreResult, RestoredField};
pub use store::{BackupStore, InMemoryBackupStore, JsonlBackupStore};

use crate::domain::{IssueKey, Priority, RemoteIssue, RemoteSubtask};
use crate::error::{Error, Result};
use crate::keys::{sanitize, sha256_hex};
use crate::ports::IssueTracker;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Captured state of a subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSnapshot {
    /// Tracker key.
    pub key: IssueKey,
    /// Summary.
    pub summary: String,
    /// Description.
    pub description: Option<String>,
    /// Raw status name.
    pub status: String,
    /// Estimate.
    pub story_points: Option<f64>,
    /// Assignee.
    pub assignee: Option<String>,
}

impl From<&RemoteSubtask> for SubtaskSnapshot {
    fn from(subtask: &RemoteSubtask) -> Self {
        Self {
            key: subtask.key.clone(),
            summary: subtask.summary.clone(),
            description: subtask.description.clone(),
            status: subtask.status.clone(),
            story_points: subtask.story_points,
            assignee: subtask.assignee.clone(),
        }
    }
}

/// Captured state of an issue and its subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSnapshot {
    /// Tracker key.
    pub key: IssueKey,
    /// Summary.
    pub summary: String,
    /// Description.
    pub description: Option<String>,
    /// Raw status name.
    pub status: String,
    /// Issue type name.
    pub issue_type: String,
    /// Estimate.
    pub story_points: Option<f64>,
    /// Priority.
    pub priority: Option<Priority>,
    /// Assignee.
    pub assignee: Option<String>,
    /// Subtasks.
    pub subtasks: Vec<SubtaskSnapshot>,
}

impl From<&RemoteIssue> for IssueSnapshot {
    fn from(issue: &RemoteIssue) -> Self {
        Self {
            key: issue.key.clone(),
            summary: issue.summary.clone(),
            description: issue.description.clone(),
            status: issue.status.clone(),
            issue_type: issue.issue_type.clone(),
            story_points: issue.story_points,
            priority: issue.priority,
            assignee: issue.assignee.clone(),
            subtasks: issue.subtasks.iter().map(SubtaskSnapshot::from).collect(),
        }
    }
}

/// An immutable copy of an epic's remote issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// `<epic>-<yyyymmddTHHMMSS>-<hash>`.
    pub backup_id: String,
    /// Epic key.
    pub epic_key: String,
    /// Document the run was syncing.
    pub document_path: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Captured issues.
    pub issues: Vec<IssueSnapshot>,
}

impl Backup {
    /// Number of issues.
    #[must_use]
    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    /// Number of subtasks across all issues.
    #[must_use]
    pub fn subtask_count(&self) -> usize {
        self.issues.iter().map(|i| i.subtasks.len()).sum()
    }

    /// Listing entry for this backup.
    #[must_use]
    pub fn summary(&self) -> BackupSummary {
        BackupSummary {
            backup_id: self.backup_id.clone(),
            epic_key: self.epic_key.clone(),
            created_at: self.created_at,
            issue_count: self.issue_count(),
            subtask_count: self.subtask_count(),
        }
    }
}

/// Listing entry of a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    /// Backup id.
    pub backup_id: String,
    /// Epic key.
    pub epic_key: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Number of issues.
    pub issue_count: usize,
    /// Number of subtasks.
    pub subtask_count: usize,
}

fn backup_id(epic_key: &str, created_at: DateTime<Utc>, issues: &[IssueSnapshot]) -> String {
    let mut content = serde_json::to_vec(issues).unwrap_or_default();
    content.extend_from_slice(
        created_at
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string()
            .as_bytes(),
    );
    format!(
        "{}-{}-{}",
        sanitize(epic_key),
        created_at.format("%Y%m%dT%H%M%S"),
        &sha256_hex(&content)[..8]
    )
}

/// Creates, lists and prunes backups.
#[derive(Clone)]
pub struct BackupManager {
    store: Arc<dyn BackupStore>,
    max_backups: usize,
    retention_days: Option<u32>,
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("max_backups", &self.max_backups)
            .field("retention_days", &self.retention_days)
            .finish_non_exhaustive()
    }
}

impl BackupManager {
    /// Manager keeping up to `max_backups` per epic; `0` keeps every backup.
    pub fn new(store: Arc<dyn BackupStore>, max_backups: usize) -> Self {
        Self {
            store,
            max_backups,
            retention_days: None,
        }
    }

    /// Also drop backups older than `days`.
    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }

    /// Snapshot every issue under the epic and persist it, then apply
    /// retention.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracker cannot be read or the backup cannot
    /// be written.
    pub async fn create_backup<T: IssueTracker + ?Sized>(
        &self,
        tracker: &T,
        epic_key: &IssueKey,
        document_path: &str,
    ) -> Result<Backup> {
        let children = tracker.get_epic_children(epic_key).await?;
        let issues: Vec<IssueSnapshot> = children.iter().map(IssueSnapshot::from).collect();
        let created_at = Utc::now();
        let backup = Backup {
            backup_id: backup_id(epic_key.as_str(), created_at, &issues),
            epic_key: epic_key.to_string(),
            document_path: document_path.to_string(),
            created_at,
            issues,
        };
        self.store.save(&backup).await?;
        info!(
            backup_id = %backup.backup_id,
            issues = backup.issue_count(),
            subtasks = backup.subtask_count(),
            "backup created"
        );
        self.cleanup(epic_key.as_str()).await?;
        Ok(backup)
    }

    /// Backups of an epic, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_backups(&self, epic_key: &str) -> Result<Vec<BackupSummary>> {
        self.store.list(epic_key).await
    }

    /// Load a backup.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackupNotFound` if there is no such backup.
    pub async fn load_backup(&self, backup_id: &str) -> Result<Backup> {
        self.store
            .load(backup_id)
            .await?
            .ok_or_else(|| Error::BackupNotFound(backup_id.to_string()))
    }

    /// Newest backup of an epic.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn latest_backup(&self, epic_key: &str) -> Result<Option<Backup>> {
        match self.store.list(epic_key).await?.first() {
            Some(summary) => self.store.load(&summary.backup_id).await,
            None => Ok(None),
        }
    }

    /// Delete a backup. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<bool> {
        self.store.delete(backup_id).await
    }

    /// Apply retention to an epic's backups. Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn cleanup(&self, epic_key: &str) -> Result<usize> {
        let cutoff = self
            .retention_days
            .map(|days| Utc::now() - Duration::days(i64::from(days)));
        let mut deleted = 0;
        for (index, summary) in self.store.list(epic_key).await?.iter().enumerate() {
            let over_count = self.max_backups > 0 && index >= self.max_backups;
            let expired = cutoff.is_some_and(|cutoff| summary.created_at < cutoff);
            if (over_count || expired) && self.store.delete(&summary.backup_id).await? {
                debug!(backup_id = %summary.backup_id, over_count, expired, "backup pruned");
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(epic_key, deleted, "old backups pruned");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::memory::InMemoryTracker;
    use tempfile::TempDir;

    async fn tracker_with_epic() -> (InMemoryTracker, IssueKey) {
        let tracker = InMemoryTracker::new("PROJ");
        let epic = tracker.create_epic("Epic").await;
        tracker.insert_story(&epic, "Sign in").await;
        tracker.insert_story(&epic, "Sign out").await;
        (tracker, epic)
    }

    #[test]
    fn backup_id_shape() {
        let at = DateTime::parse_from_rfc3339("2026-10-18T09:30:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = backup_id("PROJ-1", at, &[]);
        assert!(id.starts_with("PROJ-1-20261018T093005-"), "{id}");
        assert_eq!(id.len(), "PROJ-1-20261018T093005-".len() + 8);
    }

    #[tokio::test]
    async fn create_list_load_latest() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(Arc::new(JsonlBackupStore::new(dir.path())), 0);
        let (tracker, epic) = tracker_with_epic().await;

        let backup = manager.create_backup(&tracker, &epic, "epic.md").await.unwrap();
        assert_eq!(backup.issue_count(), 2);

        let listed = manager.list_backups(epic.as_str()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].issue_count, 2);

        let loaded = manager.load_backup(&backup.backup_id).await.unwrap();
        assert_eq!(loaded, backup);
        let latest = manager.latest_backup(epic.as_str()).await.unwrap();
        assert_eq!(latest.map(|b| b.backup_id), Some(backup.backup_id.clone()));

        assert!(manager.delete_backup(&backup.backup_id).await.unwrap());
        assert!(matches!(
            manager.load_backup(&backup.backup_id).await,
            Err(Error::BackupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn retention_keeps_newest() {
        let store = Arc::new(InMemoryBackupStore::new());
        let manager = BackupManager::new(store.clone(), 2);
        let (tracker, epic) = tracker_with_epic().await;

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(manager.create_backup(&tracker, &epic, "epic.md").await.unwrap().backup_id);
        }
        let left: Vec<String> = manager
            .list_backups(epic.as_str())
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.backup_id)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&ids[3]));
    }

    #[tokio::test]
    async fn expired_backups_are_pruned() {
        let store = Arc::new(InMemoryBackupStore::new());
        let manager = BackupManager::new(store.clone(), 0).with_retention_days(30);
        let mut old = Backup {
            backup_id: "PROJ-1-20200101T000000-00000000".into(),
            epic_key: "PROJ-1".into(),
            document_path: "epic.md".into(),
            created_at: Utc::now() - Duration::days(90),
            issues: Vec::new(),
        };
        store.save(&old).await.unwrap();
        old.backup_id = "PROJ-1-20990101T000000-00000000".into();
        old.created_at = Utc::now();
        store.save(&old).await.unwrap();

        assert_eq!(manager.cleanup("PROJ-1").await.unwrap(), 1);
        assert_eq!(manager.list_backups("PROJ-1").await.unwrap().len(), 1);
    }
}
