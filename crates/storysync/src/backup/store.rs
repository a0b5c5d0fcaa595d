//! Backup persistence.

use super::{Backup, BackupSummary, IssueSnapshot};
use crate::error::{Result, StoreError};
use crate::keys::sanitize;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use storysync_jsonl::JsonlReader;
use tokio::sync::Mutex;
use tracing::warn;

/// Persistence for backups. Backups are written once and never modified.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Persist a new backup.
    async fn save(&self, backup: &Backup) -> Result<()>;

    /// Load a backup by id.
    async fn load(&self, backup_id: &str) -> Result<Option<Backup>>;

    /// Summaries of an epic's backups, newest first.
    async fn list(&self, epic_key: &str) -> Result<Vec<BackupSummary>>;

    /// Delete a backup. Returns whether it existed.
    async fn delete(&self, backup_id: &str) -> Result<bool>;
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupHeader {
    backup_id: String,
    epic_key: String,
    document_path: String,
    created_at: DateTime<Utc>,
    issue_count: usize,
    subtask_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum BackupRecord {
    Header(BackupHeader),
    Issue(IssueSnapshot),
}

impl From<&BackupHeader> for BackupSummary {
    fn from(header: &BackupHeader) -> Self {
        Self {
            backup_id: header.backup_id.clone(),
            epic_key: header.epic_key.clone(),
            created_at: header.created_at,
            issue_count: header.issue_count,
            subtask_count: header.subtask_count,
        }
    }
}

/// Backups as `<dir>/<epic>/<backup-id>.jsonl`: a header line, then one
/// line per issue.
#[derive(Debug, Clone)]
pub struct JsonlBackupStore {
    dir: PathBuf,
}

impl JsonlBackupStore {
    /// Store rooted at `dir`; created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of a backup file. The epic directory is recovered from the id,
    /// which is `<epic>-<timestamp>-<hash>`.
    fn file_path(&self, backup_id: &str) -> PathBuf {
        let epic_dir = backup_id
            .rsplitn(3, '-')
            .nth(2)
            .unwrap_or(backup_id);
        self.dir
            .join(sanitize(epic_dir))
            .join(format!("{}.jsonl", sanitize(backup_id)))
    }

    async fn read_header(path: &Path) -> Result<Option<BackupHeader>> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = JsonlReader::new(file);
        match reader.read_value::<BackupRecord>().await {
            Ok(Some(BackupRecord::Header(header))) => Ok(Some(header)),
            Ok(_) => Err(corrupt(path, "backup header missing")),
            Err(e) => Err(corrupt(path, &e.to_string())),
        }
    }
}

fn corrupt(path: &Path, message: &str) -> crate::error::Error {
    StoreError::Corrupt {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
    .into()
}

#[async_trait]
impl BackupStore for JsonlBackupStore {
    async fn save(&self, backup: &Backup) -> Result<()> {
        let header = BackupRecord::Header(BackupHeader {
            backup_id: backup.backup_id.clone(),
            epic_key: backup.epic_key.clone(),
            document_path: backup.document_path.clone(),
            created_at: backup.created_at,
            issue_count: backup.issue_count(),
            subtask_count: backup.subtask_count(),
        });
        let records =
            std::iter::once(header).chain(backup.issues.iter().cloned().map(BackupRecord::Issue));
        storysync_jsonl::write_jsonl_atomic_iter(self.file_path(&backup.backup_id), records)
            .await?;
        Ok(())
    }

    async fn load(&self, backup_id: &str) -> Result<Option<Backup>> {
        let path = self.file_path(backup_id);
        let (records, warnings) =
            storysync_jsonl::read_jsonl_resilient::<BackupRecord, _>(&path).await?;
        for warning in &warnings {
            warn!(path = %path.display(), %warning, "skipping damaged backup record");
        }
        let mut records = records.into_iter();
        let Some(first) = records.next() else {
            return Ok(None);
        };
        let BackupRecord::Header(header) = first else {
            return Err(corrupt(&path, "backup header missing"));
        };
        let issues = records
            .filter_map(|record| match record {
                BackupRecord::Issue(issue) => Some(issue),
                BackupRecord::Header(_) => None,
            })
            .collect();
        Ok(Some(Backup {
            backup_id: header.backup_id,
            epic_key: header.epic_key,
            document_path: header.document_path,
            created_at: header.created_at,
            issues,
        }))
    }

    async fn list(&self, epic_key: &str) -> Result<Vec<BackupSummary>> {
        let epic_dir = self.dir.join(sanitize(epic_key));
        let mut entries = match tokio::fs::read_dir(&epic_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            match Self::read_header(&path).await {
                Ok(Some(header)) if header.epic_key == epic_key => {
                    summaries.push(BackupSummary::from(&header));
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable backup"),
            }
        }
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(summaries)
    }

    async fn delete(&self, backup_id: &str) -> Result<bool> {
        Ok(storysync_jsonl::remove_if_exists(self.file_path(backup_id)).await?)
    }
}

/// Backup store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryBackupStore {
    backups: Mutex<BTreeMap<String, Backup>>,
}

impl InMemoryBackupStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupStore for InMemoryBackupStore {
    async fn save(&self, backup: &Backup) -> Result<()> {
        self.backups
            .lock()
            .await
            .insert(backup.backup_id.clone(), backup.clone());
        Ok(())
    }

    async fn load(&self, backup_id: &str) -> Result<Option<Backup>> {
        Ok(self.backups.lock().await.get(backup_id).cloned())
    }

    async fn list(&self, epic_key: &str) -> Result<Vec<BackupSummary>> {
        let mut summaries: Vec<BackupSummary> = self
            .backups
            .lock()
            .await
            .values()
            .filter(|b| b.epic_key == epic_key)
            .map(Backup::summary)
            .collect();
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(summaries)
    }

    async fn delete(&self, backup_id: &str) -> Result<bool> {
        Ok(self.backups.lock().await.remove(backup_id).is_some())
    }
}
