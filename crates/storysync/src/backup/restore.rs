//! Restoring a backup onto the live tracker.
//!
//! Restore is idempotent: each captured field is compared with the live
//! value and written only when it differs. Deleted issues are never
//! recreated. Every per-issue failure is recorded as a failed operation and
//! the restore carries on; only rejected credentials before the first write
//! abort it.

use super::diff::{same_status, same_text};
use super::{Backup, BackupManager, IssueSnapshot, SubtaskSnapshot};
use crate::domain::{
    IssueFieldUpdate, IssueKey, RemoteIssue, RemoteSubtask, Status, SubtaskUpdate, points_equal,
};
use crate::error::{Error, Result, TrackerError};
use crate::ports::{IssueTracker, RichDoc, TrackerResult};
use crate::sync::FailedOperation;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A field written (or, in a dry run, due to be written) by a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredField {
    /// Issue or subtask key.
    pub issue_key: IssueKey,
    /// Field name.
    pub field: String,
}

/// Outcome of a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    /// Backup restored.
    pub backup_id: String,
    /// Whether nothing was written.
    pub dry_run: bool,
    /// Fields written.
    pub restored: Vec<RestoredField>,
    /// Fields already matching the backup.
    pub skipped_fields: usize,
    /// Issues with every field already matching the backup.
    pub issues_unchanged: usize,
    /// Failed writes and missing issues.
    pub failed_operations: Vec<FailedOperation>,
}

impl RestoreResult {
    /// Whether no operation failed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed_operations.is_empty()
    }
}

struct Restorer<'a, T: ?Sized> {
    tracker: &'a T,
    result: RestoreResult,
}

impl<T: IssueTracker + ?Sized> Restorer<'_, T> {
    /// Write one field unless it already matches. Returns whether it
    /// differed.
    async fn field<F>(&mut self, key: &IssueKey, field: &str, equal: bool, write: F) -> bool
    where
        F: std::future::Future<Output = TrackerResult<()>>,
    {
        if equal {
            self.result.skipped_fields += 1;
            return false;
        }
        if self.result.dry_run {
            debug!(%key, field, "would restore field");
        } else if let Err(e) = write.await {
            warn!(%key, field, error = %e, "field restore failed");
            self.result.failed_operations.push(FailedOperation::from_tracker(
                format!("restore_{field}"),
                Some(key),
                None,
                &e,
            ));
            return true;
        }
        self.result.restored.push(RestoredField {
            issue_key: key.clone(),
            field: field.to_string(),
        });
        true
    }

    async fn issue(&mut self, snapshot: &IssueSnapshot, live: &RemoteIssue) -> bool {
        let tracker = self.tracker;
        let key = &snapshot.key;
        let mut changed = false;

        changed |= self
            .field(key, "summary", snapshot.summary == live.summary, async {
                let update = IssueFieldUpdate {
                    summary: Some(snapshot.summary.clone()),
                    ..Default::default()
                };
                tracker.update_issue_fields(key, update).await
            })
            .await;
        changed |= self
            .field(
                key,
                "description",
                same_text(snapshot.description.as_deref(), live.description.as_deref()),
                async {
                    let text = snapshot.description.clone().unwrap_or_default();
                    tracker.update_description(key, RichDoc::plain(text)).await
                },
            )
            .await;
        changed |= self
            .field(
                key,
                "story_points",
                points_equal(snapshot.story_points, live.story_points),
                async {
                    let update = IssueFieldUpdate {
                        story_points: Some(snapshot.story_points),
                        ..Default::default()
                    };
                    tracker.update_issue_fields(key, update).await
                },
            )
            .await;
        if let Some(priority) = snapshot.priority {
            changed |= self
                .field(key, "priority", Some(priority) == live.priority, async {
                    let update = IssueFieldUpdate {
                        priority: Some(priority),
                        ..Default::default()
                    };
                    tracker.update_issue_fields(key, update).await
                })
                .await;
        }
        changed |= self
            .field(key, "assignee", snapshot.assignee == live.assignee, async {
                let update = IssueFieldUpdate {
                    assignee: Some(snapshot.assignee.clone()),
                    ..Default::default()
                };
                tracker.update_issue_fields(key, update).await
            })
            .await;
        changed |= self.status(key, &snapshot.status, &live.status).await;
        changed
    }

    /// Transition back to the captured status. A custom workflow state has
    /// no known transition and is reported as failed.
    async fn status(&mut self, key: &IssueKey, captured: &str, live: &str) -> bool {
        let equal = same_status(captured, live);
        match Status::recognize(captured) {
            Some(target) => {
                let tracker = self.tracker;
                self.field(key, "status", equal, tracker.transition_issue(key, target))
                    .await
            }
            None if equal => self.field(key, "status", true, async { Ok(()) }).await,
            None => {
                warn!(%key, status = captured, "no known transition to captured status");
                self.result.failed_operations.push(FailedOperation {
                    operation: "restore_status".to_string(),
                    target_key: Some(key.clone()),
                    story_id: None,
                    message: format!("cannot transition from '{live}' back to '{captured}'"),
                    recoverable: false,
                });
                true
            }
        }
    }

    async fn subtask(&mut self, snapshot: &SubtaskSnapshot, live: &RemoteSubtask) -> bool {
        let tracker = self.tracker;
        let key = &snapshot.key;
        let mut changed = false;

        changed |= self
            .field(key, "summary", snapshot.summary == live.summary, async {
                let update = SubtaskUpdate {
                    summary: Some(snapshot.summary.clone()),
                    ..Default::default()
                };
                tracker.update_subtask(key, update).await
            })
            .await;
        changed |= self
            .field(
                key,
                "description",
                same_text(snapshot.description.as_deref(), live.description.as_deref()),
                async {
                    let update = SubtaskUpdate {
                        description: Some(RichDoc::plain(
                            snapshot.description.clone().unwrap_or_default(),
                        )),
                        ..Default::default()
                    };
                    tracker.update_subtask(key, update).await
                },
            )
            .await;
        changed |= self
            .field(
                key,
                "story_points",
                points_equal(snapshot.story_points, live.story_points),
                async {
                    let update = SubtaskUpdate {
                        story_points: Some(snapshot.story_points),
                        ..Default::default()
                    };
                    tracker.update_subtask(key, update).await
                },
            )
            .await;
        changed |= self
            .field(key, "assignee", snapshot.assignee == live.assignee, async {
                let update = SubtaskUpdate {
                    assignee: Some(snapshot.assignee.clone()),
                    ..Default::default()
                };
                tracker.update_subtask(key, update).await
            })
            .await;
        changed |= self.status(key, &snapshot.status, &live.status).await;
        changed
    }

    fn unreadable(&mut self, key: &IssueKey, error: &TrackerError) {
        warn!(%key, error = %error, "could not read issue at restore time");
        self.result.failed_operations.push(FailedOperation::from_tracker(
            "restore_issue",
            Some(key),
            None,
            error,
        ));
    }

    /// Whether the tracker has been written to.
    fn has_written(&self) -> bool {
        !self.result.dry_run && !self.result.restored.is_empty()
    }

    fn missing(&mut self, key: &IssueKey, error: &TrackerError) {
        warn!(%key, "issue missing at restore time; not recreating it");
        self.result.failed_operations.push(FailedOperation {
            operation: "restore_issue".to_string(),
            target_key: Some(key.clone()),
            story_id: None,
            message: error.to_string(),
            recoverable: true,
        });
    }
}

impl BackupManager {
    /// Push a backup's captured values back onto the tracker.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackupNotFound` if the backup does not exist or
    /// belongs to another epic, and authentication failures raised before
    /// anything was written.
    pub async fn restore_backup<T: IssueTracker + ?Sized>(
        &self,
        tracker: &T,
        backup_id: &str,
        epic_key: &str,
        dry_run: bool,
    ) -> Result<RestoreResult> {
        let backup = self.load_backup(backup_id).await?;
        if backup.epic_key != epic_key {
            return Err(Error::BackupNotFound(format!(
                "{backup_id} (belongs to epic {}, not {epic_key})",
                backup.epic_key
            )));
        }
        restore(tracker, &backup, dry_run).await
    }
}

/// Restore an already-loaded backup.
///
/// # Errors
///
/// Returns authentication failures raised before anything was written.
/// Once a field has been written they are recorded in the result instead,
/// so the caller learns what changed.
pub async fn restore<T: IssueTracker + ?Sized>(
    tracker: &T,
    backup: &Backup,
    dry_run: bool,
) -> Result<RestoreResult> {
    let mut restorer = Restorer {
        tracker,
        result: RestoreResult {
            backup_id: backup.backup_id.clone(),
            dry_run,
            ..RestoreResult::default()
        },
    };

    for snapshot in &backup.issues {
        let live = match tracker.get_issue(&snapshot.key).await {
            Ok(issue) => issue,
            Err(e @ TrackerError::NotFound(_)) => {
                restorer.missing(&snapshot.key, &e);
                continue;
            }
            Err(e) if e.is_connectivity() => {
                if !restorer.has_written() {
                    return Err(e.into());
                }
                restorer.unreadable(&snapshot.key, &e);
                break;
            }
            Err(e) => {
                restorer.unreadable(&snapshot.key, &e);
                continue;
            }
        };

        let mut changed = restorer.issue(snapshot, &live).await;
        for subtask in &snapshot.subtasks {
            match live.subtasks.iter().find(|s| s.key == subtask.key) {
                Some(live_subtask) => changed |= restorer.subtask(subtask, live_subtask).await,
                None => restorer.missing(
                    &subtask.key,
                    &TrackerError::NotFound(format!("subtask {} no longer exists", subtask.key)),
                ),
            }
        }
        if !changed {
            restorer.result.issues_unchanged += 1;
        }
    }

    let result = restorer.result;
    info!(
        backup_id = %result.backup_id,
        dry_run,
        restored = result.restored.len(),
        skipped = result.skipped_fields,
        failed = result.failed_operations.len(),
        "restore finished"
    );
    Ok(result)
}
