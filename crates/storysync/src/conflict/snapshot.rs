//! Last-agreed field values, the base of three-way comparison.

use super::{ConflictField, FieldValue};
use crate::domain::{IssueKey, RemoteIssue, StoryId, UserStory};
use crate::error::{Result, StoreError};
use crate::keys::store_stem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Agreed value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    /// The field.
    pub field: ConflictField,
    /// Its agreed value.
    pub value: FieldValue,
}

/// Agreed values of one story's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySnapshot {
    /// Document story.
    pub story_id: StoryId,
    /// Matched remote issue at capture time.
    pub issue_key: IssueKey,
    /// Fields with an agreed value; fields that never agreed are absent.
    pub fields: Vec<FieldSnapshot>,
}

impl StorySnapshot {
    /// Base value of a field, if the sides ever agreed on it.
    #[must_use]
    pub fn base(&self, field: ConflictField) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|f| f.field == field)
            .map(|f| &f.value)
    }
}

/// Baseline of one (epic, document) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    /// Epic key.
    pub epic_key: String,
    /// Document path.
    pub document_path: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Per-story baselines.
    pub stories: BTreeMap<StoryId, StorySnapshot>,
}

impl SyncSnapshot {
    /// A snapshot with no stories.
    #[must_use]
    pub fn empty(epic_key: &str, document_path: &str) -> Self {
        Self {
            epic_key: epic_key.to_string(),
            document_path: document_path.to_string(),
            created_at: Utc::now(),
            stories: BTreeMap::new(),
        }
    }

    /// Capture a new baseline from the document and the tracker state after
    /// a run.
    ///
    /// A field whose sides agree takes the agreed value. A field whose sides
    /// still disagree keeps the previous base, so a skipped conflict or an
    /// un-pulled remote change is detected again next time.
    #[must_use]
    pub fn capture(
        epic_key: &str,
        document_path: &str,
        stories: &[UserStory],
        remote: &[RemoteIssue],
        matches: &BTreeMap<StoryId, IssueKey>,
        previous: Option<&Self>,
    ) -> Self {
        let by_key: HashMap<&IssueKey, &RemoteIssue> =
            remote.iter().map(|issue| (&issue.key, issue)).collect();
        let mut snapshot = Self::empty(epic_key, document_path);

        for story in stories {
            let Some(key) = matches.get(&story.id) else {
                continue;
            };
            let Some(issue) = by_key.get(key) else {
                continue;
            };
            let previous_story = previous.and_then(|p| p.stories.get(&story.id));
            let fields = ConflictField::ALL
                .into_iter()
                .filter_map(|field| {
                    let local = field.local_value(story);
                    let value = if local.same_as(&field.remote_value(issue)) {
                        local
                    } else {
                        previous_story.and_then(|s| s.base(field)).cloned()?
                    };
                    Some(FieldSnapshot { field, value })
                })
                .collect();
            snapshot.stories.insert(
                story.id.clone(),
                StorySnapshot {
                    story_id: story.id.clone(),
                    issue_key: key.clone(),
                    fields,
                },
            );
        }
        snapshot
    }
}

/// Persistence for snapshots; a new snapshot supersedes the old one whole.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The saved snapshot, if any.
    async fn load(&self, epic_key: &str, document_path: &str) -> Result<Option<SyncSnapshot>>;

    /// Replace the saved snapshot.
    async fn save(&self, snapshot: &SyncSnapshot) -> Result<()>;

    /// Forget the saved snapshot. Returns whether one existed.
    async fn clear(&self, epic_key: &str, document_path: &str) -> Result<bool>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum SnapshotRecord {
    Header {
        epic_key: String,
        document_path: String,
        created_at: DateTime<Utc>,
    },
    Story(StorySnapshot),
}

/// Header line plus one line per story, one file per (epic, document).
#[derive(Debug, Clone)]
pub struct JsonlSnapshotStore {
    dir: PathBuf,
}

impl JsonlSnapshotStore {
    /// Store rooted at `dir`; created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_path(&self, epic_key: &str, document_path: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", store_stem(epic_key, document_path)))
    }
}

#[async_trait]
impl SnapshotStore for JsonlSnapshotStore {
    async fn load(&self, epic_key: &str, document_path: &str) -> Result<Option<SyncSnapshot>> {
        let path = self.file_path(epic_key, document_path);
        let (records, warnings) =
            storysync_jsonl::read_jsonl_resilient::<SnapshotRecord, _>(&path).await?;
        for warning in &warnings {
            warn!(path = %path.display(), %warning, "skipping damaged snapshot record");
        }
        let mut records = records.into_iter();
        let Some(first) = records.next() else {
            return Ok(None);
        };
        let SnapshotRecord::Header {
            epic_key,
            document_path,
            created_at,
        } = first
        else {
            return Err(StoreError::Corrupt {
                path,
                message: "snapshot header missing".to_string(),
            }
            .into());
        };
        let mut snapshot = SyncSnapshot {
            epic_key,
            document_path,
            created_at,
            stories: BTreeMap::new(),
        };
        for record in records {
            if let SnapshotRecord::Story(story) = record {
                snapshot.stories.insert(story.story_id.clone(), story);
            }
        }
        debug!(path = %path.display(), stories = snapshot.stories.len(), "snapshot loaded");
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &SyncSnapshot) -> Result<()> {
        let path = self.file_path(&snapshot.epic_key, &snapshot.document_path);
        let header = SnapshotRecord::Header {
            epic_key: snapshot.epic_key.clone(),
            document_path: snapshot.document_path.clone(),
            created_at: snapshot.created_at,
        };
        let records = std::iter::once(header).chain(
            snapshot
                .stories
                .values()
                .cloned()
                .map(SnapshotRecord::Story),
        );
        storysync_jsonl::write_jsonl_atomic_iter(&path, records).await?;
        Ok(())
    }

    async fn clear(&self, epic_key: &str, document_path: &str) -> Result<bool> {
        Ok(storysync_jsonl::remove_if_exists(self.file_path(epic_key, document_path)).await?)
    }
}

/// Snapshot store held in memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<(String, String), SyncSnapshot>>,
}

impl InMemorySnapshotStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, epic_key: &str, document_path: &str) -> Result<Option<SyncSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .await
            .get(&(epic_key.to_string(), document_path.to_string()))
            .cloned())
    }

    async fn save(&self, snapshot: &SyncSnapshot) -> Result<()> {
        self.snapshots.lock().await.insert(
            (snapshot.epic_key.clone(), snapshot.document_path.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn clear(&self, epic_key: &str, document_path: &str) -> Result<bool> {
        Ok(self
            .snapshots
            .lock()
            .await
            .remove(&(epic_key.to_string(), document_path.to_string()))
            .is_some())
    }
}
