//! Per-story content fingerprints for incremental sync.
//!
//! A fingerprint is a SHA-256 over a story's normalized synchronizable
//! fields: title, role/want/benefit, points, priority, status, the subtask
//! set and the acceptance checklist. Whitespace runs collapse before hashing,
//! so reformatting a document does not change any fingerprint. Technical
//! notes, commits and the external key are not synchronizable fields.
//!
//! The [`ChangeTracker`] compares fresh fingerprints against the ones saved
//! by the last fully successful run. It only writes when told to, which the
//! orchestrator does once at the very end of a successful non-dry run.

use crate::domain::{StoryId, UserStory, normalize_whitespace};
use crate::error::Result;
use crate::keys::{sha256_hex, store_stem};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Saved fingerprints of one (epic, document) pair.
pub type FingerprintMap = BTreeMap<StoryId, String>;

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

fn push_field(out: &mut String, value: &str) {
    out.push_str(&normalize_whitespace(value));
    out.push(FIELD_SEP);
}

fn points_repr(points: Option<f64>) -> String {
    points.map_or_else(|| "-".to_string(), |p| format!("{p}"))
}

/// Fingerprint of one story.
#[must_use]
pub fn fingerprint(story: &UserStory) -> String {
    let mut canonical = String::new();
    push_field(&mut canonical, &story.title);
    match &story.description {
        Some(d) => {
            push_field(&mut canonical, &d.role);
            push_field(&mut canonical, &d.want);
            push_field(&mut canonical, &d.benefit);
        }
        None => push_field(&mut canonical, "\u{0}"),
    }
    push_field(&mut canonical, &points_repr(story.story_points));
    push_field(&mut canonical, story.priority.as_str());
    push_field(&mut canonical, story.status.tracker_name());
    canonical.push(RECORD_SEP);

    let mut subtasks: Vec<String> = story
        .subtasks
        .iter()
        .map(|s| {
            let mut entry = String::new();
            push_field(&mut entry, &s.name);
            push_field(&mut entry, &s.description);
            push_field(&mut entry, &points_repr(s.story_points));
            push_field(&mut entry, s.status.tracker_name());
            entry
        })
        .collect();
    subtasks.sort();
    for entry in subtasks {
        canonical.push_str(&entry);
        canonical.push(RECORD_SEP);
    }
    canonical.push(RECORD_SEP);

    for criterion in &story.acceptance_criteria {
        push_field(&mut canonical, &criterion.text);
        push_field(&mut canonical, if criterion.done { "x" } else { " " });
    }

    sha256_hex(canonical.as_bytes())
}

/// Persistence for fingerprint maps.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Saved fingerprints, empty when nothing was ever saved.
    async fn load(&self, epic: &str, document_path: &str) -> Result<FingerprintMap>;

    /// Replace the saved fingerprints.
    async fn save(&self, epic: &str, document_path: &str, map: &FingerprintMap) -> Result<()>;

    /// Forget the saved fingerprints. Returns whether anything was removed.
    async fn clear(&self, epic: &str, document_path: &str) -> Result<bool>;
}

#[derive(Debug, Serialize, Deserialize)]
struct FingerprintRecord {
    story_id: StoryId,
    fingerprint: String,
}

/// One JSONL file per (epic, document) under a directory.
#[derive(Debug, Clone)]
pub struct JsonlFingerprintStore {
    dir: PathBuf,
}

impl JsonlFingerprintStore {
    /// Store rooted at `dir`; created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File holding the fingerprints of an (epic, document) pair.
    #[must_use]
    pub fn file_path(&self, epic: &str, document_path: &str) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", store_stem(epic, document_path)))
    }
}

#[async_trait]
impl FingerprintStore for JsonlFingerprintStore {
    async fn load(&self, epic: &str, document_path: &str) -> Result<FingerprintMap> {
        let path = self.file_path(epic, document_path);
        let (records, warnings) =
            storysync_jsonl::read_jsonl_resilient::<FingerprintRecord, _>(&path).await?;
        for warning in &warnings {
            warn!(path = %path.display(), %warning, "skipping damaged fingerprint record");
        }
        Ok(records
            .into_iter()
            .map(|r| (r.story_id, r.fingerprint))
            .collect())
    }

    async fn save(&self, epic: &str, document_path: &str, map: &FingerprintMap) -> Result<()> {
        let path = self.file_path(epic, document_path);
        let records: Vec<FingerprintRecord> = map
            .iter()
            .map(|(story_id, fingerprint)| FingerprintRecord {
                story_id: story_id.clone(),
                fingerprint: fingerprint.clone(),
            })
            .collect();
        storysync_jsonl::write_jsonl_atomic_iter(&path, records).await?;
        debug!(path = %path.display(), count = map.len(), "fingerprints saved");
        Ok(())
    }

    async fn clear(&self, epic: &str, document_path: &str) -> Result<bool> {
        Ok(storysync_jsonl::remove_if_exists(self.file_path(epic, document_path)).await?)
    }
}

/// Fingerprint store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryFingerprintStore {
    maps: Mutex<HashMap<(String, String), FingerprintMap>>,
}

impl InMemoryFingerprintStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for InMemoryFingerprintStore {
    async fn load(&self, epic: &str, document_path: &str) -> Result<FingerprintMap> {
        let maps = self.maps.lock().await;
        Ok(maps
            .get(&(epic.to_string(), document_path.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, epic: &str, document_path: &str, map: &FingerprintMap) -> Result<()> {
        self.maps
            .lock()
            .await
            .insert((epic.to_string(), document_path.to_string()), map.clone());
        Ok(())
    }

    async fn clear(&self, epic: &str, document_path: &str) -> Result<bool> {
        Ok(self
            .maps
            .lock()
            .await
            .remove(&(epic.to_string(), document_path.to_string()))
            .is_some())
    }
}

/// Detects which stories changed since the last successful run.
pub struct ChangeTracker {
    store: Arc<dyn FingerprintStore>,
    epic: String,
    document_path: String,
    stored: FingerprintMap,
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("epic", &self.epic)
            .field("document_path", &self.document_path)
            .field("stored", &self.stored.len())
            .finish_non_exhaustive()
    }
}

impl ChangeTracker {
    /// Load the saved fingerprints of an (epic, document) pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn load(
        store: Arc<dyn FingerprintStore>,
        epic: &str,
        document_path: &str,
    ) -> Result<Self> {
        let stored = store.load(epic, document_path).await?;
        debug!(epic, document_path, count = stored.len(), "fingerprints loaded");
        Ok(Self {
            store,
            epic: epic.to_string(),
            document_path: document_path.to_string(),
            stored,
        })
    }

    /// Number of saved fingerprints.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.stored.len()
    }

    /// Whether each story changed since the saved baseline.
    ///
    /// A story with no saved fingerprint counts as changed. Pure: nothing is
    /// written.
    #[must_use]
    pub fn detect_changes(&self, stories: &[UserStory]) -> BTreeMap<StoryId, bool> {
        stories
            .iter()
            .map(|story| {
                let changed = self
                    .stored
                    .get(&story.id)
                    .is_none_or(|saved| *saved != fingerprint(story));
                (story.id.clone(), changed)
            })
            .collect()
    }

    /// Ids of the stories that changed, in document order.
    #[must_use]
    pub fn changed_ids(&self, stories: &[UserStory]) -> Vec<StoryId> {
        let changes = self.detect_changes(stories);
        stories
            .iter()
            .filter(|s| changes.get(&s.id).copied().unwrap_or(true))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Persist fresh fingerprints of `stories` as the new baseline.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn save(&mut self, stories: &[UserStory]) -> Result<()> {
        let map: FingerprintMap = stories
            .iter()
            .map(|s| (s.id.clone(), fingerprint(s)))
            .collect();
        self.store
            .save(&self.epic, &self.document_path, &map)
            .await?;
        self.stored = map;
        Ok(())
    }

    /// Drop the saved baseline so the next run treats every story as changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn clear(&mut self) -> Result<bool> {
        self.stored.clear();
        self.store.clear(&self.epic, &self.document_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AcceptanceCriterion, CommitRef, Description, Status, Subtask};
    use tempfile::TempDir;

    fn story() -> UserStory {
        let mut story = UserStory::new("US-001", "Sign in");
        story.description = Some(Description {
            role: "user".into(),
            want: "to sign in".into(),
            benefit: "I see my data".into(),
        });
        story.story_points = Some(3.0);
        story.subtasks = vec![
            Subtask {
                name: "Form".into(),
                ..Default::default()
            },
            Subtask {
                name: "API".into(),
                ..Default::default()
            },
        ];
        story.acceptance_criteria = vec![AcceptanceCriterion {
            text: "works".into(),
            done: false,
        }];
        story
    }

    #[test]
    fn whitespace_and_subtask_order_do_not_matter() {
        let a = story();
        let mut b = story();
        b.title = "  Sign   in ".into();
        b.subtasks.reverse();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn unsynced_fields_do_not_matter() {
        let a = story();
        let mut b = story();
        b.technical_notes = "use OAuth".into();
        b.commits.push(CommitRef {
            hash: "abc".into(),
            message: "wip".into(),
        });
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn criteria_order_matters() {
        let mut a = story();
        a.acceptance_criteria.push(AcceptanceCriterion {
            text: "fast".into(),
            done: true,
        });
        let mut b = a.clone();
        b.acceptance_criteria.reverse();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn missing_description_differs_from_empty_one() {
        let mut a = story();
        a.description = None;
        let mut b = story();
        b.description = Some(Description::default());
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn detect_then_save_then_detect() {
        let store: Arc<dyn FingerprintStore> = Arc::new(InMemoryFingerprintStore::new());
        let stories = vec![story()];

        let mut tracker = ChangeTracker::load(store.clone(), "PROJ-1", "epic.md")
            .await
            .unwrap();
        assert_eq!(tracker.changed_ids(&stories), vec![StoryId::new("US-001")]);

        tracker.save(&stories).await.unwrap();
        let reloaded = ChangeTracker::load(store, "PROJ-1", "epic.md").await.unwrap();
        assert!(reloaded.changed_ids(&stories).is_empty());

        let mut edited = stories.clone();
        edited[0].status = Status::Done;
        assert!(reloaded.detect_changes(&edited)[&StoryId::new("US-001")]);
    }

    #[tokio::test]
    async fn jsonl_store_persists_and_clears() {
        let dir = TempDir::new().unwrap();
        let store = JsonlFingerprintStore::new(dir.path());
        let mut map = FingerprintMap::new();
        map.insert(StoryId::new("US-001"), "abc".into());

        store.save("PROJ-1", "epic.md", &map).await.unwrap();
        assert!(store.file_path("PROJ-1", "epic.md").exists());
        assert_eq!(store.load("PROJ-1", "epic.md").await.unwrap(), map);
        assert!(store.load("PROJ-1", "other.md").await.unwrap().is_empty());

        assert!(store.clear("PROJ-1", "epic.md").await.unwrap());
        assert!(store.load("PROJ-1", "epic.md").await.unwrap().is_empty());
    }
}
