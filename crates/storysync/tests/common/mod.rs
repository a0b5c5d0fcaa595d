//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use storysync::domain::{Description, Epic, IssueKey, Subtask, UserStory};
use storysync::ports::document::{PlainTextFormatter, StaticDocument};
use storysync::ports::memory::InMemoryTracker;
use storysync::{SyncOptions, SyncOrchestrator, SyncResult, SyncStores};

/// Document path every test syncs under.
pub const DOCUMENT: &str = "docs/checkout.md";

/// Orchestrator over the in-memory adapters.
pub type MemorySync = SyncOrchestrator<StaticDocument, InMemoryTracker, PlainTextFormatter>;

/// A tracker holding one empty epic.
pub async fn tracker_with_epic() -> (InMemoryTracker, IssueKey) {
    let tracker = InMemoryTracker::new("PROJ");
    let epic_key = tracker.create_epic("Checkout").await;
    (tracker, epic_key)
}

/// A story with a role/want/benefit description derived from its title.
pub fn story(id: &str, title: &str) -> UserStory {
    let mut story = UserStory::new(id, title);
    story.description = Some(Description {
        role: "shopper".into(),
        want: format!("to {}", title.to_lowercase()),
        benefit: "I can finish my order".into(),
    });
    story
}

/// A story with subtasks and an estimate.
pub fn detailed_story(id: &str, title: &str, subtasks: &[&str]) -> UserStory {
    let mut story = story(id, title);
    story.story_points = Some(3.0);
    story.subtasks = subtasks
        .iter()
        .map(|name| Subtask {
            name: (*name).to_string(),
            description: format!("Implement {name}"),
            story_points: Some(1.0),
            ..Subtask::default()
        })
        .collect();
    story
}

/// Wrap stories in an epic document.
pub fn document(stories: Vec<UserStory>) -> StaticDocument {
    StaticDocument::new(Epic {
        key: None,
        title: "Checkout".into(),
        description: String::new(),
        stories,
    })
}

/// Build an orchestrator sharing the tracker and stores.
pub fn orchestrator(
    stories: Vec<UserStory>,
    tracker: &InMemoryTracker,
    options: SyncOptions,
    stores: &SyncStores,
) -> MemorySync {
    SyncOrchestrator::new(
        document(stories),
        tracker.clone(),
        PlainTextFormatter,
        options,
        stores.clone(),
    )
}

/// One run over the given stories.
pub async fn run_sync(
    stories: Vec<UserStory>,
    tracker: &InMemoryTracker,
    epic_key: &IssueKey,
    options: SyncOptions,
    stores: &SyncStores,
) -> SyncResult {
    orchestrator(stories, tracker, options, stores)
        .sync("", DOCUMENT, epic_key)
        .await
        .expect("sync should not fail fatally")
}
