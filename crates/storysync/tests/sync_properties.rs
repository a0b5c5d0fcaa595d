//! End-to-end properties of sync runs against the in-memory tracker.

use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use storysync::conflict::{
    Conflict, ConflictField, FieldValue, MergeOptions, NumericPolicy, Resolution,
    ResolutionStrategy, TextGranularity,
};
use storysync::domain::{IssueKey, UserStory};
use storysync::domain::{Description, StoryId};
use storysync::ports::memory::InMemoryTracker;
use storysync::error::TrackerError;
use storysync::fingerprint::FingerprintStore;
use storysync::ports::memory::TrackerOperation;
use storysync::state::{StateManager, SyncPhase};
use storysync::{SyncOptions, SyncStores};

mod common;
use common::{DOCUMENT, detailed_story, orchestrator, run_sync, story, tracker_with_epic};

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn second_run_over_an_unchanged_document_changes_nothing() {
    let (tracker, epic_key) = tracker_with_epic().await;
    let mut with_commit = detailed_story("US-002", "Refund an order", &["Refund API"]);
    with_commit.commits.push(storysync::domain::CommitRef {
        hash: "9f2c1ab".into(),
        message: "Add refund endpoint".into(),
    });
    let stories = vec![
        detailed_story("US-001", "Pay by card", &["Card form", "Card validation"]),
        with_commit,
    ];
    let stores = SyncStores::in_memory();

    let first = run_sync(stories.clone(), &tracker, &epic_key, SyncOptions::default(), &stores).await;
    assert!(first.success(), "{:?}", first.errors);
    assert_eq!(first.stories_created, 2);
    assert_eq!(first.subtasks_created, 3);
    assert_eq!(first.comments_added, 1);
    let mutations = tracker.mutation_count().await;

    let second = run_sync(stories, &tracker, &epic_key, SyncOptions::default(), &stores).await;

    assert!(second.success(), "{:?}", second.errors);
    assert_eq!(second.stories_matched, 2);
    assert_eq!(second.stories_created, 0);
    assert_eq!(second.stories_updated, 0);
    assert_eq!(second.subtasks_created, 0);
    assert_eq!(second.subtasks_updated, 0);
    assert_eq!(second.comments_added, 0);
    assert_eq!(second.statuses_updated, 0);
    assert_eq!(second.conflicts_detected, 0);
    assert_eq!(tracker.mutation_count().await, mutations);
}

#[tokio::test]
async fn completed_sessions_are_recorded() {
    let (tracker, epic_key) = tracker_with_epic().await;
    let stores = SyncStores::in_memory();

    let result = run_sync(
        vec![story("US-001", "Pay by card")],
        &tracker,
        &epic_key,
        SyncOptions::default(),
        &stores,
    )
    .await;

    let sessions = StateManager::new(stores.sessions.clone());
    let state = sessions.load(&result.session_id).await.unwrap();
    assert_eq!(state.phase, SyncPhase::Completed);
    assert_eq!(state.matched.len(), 1);
}

// ============================================================================
// Graceful degradation
// ============================================================================

#[rstest]
#[case(5, 0)]
#[case(5, 2)]
#[case(4, 4)]
#[tokio::test]
async fn per_story_failures_do_not_stop_the_run(#[case] total: usize, #[case] failing: usize) {
    let (tracker, epic_key) = tracker_with_epic().await;
    let mut stories = Vec::new();
    for n in 0..total {
        let title = format!("Story number {n}");
        let key = tracker.insert_story(&epic_key, &title).await;
        if n < failing {
            tracker
                .fail(
                    TrackerOperation::UpdateDescription,
                    Some(&key),
                    TrackerError::NotFound(key.to_string()),
                )
                .await;
        }
        stories.push(story(&format!("US-{n:03}"), &title));
    }
    let stores = SyncStores::in_memory();

    let result = run_sync(stories, &tracker, &epic_key, SyncOptions::default(), &stores).await;

    assert_eq!(result.failed_operations.len(), failing);
    assert_eq!(result.stories_updated, total - failing);
    assert!(
        result
            .failed_operations
            .iter()
            .all(|f| f.operation == "update_description" && f.story_id.is_some())
    );
    assert_eq!(result.success(), failing == 0);
    assert_eq!(result.partial_success(), failing > 0 && failing < total);
}

#[tokio::test]
async fn failed_runs_keep_the_previous_baselines() {
    let (tracker, epic_key) = tracker_with_epic().await;
    let key = tracker.insert_story(&epic_key, "Pay by card").await;
    tracker
        .fail(
            TrackerOperation::UpdateDescription,
            Some(&key),
            TrackerError::Transient("timeout".into()),
        )
        .await;
    let stores = SyncStores::in_memory();

    let result = run_sync(
        vec![story("US-001", "Pay by card")],
        &tracker,
        &epic_key,
        SyncOptions::default(),
        &stores,
    )
    .await;

    assert!(!result.success());
    assert!(result.failed_operations[0].recoverable);
    let fingerprints = stores
        .fingerprints
        .load(epic_key.as_str(), common::DOCUMENT)
        .await
        .unwrap();
    assert!(fingerprints.is_empty());
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn take_higher_merge_keeps_the_larger_estimate() {
    let (tracker, epic_key) = tracker_with_epic().await;
    let key = tracker.insert_story(&epic_key, "Pay by card").await;
    let stores = SyncStores::in_memory();
    let mut local = story("US-001", "Pay by card");
    local.story_points = Some(3.0);
    let baseline = run_sync(vec![local.clone()], &tracker, &epic_key, SyncOptions::default(), &stores).await;
    assert_eq!(tracker.issue(&key).await.unwrap().story_points, Some(3.0));
    assert!(baseline.success());

    tracker.edit_issue(&key, |issue| issue.story_points = Some(8.0)).await;
    local.story_points = Some(5.0);
    let options = SyncOptions {
        strategy: ResolutionStrategy::Merge,
        merge: MergeOptions {
            numeric_policy: NumericPolicy::TakeHigher,
            ..MergeOptions::default()
        },
        ..SyncOptions::default()
    };
    let before = tracker.mutation_count().await;

    let result = run_sync(vec![local.clone()], &tracker, &epic_key, options.clone(), &stores).await;

    assert_eq!(result.conflicts_detected, 1);
    assert_eq!(result.conflicts_resolved, 1);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    assert_eq!(tracker.issue(&key).await.unwrap().story_points, Some(8.0));
    assert_eq!(tracker.mutation_count().await, before);
    assert_eq!(result.pull_changes.len(), 1);

    // Stable across runs; the base stays at the last agreed value.
    let again = run_sync(vec![local], &tracker, &epic_key, options, &stores).await;
    assert_eq!(tracker.issue(&key).await.unwrap().story_points, Some(8.0));
    assert!(again.success());
}

fn smart_merge() -> SyncOptions {
    SyncOptions {
        strategy: ResolutionStrategy::SmartMerge,
        merge: MergeOptions {
            text_granularity: TextGranularity::Word,
            ..MergeOptions::default()
        },
        ..SyncOptions::default()
    }
}

/// A story synced once as "Pay by card", tied to its issue by key.
async fn synced_title(
    tracker: &InMemoryTracker,
    epic_key: &IssueKey,
    stores: &SyncStores,
) -> (IssueKey, UserStory) {
    let key = tracker.insert_story(epic_key, "Pay by card").await;
    let mut local = story("US-001", "Pay by card");
    local.external_key = Some(key.clone());
    let baseline = run_sync(vec![local.clone()], tracker, epic_key, SyncOptions::default(), stores).await;
    assert!(baseline.success(), "{:?}", baseline.errors);
    (key, local)
}

fn counting_prompt(calls: &Arc<AtomicUsize>) -> impl Fn(&Conflict) -> Resolution + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_: &Conflict| {
        calls.fetch_add(1, Ordering::SeqCst);
        Resolution::UseLocal
    }
}

#[tokio::test]
async fn smart_merge_combines_edits_to_separate_words() {
    let (tracker, epic_key) = tracker_with_epic().await;
    let stores = SyncStores::in_memory();
    let (key, mut local) = synced_title(&tracker, &epic_key, &stores).await;
    tracker
        .edit_issue(&key, |issue| issue.summary = "Pay by voucher".into())
        .await;
    local.title = "Checkout by card".into();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = orchestrator(vec![local], &tracker, smart_merge(), &stores)
        .with_prompt(counting_prompt(&calls))
        .sync("", DOCUMENT, &epic_key)
        .await
        .unwrap();

    assert!(result.success(), "{:?}", result.errors);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.conflicts_detected, 1);
    assert_eq!(result.conflicts_resolved, 1);
    assert_eq!(tracker.issue(&key).await.unwrap().summary, "Checkout by voucher");
    assert_eq!(result.pull_changes.len(), 1);
    assert_eq!(result.pull_changes[0].field, ConflictField::Title);
    assert_eq!(result.pull_changes[0].value, FieldValue::text("Checkout by voucher"));
}

#[tokio::test]
async fn smart_merge_asks_when_both_sides_edit_the_same_word() {
    let (tracker, epic_key) = tracker_with_epic().await;
    let stores = SyncStores::in_memory();
    let (key, mut local) = synced_title(&tracker, &epic_key, &stores).await;
    tracker
        .edit_issue(&key, |issue| issue.summary = "Pay by voucher".into())
        .await;
    local.title = "Pay by cash".into();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = orchestrator(vec![local], &tracker, smart_merge(), &stores)
        .with_prompt(counting_prompt(&calls))
        .sync("", DOCUMENT, &epic_key)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.conflicts_resolved, 1);
    assert!(result.pull_changes.is_empty());
    assert_eq!(tracker.issue(&key).await.unwrap().summary, "Pay by cash");
}

#[tokio::test]
async fn one_sided_remote_edit_is_not_a_conflict() {
    let (tracker, epic_key) = tracker_with_epic().await;
    let key = tracker.insert_story(&epic_key, "Pay by card").await;
    let stores = SyncStores::in_memory();
    let local = story("US-001", "Pay by card");
    run_sync(vec![local.clone()], &tracker, &epic_key, SyncOptions::default(), &stores).await;

    tracker
        .edit_issue(&key, |issue| issue.description = Some("Edited in the tracker".into()))
        .await;
    let result = run_sync(vec![local], &tracker, &epic_key, SyncOptions::default(), &stores).await;

    assert_eq!(result.conflicts_detected, 0);
    assert_eq!(result.stories_updated, 0);
    assert_eq!(
        tracker.issue(&key).await.unwrap().description.as_deref(),
        Some("Edited in the tracker")
    );
}

// ============================================================================
// Incremental sync
// ============================================================================

#[tokio::test]
async fn incremental_run_skips_unchanged_stories() {
    let (tracker, epic_key) = tracker_with_epic().await;
    let stores = SyncStores::in_memory();
    let options = SyncOptions {
        incremental: true,
        ..SyncOptions::default()
    };
    let mut stories = vec![story("US-001", "Pay by card"), story("US-002", "Refund an order")];
    let first = run_sync(stories.clone(), &tracker, &epic_key, options.clone(), &stores).await;
    assert_eq!(first.stories_created, 2);
    assert_eq!(first.stories_skipped, 0);

    stories[1].description = Some(Description {
        role: "support agent".into(),
        want: "to refund part of an order".into(),
        benefit: "customers keep the rest".into(),
    });
    let second = run_sync(stories.clone(), &tracker, &epic_key, options.clone(), &stores).await;

    assert_eq!(second.stories_skipped, 1);
    assert_eq!(second.stories_updated, 1);
    assert_eq!(second.stories_matched, 2);

    let forced = SyncOptions {
        force_full_sync: true,
        ..options
    };
    let third = run_sync(stories, &tracker, &epic_key, forced, &stores).await;
    assert_eq!(third.stories_skipped, 0);
    assert_eq!(third.stories_updated, 0);
}

#[tokio::test]
async fn external_key_matches_despite_a_renamed_issue() {
    let (tracker, epic_key) = tracker_with_epic().await;
    let key = tracker.insert_story(&epic_key, "Card payments (old name)").await;
    let mut local = story("US-001", "Pay by card");
    local.external_key = Some(key.clone());
    let stores = SyncStores::in_memory();

    let result = run_sync(vec![local], &tracker, &epic_key, SyncOptions::default(), &stores).await;

    assert_eq!(result.stories_created, 0);
    assert_eq!(result.matched.get(&StoryId::new("US-001")), Some(&key));
    assert_eq!(tracker.issue(&key).await.unwrap().summary, "Pay by card");
}
