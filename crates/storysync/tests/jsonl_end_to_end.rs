//! Sync runs over the on-disk JSONL stores, backups and the admin binary.

use rstest::{fixture, rstest};
use std::path::Path;
use std::process::{Command, Output};
use storysync::backup::compare_backup_to_current;
use storysync::config::{STATE_DIR_NAME, StorysyncConfig};
use storysync::conflict::SnapshotStore;
use storysync::domain::{Status, UserStory};
use storysync::fingerprint::FingerprintStore;
use storysync::SyncOptions;
use tempfile::TempDir;

mod common;
use common::{DOCUMENT, detailed_story, run_sync, tracker_with_epic};

// ============================================================================
// Test Fixtures
// ============================================================================

/// Provides a fresh project root for each test
#[fixture]
fn root() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

fn stories() -> Vec<UserStory> {
    vec![
        detailed_story("US-001", "Pay by card", &["Card form", "Card validation"]),
        detailed_story("US-002", "Refund an order", &["Refund API"]),
    ]
}

fn run_storysync(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_storysync"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("Failed to execute storysync binary")
}

// ============================================================================
// Baselines
// ============================================================================

#[rstest]
#[tokio::test]
async fn baselines_survive_reopening_the_stores(root: TempDir) {
    let (tracker, epic_key) = tracker_with_epic().await;
    let config = StorysyncConfig::default();
    let options = SyncOptions {
        incremental: true,
        ..SyncOptions::default()
    };

    let first = run_sync(stories(), &tracker, &epic_key, options.clone(), &config.open_stores(root.path())).await;
    assert!(first.success(), "{:?}", first.errors);
    assert!(root.path().join(STATE_DIR_NAME).is_dir());

    let reopened = config.open_stores(root.path());
    let fingerprints = reopened
        .fingerprints
        .load(epic_key.as_str(), DOCUMENT)
        .await
        .unwrap();
    assert_eq!(fingerprints.len(), 2);
    let snapshot = reopened
        .snapshots
        .load(epic_key.as_str(), DOCUMENT)
        .await
        .unwrap()
        .expect("snapshot saved");
    assert_eq!(snapshot.stories.len(), 2);

    let second = run_sync(stories(), &tracker, &epic_key, options, &reopened).await;
    assert_eq!(second.stories_skipped, 2);
    assert_eq!(second.successes(), 0);
}

// ============================================================================
// Backup and restore
// ============================================================================

#[rstest]
#[tokio::test]
async fn restoring_a_backup_undoes_a_run(root: TempDir) {
    let (tracker, epic_key) = tracker_with_epic().await;
    let config = StorysyncConfig::default();
    let stores = config.open_stores(root.path());
    run_sync(stories(), &tracker, &epic_key, SyncOptions::default(), &stores).await;

    let mut finished = stories();
    finished[0].status = Status::Done;
    finished[0].story_points = Some(5.0);
    let second = run_sync(finished, &tracker, &epic_key, SyncOptions::default(), &stores).await;
    assert!(second.success(), "{:?}", second.errors);
    assert_eq!(second.statuses_updated, 3);
    let backup_id = second.backup_id.expect("backup taken before mutating");

    let manager = config.backup_manager(root.path());
    let backup = manager.load_backup(&backup_id).await.unwrap();
    assert_eq!(backup.issue_count(), 2);
    assert_eq!(backup.subtask_count(), 3);
    let drift = compare_backup_to_current(&tracker, &backup).await.unwrap();
    assert!(drift.has_changes());

    let preview = manager
        .restore_backup(&tracker, &backup_id, epic_key.as_str(), true)
        .await
        .unwrap();
    assert!(!preview.restored.is_empty());
    assert!(compare_backup_to_current(&tracker, &backup).await.unwrap().has_changes());

    let restored = manager
        .restore_backup(&tracker, &backup_id, epic_key.as_str(), false)
        .await
        .unwrap();
    assert!(restored.success(), "{:?}", restored.failed_operations);
    assert_eq!(restored.restored.len(), preview.restored.len());

    let after = compare_backup_to_current(&tracker, &backup).await.unwrap();
    assert!(!after.has_changes(), "{after:?}");
    assert_eq!(after.unchanged_issues, 2);
}

#[rstest]
#[tokio::test]
async fn backups_of_another_epic_are_refused(root: TempDir) {
    let (tracker, epic_key) = tracker_with_epic().await;
    let other = tracker.create_epic("Shipping").await;
    let manager = StorysyncConfig::default().backup_manager(root.path());
    let backup = manager.create_backup(&tracker, &epic_key, DOCUMENT).await.unwrap();

    let err = manager
        .restore_backup(&tracker, &backup.backup_id, other.as_str(), false)
        .await
        .unwrap_err();

    assert!(matches!(err, storysync::Error::BackupNotFound(_)));
}

// ============================================================================
// Admin binary
// ============================================================================

#[rstest]
#[tokio::test]
async fn cli_reports_what_a_run_stored(root: TempDir) {
    let (tracker, epic_key) = tracker_with_epic().await;
    let stores = StorysyncConfig::default().open_stores(root.path());
    run_sync(stories(), &tracker, &epic_key, SyncOptions::default(), &stores).await;

    let output = run_storysync(root.path(), &["fingerprints", "show", epic_key.as_str(), DOCUMENT, "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let fingerprints: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(fingerprints.as_object().map(serde_json::Map::len), Some(2));

    let output = run_storysync(root.path(), &["sessions", "list", "--json"]);
    let sessions: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(sessions.as_array().map(Vec::len), Some(1));
    assert_eq!(sessions[0]["phase"], "completed");

    let output = run_storysync(root.path(), &["backups", "list", epic_key.as_str(), "--json"]);
    let backups: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(backups.as_array().map(Vec::len), Some(1));

    let output = run_storysync(root.path(), &["fingerprints", "clear", epic_key.as_str(), DOCUMENT]);
    assert!(output.status.success());
    let cleared = stores
        .fingerprints
        .load(epic_key.as_str(), DOCUMENT)
        .await
        .unwrap();
    assert!(cleared.is_empty());
}

#[rstest]
fn cli_prints_default_config_without_a_config_file(root: TempDir) {
    let output = run_storysync(root.path(), &["config"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("max_backups: 10"), "{stdout}");
}

#[rstest]
fn cli_rejects_an_invalid_config(root: TempDir) {
    let dir = root.path().join(STATE_DIR_NAME);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.yaml"), "backup: [not, a, map]\n").unwrap();

    let output = run_storysync(root.path(), &["config"]);

    assert!(!output.status.success());
}
