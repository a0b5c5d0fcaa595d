//! Configuration for storysync.
//!
//! Settings live in `.storysync/config.yaml`. Every field has a default, so
//! a partial file (or no file at all) is valid:
//!
//! ```yaml
//! sync:
//!   incremental: true
//!   phases:
//!     comments: false
//! backup:
//!   max_backups: 5
//! conflict:
//!   strategy: merge
//!   numeric_policy: take_higher
//! ```

use crate::backup::{BackupManager, JsonlBackupStore};
use crate::conflict::{
    JsonlSnapshotStore, MergeOptions, NumericPolicy, ResolutionStrategy, TextGranularity,
};
use crate::error::{ConfigError, Result};
use crate::fingerprint::JsonlFingerprintStore;
use crate::state::JsonlStateStore;
use crate::sync::{
    BatchOptions, DEFAULT_STORY_ISSUE_TYPES, PhaseToggles, SyncOptions, SyncStores,
};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Name of the state directory.
pub const STATE_DIR_NAME: &str = ".storysync";

/// Name of the configuration file inside the state directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Store subdirectories of the state directory.
pub const FINGERPRINTS_DIR: &str = "fingerprints";
/// See [`FINGERPRINTS_DIR`].
pub const SNAPSHOTS_DIR: &str = "snapshots";
/// See [`FINGERPRINTS_DIR`].
pub const SESSIONS_DIR: &str = "sessions";
/// See [`FINGERPRINTS_DIR`].
pub const BACKUPS_DIR: &str = "backups";

/// Slowest accepted request rate other than `0`.
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.01;

/// Contents of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorysyncConfig {
    /// Where the stores live, relative to the project root unless absolute.
    pub state_dir: PathBuf,
    /// Run behavior.
    pub sync: SyncConfig,
    /// Backups taken before mutating.
    pub backup: BackupConfig,
    /// Conflict detection and resolution.
    pub conflict: ConflictConfig,
    /// Batched subtask creation.
    pub batch: BatchConfig,
}

/// `sync` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct SyncConfig {
    /// Compute changes without writing to the tracker.
    pub dry_run: bool,
    /// Skip stories whose fingerprint did not change.
    pub incremental: bool,
    /// Ignore fingerprints even when incremental.
    pub force_full_sync: bool,
    /// Report tracker-side changes for the document.
    pub bidirectional: bool,
    /// Optional phases.
    pub phases: PhaseToggles,
    /// Issue types tried, in order, when creating stories.
    pub story_issue_types: Vec<String>,
}

impl Default for SyncConfig {
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
        }
    }
}

/// `backup` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Take a backup before mutating.
    pub enabled: bool,
    /// Backups kept per epic; `0` keeps all.
    pub max_backups: usize,
    /// Drop backups older than this many days.
    pub retention_days: Option<u32>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_backups: 10,
            retention_days: None,
        }
    }
}

/// `conflict` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Keep a snapshot and detect three-way conflicts.
    pub enabled: bool,
    /// How conflicts are decided.
    pub strategy: ResolutionStrategy,
    /// Token size for text merges.
    pub text_granularity: TextGranularity,
    /// Policy for numeric merges.
    pub numeric_policy: NumericPolicy,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: ResolutionStrategy::default(),
            text_granularity: TextGranularity::default(),
            numeric_policy: NumericPolicy::default(),
        }
    }
}

/// `batch` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Create missing subtasks concurrently.
    pub enabled: bool,
    /// Operations in flight at once.
    pub max_concurrency: usize,
    /// Sustained request rate; `0` disables limiting.
    pub requests_per_second: f64,
    /// Requests allowed back to back.
    pub burst: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let defaults = BatchOptions::default();
        Self {
            enabled: false,
            max_concurrency: defaults.max_concurrency,
            requests_per_second: defaults.requests_per_second,
            burst: defaults.burst,
        }
    }
}

impl Default for StorysyncConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(STATE_DIR_NAME),
            sync: SyncConfig::default(),
            backup: BackupConfig::default(),
            conflict: ConflictConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl StorysyncConfig {
    /// Conventional config path under a project root.
    #[must_use]
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(STATE_DIR_NAME).join(CONFIG_FILE_NAME)
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` if the file cannot be read,
    /// `ConfigError::Syntax` if it is not valid YAML for the schema, and
    /// `ConfigError::Invalid` if a value is out of range.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Syntax(e.to_string()))?;
        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or is invalid.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        match fs::metadata(path).await {
            Ok(_) => Self::load(path).await,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no configuration file; using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
            .into()),
        }
    }

    /// Write the configuration, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| ConfigError::Syntax(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;
        Ok(())
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for the first offending field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(invalid("state_dir", "must not be empty"));
        }
        if self.sync.story_issue_types.is_empty() {
            return Err(invalid("sync.story_issue_types", "needs at least one issue type"));
        }
        if self.sync.story_issue_types.iter().any(|t| t.trim().is_empty()) {
            return Err(invalid("sync.story_issue_types", "issue type names must not be blank"));
        }
        if self.batch.max_concurrency == 0 {
            return Err(invalid("batch.max_concurrency", "must be at least 1"));
        }
        let rate = self.batch.requests_per_second;
        if !rate.is_finite() || rate < 0.0 {
            return Err(invalid(
                "batch.requests_per_second",
                "must be a non-negative number",
            ));
        }
        if rate > 0.0 && rate < MIN_REQUESTS_PER_SECOND {
            return Err(invalid(
                "batch.requests_per_second",
                &format!("must be 0 or at least {MIN_REQUESTS_PER_SECOND}"),
            ));
        }
        if self.batch.burst == 0 {
            return Err(invalid("batch.burst", "must be at least 1"));
        }
        Ok(())
    }

    /// The state directory resolved against a project root.
    #[must_use]
    pub fn state_dir(&self, root: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            root.join(&self.state_dir)
        }
    }

    /// JSONL-backed stores under the state directory.
    ///
    /// Nothing is created on disk until a store is first written.
    #[must_use]
    pub fn open_stores(&self, root: &Path) -> SyncStores {
        let dir = self.state_dir(root);
        SyncStores {
            fingerprints: Arc::new(JsonlFingerprintStore::new(dir.join(FINGERPRINTS_DIR))),
            snapshots: Arc::new(JsonlSnapshotStore::new(dir.join(SNAPSHOTS_DIR))),
            sessions: Arc::new(JsonlStateStore::new(dir.join(SESSIONS_DIR))),
            backups: self.backup.enabled.then(|| self.backup_manager(root)),
        }
    }

    /// Backup manager over the JSONL backup store, with the configured
    /// retention.
    #[must_use]
    pub fn backup_manager(&self, root: &Path) -> BackupManager {
        let store = Arc::new(JsonlBackupStore::new(self.state_dir(root).join(BACKUPS_DIR)));
        let manager = BackupManager::new(store, self.backup.max_backups);
        match self.backup.retention_days {
            Some(days) => manager.with_retention_days(days),
            None => manager,
        }
    }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}

impl From<&StorysyncConfig> for SyncOptions {
    fn from(config: &StorysyncConfig) -> Self {
        let mut phases = config.sync.phases;
        phases.backup &= config.backup.enabled;
        Self {
            dry_run: config.sync.dry_run,
            incremental: config.sync.incremental,
            force_full_sync: config.sync.force_full_sync,
            bidirectional: config.sync.bidirectional,
            phases,
            story_issue_types: config.sync.story_issue_types.clone(),
            conflict_detection: config.conflict.enabled,
            strategy: config.conflict.strategy,
            merge: MergeOptions {
                text_granularity: config.conflict.text_granularity,
                numeric_policy: config.conflict.numeric_policy,
            },
            batch: config.batch.enabled.then_some(BatchOptions {
                max_concurrency: config.batch.max_concurrency,
                requests_per_second: config.batch.requests_per_second,
                burst: config.batch.burst,
            }),
        }
    }
}
