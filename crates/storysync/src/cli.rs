//! Command-line interface of the `storysync` admin binary.
//!
//! The binary works on the local stores only; it never talks to a tracker.
//!
//! # Commands
//!
//! - `backups list <epic>` / `backups show <id>` / `backups prune <epic>`
//! - `sessions list` / `sessions show <id>` / `sessions clean`
//! - `fingerprints show <epic> <document>` / `fingerprints clear <epic> <document>`
//! - `config`: print the effective configuration
//!
//! # Global Flags
//!
//! - `--root <dir>`: project root holding `.storysync/` (default: `.`)
//! - `--json`: machine-readable output

use crate::backup::BackupSummary;
use crate::config::StorysyncConfig;
use crate::fingerprint::ChangeTracker;
use crate::state::{StateManager, SyncPhase, SyncState};
use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

/// storysync - inspect and maintain the local sync stores
#[derive(Parser, Debug)]
#[command(name = "storysync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Project root holding the `.storysync/` directory
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Output in JSON format for programmatic use
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Inspect and prune backups
    #[command(subcommand)]
    Backups(BackupCommand),

    /// Inspect and clean sync sessions
    #[command(subcommand)]
    Sessions(SessionCommand),

    /// Inspect and reset incremental-sync fingerprints
    #[command(subcommand)]
    Fingerprints(FingerprintCommand),

    /// Print the effective configuration
    Config,
}

/// `backups` subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum BackupCommand {
    /// List the backups of an epic, newest first
    List {
        /// Epic key
        epic: String,
    },
    /// Show the issues captured by a backup
    Show {
        /// Backup id
        backup_id: String,
    },
    /// Apply the retention policy to an epic's backups
    Prune {
        /// Epic key
        epic: String,
    },
}

/// `sessions` subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SessionCommand {
    /// List sessions, most recently updated first
    List,
    /// Show one session with its phase counters
    Show {
        /// Session id
        session_id: String,
    },
    /// Delete completed and failed sessions
    Clean,
}

/// `fingerprints` subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum FingerprintCommand {
    /// Show the stored fingerprints of a document
    Show {
        /// Epic key
        epic: String,
        /// Document path, as passed to sync
        document: String,
    },
    /// Forget the fingerprints so the next incremental run syncs everything
    Clear {
        /// Epic key
        epic: String,
        /// Document path, as passed to sync
        document: String,
    },
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Execute the parsed command
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a store cannot be
    /// read or written.
    pub async fn execute(&self) -> Result<()> {
        let config =
            StorysyncConfig::load_or_default(&StorysyncConfig::default_path(&self.root)).await?;
        match &self.command {
            Commands::Backups(command) => self.backups(&config, command).await,
            Commands::Sessions(command) => self.sessions(&config, command).await,
            Commands::Fingerprints(command) => self.fingerprints(&config, command).await,
            Commands::Config => {
                if self.json {
                    print_json(&config)
                } else {
                    print!("{}", serde_yaml::to_string(&config)?);
                    Ok(())
                }
            }
        }
    }

    async fn backups(&self, config: &StorysyncConfig, command: &BackupCommand) -> Result<()> {
        let manager = config.backup_manager(&self.root);
        match command {
            BackupCommand::List { epic } => {
                let backups = manager.list_backups(epic).await?;
                if self.json {
                    return print_json(&backups);
                }
                if backups.is_empty() {
                    println!("No backups for {epic}");
                }
                for backup in &backups {
                    print_backup_line(backup);
                }
            }
            BackupCommand::Show { backup_id } => {
                let backup = manager.load_backup(backup_id).await?;
                if self.json {
                    return print_json(&backup);
                }
                print_backup_line(&backup.summary());
                println!("  {} {}", "Document:".dimmed(), backup.document_path);
                for issue in &backup.issues {
                    println!(
                        "  {} {} [{}]",
                        issue.key.as_str().cyan(),
                        issue.summary,
                        issue.status
                    );
                    for subtask in &issue.subtasks {
                        println!(
                            "    {} {} [{}]",
                            subtask.key.as_str().cyan(),
                            subtask.summary,
                            subtask.status
                        );
                    }
                }
            }
            BackupCommand::Prune { epic } => {
                let pruned = manager.cleanup(epic).await?;
                if self.json {
                    return print_json(&serde_json::json!({ "epic": epic, "pruned": pruned }));
                }
                println!("Pruned {pruned} backup(s) of {epic}");
            }
        }
        Ok(())
    }

    async fn sessions(&self, config: &StorysyncConfig, command: &SessionCommand) -> Result<()> {
        let sessions = StateManager::new(config.open_stores(&self.root).sessions);
        match command {
            SessionCommand::List => {
                let states = sessions.list().await?;
                if self.json {
                    return print_json(&states);
                }
                if states.is_empty() {
                    println!("No sessions");
                }
                for state in &states {
                    print_session_line(state);
                }
            }
            SessionCommand::Show { session_id } => {
                let state = sessions.load(session_id).await?;
                if self.json {
                    return print_json(&state);
                }
                print_session_line(&state);
                println!("  {} {}", "Started:".dimmed(), state.started_at.to_rfc3339());
                println!("  {} {}", "Matched:".dimmed(), state.matched.len());
                for (phase, progress) in &state.progress {
                    println!(
                        "  {phase:<18} {} ok, {} failed, {} skipped",
                        progress.succeeded, progress.failed, progress.skipped
                    );
                }
                if let Some(error) = &state.error {
                    println!("  {} {}", "Error:".red(), error);
                }
            }
            SessionCommand::Clean => {
                let removed = sessions.cleanup_completed().await?;
                if self.json {
                    return print_json(&serde_json::json!({ "removed": removed }));
                }
                println!("Removed {removed} finished session(s)");
            }
        }
        Ok(())
    }

    async fn fingerprints(
        &self,
        config: &StorysyncConfig,
        command: &FingerprintCommand,
    ) -> Result<()> {
        let store = config.open_stores(&self.root).fingerprints;
        match command {
            FingerprintCommand::Show { epic, document } => {
                let map = store.load(epic, document).await?;
                if self.json {
                    return print_json(&map);
                }
                if map.is_empty() {
                    println!("No fingerprints for {document} in {epic}");
                }
                for (story_id, fingerprint) in &map {
                    let short = fingerprint.get(..12).unwrap_or(fingerprint);
                    println!("{} {}", story_id.as_str().cyan(), short.dimmed());
                }
            }
            FingerprintCommand::Clear { epic, document } => {
                let mut tracker = ChangeTracker::load(store, epic, document).await?;
                let cleared = tracker.clear().await?;
                if self.json {
                    return print_json(&serde_json::json!({ "cleared": cleared }));
                }
                if cleared {
                    println!("Cleared fingerprints of {document} in {epic}");
                } else {
                    println!("No fingerprints stored for {document} in {epic}");
                }
            }
        }
        Ok(())
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_backup_line(backup: &BackupSummary) {
    println!(
        "{} {} ({} issues, {} subtasks)",
        backup.backup_id.cyan(),
        backup.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        backup.issue_count,
        backup.subtask_count
    );
}

fn print_session_line(state: &SyncState) {
    let phase = match state.phase {
        SyncPhase::Completed => state.phase.as_str().green(),
        SyncPhase::Failed => state.phase.as_str().red(),
        _ => state.phase.as_str().yellow(),
    };
    println!(
        "{} {} {} {} (resumed {}x)",
        state.session_id.cyan(),
        phase,
        state.epic_key,
        state.document_path,
        state.resume_count
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["storysync", "backups", "list", "PROJ-1"])]
    #[case(&["storysync", "backups", "show", "PROJ-1-20260101T000000-abcd1234"])]
    #[case(&["storysync", "sessions", "clean", "--json"])]
    #[case(&["storysync", "--root", "/tmp/x", "fingerprints", "clear", "PROJ-1", "epic.md"])]
    #[case(&["storysync", "config"])]
    fn accepts_valid_invocations(#[case] args: &[&str]) {
        assert!(Cli::try_parse_from(args).is_ok());
    }

    #[rstest]
    #[case(&["storysync"])]
    #[case(&["storysync", "backups", "list"])]
    #[case(&["storysync", "fingerprints", "show", "PROJ-1"])]
    fn rejects_incomplete_invocations(#[case] args: &[&str]) {
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::try_parse_from(["storysync", "sessions", "list", "--json", "--root", "proj"])
            .unwrap();
        assert!(cli.json);
        assert_eq!(cli.root, PathBuf::from("proj"));
    }
}
