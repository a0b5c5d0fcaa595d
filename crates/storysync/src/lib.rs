//! storysync - keeps an epic document and a remote issue tracker in agreement.
//!
//! The engine reads user stories from a document through a
//! [`DocumentParser`](ports::DocumentParser), compares them with the issues
//! under an epic fetched through an [`IssueTracker`](ports::IssueTracker),
//! and pushes the differences back phase by phase. Around that loop it keeps
//! local baselines so repeated runs stay cheap and safe:
//!
//! - [`fingerprint`]: per-story hashes for incremental runs
//! - [`conflict`]: a snapshot of agreed values for three-way conflict
//!   detection, resolution strategies and field merging
//! - [`backup`]: point-in-time copies of the tracker side, with diff and
//!   restore
//! - [`state`]: resumable session records
//!
//! [`sync::SyncOrchestrator`] ties them together.

#![forbid(unsafe_code)]

pub mod backup;
pub mod conflict;
pub mod config;
pub mod domain;
pub mod error;
pub mod fingerprint;
pub mod ports;
pub mod state;
pub mod sync;

// CLI of the admin binary
pub mod cli;

pub(crate) mod keys;

pub use error::{Error, Result};
pub use sync::{SyncOptions, SyncOrchestrator, SyncResult, SyncStores};
