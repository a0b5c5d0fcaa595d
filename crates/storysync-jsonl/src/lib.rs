//! Crash-safe JSON Lines persistence.
//!
//! Every local store of storysync (fingerprints, sync snapshots, backups,
//! session state) is a small JSONL file written through
//! [`write_jsonl_atomic`] and read back with [`read_jsonl_resilient`], so a
//! crash mid-write never corrupts a baseline and a hand-damaged line costs one
//! record instead of the whole store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod atomic;
pub mod error;
pub mod reader;
pub mod warning;
pub mod writer;

pub use atomic::{read_jsonl_resilient, remove_if_exists, write_jsonl_atomic, write_jsonl_atomic_iter};
pub use error::{Error, Result};
pub use reader::JsonlReader;
pub use warning::Warning;
pub use writer::JsonlWriter;
