//! Atomic file operations for JSONL stores.
//!
//! Writes go to a sibling temporary file which is flushed, synced and then
//! renamed over the target. Renames within one filesystem are atomic on
//! POSIX, so readers observe either the old file or the new one, never a
//! partial write. On failure the temporary file is removed on a best-effort
//! basis and the original file is left untouched.

use crate::{JsonlReader, JsonlWriter, Result, Warning};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs::File;

/// Atomically replaces `path` with the given values, one JSON line each.
///
/// Missing parent directories are created.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be created or written, a
/// value fails to serialize, or the final rename fails.
///
/// # Examples
///
/// ```no_run
/// use storysync_jsonl::write_jsonl_atomic;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// write_jsonl_atomic("state/fingerprints.jsonl", &["a", "b"]).await?;
/// # Ok(())
/// # }
/// ```
pub async fn write_jsonl_atomic<T, P>(path: P, values: &[T]) -> Result<()>
where
    T: Serialize,
    P: AsRef<Path>,
{
    write_jsonl_atomic_iter(path, values.iter()).await
}

/// Iterator flavor of [`write_jsonl_atomic`].
///
/// # Errors
///
/// See [`write_jsonl_atomic`].
pub async fn write_jsonl_atomic_iter<T, I, P>(path: P, values: I) -> Result<()>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = make_temp_path(path);

    if let Err(e) = write_to_temp_file(&temp_path, values).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&temp_path, path).await?;
    tracing::trace!(path = %path.display(), "atomic JSONL write committed");
    Ok(())
}

/// Reads a JSONL file, skipping malformed lines.
///
/// A missing file is not an error: it reads as empty with no warnings, which
/// is what every store wants on first use.
///
/// # Errors
///
/// Returns `Error::Io` for IO failures other than "not found".
pub async fn read_jsonl_resilient<T, P>(path: P) -> Result<(Vec<T>, Vec<Warning>)>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let file = match File::open(path.as_ref()).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Vec::new(), Vec::new()));
        }
        Err(e) => return Err(e.into()),
    };
    JsonlReader::new(file).read_all_resilient().await
}

/// Removes a file, treating "not found" as success.
///
/// # Errors
///
/// Returns `Error::Io` for any other removal failure.
pub async fn remove_if_exists<P: AsRef<Path>>(path: P) -> Result<bool> {
    match tokio::fs::remove_file(path.as_ref()).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Appends `.tmp` to the full file name, so `a.jsonl` becomes `a.jsonl.tmp`.
fn make_temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(OsString::new, std::ffi::OsStr::to_os_string);
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_to_temp_file<T, I>(temp_path: &Path, values: I) -> Result<()>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let file = File::create(temp_path).await?;
    let mut writer = JsonlWriter::new(file);
    writer.write_all(values).await?;
    writer.flush().await?;
    writer.into_inner().into_inner().sync_all().await?;
    Ok(())
}
