//! Deterministic naming for on-disk store entries.
//!
//! Every store is keyed by (epic, document path) or by a generated id. Names
//! are derived here so all stores agree on them and so that re-running
//! against the same inputs finds the same files.

use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Lowercase hex SHA-256 of the given bytes.
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        // Writing to a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Make an epic key safe for use in a file name.
///
/// ASCII alphanumerics, `-` and `_` are kept; everything else becomes `_`.
#[must_use]
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// File stem for state keyed by (epic, document path).
#[must_use]
pub fn store_stem(epic: &str, document_path: &str) -> String {
    let digest = sha256_hex(document_path.as_bytes());
    format!("{}-{}", sanitize(epic), &digest[..16])
}

/// Session id for a (document path, epic) pair.
///
/// Stable across processes: re-invoking against the same inputs yields the
/// same id, so an interrupted session is found again.
#[must_use]
pub fn session_id(document_path: &str, epic: &str) -> String {
    let mut input = Vec::with_capacity(document_path.len() + epic.len() + 1);
    input.extend_from_slice(document_path.as_bytes());
    input.push(0);
    input.extend_from_slice(epic.as_bytes());
    sha256_hex(&input)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("PROJ-1", "PROJ-1")]
    #[case("team/epic 7", "team_epic_7")]
    #[case("", "_")]
    #[case("../etc", "___etc")]
    fn sanitizes_names(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize(input), expected);
    }

    #[test]
    fn session_id_is_deterministic() {
        let a = session_id("docs/epic.md", "PROJ-1");
        assert_eq!(a, session_id("docs/epic.md", "PROJ-1"));
        assert_eq!(a.len(), 16);
        assert_ne!(a, session_id("docs/epic.md", "PROJ-2"));
        assert_ne!(a, session_id("docs/other.md", "PROJ-1"));
    }

    #[test]
    fn separator_prevents_ambiguous_concatenation() {
        assert_ne!(session_id("ab", "c"), session_id("a", "bc"));
    }

    #[test]
    fn stem_combines_epic_and_path_digest() {
        let stem = store_stem("PROJ-1", "docs/epic.md");
        assert!(stem.starts_with("PROJ-1-"));
        assert_eq!(stem.len(), "PROJ-1-".len() + 16);
    }
}
