//! Three-way merge of conflicting field values.
//!
//! Text is merged with diff3 over tokens, using the base as common ancestor.
//! Each side is aligned with the base through a longest common subsequence;
//! regions where the base is stable on both sides are copied, and every
//! unstable region is taken from whichever side changed it. When both sides
//! changed the same region differently the merge is ambiguous and yields
//! `None`.
//!
//! Numbers are merged by a fixed [`NumericPolicy`].

use super::FieldValue;
use serde::{Deserialize, Serialize};

/// Token size for text merges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextGranularity {
    /// Whole lines, newline included.
    #[default]
    Line,
    /// Words and the whitespace runs between them.
    Word,
    /// Single characters.
    Character,
}

/// How two diverging numbers combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericPolicy {
    /// The larger value.
    #[default]
    TakeHigher,
    /// The smaller value.
    TakeLower,
    /// The document's value.
    TakeLocal,
    /// The tracker's value.
    TakeRemote,
    /// `base + (local - base) + (remote - base)`.
    SumDeltas,
}

/// Merge settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Token size for text fields.
    pub text_granularity: TextGranularity,
    /// Policy for numeric fields.
    pub numeric_policy: NumericPolicy,
}

/// Largest LCS table a text merge will build.
const MAX_TABLE_CELLS: usize = 4_000_000;

/// Merge one field. `None` means the merge is ambiguous.
#[must_use]
pub fn merge_values(
    base: &FieldValue,
    local: &FieldValue,
    remote: &FieldValue,
    options: MergeOptions,
) -> Option<FieldValue> {
    if local.same_as(remote) {
        return Some(local.clone());
    }
    if base.same_as(local) {
        return Some(remote.clone());
    }
    if base.same_as(remote) {
        return Some(local.clone());
    }

    if local.is_number() || remote.is_number() {
        let merged = merge_numbers(
            base.as_number(),
            local.as_number()?,
            remote.as_number()?,
            options.numeric_policy,
        );
        return Some(FieldValue::Number(merged));
    }

    let merged = merge_text(
        base.as_text(),
        local.as_text(),
        remote.as_text(),
        options.text_granularity,
    )?;
    Some(FieldValue::text(merged))
}

/// Merge two diverging numbers; a missing base counts as zero.
#[must_use]
pub fn merge_numbers(base: Option<f64>, local: f64, remote: f64, policy: NumericPolicy) -> f64 {
    match policy {
        NumericPolicy::TakeHigher => local.max(remote),
        NumericPolicy::TakeLower => local.min(remote),
        NumericPolicy::TakeLocal => local,
        NumericPolicy::TakeRemote => remote,
        NumericPolicy::SumDeltas => {
            let base = base.unwrap_or(0.0);
            base + (local - base) + (remote - base)
        }
    }
}

/// diff3 text merge. `None` when both sides edited the same region
/// differently.
#[must_use]
pub fn merge_text(
    base: &str,
    local: &str,
    remote: &str,
    granularity: TextGranularity,
) -> Option<String> {
    let base = tokenize(base, granularity);
    let local = tokenize(local, granularity);
    let remote = tokenize(remote, granularity);

    let match_local = align(&base, &local)?;
    let match_remote = align(&base, &remote)?;

    let mut out = String::new();
    let (mut o, mut a, mut b) = (0, 0, 0);
    loop {
        let mut stable = 0;
        while o + stable < base.len()
            && match_local[o + stable] == Some(a + stable)
            && match_remote[o + stable] == Some(b + stable)
        {
            stable += 1;
        }
        if stable > 0 {
            out.extend(base[o..o + stable].iter().copied());
            o += stable;
            a += stable;
            b += stable;
            continue;
        }

        let sync = (o..base.len()).find_map(|i| match (match_local[i], match_remote[i]) {
            (Some(x), Some(y)) => Some((i, x, y)),
            _ => None,
        });
        let (next_o, next_a, next_b) = sync.unwrap_or((base.len(), local.len(), remote.len()));
        if o == next_o && a == next_a && b == next_b {
            break;
        }

        let base_chunk = &base[o..next_o];
        let local_chunk = &local[a..next_a];
        let remote_chunk = &remote[b..next_b];
        let chosen = if local_chunk == base_chunk || local_chunk == remote_chunk {
            remote_chunk
        } else if remote_chunk == base_chunk {
            local_chunk
        } else {
            return None;
        };
        out.extend(chosen.iter().copied());
        o = next_o;
        a = next_a;
        b = next_b;
    }
    Some(out)
}

fn tokenize(text: &str, granularity: TextGranularity) -> Vec<&str> {
    match granularity {
        TextGranularity::Line => text.split_inclusive('\n').collect(),
        TextGranularity::Character => text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect(),
        TextGranularity::Word => {
            let mut tokens = Vec::new();
            let mut start = 0;
            let mut in_space = None;
            for (i, c) in text.char_indices() {
                let space = c.is_whitespace();
                if in_space.is_some_and(|s| s != space) {
                    tokens.push(&text[start..i]);
                    start = i;
                }
                in_space = Some(space);
            }
            if start < text.len() {
                tokens.push(&text[start..]);
            }
            tokens
        }
    }
}

/// For every base token, the index of the side token it is aligned with.
fn align(base: &[&str], side: &[&str]) -> Option<Vec<Option<usize>>> {
    let (n, m) = (base.len(), side.len());
    if (n + 1).saturating_mul(m + 1) > MAX_TABLE_CELLS {
        return None;
    }
    // suffix[i][j] = LCS length of base[i..] and side[j..]
    let width = m + 1;
    let mut suffix = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            suffix[i * width + j] = if base[i] == side[j] {
                suffix[(i + 1) * width + j + 1] + 1
            } else {
                suffix[(i + 1) * width + j].max(suffix[i * width + j + 1])
            };
        }
    }

    let mut matches = vec![None; n];
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if base[i] == side[j] {
            matches[i] = Some(j);
            i += 1;
            j += 1;
        } else if suffix[(i + 1) * width + j] >= suffix[i * width + j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    Some(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn non_overlapping_line_edits_combine() {
        let base = "one\ntwo\nthree\n";
        let local = "ONE\ntwo\nthree\n";
        let remote = "one\ntwo\nTHREE\n";
        assert_eq!(
            merge_text(base, local, remote, TextGranularity::Line).as_deref(),
            Some("ONE\ntwo\nTHREE\n")
        );
    }

    #[test]
    fn identical_edits_collapse() {
        let base = "a\nb\n";
        let both = "a\nB\n";
        assert_eq!(
            merge_text(base, both, both, TextGranularity::Line).as_deref(),
            Some(both)
        );
    }

    #[test]
    fn overlapping_edits_are_ambiguous() {
        assert_eq!(
            merge_text("a\nb\n", "a\nx\n", "a\ny\n", TextGranularity::Line),
            None
        );
    }

    #[test]
    fn word_granularity_separates_same_line_edits() {
        let base = "the quick brown fox";
        let local = "the slow brown fox";
        let remote = "the quick brown dog";
        assert_eq!(merge_text(base, local, remote, TextGranularity::Line), None);
        assert_eq!(
            merge_text(base, local, remote, TextGranularity::Word).as_deref(),
            Some("the slow brown dog")
        );
    }

    #[test]
    fn character_granularity_merges_inside_words() {
        assert_eq!(
            merge_text("colour", "Colour", "color", TextGranularity::Character).as_deref(),
            Some("Color")
        );
    }

    #[test]
    fn insertions_at_both_ends() {
        assert_eq!(
            merge_text("b\n", "a\nb\n", "b\nc\n", TextGranularity::Line).as_deref(),
            Some("a\nb\nc\n")
        );
    }

    #[rstest]
    #[case(NumericPolicy::TakeHigher, 8.0)]
    #[case(NumericPolicy::TakeLower, 5.0)]
    #[case(NumericPolicy::TakeLocal, 5.0)]
    #[case(NumericPolicy::TakeRemote, 8.0)]
    #[case(NumericPolicy::SumDeltas, 10.0)]
    fn numeric_policies(#[case] policy: NumericPolicy, #[case] expected: f64) {
        assert!((merge_numbers(Some(3.0), 5.0, 8.0, policy) - expected).abs() < 1e-9);
    }

    #[test]
    fn cleared_estimate_cannot_be_merged_numerically() {
        let options = MergeOptions::default();
        let merged = merge_values(
            &FieldValue::Number(3.0),
            &FieldValue::Empty,
            &FieldValue::Number(8.0),
            options,
        );
        assert_eq!(merged, None);
    }
}
