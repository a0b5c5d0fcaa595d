//! JSONL reading operations.
//!
//! This module provides async, line-oriented reading of JSONL data with line
//! number tracking, in a strict flavor (first bad line is an error) and a
//! resilient flavor (bad lines become [`Warning`]s).

use crate::warning::Warning;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Async reader for JSONL (JSON Lines) data.
///
/// `JsonlReader` wraps an async reader in a [`BufReader`] and tracks the
/// 1-based number of the last line read so decode failures can point at the
/// offending line. Blank lines are skipped silently in both reading modes.
///
/// # Examples
///
/// ```no_run
/// use storysync_jsonl::JsonlReader;
/// use tokio::fs::File;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let file = File::open("fingerprints.jsonl").await?;
/// let mut reader = JsonlReader::new(file);
/// while let Some(value) = reader.read_value::<serde_json::Value>().await? {
///     println!("{value}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct JsonlReader<R> {
    reader: BufReader<R>,
    line_number: usize,
    buffer: String,
}

impl<R: AsyncRead + Unpin> JsonlReader<R> {
    /// Creates a new `JsonlReader` wrapping the given async reader.
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line_number: 0,
            buffer: String::new(),
        }
    }

    /// Returns the 1-based number of the last line read, or 0 before any read.
    #[must_use]
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Reads the next non-blank line, without its trailing newline.
    ///
    /// Returns `Ok(None)` at end of input.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the underlying reader fails.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            self.buffer.clear();
            let read = self.reader.read_line(&mut self.buffer).await?;
            if read == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            if !self.buffer.trim().is_empty() {
                return Ok(Some(self.buffer.trim_end_matches(['\n', '\r']).to_string()));
            }
        }
    }

    /// Reads and decodes the next record, failing on the first bad line.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidLine` if a line is not valid JSON for `T`, or
    /// `Error::Io` if the underlying reader fails.
    pub async fn read_value<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let Some(line) = self.next_line().await? else {
            return Ok(None);
        };
        serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| Error::InvalidLine {
                line_number: self.line_number,
                message: e.to_string(),
            })
    }

    /// Reads every remaining record, skipping lines that fail to decode.
    ///
    /// Each skipped line produces a [`Warning::MalformedJson`] carrying its
    /// line number. Only IO failures abort the read.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the underlying reader fails.
    pub async fn read_all_resilient<T: DeserializeOwned>(
        &mut self,
    ) -> Result<(Vec<T>, Vec<Warning>)> {
        let mut values = Vec::new();
        let mut warnings = Vec::new();
        loop {
            let Some(line) = self.next_line().await? else {
                break;
            };
            match serde_json::from_str::<T>(&line) {
                Ok(value) => values.push(value),
                Err(e) => warnings.push(Warning::MalformedJson {
                    line_number: self.line_number,
                    error: e.to_string(),
                }),
            }
        }
        Ok((values, warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        id: u32,
    }

    #[tokio::test]
    async fn blank_lines_are_skipped_but_counted() {
        let data = Cursor::new(b"{\"id\":1}\n\n   \n{\"id\":2}\n".to_vec());
        let mut reader = JsonlReader::new(data);

        assert_eq!(reader.read_value::<Row>().await.unwrap(), Some(Row { id: 1 }));
        assert_eq!(reader.line_number(), 1);
        assert_eq!(reader.read_value::<Row>().await.unwrap(), Some(Row { id: 2 }));
        assert_eq!(reader.line_number(), 4);
        assert_eq!(reader.read_value::<Row>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn strict_read_reports_line_number() {
        let data = Cursor::new(b"{\"id\":1}\nnot json\n".to_vec());
        let mut reader = JsonlReader::new(data);

        reader.read_value::<Row>().await.unwrap();
        let err = reader.read_value::<Row>().await.unwrap_err();
        assert!(matches!(err, Error::InvalidLine { line_number: 2, .. }));
    }

    #[tokio::test]
    async fn resilient_read_collects_warnings() {
        let data = Cursor::new(b"{\"id\":1}\n{broken\n{\"id\":3}\n{\"name\":\"x\"}\n".to_vec());
        let mut reader = JsonlReader::new(data);

        let (rows, warnings) = reader.read_all_resilient::<Row>().await.unwrap();
        assert_eq!(rows, vec![Row { id: 1 }, Row { id: 3 }]);
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].line_number(), 2);
        assert_eq!(warnings[1].line_number(), 4);
    }

    #[tokio::test]
    async fn crlf_line_endings_are_trimmed() {
        let data = Cursor::new(b"{\"id\":7}\r\n".to_vec());
        let mut reader = JsonlReader::new(data);
        assert_eq!(reader.read_value::<Row>().await.unwrap(), Some(Row { id: 7 }));
    }
}
