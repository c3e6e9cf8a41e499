//! Line reassembly.
//!
//! Transports hand over arbitrary byte chunks. The reassembler joins them
//! into complete lines, repairs invalid UTF-8 and prefixes every non-empty
//! line with a capture timestamp:
//!
//! ```text
//! chunk "boo"      -> (buffered)
//! chunk "t ok\nre" -> "2024-05-01 12:00:00: boot ok\n"   ("re" buffered)
//! ```
//!
//! Decoding happens per complete line, after splitting on `\n`, so a
//! multi-byte character split across two chunks is decoded intact.

use crate::naming::LINE_TIME_FORMAT;
use chrono::{DateTime, Utc};
use std::borrow::Cow;

/// Separator between the timestamp and the captured text.
pub const RECORD_SEPARATOR: &str = ": ";

/// Accumulates raw chunks of one stream and emits timestamped lines.
///
/// The state is private to one capture loop; no synchronisation is needed.
#[derive(Debug, Default)]
pub struct LineReassembler {
    pending: Vec<u8>,
}

impl LineReassembler {
    /// Creates an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the records for every line it completes.
    ///
    /// Bytes after the last newline are kept for the next call. Empty lines
    /// produce no record.
    pub fn feed(&mut self, chunk: &[u8], now: DateTime<Utc>) -> Vec<String> {
        let previous_len = self.pending.len();
        self.pending.extend_from_slice(chunk);

        // Buffered bytes never contain a newline, so only the chunk is searched.
        let Some(last) = memchr::memrchr(b'\n', chunk) else {
            return Vec::new();
        };

        let rest = self.pending.split_off(previous_len + last + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        let stamp = now.format(LINE_TIME_FORMAT).to_string();
        complete[..complete.len() - 1]
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| format_record(&stamp, line))
            .collect()
    }

    /// Emits the unterminated remainder as a final record, if any.
    ///
    /// Used when the stream ends so that captured bytes are not dropped.
    pub fn finish(&mut self, now: DateTime<Utc>) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        let stamp = now.format(LINE_TIME_FORMAT).to_string();
        Some(format_record(&stamp, &line))
    }

    /// Returns the number of buffered bytes not yet terminated by a newline.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn format_record(stamp: &str, line: &[u8]) -> String {
    let text = repair_utf8(line);
    let mut record = String::with_capacity(stamp.len() + RECORD_SEPARATOR.len() + text.len() + 1);
    record.push_str(stamp);
    record.push_str(RECORD_SEPARATOR);
    record.push_str(&text);
    record.push('\n');
    record
}

/// Decodes `bytes` as UTF-8, replacing each maximal run of invalid
/// sequences with a single U+FFFD.
///
/// Valid input is returned borrowed.
#[must_use]
pub fn repair_utf8(bytes: &[u8]) -> Cow<'_, str> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(bytes.len() + 3);
    let mut in_invalid_run = false;

    for chunk in bytes.utf8_chunks() {
        if !chunk.valid().is_empty() {
            out.push_str(chunk.valid());
            in_invalid_run = false;
        }
        if !chunk.invalid().is_empty() && !in_invalid_run {
            out.push(char::REPLACEMENT_CHARACTER);
            in_invalid_run = true;
        }
    }

    Cow::Owned(out)
}
