//! Segment and upload naming.
//!
//! Segment files live directly under the storage root:
//!
//! ```text
//! <storage_dir>/
//! ├─ 0_2024-05-01_12-00-00.gz    # closed, compressed
//! ├─ 0_2024-05-01_13-10-42       # active (or closed, awaiting compression)
//! └─ 3_2024-05-01_12-00-07.gz
//! ```
//!
//! The stream id is the prefix up to the first [`SEPARATOR`], so grouping by
//! stream is a prefix match, and the fixed-width timestamp after it sorts
//! lexically in chronological order.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use std::fmt;
use std::path::{Path, PathBuf};

/// Separator between stream id and timestamp in segment file names.
pub const SEPARATOR: char = '_';

/// Extension appended to compressed segments.
pub const COMPRESSED_EXTENSION: &str = "gz";

/// Timestamp format embedded in segment file names.
pub const NAME_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Timestamp format prefixed to every captured line.
pub const LINE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Suffix of uploaded objects.
pub const UPLOAD_SUFFIX: &str = ".log.gz";

/// Identifier of a logical stream, usually a port label such as `"3"`.
///
/// Stream ids are embedded in file names, so they are restricted to ASCII
/// letters, digits and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a stream id, rejecting values that would break file naming.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidStreamId`] if `id` is empty or contains a
    /// character other than ASCII alphanumerics and `-`.
    pub fn new(id: impl Into<String>) -> CoreResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::InvalidStreamId {
                id,
                reason: "must not be empty",
            });
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(CoreError::InvalidStreamId {
                id,
                reason: "only ASCII letters, digits and '-' are allowed",
            });
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the file name of a segment of `stream` created at `at`.
#[must_use]
pub fn segment_file_name(stream: &StreamId, at: DateTime<Utc>) -> String {
    format!("{stream}{SEPARATOR}{}", at.format(NAME_TIME_FORMAT))
}

/// Returns the path of a segment of `stream` created at `at` under `root`.
#[must_use]
pub fn segment_path(root: &Path, stream: &StreamId, at: DateTime<Utc>) -> PathBuf {
    root.join(segment_file_name(stream, at))
}

/// Returns the path a compressed copy of `path` is written to.
#[must_use]
pub fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(COMPRESSED_EXTENSION);
    PathBuf::from(name)
}

/// Chooses the creation time of the next segment of a stream.
///
/// The result is `now` truncated to whole seconds, bumped to one second past
/// `previous` when the stream already rotated within the same second. Names
/// derived from successive results are therefore strictly increasing.
#[must_use]
pub fn next_segment_time(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.with_nanosecond(0).unwrap_or(now);
    match previous {
        Some(prev) if prev >= now => prev + Duration::seconds(1),
        _ => now,
    }
}

/// Returns the object key a consolidated stream archive is uploaded under.
///
/// `timestamp` is the name timestamp of the earliest segment in the batch.
#[must_use]
pub fn upload_key(prefix: &str, stream: &str, timestamp: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{stream}{SEPARATOR}{timestamp}{UPLOAD_SUFFIX}")
    } else {
        format!("{prefix}/{stream}{SEPARATOR}{timestamp}{UPLOAD_SUFFIX}")
    }
}

/// A parsed segment file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    /// Stream id prefix.
    pub stream: String,
    /// Name timestamp, `YYYY-MM-DD_HH-MM-SS`.
    pub timestamp: String,
    /// Whether the file carries the compressed extension.
    pub compressed: bool,
}

impl SegmentName {
    /// Parses a segment file name.
    ///
    /// Returns `None` for anything that is not `<stream>_<timestamp>` with an
    /// optional `.gz` suffix, including staging files of the compressor.
    #[must_use]
    pub fn parse(file_name: &str) -> Option<Self> {
        let (base, compressed) = match file_name
            .strip_suffix(COMPRESSED_EXTENSION)
            .and_then(|rest| rest.strip_suffix('.'))
        {
            Some(base) => (base, true),
            None => (file_name, false),
        };

        let (stream, timestamp) = base.split_once(SEPARATOR)?;
        StreamId::new(stream).ok()?;

        let parsed = NaiveDateTime::parse_from_str(timestamp, NAME_TIME_FORMAT).ok()?;
        if parsed.format(NAME_TIME_FORMAT).to_string() != timestamp {
            return None;
        }

        Some(Self {
            stream: stream.to_string(),
            timestamp: timestamp.to_string(),
            compressed,
        })
    }

    /// Returns the creation time encoded in the name.
    #[must_use]
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.timestamp, NAME_TIME_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}
