//! The active segment of a stream.

use crate::error::CoreResult;
use crate::naming::{compressed_path, next_segment_time, segment_path, StreamId};
use crate::registry::SegmentRegistry;
use chrono::{DateTime, Duration, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// A segment file open for writing by exactly one capture loop.
///
/// # Durability
///
/// - `append` writes into an in-memory buffer
/// - `flush_and_sync` pushes the buffer to the OS and calls `sync_all`
/// - `close` does both, then releases the file handle
///
/// The path is marked in the [`SegmentRegistry`] before the file is created.
/// Closing does **not** unmark it; that is left to whoever finishes with the
/// closed file (normally the background compressor).
#[derive(Debug)]
pub struct ActiveSegment {
    path: PathBuf,
    created_at: DateTime<Utc>,
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl ActiveSegment {
    /// Creates the next segment of `stream` under `root`.
    ///
    /// `previous` is the creation time of the stream's previous segment, if
    /// any. Times whose plain or compressed file already exists are skipped,
    /// so an existing segment is never appended to or overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created; the path is unmarked
    /// again in that case.
    pub fn create(
        root: &Path,
        stream: &StreamId,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        registry: &SegmentRegistry,
    ) -> CoreResult<Self> {
        let mut created_at = next_segment_time(previous, now);
        let mut path = segment_path(root, stream, created_at);
        while path.exists() || compressed_path(&path).exists() {
            created_at += Duration::seconds(1);
            path = segment_path(root, stream, created_at);
        }

        registry.mark(&path);
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) => {
                registry.unmark(&path);
                return Err(err.into());
            }
        };

        tracing::info!(stream = %stream, path = %path.display(), "opened segment");

        Ok(Self {
            path,
            created_at,
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    /// Appends a record to the segment buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered writer fails.
    pub fn append(&mut self, record: &str) -> io::Result<()> {
        self.writer.write_all(record.as_bytes())?;
        self.bytes_written += record.len() as u64;
        Ok(())
    }

    /// Flushes buffered records and syncs the file to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or the sync fails.
    pub fn flush_and_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Returns the number of bytes appended since the segment was created.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Returns the segment path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the creation time embedded in the segment name.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Flushes, syncs and closes the segment, returning its path.
    ///
    /// Failures are logged; the file is closed regardless, since nothing more
    /// will be written to it.
    pub fn close(self) -> PathBuf {
        let Self { path, writer, .. } = self;
        match writer.into_inner() {
            Ok(file) => {
                if let Err(err) = file.sync_all() {
                    tracing::warn!(path = %path.display(), error = %err, "could not sync segment");
                }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err.error(), "could not flush segment");
            }
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn create_marks_before_open_and_close_keeps_mark() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let stream = StreamId::new("0").unwrap();

        let mut segment =
            ActiveSegment::create(dir.path(), &stream, None, t0(), &registry).unwrap();
        assert!(registry.is_open(segment.path()));
        assert_eq!(
            segment.path(),
            dir.path().join("0_2024-05-01_12-00-00").as_path()
        );

        segment.append("line\n").unwrap();
        assert_eq!(segment.bytes_written(), 5);

        let path = segment.close();
        assert_eq!(fs::read_to_string(&path).unwrap(), "line\n");
        assert!(registry.is_open(&path));
    }

    #[test]
    fn flush_and_sync_makes_data_visible() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let stream = StreamId::new("0").unwrap();

        let mut segment =
            ActiveSegment::create(dir.path(), &stream, None, t0(), &registry).unwrap();
        segment.append("abc\n").unwrap();
        assert_eq!(fs::read(segment.path()).unwrap().len(), 0);

        segment.flush_and_sync().unwrap();
        assert_eq!(fs::read_to_string(segment.path()).unwrap(), "abc\n");
    }

    #[test]
    fn existing_names_are_skipped() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let stream = StreamId::new("0").unwrap();

        fs::write(dir.path().join("0_2024-05-01_12-00-00.gz"), b"old").unwrap();
        fs::write(dir.path().join("0_2024-05-01_12-00-01"), b"old").unwrap();

        let segment = ActiveSegment::create(dir.path(), &stream, None, t0(), &registry).unwrap();
        assert_eq!(
            segment.path(),
            dir.path().join("0_2024-05-01_12-00-02").as_path()
        );
        assert_eq!(segment.created_at(), t0() + Duration::seconds(2));
    }

    #[test]
    fn rotation_within_same_second_gets_later_name() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let stream = StreamId::new("0").unwrap();

        let first = ActiveSegment::create(dir.path(), &stream, None, t0(), &registry).unwrap();
        let first_at = first.created_at();
        first.close();

        let second =
            ActiveSegment::create(dir.path(), &stream, Some(first_at), t0(), &registry).unwrap();
        assert!(second.created_at() > first_at);
    }

    #[test]
    fn failed_create_unmarks() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let stream = StreamId::new("0").unwrap();
        let missing = dir.path().join("missing");

        let result = ActiveSegment::create(&missing, &stream, None, t0(), &registry);
        assert!(result.is_err());
        assert!(registry.is_empty());
    }
}
