//! Background compression of closed segments.
//!
//! A closed segment `P` is replaced by `P.gz`:
//!
//! 1. read `P`
//! 2. gzip into `P.gz.tmp`, sync, rename to `P.gz`
//! 3. remove `P`
//! 4. unmark `P` in the registry
//!
//! `P` stays marked until step 4, so the consolidator never reads a
//! half-compressed segment, and the staging name is not a segment name, so
//! it is ignored by listing. If step 3 fails the compressed copy is removed
//! again; the same data is never present under two names.

use crate::error::CoreResult;
use crate::naming::{compressed_path, SegmentName, StreamId, COMPRESSED_EXTENSION};
use crate::registry::SegmentRegistry;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

const STAGING_SUFFIX: &str = ".tmp";

/// Compresses `data` into a single gzip member.
///
/// The header carries no modification time, so equal input always yields
/// equal output.
///
/// # Errors
///
/// Returns an error if the encoder fails.
pub fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let capacity = data.len() / 4 + 32;
    let mut encoder = GzEncoder::new(Vec::with_capacity(capacity), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Returns the segment file name a staging file was written for, or
/// `None` if `file_name` is not a compressor staging name.
pub(crate) fn staging_source(file_name: &str) -> Option<&str> {
    let source = file_name
        .strip_suffix(STAGING_SUFFIX)?
        .strip_suffix(COMPRESSED_EXTENSION)?
        .strip_suffix('.')?;
    SegmentName::parse(source)
        .filter(|name| !name.compressed)
        .map(|_| source)
}

/// Compresses the closed segment at `path` and removes the original.
///
/// Returns the path of the compressed file, or `None` if the segment was
/// empty and was removed without producing an archive.
///
/// # Errors
///
/// Returns an error if reading, writing or removing fails. The original is
/// left in place in that case.
pub fn compress_segment(path: &Path) -> CoreResult<Option<PathBuf>> {
    let data = fs::read(path)?;
    if data.is_empty() {
        fs::remove_file(path)?;
        return Ok(None);
    }

    let compressed = gzip(&data)?;
    let target = compressed_path(path);
    let mut staging = target.clone().into_os_string();
    staging.push(STAGING_SUFFIX);
    let staging = PathBuf::from(staging);

    let staged = (|| -> io::Result<()> {
        let mut file = File::create(&staging)?;
        file.write_all(&compressed)?;
        file.sync_all()?;
        fs::rename(&staging, &target)
    })();
    if let Err(err) = staged {
        let _ = fs::remove_file(&staging);
        return Err(err.into());
    }

    if let Err(err) = fs::remove_file(path) {
        let _ = fs::remove_file(&target);
        return Err(err.into());
    }

    Ok(Some(target))
}

/// Runs segment compression off the capture path.
///
/// Every job unmarks its segment when done, whether compression succeeded
/// or not; a failed segment stays on disk uncompressed and is compressed in
/// memory by the next consolidation pass instead.
#[derive(Debug, Clone)]
pub struct BackgroundCompressor {
    registry: SegmentRegistry,
}

impl BackgroundCompressor {
    /// Creates a compressor that releases paths in `registry`.
    #[must_use]
    pub fn new(registry: SegmentRegistry) -> Self {
        Self { registry }
    }

    /// Compresses `path` on a detached thread.
    ///
    /// Returns the thread handle, or `None` if no thread could be started,
    /// in which case the job has already run inline.
    pub fn spawn(&self, stream: &StreamId, path: PathBuf) -> Option<JoinHandle<()>> {
        let job = self.clone();
        let job_path = path.clone();
        let job_stream = stream.clone();

        match thread::Builder::new()
            .name(format!("compress-{stream}"))
            .spawn(move || {
                job.run_inline(&job_stream, &job_path);
            }) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(stream = %stream, error = %err, "cannot start compression thread, compressing inline");
                self.run_inline(stream, &path);
                None
            }
        }
    }

    /// Compresses `path` on the calling thread.
    ///
    /// Returns the compressed path on success.
    pub fn run_inline(&self, stream: &StreamId, path: &Path) -> Option<PathBuf> {
        let result = compress_segment(path);
        self.registry.unmark(path);

        match result {
            Ok(Some(target)) => {
                tracing::debug!(stream = %stream, path = %target.display(), "compressed segment");
                Some(target)
            }
            Ok(None) => {
                tracing::debug!(stream = %stream, path = %path.display(), "removed empty segment");
                None
            }
            Err(err) => {
                tracing::warn!(stream = %stream, path = %path.display(), error = %err, "segment compression failed");
                None
            }
        }
    }
}
