//! Upload consolidation.
//!
//! A pass lists the storage root, groups closed segments by stream and
//! uploads each group as one multi-member gzip object keyed by its earliest
//! segment. Constituent files are removed only after the upload succeeded,
//! so a failed group is retried unchanged by the next pass.
//!
//! ## Exclusion
//!
//! Every path present in the [`SegmentRegistry`] is skipped: it is either
//! being written by a capture loop or being compressed. Compressor staging
//! files whose segment is no longer registered were left by an interrupted
//! compression and are deleted. Other files are ignored.
//!
//! Uploaded segments are removed oldest first, stopping at the first
//! failure. What stays behind is always a run of newer segments, so the next
//! pass uploads it under a key of its own.

use crate::compressor::{gzip, staging_source};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::naming::{upload_key, SegmentName};
use crate::registry::SegmentRegistry;
use portlog_store::ObjectStore;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A closed segment waiting for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSegment {
    /// Path under the storage root.
    pub path: PathBuf,
    /// Parsed file name.
    pub name: SegmentName,
    /// File size in bytes.
    pub size: u64,
}

/// The pending segments of one stream, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    /// Stream id.
    pub stream: String,
    /// Segments sorted by name timestamp.
    pub segments: Vec<PendingSegment>,
}

impl StreamBatch {
    /// Returns the name timestamp of the oldest segment.
    #[must_use]
    pub fn earliest(&self) -> Option<&str> {
        self.segments.first().map(|s| s.name.timestamp.as_str())
    }

    /// Returns the object key this batch is uploaded under.
    #[must_use]
    pub fn key(&self, prefix: &str) -> Option<String> {
        self.earliest()
            .map(|timestamp| upload_key(prefix, &self.stream, timestamp))
    }

    /// Returns the total on-disk size of the batch.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.size).sum()
    }
}

/// What a pass would do, computed without side effects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationPlan {
    /// Batches to upload, ordered by stream id.
    pub batches: Vec<StreamBatch>,
    /// Zero-byte segments to delete without uploading.
    pub zero_byte: Vec<PathBuf>,
    /// Staging files of interrupted compressions.
    pub stale_staging: Vec<PathBuf>,
    /// Segments skipped because they are registered as open.
    pub skipped_open: usize,
    /// Entries ignored because they are not segment files.
    pub ignored: usize,
}

impl ConsolidationPlan {
    /// Returns true if the pass would neither upload nor delete anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.zero_byte.is_empty() && self.stale_staging.is_empty()
    }
}

/// Outcome of one consolidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Batches uploaded and removed locally.
    pub groups_uploaded: usize,
    /// Batches whose read or upload failed and were left in place.
    pub groups_failed: usize,
    /// Segment files removed after upload.
    pub files_removed: usize,
    /// Zero-byte segment files removed.
    pub zero_byte_removed: usize,
    /// Stale staging files removed.
    pub staging_removed: usize,
    /// Segments skipped because they were open.
    pub open_skipped: usize,
    /// Payload bytes uploaded.
    pub bytes_uploaded: u64,
}

/// Groups closed segments and ships them to an object store.
#[derive(Clone)]
pub struct Consolidator {
    storage_dir: PathBuf,
    registry: SegmentRegistry,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key_prefix: String,
}

impl fmt::Debug for Consolidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consolidator")
            .field("storage_dir", &self.storage_dir)
            .field("bucket", &self.bucket)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl Consolidator {
    /// Creates a consolidator for `storage_dir`.
    pub fn new(
        storage_dir: impl Into<PathBuf>,
        registry: SegmentRegistry,
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            registry,
            store,
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
        }
    }

    /// Creates a consolidator using the storage root and upload target of
    /// `config`.
    pub fn from_config(
        config: &Config,
        registry: SegmentRegistry,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self::new(
            &config.storage_dir,
            registry,
            store,
            &config.bucket,
            &config.key_prefix,
        )
    }

    /// Returns the storage root.
    #[must_use]
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Returns the key prefix of uploaded objects.
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Classifies the storage root without touching any file.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be listed.
    pub fn scan(&self) -> CoreResult<ConsolidationPlan> {
        scan_storage(&self.storage_dir, &self.registry)
    }

    /// Runs one consolidation pass.
    ///
    /// Batches are independent: a failed upload leaves that batch's files
    /// untouched and the pass continues with the next stream. A segment that
    /// cannot be read is left out of its batch and retried by the next pass.
    ///
    /// # Errors
    ///
    /// Returns an error only if the storage root cannot be listed.
    pub fn run_pass(&self) -> CoreResult<ConsolidationReport> {
        let plan = self.scan()?;
        let mut report = ConsolidationReport {
            open_skipped: plan.skipped_open,
            ..ConsolidationReport::default()
        };

        for path in &plan.stale_staging {
            if remove_stray(path, "stale staging file") {
                report.staging_removed += 1;
            }
        }
        for path in &plan.zero_byte {
            if remove_stray(path, "zero-byte segment") {
                report.zero_byte_removed += 1;
            }
        }

        for batch in &plan.batches {
            match self.upload_batch(batch) {
                Ok(Some((key, bytes, uploaded))) => {
                    report.groups_uploaded += 1;
                    report.bytes_uploaded += bytes;
                    report.files_removed += remove_all(&uploaded);
                    tracing::info!(
                        stream = %batch.stream,
                        key = %key,
                        bytes,
                        files = uploaded.len(),
                        "uploaded segments"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    report.groups_failed += 1;
                    let retryable = match &err {
                        CoreError::Store(store) => store.is_retryable(),
                        _ => true,
                    };
                    tracing::warn!(
                        stream = %batch.stream,
                        error = %err,
                        retryable,
                        "upload failed, segments kept for next pass"
                    );
                }
            }
        }

        tracing::debug!(
            uploaded = report.groups_uploaded,
            failed = report.groups_failed,
            removed = report.files_removed,
            skipped = report.open_skipped,
            "consolidation pass finished"
        );
        Ok(report)
    }

    /// Builds and uploads the payload of one batch.
    ///
    /// Returns the key, the payload size and the files included, or `None`
    /// if no file could be read.
    fn upload_batch(
        &self,
        batch: &StreamBatch,
    ) -> CoreResult<Option<(String, u64, Vec<PathBuf>)>> {
        let mut payload = Vec::new();
        let mut included = Vec::with_capacity(batch.segments.len());
        let mut earliest = None;

        for segment in &batch.segments {
            let data = match fs::read(&segment.path) {
                Ok(data) => data,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(path = %segment.path.display(), "segment vanished before upload");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(
                        path = %segment.path.display(),
                        error = %err,
                        "cannot read segment, leaving it for next pass"
                    );
                    continue;
                }
            };

            if segment.name.compressed {
                payload.extend_from_slice(&data);
            } else {
                payload.extend(gzip(&data)?);
            }
            earliest.get_or_insert(segment.name.timestamp.as_str());
            included.push(segment.path.clone());
        }

        let Some(earliest) = earliest else {
            return Ok(None);
        };

        let key = upload_key(&self.key_prefix, &batch.stream, earliest);
        self.store.put(&self.bucket, &key, &payload)?;
        Ok(Some((key, payload.len() as u64, included)))
    }
}

/// Classifies the segment files under `storage_dir`.
///
/// Paths present in `registry` are counted as open and left out of the
/// plan. A process that does not own the capture loops of `storage_dir`
/// sees an empty registry, so it must hold the directory lock (see
/// [`StorageDir`](crate::StorageDir)) before acting on the plan.
///
/// # Errors
///
/// Returns an error if `storage_dir` cannot be listed. Entries that cannot
/// be inspected are logged and left out.
pub fn scan_storage(
    storage_dir: &Path,
    registry: &SegmentRegistry,
) -> CoreResult<ConsolidationPlan> {
    let mut plan = ConsolidationPlan::default();
    let mut groups: BTreeMap<String, Vec<PendingSegment>> = BTreeMap::new();

    for entry in fs::read_dir(storage_dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(dir = %storage_dir.display(), error = %err, "cannot list entry");
                continue;
            }
        };
        let path = entry.path();

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cannot stat entry");
                continue;
            }
        };
        if !metadata.is_file() {
            plan.ignored += 1;
            continue;
        }

        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            plan.ignored += 1;
            continue;
        };

        if let Some(source) = staging_source(file_name) {
            if registry.is_open(&storage_dir.join(source)) {
                plan.ignored += 1;
            } else {
                plan.stale_staging.push(path);
            }
            continue;
        }

        let Some(name) = SegmentName::parse(file_name) else {
            plan.ignored += 1;
            continue;
        };

        if registry.is_open(&path) {
            plan.skipped_open += 1;
            continue;
        }

        if metadata.len() == 0 {
            plan.zero_byte.push(path);
            continue;
        }

        groups.entry(name.stream.clone()).or_default().push(PendingSegment {
            path,
            name,
            size: metadata.len(),
        });
    }

    plan.zero_byte.sort();
    plan.stale_staging.sort();
    plan.batches = groups
        .into_iter()
        .map(|(stream, mut segments)| {
            segments.sort_by(|a, b| a.name.timestamp.cmp(&b.name.timestamp));
            StreamBatch { stream, segments }
        })
        .collect();

    Ok(plan)
}

/// Removes uploaded segments in order and stops at the first failure.
///
/// Returns the number of files removed.
fn remove_all(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for (index, path) in paths.iter().enumerate() {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    kept = paths.len() - index,
                    "could not remove uploaded segment, keeping it and newer ones"
                );
                break;
            }
        }
    }
    removed
}

fn remove_stray(path: &Path, what: &str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "removed {what}");
            true
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "could not remove {what}");
            false
        }
    }
}
