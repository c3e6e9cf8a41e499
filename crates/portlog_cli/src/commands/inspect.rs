//! Inspect command implementation.

use portlog_core::{scan_storage, Config, ConsolidationPlan, SegmentRegistry};
use serde::Serialize;

/// Storage inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Storage directory.
    pub path: String,
    /// Key prefix uploads would use.
    pub key_prefix: String,
    /// Pending segments per stream.
    pub streams: Vec<StreamStats>,
    /// Zero-byte segments.
    pub zero_byte: usize,
    /// Unrelated entries.
    pub ignored: usize,
}

/// Pending segments of one stream.
#[derive(Debug, Serialize)]
pub struct StreamStats {
    /// Stream id.
    pub stream: String,
    /// Key the next upload would use.
    pub upload_key: String,
    /// Total size in bytes.
    pub bytes: u64,
    /// Segments, oldest first.
    pub segments: Vec<SegmentStats>,
}

/// A single pending segment.
#[derive(Debug, Serialize)]
pub struct SegmentStats {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub bytes: u64,
    /// Whether the file is gzip-compressed.
    pub compressed: bool,
}

impl InspectResult {
    fn from_plan(path: String, key_prefix: &str, plan: &ConsolidationPlan) -> Self {
        let streams = plan
            .batches
            .iter()
            .map(|batch| StreamStats {
                stream: batch.stream.clone(),
                upload_key: batch.key(key_prefix).unwrap_or_default(),
                bytes: batch.total_bytes(),
                segments: batch
                    .segments
                    .iter()
                    .map(|segment| SegmentStats {
                        name: segment
                            .path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        bytes: segment.size,
                        compressed: segment.name.compressed,
                    })
                    .collect(),
            })
            .collect();

        Self {
            path,
            key_prefix: key_prefix.to_string(),
            streams,
            zero_byte: plan.zero_byte.len(),
            ignored: plan.ignored,
        }
    }
}

/// Runs the inspect command.
///
/// Read-only; segments still open in a running daemon are listed too.
pub fn run(config: &Config, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = &config.storage_dir;
    if !path.is_dir() {
        return Err(format!("No storage directory at {}", path.display()).into());
    }

    let plan = scan_storage(path, &SegmentRegistry::new())?;
    let result = InspectResult::from_plan(path.display().to_string(), &config.key_prefix, &plan);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        "text" => print_text(&result),
        other => return Err(format!("Unknown format: {other}").into()),
    }

    Ok(())
}

fn print_text(result: &InspectResult) {
    println!("Storage: {}", result.path);
    println!();

    if result.streams.is_empty() {
        println!("No pending segments");
    }
    for stream in &result.streams {
        println!(
            "Stream {} ({} segments, {} bytes) -> {}",
            stream.stream,
            stream.segments.len(),
            stream.bytes,
            stream.upload_key
        );
        for segment in &stream.segments {
            println!(
                "  {:<32} {:>12} {}",
                segment.name,
                segment.bytes,
                if segment.compressed { "gz" } else { "" }
            );
        }
    }

    if result.zero_byte > 0 {
        println!();
        println!("Zero-byte segments: {}", result.zero_byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn result_groups_streams() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("2_2024-05-01_12-00-00"), b"line\n").unwrap();
        fs::write(dir.path().join("2_2024-05-01_11-00-00.gz"), b"gz").unwrap();
        fs::write(dir.path().join("0_2024-05-01_12-00-00"), b"").unwrap();

        let plan = scan_storage(dir.path(), &SegmentRegistry::new()).unwrap();
        let result = InspectResult::from_plan("x".to_string(), "site", &plan);

        assert_eq!(result.streams.len(), 1);
        let stream = &result.streams[0];
        assert_eq!(stream.upload_key, "site/2_2024-05-01_11-00-00.log.gz");
        assert_eq!(stream.bytes, 7);
        assert_eq!(stream.segments[0].name, "2_2024-05-01_11-00-00.gz");
        assert!(stream.segments[0].compressed);
        assert_eq!(result.zero_byte, 1);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["streams"][0]["stream"], "2");
    }
}
