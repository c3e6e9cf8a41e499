//! Service configuration.

use crate::error::{CoreError, CoreResult};
use crate::naming::StreamId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variables holding port mappings, `P0` to `P9`.
/// The digit becomes the stream id.
const PORT_VARS: [&str; 10] = ["P0", "P1", "P2", "P3", "P4", "P5", "P6", "P7", "P8", "P9"];

/// A stream and the transport identifier it is captured from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Logical stream id, used as the segment name prefix.
    pub stream: StreamId,
    /// Transport identifier, for example `/dev/ttyUSB0`.
    pub device: String,
}

impl FromStr for PortMapping {
    type Err = CoreError;

    /// Parses `NAME=DEVICE`.
    fn from_str(s: &str) -> CoreResult<Self> {
        let (name, device) = s
            .split_once('=')
            .ok_or_else(|| CoreError::invalid_config(format!("expected NAME=DEVICE, got '{s}'")))?;
        if device.is_empty() {
            return Err(CoreError::invalid_config(format!("empty device for port '{name}'")));
        }
        Ok(Self {
            stream: StreamId::new(name)?,
            device: device.to_string(),
        })
    }
}

/// Configuration for the capture loops and the consolidator.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory segment files are written to.
    pub storage_dir: PathBuf,

    /// Segment size in bytes above which the active segment is rotated.
    pub max_segment_size: u64,

    /// How often the active segment is flushed and synced.
    pub sync_interval: Duration,

    /// Silence after which a non-empty active segment is rotated anyway.
    pub quiescence: Duration,

    /// Transport read timeout.
    pub read_timeout: Duration,

    /// Time between consolidation passes.
    pub upload_interval: Duration,

    /// Serial line speed.
    pub baud_rate: u32,

    /// Object store bucket uploads go to.
    pub bucket: String,

    /// Key prefix of uploaded objects.
    pub key_prefix: String,

    /// Streams to capture.
    pub ports: Vec<PortMapping>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data"),
            max_segment_size: 1_000_000_000,
            sync_interval: Duration::from_secs(15),
            quiescence: Duration::from_secs(10 * 60),
            read_timeout: Duration::from_millis(100),
            upload_interval: Duration::from_secs(12 * 60 * 60),
            baud_rate: 115_200,
            bucket: "portlog".to_string(),
            key_prefix: "default".to_string(),
            ports: Vec::new(),
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> CoreResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Reads the configuration from key/value pairs.
    ///
    /// Recognised keys: `STORAGE_DIR`, `MAX_FILE_SIZE` (bytes),
    /// `SYNC_INTERVAL_SECS`, `QUIESCENCE_SECS`, `READ_TIMEOUT_MS`,
    /// `UPLOAD_INTERVAL` (minutes), `BAUD_RATE`, `UPLOAD_BUCKET`,
    /// `UPLOAD_PATH_PREFIX` and `P0`..`P9`. Empty values are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric value does not parse or a port mapping
    /// is invalid.
    pub fn from_vars<I, K, V>(vars: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.is_empty())
            .collect();

        let mut config = Self::default();

        if let Some(dir) = vars.get("STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(size) = parse_var::<u64>(&vars, "MAX_FILE_SIZE")? {
            config.max_segment_size = size;
        }
        if let Some(secs) = parse_var::<u64>(&vars, "SYNC_INTERVAL_SECS")? {
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&vars, "QUIESCENCE_SECS")? {
            config.quiescence = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&vars, "READ_TIMEOUT_MS")? {
            config.read_timeout = Duration::from_millis(ms);
        }
        if let Some(minutes) = parse_var::<u64>(&vars, "UPLOAD_INTERVAL")? {
            config.upload_interval = Duration::from_secs(minutes * 60);
        }
        if let Some(baud) = parse_var::<u32>(&vars, "BAUD_RATE")? {
            config.baud_rate = baud;
        }
        if let Some(bucket) = vars.get("UPLOAD_BUCKET") {
            config.bucket = bucket.clone();
        }
        if let Some(prefix) = vars.get("UPLOAD_PATH_PREFIX") {
            config.key_prefix = prefix.clone();
        }

        for (index, var) in PORT_VARS.iter().enumerate() {
            if let Some(device) = vars.get(*var) {
                config.ports.push(PortMapping {
                    stream: StreamId::new(index.to_string())?,
                    device: device.clone(),
                });
            }
        }

        Ok(config)
    }

    /// Sets the storage directory.
    #[must_use]
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Sets the maximum segment size.
    #[must_use]
    pub const fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Sets the sync interval.
    #[must_use]
    pub const fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the quiescence window.
    #[must_use]
    pub const fn quiescence(mut self, window: Duration) -> Self {
        self.quiescence = window;
        self
    }

    /// Sets the upload interval.
    #[must_use]
    pub const fn upload_interval(mut self, interval: Duration) -> Self {
        self.upload_interval = interval;
        self
    }

    /// Adds a port mapping, replacing any existing mapping for the stream.
    #[must_use]
    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.retain(|p| p.stream != mapping.stream);
        self.ports.push(mapping);
        self
    }

    /// Checks that the values are usable together.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_segment_size == 0 {
            return Err(CoreError::invalid_config("max segment size must be positive"));
        }
        if self.upload_interval.is_zero() {
            return Err(CoreError::invalid_config("upload interval must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(CoreError::invalid_config("read timeout must be positive"));
        }
        if self.quiescence <= self.sync_interval {
            return Err(CoreError::invalid_config(
                "quiescence window must be longer than the sync interval",
            ));
        }
        portlog_store::validate_bucket(&self.bucket)?;
        Ok(())
    }

    /// Returns the subset of settings a capture loop needs.
    #[must_use]
    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            storage_dir: self.storage_dir.clone(),
            max_segment_size: self.max_segment_size,
            sync_interval: self.sync_interval,
            quiescence: self.quiescence,
            read_buffer_size: CaptureConfig::DEFAULT_READ_BUFFER,
        }
    }
}

/// Settings of a single capture loop.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Directory segment files are written to.
    pub storage_dir: PathBuf,
    /// Rotation threshold in bytes.
    pub max_segment_size: u64,
    /// Flush and sync cadence.
    pub sync_interval: Duration,
    /// Silence after which a non-empty segment is rotated.
    pub quiescence: Duration,
    /// Size of the transport read buffer.
    pub read_buffer_size: usize,
}

impl CaptureConfig {
    /// Default size of the transport read buffer.
    pub const DEFAULT_READ_BUFFER: usize = 256;
}

fn parse_var<T: FromStr>(vars: &HashMap<String, String>, key: &str) -> CoreResult<Option<T>> {
    vars.get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| CoreError::invalid_config(format!("{key}: cannot parse '{raw}'")))
        })
        .transpose()
}
