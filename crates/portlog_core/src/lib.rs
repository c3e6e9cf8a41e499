//! # portlog Core
//!
//! Capture, rotation and consolidation pipeline for portlog.
//!
//! This crate provides:
//! - Line reassembly with timestamp prefixes and UTF-8 repair
//! - Per-port capture loops writing size- and silence-rotated segments
//! - Background gzip compression of closed segments
//! - Consolidation of closed segments into one upload per stream
//!
//! ## Coordination
//!
//! Capture loops, compression jobs and the consolidator share nothing but
//! the storage directory and a [`SegmentRegistry`] of paths that must not be
//! touched:
//!
//! ```text
//! capture loop --mark--> registry <--is_open-- consolidator
//!      |                    ^
//!      +--closed path--> compressor --unmark
//! ```
//!
//! ## File layout
//!
//! Segments are named `<stream>_<YYYY-MM-DD_HH-MM-SS>` and become
//! `<stream>_<YYYY-MM-DD_HH-MM-SS>.gz` once compressed. Each line is stored
//! as `YYYY-MM-DD HH:MM:SS: <text>` in UTC.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod capture;
mod clock;
mod compressor;
mod config;
mod consolidator;
mod dir;
mod error;
mod naming;
mod reassembler;
mod registry;
mod segment;
mod shutdown;
mod transport;

pub use capture::{CaptureLoop, CaptureState, CaptureSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compressor::{compress_segment, gzip, BackgroundCompressor};
pub use config::{CaptureConfig, Config, PortMapping};
pub use consolidator::{
    scan_storage, ConsolidationPlan, ConsolidationReport, Consolidator, PendingSegment,
    StreamBatch,
};
pub use dir::StorageDir;
pub use error::{CoreError, CoreResult};
pub use naming::{
    compressed_path, next_segment_time, segment_file_name, segment_path, upload_key,
    SegmentName, StreamId, LINE_TIME_FORMAT, NAME_TIME_FORMAT,
};
pub use reassembler::{repair_utf8, LineReassembler, RECORD_SEPARATOR};
pub use registry::SegmentRegistry;
pub use segment::ActiveSegment;
pub use shutdown::ShutdownSignal;
#[cfg(feature = "serial")]
pub use transport::{SerialConnector, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT};
pub use transport::{
    is_idle_error, Connector, ScriptStep, ScriptedConnector, ScriptedTransport, Transport,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
