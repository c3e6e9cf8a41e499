//! Per-port capture loop.
//!
//! ```text
//! Opening -> Active -> Rotating -> Active -> ... -> Closing -> Terminated
//! ```
//!
//! A loop owns exactly one writable segment at a time. Rotation closes the
//! current segment, hands it to the background compressor and opens the
//! next one; the closed path stays registered until compression is done.

use crate::clock::{Clock, SystemClock};
use crate::compressor::BackgroundCompressor;
use crate::config::CaptureConfig;
use crate::error::{CoreError, CoreResult};
use crate::naming::StreamId;
use crate::reassembler::LineReassembler;
use crate::registry::SegmentRegistry;
use crate::segment::ActiveSegment;
use crate::shutdown::ShutdownSignal;
use crate::transport::{is_idle_error, Connector, Transport};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Lifecycle state of a capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Acquiring the transport.
    Opening,
    /// Reading and appending lines.
    Active,
    /// Closing the current segment and opening the next.
    Rotating,
    /// Flushing and closing the final segment.
    Closing,
    /// The loop has returned.
    Terminated,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Closing => "closing",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Counters reported when a capture loop ends cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    /// Raw bytes read from the transport.
    pub bytes_read: u64,
    /// Timestamped records appended to segments.
    pub lines_written: u64,
    /// Segments created, including the first.
    pub segments_opened: u64,
    /// Rotations performed.
    pub rotations: u64,
}

/// Captures one transport into rotating segment files.
pub struct CaptureLoop {
    stream: StreamId,
    identifier: String,
    config: CaptureConfig,
    compressor: BackgroundCompressor,
    registry: SegmentRegistry,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownSignal,
    state: CaptureState,
    compression_jobs: Vec<JoinHandle<()>>,
}

impl fmt::Debug for CaptureLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureLoop")
            .field("stream", &self.stream)
            .field("identifier", &self.identifier)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CaptureLoop {
    /// Creates a loop capturing `identifier` into segments of `stream`.
    pub fn new(
        stream: StreamId,
        identifier: impl Into<String>,
        config: CaptureConfig,
        registry: SegmentRegistry,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            stream,
            identifier: identifier.into(),
            config,
            compressor: BackgroundCompressor::new(registry.clone()),
            registry,
            clock: Arc::new(SystemClock),
            shutdown,
            state: CaptureState::Opening,
            compression_jobs: Vec::new(),
        }
    }

    /// Replaces the clock used for stamps, names and timers.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the stream this loop captures.
    #[must_use]
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Opens the transport and captures until shutdown or a fatal error.
    ///
    /// On return the final segment has been closed and compressed, and
    /// every compression job started by a rotation has finished.
    ///
    /// # Errors
    ///
    /// - [`CoreError::TransportOpen`] if the transport cannot be opened
    /// - [`CoreError::TransportRead`] on a non-timeout read error
    /// - [`CoreError::Io`] if a segment file cannot be created
    pub fn run(&mut self, connector: &dyn Connector) -> CoreResult<CaptureSummary> {
        self.set_state(CaptureState::Opening);

        let mut transport = match connector.open(&self.identifier) {
            Ok(transport) => transport,
            Err(err) => {
                tracing::error!(stream = %self.stream, device = %self.identifier, error = %err, "cannot open transport");
                self.set_state(CaptureState::Terminated);
                return Err(CoreError::transport_open(
                    self.stream.as_str(),
                    self.identifier.as_str(),
                    err,
                ));
            }
        };
        tracing::info!(stream = %self.stream, device = %self.identifier, "capture started");

        let result = self.capture(transport.as_mut());

        if let Err(err) = transport.close() {
            tracing::warn!(stream = %self.stream, error = %err, "could not close transport");
        }
        self.wait_for_compression();
        self.set_state(CaptureState::Terminated);

        match &result {
            Ok(summary) => tracing::info!(
                stream = %self.stream,
                bytes = summary.bytes_read,
                lines = summary.lines_written,
                rotations = summary.rotations,
                "capture stopped"
            ),
            Err(err) => tracing::error!(stream = %self.stream, error = %err, "capture failed"),
        }
        result
    }

    fn capture(&mut self, transport: &mut dyn Transport) -> CoreResult<CaptureSummary> {
        let mut summary = CaptureSummary::default();
        let mut reassembler = LineReassembler::new();
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];

        let mut segment = self.open_segment(None, &mut summary)?;
        self.set_state(CaptureState::Active);

        let mut last_sync = self.clock.monotonic();
        let mut last_data = last_sync;

        loop {
            if self.shutdown.is_requested() {
                self.close_final(segment, &mut reassembler, &mut summary);
                return Ok(summary);
            }

            match transport.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    summary.bytes_read += n as u64;
                    last_data = self.clock.monotonic();
                    for record in reassembler.feed(&buf[..n], self.clock.now()) {
                        self.append(&mut segment, &record, &mut summary);
                    }
                }
                Err(err) if is_idle_error(&err) => {}
                Err(err) => {
                    self.close_final(segment, &mut reassembler, &mut summary);
                    return Err(CoreError::transport_read(self.stream.as_str(), err));
                }
            }

            let now = self.clock.monotonic();

            if now.saturating_sub(last_sync) >= self.config.sync_interval {
                last_sync = now;
                self.sync(&mut segment);
                if segment.bytes_written() > self.config.max_segment_size {
                    tracing::debug!(stream = %self.stream, bytes = segment.bytes_written(), "segment reached size limit");
                    segment = self.rotate(segment, &mut summary)?;
                }
            }

            if now.saturating_sub(last_data) >= self.config.quiescence {
                last_data = now;
                self.sync(&mut segment);
                if segment.bytes_written() > 0 {
                    tracing::debug!(stream = %self.stream, "stream quiescent");
                    segment = self.rotate(segment, &mut summary)?;
                }
            }
        }
    }

    fn open_segment(
        &self,
        previous: Option<DateTime<Utc>>,
        summary: &mut CaptureSummary,
    ) -> CoreResult<ActiveSegment> {
        let segment = ActiveSegment::create(
            &self.config.storage_dir,
            &self.stream,
            previous,
            self.clock.now(),
            &self.registry,
        )?;
        summary.segments_opened += 1;
        Ok(segment)
    }

    fn append(&self, segment: &mut ActiveSegment, record: &str, summary: &mut CaptureSummary) {
        match segment.append(record) {
            Ok(()) => summary.lines_written += 1,
            Err(err) => {
                tracing::warn!(stream = %self.stream, path = %segment.path().display(), error = %err, "write failed");
            }
        }
    }

    fn sync(&self, segment: &mut ActiveSegment) {
        if let Err(err) = segment.flush_and_sync() {
            tracing::warn!(stream = %self.stream, path = %segment.path().display(), error = %err, "could not sync segment");
        }
    }

    fn rotate(
        &mut self,
        segment: ActiveSegment,
        summary: &mut CaptureSummary,
    ) -> CoreResult<ActiveSegment> {
        self.set_state(CaptureState::Rotating);

        let previous = segment.created_at();
        let closed = segment.close();
        tracing::info!(stream = %self.stream, path = %closed.display(), "rotated segment");

        self.compression_jobs.retain(|job| !job.is_finished());
        if let Some(job) = self.compressor.spawn(&self.stream, closed) {
            self.compression_jobs.push(job);
        }

        let next = self.open_segment(Some(previous), summary)?;
        summary.rotations += 1;
        self.set_state(CaptureState::Active);
        Ok(next)
    }

    fn close_final(
        &mut self,
        mut segment: ActiveSegment,
        reassembler: &mut LineReassembler,
        summary: &mut CaptureSummary,
    ) {
        self.set_state(CaptureState::Closing);

        if let Some(record) = reassembler.finish(self.clock.now()) {
            self.append(&mut segment, &record, summary);
        }
        let closed = segment.close();
        self.compressor.run_inline(&self.stream, &closed);
    }

    fn wait_for_compression(&mut self) {
        for job in self.compression_jobs.drain(..) {
            if job.join().is_err() {
                tracing::warn!(stream = %self.stream, "compression thread panicked");
            }
        }
    }

    fn set_state(&mut self, state: CaptureState) {
        if self.state != state {
            tracing::trace!(stream = %self.stream, from = %self.state, to = %state, "capture state");
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::{ScriptStep, ScriptedConnector, ScriptedTransport};
    use chrono::TimeZone;
    use flate2::read::MultiGzDecoder;
    use std::collections::VecDeque;
    use std::fs;
    use std::io::{self, Read};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    const DEVICE: &str = "/dev/test";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn config(dir: &Path) -> CaptureConfig {
        CaptureConfig {
            storage_dir: dir.to_path_buf(),
            max_segment_size: 1_000_000,
            sync_interval: Duration::ZERO,
            quiescence: Duration::from_secs(600),
            read_buffer_size: 64,
        }
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn gunzip_file(path: &Path) -> String {
        let mut out = String::new();
        MultiGzDecoder::new(fs::File::open(path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    fn capture_loop(
        dir: &Path,
        registry: &SegmentRegistry,
        shutdown: &ShutdownSignal,
    ) -> CaptureLoop {
        CaptureLoop::new(
            StreamId::new("0").unwrap(),
            DEVICE,
            config(dir),
            registry.clone(),
            shutdown.clone(),
        )
        .with_clock(Arc::new(ManualClock::new(t0())))
    }

    #[test]
    fn open_failure_terminates() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let shutdown = ShutdownSignal::new();
        let mut capture = capture_loop(dir.path(), &registry, &shutdown);

        let result = capture.run(&ScriptedConnector::new());

        assert!(matches!(result, Err(CoreError::TransportOpen { .. })));
        assert_eq!(capture.state(), CaptureState::Terminated);
        assert!(file_names(dir.path()).is_empty());
    }

    #[test]
    fn lines_are_captured_until_shutdown() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let shutdown = ShutdownSignal::new();
        let connector = ScriptedConnector::new();
        connector.insert(
            DEVICE,
            ScriptedTransport::from_chunks(["hel", "lo\nwor", "ld\n\n", "tail"])
                .shutdown_when_done(shutdown.clone()),
        );

        let mut capture = capture_loop(dir.path(), &registry, &shutdown);
        let summary = capture.run(&connector).unwrap();

        assert_eq!(summary.bytes_read, 17);
        assert_eq!(summary.lines_written, 3);
        assert_eq!(summary.segments_opened, 1);
        assert_eq!(summary.rotations, 0);
        assert_eq!(capture.state(), CaptureState::Terminated);
        assert!(registry.is_empty());

        assert_eq!(file_names(dir.path()), vec!["0_2024-05-01_12-00-00.gz"]);
        assert_eq!(
            gunzip_file(&dir.path().join("0_2024-05-01_12-00-00.gz")),
            "2024-05-01 12:00:00: hello\n\
             2024-05-01 12:00:00: world\n\
             2024-05-01 12:00:00: tail\n"
        );
    }

    #[test]
    fn size_limit_rotates_without_losing_lines() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let shutdown = ShutdownSignal::new();
        let connector = ScriptedConnector::new();
        connector.insert(
            DEVICE,
            ScriptedTransport::from_chunks(["one\n", "two\n", "three\n"])
                .shutdown_when_done(shutdown.clone()),
        );

        // Each record is 25 or 27 bytes; the second one crosses the limit.
        let mut capture = CaptureLoop::new(
            StreamId::new("0").unwrap(),
            DEVICE,
            CaptureConfig {
                max_segment_size: 30,
                ..config(dir.path())
            },
            registry.clone(),
            shutdown.clone(),
        )
        .with_clock(Arc::new(ManualClock::new(t0())));

        let summary = capture.run(&connector).unwrap();
        assert_eq!(summary.rotations, 1);
        assert_eq!(summary.segments_opened, 2);
        assert!(registry.is_empty());

        let names = file_names(dir.path());
        assert_eq!(
            names,
            vec!["0_2024-05-01_12-00-00.gz", "0_2024-05-01_12-00-01.gz"]
        );

        let joined: String = names
            .iter()
            .map(|name| gunzip_file(&dir.path().join(name)))
            .collect();
        assert_eq!(
            joined,
            "2024-05-01 12:00:00: one\n\
             2024-05-01 12:00:00: two\n\
             2024-05-01 12:00:00: three\n"
        );
    }

    /// Replays data and idle periods against a manual clock.
    struct ClockedTransport {
        steps: VecDeque<Option<&'static [u8]>>,
        idle: chrono::Duration,
        clock: Arc<ManualClock>,
        shutdown: ShutdownSignal,
    }

    impl Transport for ClockedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                Some(Some(data)) => {
                    buf[..data.len()].copy_from_slice(data);
                    Ok(data.len())
                }
                Some(None) => {
                    self.clock.advance(self.idle);
                    Ok(0)
                }
                None => {
                    self.shutdown.request();
                    Ok(0)
                }
            }
        }
    }

    struct ClockedConnector<T>(parking_lot::Mutex<Option<T>>);

    impl<T: Transport + 'static> Connector for ClockedConnector<T> {
        fn open(&self, _identifier: &str) -> io::Result<Box<dyn Transport>> {
            self.0
                .lock()
                .take()
                .map(|t| Box::new(t) as Box<dyn Transport>)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    #[test]
    fn quiescence_rotates_non_empty_segment_once() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let shutdown = ShutdownSignal::new();
        let clock = Arc::new(ManualClock::new(t0()));

        let transport = ClockedTransport {
            steps: VecDeque::from([Some(&b"ping\n"[..]), None, None, None]),
            idle: chrono::Duration::minutes(6),
            clock: Arc::clone(&clock),
            shutdown: shutdown.clone(),
        };
        let connector = ClockedConnector(parking_lot::Mutex::new(Some(transport)));

        let mut capture = CaptureLoop::new(
            StreamId::new("0").unwrap(),
            DEVICE,
            CaptureConfig {
                sync_interval: Duration::from_secs(15),
                ..config(dir.path())
            },
            registry.clone(),
            shutdown,
        )
        .with_clock(clock);

        let summary = capture.run(&connector).unwrap();

        // 12 minutes of silence rotate the segment holding "ping"; the
        // following empty segment is never rotated and is discarded on close.
        assert_eq!(summary.rotations, 1);
        assert_eq!(summary.segments_opened, 2);
        assert_eq!(file_names(dir.path()), vec!["0_2024-05-01_12-00-00.gz"]);
        assert_eq!(
            gunzip_file(&dir.path().join("0_2024-05-01_12-00-00.gz")),
            "2024-05-01 12:00:00: ping\n"
        );
    }

    /// Writes one line, steps the wall clock back an hour, then idles in
    /// 20 second ticks and records the on-disk size of the segment.
    struct SteppedBackTransport {
        reads: usize,
        clock: Arc<ManualClock>,
        shutdown: ShutdownSignal,
        segment: std::path::PathBuf,
        on_disk: Arc<parking_lot::Mutex<Option<u64>>>,
    }

    impl Transport for SteppedBackTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.reads {
                1 => {
                    buf[..2].copy_from_slice(b"a\n");
                    Ok(2)
                }
                2 => {
                    self.clock.set(t0() - chrono::Duration::hours(1));
                    Ok(0)
                }
                3..=12 => {
                    self.clock.advance(chrono::Duration::seconds(20));
                    Ok(0)
                }
                _ => {
                    *self.on_disk.lock() = Some(fs::metadata(&self.segment)?.len());
                    self.shutdown.request();
                    Ok(0)
                }
            }
        }
    }

    #[test]
    fn wall_clock_step_back_does_not_stall_sync() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let shutdown = ShutdownSignal::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let on_disk = Arc::new(parking_lot::Mutex::new(None));

        let transport = SteppedBackTransport {
            reads: 0,
            clock: Arc::clone(&clock),
            shutdown: shutdown.clone(),
            segment: dir.path().join("0_2024-05-01_12-00-00"),
            on_disk: Arc::clone(&on_disk),
        };
        let connector = ClockedConnector(parking_lot::Mutex::new(Some(transport)));

        let mut capture = CaptureLoop::new(
            StreamId::new("0").unwrap(),
            DEVICE,
            CaptureConfig {
                sync_interval: Duration::from_secs(15),
                ..config(dir.path())
            },
            registry.clone(),
            shutdown,
        )
        .with_clock(clock);

        let summary = capture.run(&connector).unwrap();

        assert_eq!(summary.rotations, 0);
        assert_eq!(*on_disk.lock(), Some("2024-05-01 12:00:00: a\n".len() as u64));
    }

    #[test]
    fn fatal_read_error_keeps_captured_data() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let shutdown = ShutdownSignal::new();
        let connector = ScriptedConnector::new();
        connector.insert(
            DEVICE,
            ScriptedTransport::new([
                ScriptStep::Data(b"x\ny".to_vec()),
                ScriptStep::Idle(std::time::Duration::ZERO),
                ScriptStep::Fail(io::ErrorKind::BrokenPipe),
            ]),
        );

        let mut capture = capture_loop(dir.path(), &registry, &shutdown);
        let err = capture.run(&connector).unwrap_err();

        assert!(matches!(err, CoreError::TransportRead { .. }));
        assert!(err.is_fatal_for_stream());
        assert!(registry.is_empty());
        assert_eq!(
            gunzip_file(&dir.path().join("0_2024-05-01_12-00-00.gz")),
            "2024-05-01 12:00:00: x\n2024-05-01 12:00:00: y\n"
        );
    }

    #[test]
    fn active_segment_is_registered_while_capturing() {
        let dir = tempdir().unwrap();
        let registry = SegmentRegistry::new();
        let shutdown = ShutdownSignal::new();

        struct Probe {
            registry: SegmentRegistry,
            shutdown: ShutdownSignal,
            seen: Arc<parking_lot::Mutex<usize>>,
        }
        impl Transport for Probe {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                *self.seen.lock() = self.registry.len();
                self.shutdown.request();
                Ok(0)
            }
        }
        struct ProbeConnector(parking_lot::Mutex<Option<Probe>>);
        impl Connector for ProbeConnector {
            fn open(&self, _identifier: &str) -> io::Result<Box<dyn Transport>> {
                self.0
                    .lock()
                    .take()
                    .map(|t| Box::new(t) as Box<dyn Transport>)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
            }
        }

        let seen = Arc::new(parking_lot::Mutex::new(0));
        let connector = ProbeConnector(parking_lot::Mutex::new(Some(Probe {
            registry: registry.clone(),
            shutdown: shutdown.clone(),
            seen: Arc::clone(&seen),
        })));

        let mut capture = capture_loop(dir.path(), &registry, &shutdown);
        capture.run(&connector).unwrap();

        assert_eq!(*seen.lock(), 1);
        assert!(registry.is_empty());
        // Nothing was captured, so the empty segment was discarded.
        assert!(file_names(dir.path()).is_empty());
    }
}
