//! Transport layer abstraction for capture loops.

use crate::shutdown::ShutdownSignal;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::thread;
use std::time::Duration;

/// A byte source read by one capture loop.
///
/// This trait abstracts the physical port, allowing serial devices, sockets
/// or scripted sources for testing.
///
/// Reads must be bounded by a short timeout. A timeout is reported either as
/// `Ok(0)` or as an error whose kind satisfies [`is_idle_error`]; anything
/// else is treated as a permanent failure of the stream.
pub trait Transport: Send {
    /// Reads available bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Releases the underlying device.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens transports by identifier (for example a device path).
pub trait Connector: Send + Sync {
    /// Opens the transport named `identifier`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is absent or cannot be configured.
    fn open(&self, identifier: &str) -> io::Result<Box<dyn Transport>>;
}

/// Returns true if a read error only means "no data this tick".
#[must_use]
pub fn is_idle_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// One step of a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return these bytes from the next read.
    Data(Vec<u8>),
    /// Sleep, then report a read timeout.
    Idle(Duration),
    /// Fail the next read with this error kind.
    Fail(io::ErrorKind),
}

/// A transport that replays a fixed script, for testing.
///
/// Once the script is exhausted every read reports a timeout, and the
/// attached [`ShutdownSignal`] (if any) is raised so the capture loop ends.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    steps: VecDeque<ScriptStep>,
    on_exhausted: Option<ShutdownSignal>,
    closed: bool,
}

impl ScriptedTransport {
    /// Creates a transport replaying `steps`.
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            on_exhausted: None,
            closed: false,
        }
    }

    /// Creates a transport returning each chunk from one read.
    pub fn from_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self::new(chunks.into_iter().map(|c| ScriptStep::Data(c.into())))
    }

    /// Raises `signal` once the script is exhausted.
    #[must_use]
    pub fn shutdown_when_done(mut self, signal: ShutdownSignal) -> Self {
        self.on_exhausted = Some(signal);
        self
    }

    /// Returns true once `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            Some(ScriptStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.steps.push_front(ScriptStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
            Some(ScriptStep::Idle(pause)) => {
                thread::sleep(pause);
                Err(io::Error::new(io::ErrorKind::TimedOut, "scripted timeout"))
            }
            Some(ScriptStep::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
            None => {
                if let Some(signal) = &self.on_exhausted {
                    signal.request();
                }
                Err(io::Error::new(io::ErrorKind::TimedOut, "script exhausted"))
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// A connector handing out pre-built [`ScriptedTransport`]s, for testing.
///
/// Each identifier can be opened once; unknown identifiers fail with
/// `NotFound` like an absent device.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    transports: Mutex<HashMap<String, ScriptedTransport>>,
}

impl ScriptedConnector {
    /// Creates a connector with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transport` under `identifier`.
    pub fn insert(&self, identifier: impl Into<String>, transport: ScriptedTransport) {
        self.transports.lock().insert(identifier.into(), transport);
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, identifier: &str) -> io::Result<Box<dyn Transport>> {
        self.transports
            .lock()
            .remove(identifier)
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such device: {identifier}"),
                )
            })
    }
}

#[cfg(feature = "serial")]
pub use serial::{SerialConnector, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT};

#[cfg(feature = "serial")]
mod serial {
    use super::{Connector, Transport};
    use std::io::{self, Read};
    use std::time::Duration;

    /// Default line speed.
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;

    /// Default read timeout.
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

    /// Opens serial ports with the `serialport` crate.
    #[derive(Debug, Clone)]
    pub struct SerialConnector {
        baud_rate: u32,
        read_timeout: Duration,
    }

    impl SerialConnector {
        /// Creates a connector for the given line speed and read timeout.
        #[must_use]
        pub fn new(baud_rate: u32, read_timeout: Duration) -> Self {
            Self {
                baud_rate,
                read_timeout,
            }
        }
    }

    impl Default for SerialConnector {
        fn default() -> Self {
            Self::new(DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT)
        }
    }

    struct SerialTransport {
        port: Box<dyn serialport::SerialPort>,
    }

    impl Transport for SerialTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.port.read(buf)
        }
    }

    impl Connector for SerialConnector {
        fn open(&self, identifier: &str) -> io::Result<Box<dyn Transport>> {
            let port = serialport::new(identifier, self.baud_rate)
                .timeout(self.read_timeout)
                .open()
                .map_err(io::Error::from)?;
            Ok(Box::new(SerialTransport { port }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_reads_follow_script() {
        let mut transport = ScriptedTransport::new([
            ScriptStep::Data(b"abc".to_vec()),
            ScriptStep::Idle(Duration::ZERO),
            ScriptStep::Fail(io::ErrorKind::BrokenPipe),
        ]);
        let mut buf = [0u8; 8];

        assert_eq!(transport.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        let err = transport.read(&mut buf).unwrap_err();
        assert!(is_idle_error(&err));

        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!is_idle_error(&err));
    }

    #[test]
    fn oversized_chunk_is_split_across_reads() {
        let mut transport = ScriptedTransport::from_chunks([b"abcdef".to_vec()]);
        let mut buf = [0u8; 4];

        assert_eq!(transport.read(&mut buf).unwrap(), 4);
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn exhausted_script_raises_shutdown() {
        let signal = ShutdownSignal::new();
        let mut transport = ScriptedTransport::new([]).shutdown_when_done(signal.clone());

        let err = transport.read(&mut [0u8; 4]).unwrap_err();
        assert!(is_idle_error(&err));
        assert!(signal.is_requested());
    }

    #[test]
    fn connector_opens_each_device_once() {
        let connector = ScriptedConnector::new();
        connector.insert("/dev/ttyA", ScriptedTransport::new([]));

        assert!(connector.open("/dev/ttyA").is_ok());
        let err = connector.open("/dev/ttyA").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
