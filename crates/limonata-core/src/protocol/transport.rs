//! Serial transport
//!
//! The driver only sees the [`Transport`] and [`Connector`] traits. The
//! `serialport`-backed implementation lives here as well.

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use super::LabError;

/// A line-oriented byte connection to the device
pub trait Transport: Send {
    /// Write all bytes
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LabError>;

    /// Push buffered output onto the wire
    fn flush(&mut self) -> Result<(), LabError>;

    /// Block until one `\n`-terminated line arrives. The terminator is included.
    ///
    /// Fails with [`LabError::Timeout`] when nothing complete arrives in time.
    fn read_line(&mut self) -> Result<Vec<u8>, LabError>;

    /// Release the underlying port
    fn close(&mut self) -> Result<(), LabError>;

    /// Whether the port is still held
    fn is_open(&self) -> bool;
}

/// Opens transports. One call per connection attempt.
pub trait Connector: Send {
    /// Open `port` at `baud_rate`; `timeout` bounds each line read
    fn open(
        &mut self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, LabError>;
}

/// Opens [`SerialTransport`]s through the `serialport` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(
        &mut self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, LabError> {
        Ok(Box::new(SerialTransport::open(port, baud_rate, timeout)?))
    }
}

/// Short per-read timeout; the line deadline is enforced separately
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Splits a byte stream into `\n`-terminated lines
#[derive(Debug, Default)]
pub struct LineReader {
    timeout: Duration,
    /// Bytes received past the end of the last returned line
    pending: Vec<u8>,
}

impl LineReader {
    /// Empty buffer; each `read_line` waits at most `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Vec::new(),
        }
    }

    /// Split off the first complete line already buffered, if any
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let rest = self.pending.split_off(end + 1);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Read from `source` until a full line is buffered or the timeout passes.
    ///
    /// Read timeouts from `source` are polled through; other I/O errors end the read.
    pub fn read_line<R: Read + ?Sized>(&mut self, source: &mut R) -> Result<Vec<u8>, LabError> {
        if let Some(line) = self.take_line() {
            return Ok(line);
        }

        let deadline = Instant::now() + self.timeout;
        let mut buffer = [0u8; 64];

        loop {
            match source.read(&mut buffer) {
                Ok(0) => {}
                Ok(n) => {
                    self.pending.extend_from_slice(&buffer[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(line);
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(LabError::Transport(e.to_string())),
            }

            if Instant::now() >= deadline {
                tracing::debug!(
                    partial = %String::from_utf8_lossy(&self.pending),
                    "read_line: timed out"
                );
                return Err(LabError::Timeout);
            }
        }
    }

    /// Drop anything buffered
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Serial port transport with a line-read deadline
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    lines: LineReader,
}

impl SerialTransport {
    /// Open `name` as 8 data bits, no parity, 1 stop bit, no flow control.
    ///
    /// DTR is raised afterwards; boards that ignore it still work.
    pub fn open(name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, LabError> {
        let mut port = serialport::new(name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|e| LabError::Transport(format!("{} at {} baud: {}", name, baud_rate, e)))?;

        if let Err(e) = port.write_data_terminal_ready(true) {
            tracing::debug!(port = name, "DTR not raised: {}", e);
        }

        Ok(Self {
            port: Some(port),
            lines: LineReader::new(timeout),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, LabError> {
        self.port.as_mut().ok_or(LabError::NotConnected)
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LabError> {
        self.port_mut()?
            .write_all(bytes)
            .map_err(|e| LabError::Transport(e.to_string()))
    }

    fn flush(&mut self) -> Result<(), LabError> {
        self.port_mut()?
            .flush()
            .map_err(|e| LabError::Transport(e.to_string()))
    }

    fn read_line(&mut self) -> Result<Vec<u8>, LabError> {
        let port = self.port.as_mut().ok_or(LabError::NotConnected)?;
        self.lines.read_line(port)
    }

    fn close(&mut self) -> Result<(), LabError> {
        // Dropping the handle closes the OS port
        self.port = None;
        self.lines.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
