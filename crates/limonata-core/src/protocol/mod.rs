//! Serial Protocol Communication
//!
//! Implements the Limonata firmware's line-oriented text protocol: one ASCII
//! command per CRLF-terminated line, answered by exactly one response line.

pub mod commands;
mod connection;
pub mod discovery;
mod error;
pub mod registry;
pub mod transport;

pub use commands::{build_command, clip, Command};
pub use connection::{ConnectionState, DriverContext, Limonata};
pub use discovery::{DeviceMatch, Discovery, UsbDiscovery};
pub use error::LabError;
pub use registry::ConnectionRegistry;
pub use transport::{Connector, LineReader, SerialConnector, SerialTransport, Transport};

/// Baud rates tried in order when connecting
pub const DEFAULT_BAUD_RATES: [u32; 2] = [115200, 9600];

/// Default timeout for responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Time the Arduino bootloader needs after the port is opened, in milliseconds
pub const DEFAULT_SETTLE_MS: u64 = 2000;

/// Line terminator appended to every command
pub const LINE_TERMINATOR: &str = "\r\n";

/// Separator between a command name and its value
pub const SEPARATOR: char = ' ';

/// Upper limit for the heater command (percent)
pub const HEATER_MAX: f64 = 100.0;

/// Upper limit for the heater gain command
pub const GAIN_MAX: f64 = 255.0;

/// Gain the firmware starts with
pub const DEFAULT_GAIN: f64 = 200.0;
