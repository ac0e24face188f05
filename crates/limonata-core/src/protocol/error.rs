//! Driver errors

use thiserror::Error;

/// Errors that can occur while talking to the lab device or driving the lab clock
#[derive(Error, Debug)]
pub enum LabError {
    /// No port matched the filter, or it had no known board
    #[error("No Limonata device found: {0}")]
    DeviceNotFound(String),

    /// Another driver holds the connection slot
    #[error("You already have an open connection")]
    AlreadyConnected,

    /// Every baud rate was tried and none answered
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// No complete line arrived before the read deadline
    #[error("Timed out waiting for a response")]
    Timeout,

    /// The serial port refused an open, read or write
    #[error("Serial port error: {0}")]
    Transport(String),

    /// The device answered with something we could not parse
    #[error("Unexpected response: {0}")]
    Protocol(String),

    /// A caller passed a value outside its domain
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The call makes no sense in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A tick fired later than its tolerance allows
    #[error("Clock fell behind schedule by {lag:.3} s")]
    ClockOverrun {
        /// Seconds of lab time behind the scheduled tick
        lag: f64,
    },

    /// The driver is closed or was never connected
    #[error("Not connected to device")]
    NotConnected,

    /// A config file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
