//! Protocol commands
//!
//! Defines the commands understood by the Limonata firmware and how they are
//! rendered onto the wire.

use serde::{Deserialize, Serialize};

use super::{GAIN_MAX, HEATER_MAX, SEPARATOR};

/// Limit `value` to `[lower, upper]`.
///
/// Out-of-range input saturates instead of failing. NaN maps to `lower`, which
/// for every firmware command means "heater off".
pub fn clip(value: f64, lower: f64, upper: f64) -> f64 {
    if value.is_nan() {
        return lower;
    }
    // `+ 0.0` turns -0.0 into 0.0 so it never renders as "-0"
    value.max(lower).min(upper) + 0.0
}

/// Render `"<name> <value>"` with `value` clipped to `[lower, upper]`
pub fn build_command(name: &str, value: f64, lower: f64, upper: f64) -> String {
    format!("{}{}{}", name, SEPARATOR, clip(value, lower, upper))
}

/// Commands for the Limonata firmware
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Read the temperature ('F')
    Temperature,

    /// Set heater power in percent, echoes the applied value ('Q')
    SetHeater(f64),

    /// Read the applied heater power without changing it ('R')
    ReadHeater,

    /// Set the heater gain, echoes the applied value ('P')
    SetGain(f64),

    /// Firmware version string ('VER')
    Version,

    /// End the session ('X')
    Disconnect,
}

impl Command {
    /// Command name as sent on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Command::Temperature => "F",
            Command::SetHeater(_) => "Q",
            Command::ReadHeater => "R",
            Command::SetGain(_) => "P",
            Command::Version => "VER",
            Command::Disconnect => "X",
        }
    }

    /// Render the command line, without terminator
    pub fn render(&self) -> String {
        match *self {
            Command::SetHeater(value) => build_command(self.name(), value, 0.0, HEATER_MAX),
            Command::SetGain(value) => build_command(self.name(), value, 0.0, GAIN_MAX),
            _ => self.name().to_string(),
        }
    }

    /// Whether the firmware answers with a decimal number
    pub fn expects_number(&self) -> bool {
        !matches!(self, Command::Version | Command::Disconnect)
    }
}
