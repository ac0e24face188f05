//! Driver configuration
//!
//! Settings can be built in code or loaded from a JSON file; every field is
//! optional in the file and falls back to its default.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{LabError, DEFAULT_BAUD_RATES, DEFAULT_SETTLE_MS, DEFAULT_TIMEOUT_MS};

/// Connection settings for [`Limonata`](crate::protocol::Limonata)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Only consider ports whose name contains this string (empty = any)
    pub port_filter: String,

    /// Echo every line sent and received
    pub debug: bool,

    /// Response timeout in milliseconds
    pub timeout_ms: u64,

    /// Wait after opening the port before probing, in milliseconds
    pub settle_ms: u64,

    /// Baud rates tried in order
    pub baud_rates: Vec<u32>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port_filter: String::new(),
            debug: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            settle_ms: DEFAULT_SETTLE_MS,
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
        }
    }
}

impl DriverConfig {
    /// Default settings restricted to ports matching `filter`
    pub fn with_port(filter: impl Into<String>) -> Self {
        Self {
            port_filter: filter.into(),
            ..Self::default()
        }
    }

    /// Load settings from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LabError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: DriverConfig = serde_json::from_str(&content)
            .map_err(|e| LabError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write settings as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LabError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| LabError::Config(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Reject an empty baud list or a zero baud rate
    pub fn validate(&self) -> Result<(), LabError> {
        if self.baud_rates.is_empty() {
            return Err(LabError::InvalidArgument(
                "at least one baud rate is required".to_string(),
            ));
        }
        if self.baud_rates.contains(&0) {
            return Err(LabError::InvalidArgument(
                "baud rate must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Line read deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Wait after opening the port before the first read
    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}
