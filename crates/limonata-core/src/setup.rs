//! Mode selection
//!
//! Picks between the physical device and the simulated model, and sets the
//! lab clock's speed to match.

use serde::{Deserialize, Serialize};

use crate::clock::LabClock;
use crate::protocol::LabError;

/// Which lab an experiment runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabMode {
    /// The physical device, driven by [`Limonata`](crate::protocol::Limonata)
    Hardware,
    /// The simulated model
    Simulated,
}

/// Choose the lab and set `clock` to run at `speedup`.
///
/// Real hardware only runs in real time. The simulated model accepts any
/// non-negative speedup, including 0 (paused).
pub fn setup(connected: bool, speedup: f64, clock: &LabClock) -> Result<LabMode, LabError> {
    let mode = if connected {
        if speedup != 1.0 {
            return Err(LabError::InvalidArgument(
                "The real lab must run in real time".to_string(),
            ));
        }
        LabMode::Hardware
    } else {
        if speedup < 0.0 || speedup.is_nan() {
            return Err(LabError::InvalidArgument(
                "Speedup must be positive.".to_string(),
            ));
        }
        tracing::info!("LimonataModel");
        LabMode::Simulated
    };

    clock.set_rate(speedup)?;
    Ok(mode)
}
