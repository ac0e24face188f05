//! # Limonata Core Library
//!
//! Host-side driver for the Limonata temperature/heater lab device.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Discovery of the board among the host's serial ports
//! - The firmware's line-oriented command/response protocol
//! - A lab-time clock that can run faster or slower than real time
//!
//! ## Example
//!
//! ```rust,no_run
//! use limonata_core::prelude::*;
//!
//! # fn main() -> Result<(), LabError> {
//! let mut lab = Limonata::connect(DriverConfig::default())?;
//! lab.set_heater(50.0)?;
//! let ticks = lab.clock().ticks(20.0, 1.0)?;
//! for t in ticks {
//!     let (temperature, heater) = lab.scan()?;
//!     println!("{:>6.2} s  T = {:.2}  Q = {:.1}", t?, temperature, heater);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod protocol;
pub mod setup;

pub use protocol::LabError;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{LabClock, Ticks, TimeSource};
    pub use crate::config::DriverConfig;
    pub use crate::protocol::{
        ConnectionRegistry, ConnectionState, DriverContext, LabError, Limonata,
    };
    pub use crate::setup::{setup, LabMode};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
