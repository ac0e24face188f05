//! Lab time
//!
//! A wall-clock driven timeline whose speed can be scaled. Real hardware runs
//! at rate 1; offline experiments can run faster, slower or paused.
//!
//! [`LabClock`] is a cheap handle: clones share the same timeline.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::protocol::LabError;

/// Source of wall-clock time
pub trait TimeSource: Send + Sync {
    /// Monotonic wall-clock reading since an arbitrary fixed point
    fn now(&self) -> Duration;

    /// Block the calling thread for `duration` of wall-clock time
    fn sleep(&self, duration: Duration);
}

/// [`TimeSource`] backed by [`Instant`] and [`std::thread::sleep`]
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    epoch: Instant,
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug)]
struct ClockState {
    rate: f64,
    /// Wall-clock reading when the clock was last (re)based
    origin: Duration,
    /// Lab seconds banked before `origin`
    accumulated: f64,
    running: bool,
}

impl ClockState {
    fn elapsed(&self, wall: Duration) -> f64 {
        if self.running {
            self.rate * wall.saturating_sub(self.origin).as_secs_f64()
        } else {
            0.0
        }
    }

    /// Fold running time into `accumulated` and move `origin` to `wall`
    fn rebase(&mut self, wall: Duration) {
        self.accumulated += self.elapsed(wall);
        self.origin = wall;
    }
}

/// Scaled lab-time clock
#[derive(Clone)]
pub struct LabClock {
    state: Arc<Mutex<ClockState>>,
    source: Arc<dyn TimeSource>,
}

static GLOBAL_CLOCK: OnceLock<LabClock> = OnceLock::new();

impl Default for LabClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LabClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabClock")
            .field("state", &*self.lock())
            .finish()
    }
}

impl LabClock {
    /// A stopped clock at lab time 0, rate 1, on the system clock
    pub fn new() -> Self {
        Self::with_source(Arc::new(SystemTimeSource::default()))
    }

    /// A stopped clock reading wall time from `source`
    pub fn with_source(source: Arc<dyn TimeSource>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                rate: 1.0,
                origin: Duration::ZERO,
                accumulated: 0.0,
                running: false,
            })),
            source,
        }
    }

    /// The process-wide clock shared by default-constructed drivers
    pub fn global() -> LabClock {
        GLOBAL_CLOCK.get_or_init(LabClock::new).clone()
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        // State is plain data, so a poisoned lock is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the scale factor applied to wall-clock time.
    ///
    /// Rebases while running so that `now()` does not jump.
    pub fn set_rate(&self, rate: f64) -> Result<(), LabError> {
        if !rate.is_finite() || rate < 0.0 {
            return Err(LabError::InvalidArgument(format!(
                "clock rate must be a non-negative number, got {}",
                rate
            )));
        }

        let mut state = self.lock();
        let wall = self.source.now();
        state.rebase(wall);
        state.rate = rate;
        tracing::debug!(rate, lab_time = state.accumulated, "clock rate changed");
        Ok(())
    }

    /// Lab seconds per wall second
    pub fn rate(&self) -> f64 {
        self.lock().rate
    }

    /// Whether `start` was called without a later `stop`
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Start advancing from the banked lab time
    pub fn start(&self) {
        let mut state = self.lock();
        if state.running {
            return;
        }
        state.origin = self.source.now();
        state.running = true;
    }

    /// Bank elapsed lab time and stop advancing
    pub fn stop(&self) {
        let mut state = self.lock();
        if !state.running {
            return;
        }
        let wall = self.source.now();
        state.rebase(wall);
        state.running = false;
    }

    /// Current lab time in seconds
    pub fn now(&self) -> f64 {
        let state = self.lock();
        state.accumulated + state.elapsed(self.source.now())
    }

    /// Make `now()` read `seconds`. The only way to move lab time backwards.
    pub fn set_now(&self, seconds: f64) -> Result<(), LabError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(LabError::InvalidArgument(format!(
                "lab time must be a non-negative number, got {}",
                seconds
            )));
        }

        let mut state = self.lock();
        state.origin = self.source.now();
        state.accumulated = seconds;
        Ok(())
    }

    /// Block for `seconds` of lab time, i.e. `seconds / rate` of wall time.
    ///
    /// A paused clock (rate 0) would never get there, so that is an error.
    pub fn sleep(&self, seconds: f64) -> Result<(), LabError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(LabError::InvalidArgument(format!(
                "sleep duration must be a non-negative number, got {}",
                seconds
            )));
        }
        if seconds == 0.0 {
            return Ok(());
        }

        // The lock is not held while sleeping
        let rate = self.rate();
        if rate == 0.0 {
            return Err(LabError::InvalidOperation(
                "cannot sleep while the lab clock is paused (rate 0)".to_string(),
            ));
        }

        let wall = Duration::try_from_secs_f64(seconds / rate).map_err(|e| {
            LabError::InvalidArgument(format!("sleep of {} s at rate {}: {}", seconds, rate, e))
        })?;
        self.source.sleep(wall);
        Ok(())
    }

    /// Iterate over lab times `0, step, 2*step, ...` up to `period`, paced by this clock
    pub fn ticks(&self, period: f64, step: f64) -> Result<Ticks, LabError> {
        if !step.is_finite() || step <= 0.0 {
            return Err(LabError::InvalidArgument(format!(
                "tick step must be positive, got {}",
                step
            )));
        }
        if !period.is_finite() || period < 0.0 {
            return Err(LabError::InvalidArgument(format!(
                "tick period must be non-negative, got {}",
                period
            )));
        }

        // Slack so that e.g. 0.3 / 0.1 = 2.9999999999999996 still counts 3 steps
        let last = (period / step + 1e-9).floor() as u64;

        Ok(Ticks {
            clock: self.clone(),
            last,
            step,
            tolerance: f64::INFINITY,
            start: None,
            index: 0,
            done: false,
        })
    }
}

/// Fixed-step schedule on a [`LabClock`]. Created by [`LabClock::ticks`].
///
/// Each item is the lab time since the first tick, rounded to 10 ms. The
/// iterator sleeps on the lab clock until the next tick is due.
#[derive(Debug)]
pub struct Ticks {
    clock: LabClock,
    /// Index of the final tick; tick `i` is due at `i * step`
    last: u64,
    step: f64,
    tolerance: f64,
    start: Option<f64>,
    index: u64,
    done: bool,
}

impl Ticks {
    /// Fail with [`LabError::ClockOverrun`] when a tick is more than `tolerance` seconds late
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

fn round_centis(seconds: f64) -> f64 {
    (seconds * 100.0).round() / 100.0
}

impl Iterator for Ticks {
    type Item = Result<f64, LabError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let start = match self.start {
            Some(start) => start,
            None => {
                let start = self.clock.now();
                self.start = Some(start);
                self.index = 1;
                return Some(Ok(0.0));
            }
        };

        if self.index > self.last {
            self.done = true;
            return None;
        }
        let target = self.index as f64 * self.step;

        let remaining = target - (self.clock.now() - start);
        if remaining > 0.0 {
            if let Err(e) = self.clock.sleep(remaining) {
                self.done = true;
                return Some(Err(e));
            }
        }

        let elapsed = self.clock.now() - start;
        let lag = elapsed - target;
        if lag > self.tolerance {
            self.done = true;
            return Some(Err(LabError::ClockOverrun { lag }));
        }

        self.index += 1;
        Some(Ok(round_centis(elapsed)))
    }
}
