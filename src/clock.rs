//! Wall-clock abstraction shared by the budget guard and cache freshness checks.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of "now" for time-dependent decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// Clock backed by [`SystemTime::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually driven clock for deterministic tests and simulations.
///
/// Every call to [`Clock::now`] advances the clock by `step` after reading,
/// which models a fixed cost per observed operation.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<SystemTime>,
    step: Duration,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: SystemTime) -> Self {
        Self::stepping(start, Duration::ZERO)
    }

    /// Creates a clock that advances by `step` every time it is read.
    #[must_use]
    pub fn stepping(start: SystemTime, step: Duration) -> Self {
        Self {
            current: Mutex::new(start),
            step,
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *current += by;
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, to: SystemTime) {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *current = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let value = *current;
        *current += self.step;
        value
    }
}

/// Seconds since the Unix epoch, saturating at zero for pre-epoch clocks.
#[must_use]
pub fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
