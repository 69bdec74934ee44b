//! Execution-budget guard for batch imports.
//!
//! The guard is cooperative: it is consulted between descriptors and never
//! interrupts an in-flight fetch.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::clock::{Clock, SystemClock};
use crate::config::DEFAULT_SAFETY_MARGIN;

/// Wall-clock ceiling for one batch plus the margin kept in reserve.
#[derive(Debug, Clone)]
pub struct ExecutionBudget {
    ceiling: Option<Duration>,
    margin: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self::unmetered(Arc::new(SystemClock))
    }
}

impl ExecutionBudget {
    /// A budget that never fires.
    #[must_use]
    pub fn unmetered(clock: Arc<dyn Clock>) -> Self {
        Self {
            ceiling: None,
            margin: DEFAULT_SAFETY_MARGIN,
            clock,
        }
    }

    /// A budget of `ceiling`, stopping `margin` early. `None` disables the guard.
    #[must_use]
    pub fn new(ceiling: Option<Duration>, margin: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ceiling,
            margin,
            clock,
        }
    }

    /// Configured ceiling.
    #[must_use]
    pub fn ceiling(&self) -> Option<Duration> {
        self.ceiling
    }

    /// Current time on the budget's clock.
    #[must_use]
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    /// Starts timing a batch now.
    #[must_use]
    pub fn start(&self) -> BudgetTimer {
        self.start_at(self.clock.now())
    }

    /// Times a batch that belongs to a run begun at `started`.
    ///
    /// Every page of a paginated run checks against the same start, so the
    /// ceiling bounds the run as a whole.
    #[must_use]
    pub fn start_at(&self, started: SystemTime) -> BudgetTimer {
        BudgetTimer {
            started,
            ceiling: self.ceiling,
            margin: self.margin,
            clock: Arc::clone(&self.clock),
        }
    }
}

/// Elapsed-time tracker for one batch.
#[derive(Debug)]
pub struct BudgetTimer {
    started: SystemTime,
    ceiling: Option<Duration>,
    margin: Duration,
    clock: Arc<dyn Clock>,
}

impl BudgetTimer {
    /// Time since the batch started; zero if the clock went backwards.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.clock
            .now()
            .duration_since(self.started)
            .unwrap_or(Duration::ZERO)
    }

    /// True once elapsed time is within the safety margin of the ceiling.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        let Some(ceiling) = self.ceiling else {
            return false;
        };
        self.elapsed().saturating_add(self.margin) >= ceiling
    }
}
