//! Wall clock abstraction
//!
//! Slot computations and task deadlines use absolute time, so every
//! component takes its notion of "now" from a [`Clock`].

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> SystemTime;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<SystemTime>,
}

impl MockClock {
    /// Clock frozen at `now`
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Set the current time
    pub fn set(&self, now: SystemTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Advance the current time
    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += d;
    }
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `a - b`, saturating at zero
pub fn saturating_elapsed(a: SystemTime, b: SystemTime) -> Duration {
    a.duration_since(b).unwrap_or(Duration::ZERO)
}
