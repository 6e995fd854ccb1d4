//! Monotonic-enough wall-clock abstraction used to timestamp every pipeline
//! event (§4.C).
//!
//! Clocks are shared, never owned: every component that needs to timestamp
//! an event holds an `Arc<dyn Clock>` handed to it at construction.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Capability for producing timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp.
    fn now(&self) -> DateTime<Utc>;
}

/// A [`Clock`] backed by the system wall clock.
#[derive(Debug, Default)]
pub struct WallClock;

impl WallClock {
    pub fn new() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

impl Clock for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A [`Clock`] that advances by exactly one tick (one second) every time
/// [`Clock::now`] is called, for deterministic tests that need to assert
/// strict event ordering without depending on wall-clock timing.
#[derive(Debug)]
pub struct IncrementingClock {
    epoch: DateTime<Utc>,
    ticks: AtomicI64,
}

impl IncrementingClock {
    pub fn new(epoch: DateTime<Utc>) -> Arc<dyn Clock> {
        Arc::new(Self {
            epoch,
            ticks: AtomicI64::new(0),
        })
    }
}

impl Clock for IncrementingClock {
    fn now(&self) -> DateTime<Utc> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        self.epoch + chrono::Duration::seconds(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incrementing_clock_advances_monotonically() {
        let clock = IncrementingClock::new(Utc::now());
        let a = clock.now();
        let b = clock.now();
        let c = clock.now();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn wall_clock_produces_recent_timestamps() {
        let clock = WallClock::new();
        let before = Utc::now();
        let now = clock.now();
        assert!(now >= before);
    }
}
