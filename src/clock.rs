//! Clock abstraction.
//!
//! Cooldown expiry, sequential `deltaTime`, and counter decay are all
//! time-based, so the engine never reads the wall clock directly. It asks
//! a [`Clock`] instead, which lets tests drive temporal behavior with a
//! [`ManualClock`] advanced explicitly between lines.

use std::sync::Mutex;

use chrono::{Local, NaiveDate, NaiveDateTime, TimeDelta};

/// Source of "now" for the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Wall-clock time in the local timezone.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to. Used by tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        ManualClock { now: Mutex::new(start) }
    }

    /// A fixed, arbitrary starting point for tests.
    pub fn epoch() -> Self {
        let date = NaiveDate::from_ymd_opt(2020, 3, 16).unwrap();
        Self::new(date.and_hms_opt(12, 0, 0).unwrap())
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::epoch();
        let t0 = clock.now();
        clock.advance(TimeDelta::seconds(5));
        assert_eq!((clock.now() - t0).num_seconds(), 5);
    }
}
