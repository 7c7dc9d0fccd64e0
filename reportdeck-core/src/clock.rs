//! Wall-clock abstraction.
//!
//! Freshness timestamps and cache TTL checks read time through [`Clock`] so
//! tests can advance time deterministically instead of sleeping.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Starts at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().expect("manual clock poisoned");
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("manual clock poisoned") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock poisoned")
    }
}

/// Convert a whole number of seconds into a `TimeDelta`, saturating on overflow.
pub fn seconds(secs: u64) -> TimeDelta {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(TimeDelta::seconds(5));
        assert_eq!(clock.now(), start + TimeDelta::seconds(5));
    }

    #[test]
    fn seconds_saturates() {
        assert_eq!(seconds(30), TimeDelta::seconds(30));
        assert_eq!(seconds(u64::MAX), TimeDelta::MAX);
    }
}
