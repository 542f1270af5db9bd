//! Time Source
//!
//! All window, breaker and TTL arithmetic reads time through [`Clock`] so that
//! the same code runs against wall-clock time in production and a manually
//! advanced clock in tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Source of the current time
pub trait Clock: Send + Sync + Debug {
    /// Current UTC timestamp
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the current wall-clock time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += to_chrono(by);
    }

    /// Jump to an absolute timestamp
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Default shared clock (wall time)
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Upper bound for converted durations (~100 years)
const MAX_CHRONO_MILLIS: u128 = 100 * 365 * 24 * 3600 * 1000;

/// Convert a std duration to a chrono one, saturating at ~100 years
pub fn to_chrono(d: Duration) -> chrono::Duration {
    let millis = d.as_millis().min(MAX_CHRONO_MILLIS) as i64;
    chrono::Duration::milliseconds(millis)
}

/// Time remaining from `now` until `until`, zero if already passed
pub fn until(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_now();
        let start = clock.now();

        clock.advance(Duration::from_secs(90));
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }

    #[test]
    fn test_until_saturates_at_zero() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(5);
        assert_eq!(until(now, earlier), Duration::ZERO);
        assert_eq!(
            until(now, now + chrono::Duration::seconds(5)),
            Duration::from_secs(5)
        );
    }
}
