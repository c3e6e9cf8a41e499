//! Time sources for timestamps, segment names and capture timers.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::{self, Instant};

/// Source of wall-clock and monotonic time.
///
/// Line prefixes and segment names are derived from [`now`](Clock::now).
/// The capture loop's sync and quiescence timers use
/// [`monotonic`](Clock::monotonic), which never moves backwards when the
/// wall clock is stepped.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the time elapsed since an arbitrary fixed origin.
    ///
    /// Successive calls never decrease.
    fn monotonic(&self) -> time::Duration;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> time::Duration {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        ORIGIN.get_or_init(Instant::now).elapsed()
    }
}

/// A manually driven clock for tests.
///
/// [`advance`](ManualClock::advance) moves both readings forward;
/// [`set`](ManualClock::set) steps only the wall clock, the way an NTP
/// correction would.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ManualTime>,
}

#[derive(Debug)]
struct ManualTime {
    wall: DateTime<Utc>,
    monotonic: time::Duration,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ManualTime {
                wall: start,
                monotonic: time::Duration::ZERO,
            }),
        }
    }

    /// Moves the clock forward by `by`.
    ///
    /// A negative `by` steps the wall clock back and leaves the monotonic
    /// reading unchanged.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.wall += by;
        if let Ok(by) = by.to_std() {
            inner.monotonic += by;
        }
    }

    /// Sets the wall clock to `to`.
    pub fn set(&self, to: DateTime<Utc>) {
        self.inner.lock().wall = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().wall
    }

    fn monotonic(&self) -> time::Duration {
        self.inner.lock().monotonic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);

        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
        assert_eq!(clock.monotonic(), time::Duration::from_secs(90));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn wall_clock_steps_do_not_move_monotonic_time() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(10));

        clock.set(start - Duration::hours(1));
        clock.advance(Duration::seconds(-30));
        assert_eq!(clock.now(), start - Duration::hours(1) - Duration::seconds(30));
        assert_eq!(clock.monotonic(), time::Duration::from_secs(10));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let first = SystemClock.monotonic();
        let second = SystemClock.monotonic();
        assert!(second >= first);
    }
}
