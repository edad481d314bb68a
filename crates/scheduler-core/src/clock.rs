//! Wall time and monotonic tick source. The only point that reads "now".
//!
//! Production uses [`SystemClock`]; tests inject [`FakeClock`] so trigger and
//! retry math stays deterministic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Abstraction over wall time and a monotonic tick, shared by every component.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// A monotonic instant, used only for timeout/elapsed measurements.
    fn monotonic(&self) -> Instant;
}

/// Real clock backed by the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock for tests. Wall time advances only via [`FakeClock::advance`]
/// or [`FakeClock::set`].
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeClockState>>,
}

struct FakeClockState {
    now: DateTime<Utc>,
    monotonic: Instant,
}

impl FakeClock {
    /// Create a fake clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeClockState {
                now: start,
                monotonic: Instant::now(),
            })),
        }
    }

    /// Advance both wall time and the monotonic tick by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut state = self.inner.lock();
        state.now += chrono::Duration::from_std(delta).expect("duration fits in chrono range");
        state.monotonic += delta;
    }

    /// Jump wall time to an arbitrary point, without moving the monotonic tick.
    /// Useful for DST-boundary and "tomorrow" tests.
    pub fn set(&self, now: DateTime<Utc>) {
        self.inner.lock().now = now;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    fn monotonic(&self) -> Instant {
        self.inner.lock().monotonic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_wall_and_monotonic_together() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        let m0 = clock.monotonic();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
        assert!(clock.monotonic() >= m0 + Duration::from_secs(5));
    }

    #[test]
    fn fake_clock_set_moves_only_wall_time() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        let m0 = clock.monotonic();
        let jump = start + chrono::Duration::days(1);
        clock.set(jump);
        assert_eq!(clock.now(), jump);
        assert_eq!(clock.monotonic(), m0);
    }
}
