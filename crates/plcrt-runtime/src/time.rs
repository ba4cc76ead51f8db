//! Logical clock types.
//!
//! The module's notion of "now" is a 64-bit (seconds, nanoseconds)
//! logical clock advanced by exactly one declared cycle period per
//! cycle. It is seeded from wall time when the run loop activates and
//! never skips or repeats afterwards, regardless of scheduling jitter.

#![allow(missing_docs)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// 64-bit timespec shared with module code through the symbol resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSpec64 {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec64 {
    /// Current wall time, used only to seed the logical clock.
    #[must_use]
    pub fn wall_now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            sec: i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
            nsec: i64::from(elapsed.subsec_nanos()),
        }
    }

    /// Advance by the given number of nanoseconds, normalizing the
    /// nanosecond field into `[0, 1s)`.
    #[must_use]
    pub fn add_nanos(self, nanos: u64) -> Self {
        let total = self.nsec.saturating_add(i64::try_from(nanos).unwrap_or(i64::MAX));
        Self {
            sec: self.sec.saturating_add(total / NANOS_PER_SEC),
            nsec: total % NANOS_PER_SEC,
        }
    }
}

/// Shared logical clock cell.
#[derive(Debug, Clone, Default)]
pub struct ClockCell {
    inner: Arc<Mutex<TimeSpec64>>,
}

impl ClockCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, time: TimeSpec64) {
        *self.inner.lock().expect("clock cell poisoned") = time;
    }

    #[must_use]
    pub fn get(&self) -> TimeSpec64 {
        *self.inner.lock().expect("clock cell poisoned")
    }

    /// Advance by exactly one cycle period.
    pub fn advance(&self, period: Duration) {
        let mut guard = self.inner.lock().expect("clock cell poisoned");
        *guard = guard.add_nanos(u64::try_from(period.as_nanos()).unwrap_or(u64::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_normalizes_nanoseconds() {
        let clock = ClockCell::new();
        clock.set(TimeSpec64 {
            sec: 10,
            nsec: 900_000_000,
        });
        clock.advance(Duration::from_millis(250));
        let now = clock.get();
        assert_eq!(now.sec, 11);
        assert_eq!(now.nsec, 150_000_000);
    }

    #[test]
    fn repeated_advances_never_skip() {
        let clock = ClockCell::new();
        clock.set(TimeSpec64::default());
        for _ in 0..1000 {
            clock.advance(Duration::from_millis(10));
        }
        assert_eq!(clock.get(), TimeSpec64 { sec: 10, nsec: 0 });
    }
}
