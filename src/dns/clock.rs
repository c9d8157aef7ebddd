//! Monotonic time and timeout arithmetic
//!
//! A single `now` is sampled once per event tick (`Channel::tick`) and
//! threaded through every component that needs to compare against a
//! deadline, so that a query inserted mid-tick can't race against a clock
//! that advanced between two comparisons in the same tick.

use std::time::Instant;

/// Monotonic timestamp as a `(seconds, microseconds)` pair, microseconds
/// always in `[0, 1_000_000)`. Backed by `Instant` so it is immune to wall
/// clock adjustments (NTP steps, DST), matching the requirement for a
/// monotonic timeout wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeval {
    pub secs: u64,
    pub micros: u32,
}

impl Timeval {
    pub fn new(secs: u64, micros: u32) -> Timeval {
        debug_assert!(micros < 1_000_000);
        Timeval { secs, micros }
    }

    fn from_duration(d: std::time::Duration) -> Timeval {
        Timeval {
            secs: d.as_secs(),
            micros: d.subsec_micros(),
        }
    }
}

/// Wall-clock-free monotonic clock. Each `Clock` is anchored to its own
/// creation instant so `Timeval`s it produces are only meaningfully
/// comparable against other `Timeval`s from the same `Clock` (in practice
/// a `Channel` owns exactly one).
#[derive(Debug, Clone)]
pub struct Clock {
    epoch: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Clock {
        Clock { epoch: Instant::now() }
    }

    /// Sample the current monotonic time. Called exactly once per event
    /// tick.
    pub fn now(&self) -> Timeval {
        Timeval::from_duration(self.epoch.elapsed())
    }
}

/// `now >= deadline`.
pub fn timedout(now: Timeval, deadline: Timeval) -> bool {
    now >= deadline
}

/// `t + millis`, carrying seconds on microsecond overflow.
pub fn timeadd(t: Timeval, millis: u64) -> Timeval {
    let extra_micros = (millis % 1000) * 1000;
    let extra_secs = millis / 1000;

    let mut micros = t.micros as u64 + extra_micros;
    let mut secs = t.secs + extra_secs;
    if micros >= 1_000_000 {
        micros -= 1_000_000;
        secs += 1;
    }

    Timeval::new(secs, micros as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timedout_is_inclusive() {
        let a = Timeval::new(10, 0);
        let b = Timeval::new(10, 0);
        assert!(timedout(b, a));
    }

    #[test]
    fn timedout_respects_ordering() {
        let earlier = Timeval::new(10, 500);
        let later = Timeval::new(11, 0);
        assert!(!timedout(earlier, later));
        assert!(timedout(later, earlier));
    }

    #[test]
    fn timeadd_carries_seconds() {
        let t = Timeval::new(1, 900_000);
        let result = timeadd(t, 200);
        assert_eq!(result, Timeval::new(2, 100_000));
    }

    #[test]
    fn timeadd_large_millis() {
        let t = Timeval::new(0, 0);
        let result = timeadd(t, 2500);
        assert_eq!(result, Timeval::new(2, 500_000));
    }

    #[test]
    fn clock_advances_monotonically() {
        let clock = Clock::new();
        let a = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now();
        assert!(b >= a);
    }
}
