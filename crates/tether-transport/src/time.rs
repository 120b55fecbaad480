//! # Service Clock
//!
//! Millisecond timestamps for the service loop. Times are wrapping `u32`
//! values; comparisons treat any difference of a day or more as a wrap.

use quanta::{Clock, Instant};

/// Differences at or above this many milliseconds are treated as wrapped.
pub const TIME_OVERFLOW: u32 = 86_400_000;

/// `a < b` in wrapping millisecond time.
#[inline]
pub fn time_less(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= TIME_OVERFLOW
}

/// `a >= b` in wrapping millisecond time.
#[inline]
pub fn time_greater_equal(a: u32, b: u32) -> bool {
    !time_less(a, b)
}

/// Absolute distance between two wrapping timestamps.
#[inline]
pub fn time_difference(a: u32, b: u32) -> u32 {
    if a.wrapping_sub(b) >= TIME_OVERFLOW {
        b.wrapping_sub(a)
    } else {
        a.wrapping_sub(b)
    }
}

// ─── ServiceClock ───────────────────────────────────────────────────────────

/// Millisecond clock anchored at host creation.
///
/// Backed by a `quanta::Clock` so tests can substitute `Clock::mock()`.
/// The first reading is 1, keeping 0 free as a "never" sentinel.
#[derive(Clone)]
pub struct ServiceClock {
    clock: Clock,
    epoch: Instant,
}

impl ServiceClock {
    pub fn new(clock: Clock) -> Self {
        let epoch = clock.now();
        ServiceClock { clock, epoch }
    }

    /// Current time in ms since the epoch, wrapping at `u32::MAX`.
    pub fn now_ms(&self) -> u32 {
        let elapsed = self.clock.now().saturating_duration_since(self.epoch);
        ((elapsed.as_millis() as u64 & 0xFFFF_FFFF) as u32).wrapping_add(1)
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

impl Default for ServiceClock {
    fn default() -> Self {
        Self::new(Clock::new())
    }
}
