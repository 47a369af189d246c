//! Millisecond clocks and 32-bit rollover compensation.
//!
//! Device code measures time with a wrapping `u32` millisecond counter. The
//! scheduler widens it to a monotonic `u64` with [`MillisExtender`], which
//! counts how many times the raw counter went backwards.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// A monotonic millisecond counter that wraps at `u32::MAX`.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary epoch, wrapping on overflow.
    fn millis(&self) -> u32;
}

/// Wall clock backed by [`Instant`], starting at zero when created.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Create a clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn millis(&self) -> u32 {
        // Truncation is the wrap-around.
        self.start.elapsed().as_millis() as u32
    }
}

/// Clock that only moves when told to. Used to drive timers deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    /// Create a clock reading `start` milliseconds.
    pub fn new(start: u32) -> Self {
        Self {
            now: AtomicU32::new(start),
        }
    }

    /// Jump to an absolute reading.
    pub fn set(&self, millis: u32) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Move forward by `delta` milliseconds, wrapping like the hardware counter.
    pub fn advance(&self, delta: u32) {
        let current = self.now.load(Ordering::SeqCst);
        self.now.store(current.wrapping_add(delta), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn millis(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Widens successive `u32` readings into a monotonic `u64`.
///
/// A reading smaller than the previous one is treated as a rollover and bumps
/// the high word. Readings must be sampled at least once per ~49.7 days for
/// this to hold, which any running main loop does.
#[derive(Debug, Default, Clone, Copy)]
pub struct MillisExtender {
    last: u32,
    major: u32,
}

impl MillisExtender {
    /// Fold a new raw reading in and return the widened value.
    pub fn extend(&mut self, now: u32) -> u64 {
        if now < self.last {
            self.major = self.major.wrapping_add(1);
            tracing::debug!(
                "Incrementing scheduler major at {}ms",
                u64::from(now) + (u64::from(self.major) << 32)
            );
        }
        self.last = now;
        u64::from(now) + (u64::from(self.major) << 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extender_is_identity_before_rollover() {
        let mut ext = MillisExtender::default();
        assert_eq!(ext.extend(0), 0);
        assert_eq!(ext.extend(1_000), 1_000);
        assert_eq!(ext.extend(1_000), 1_000);
    }

    #[test]
    fn test_extender_detects_rollover() {
        let mut ext = MillisExtender::default();
        assert_eq!(ext.extend(u32::MAX - 5), u64::from(u32::MAX - 5));
        let after = ext.extend(3);
        assert_eq!(after, (1u64 << 32) + 3);
        assert!(after > u64::from(u32::MAX - 5));
    }

    #[test]
    fn test_manual_clock_wraps() {
        let clock = ManualClock::new(u32::MAX - 1);
        clock.advance(3);
        assert_eq!(clock.millis(), 1);
    }

    #[test]
    fn test_system_clock_starts_near_zero() {
        let clock = SystemClock::new();
        assert!(clock.millis() < 1_000);
    }
}
