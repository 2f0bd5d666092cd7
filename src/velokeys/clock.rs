//! Free-running microsecond timestamps that wrap at 2^32.
//!
//! All comparisons go through the signed difference of two
//! timestamps, so they stay correct across the wrap as long as the
//! two values are within 2^31 µs (about 35 minutes) of each other.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Source of wrapping microsecond timestamps.
pub trait Clock: Send + Sync + Debug {
    fn now_us(&self) -> u32;
}

/// Is `a` strictly earlier than `b`?
pub fn wrapping_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Has `run_at` been reached at `now`?
pub fn is_due(run_at: u32, now: u32) -> bool {
    (now.wrapping_sub(run_at) as i32) >= 0
}

/// Microseconds from `now` until `run_at`, zero if already due.
pub fn micros_until(run_at: u32, now: u32) -> u32 {
    let delta = run_at.wrapping_sub(now) as i32;
    if delta > 0 {
        delta as u32
    } else {
        0
    }
}

#[derive(Debug, Clone)]
/// Wall clock backed by `std::time::Instant`.
pub struct SystemClock {
    start: Instant,

    /// Added to every reading. Starting close to `u32::MAX` makes the
    /// wrap happen within seconds instead of after 71 minutes.
    offset_us: u32,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> SystemClock {
        Self::with_offset(0)
    }

    pub fn with_offset(offset_us: u32) -> SystemClock {
        SystemClock {
            start: Instant::now(),
            offset_us,
        }
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u32 {
        // Truncating to 32 bits is the wrap.
        self.offset_us
            .wrapping_add(self.start.elapsed().as_micros() as u32)
    }
}

#[derive(Debug, Default)]
/// A clock that only moves when told to. Deterministic tests and
/// simulation drive it by hand.
pub struct ManualClock {
    now_us: AtomicU32,
}

impl ManualClock {
    pub fn new(start_us: u32) -> ManualClock {
        ManualClock {
            now_us: AtomicU32::new(start_us),
        }
    }

    pub fn set(&self, now_us: u32) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }

    /// Move forward, returning the new time.
    pub fn advance(&self, delta_us: u32) -> u32 {
        self.now_us
            .fetch_add(delta_us, Ordering::SeqCst)
            .wrapping_add(delta_us)
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u32 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_across_the_wrap() {
        assert!(wrapping_before(1, 2));
        assert!(!wrapping_before(2, 1));
        assert!(!wrapping_before(7, 7));
        assert!(wrapping_before(u32::MAX - 5, 10));
        assert!(!wrapping_before(10, u32::MAX - 5));
    }

    #[test]
    fn due_and_until() {
        assert!(is_due(100, 100));
        assert!(is_due(100, 101));
        assert!(!is_due(100, 99));
        assert!(is_due(u32::MAX, 3));
        assert!(!is_due(3, u32::MAX));

        assert_eq!(micros_until(150, 100), 50);
        assert_eq!(micros_until(100, 150), 0);
        assert_eq!(micros_until(4, u32::MAX - 1), 6);
    }

    #[test]
    fn manual_clock_wraps() {
        let clock = ManualClock::new(u32::MAX - 1);
        assert_eq!(clock.advance(3), 1);
        assert_eq!(clock.now_us(), 1);
        clock.set(42);
        assert_eq!(clock.now_us(), 42);
    }

    #[test]
    fn system_clock_moves_forward_through_offset() {
        let clock = SystemClock::with_offset(u32::MAX - 1_000);
        let first = clock.now_us();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let second = clock.now_us();
        assert!(wrapping_before(first, second));
        // Wrapped past zero by now.
        assert!(second < first);
    }
}
