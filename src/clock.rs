//! Monotonic nanosecond clocks
//!
//! Entry timestamps use `0` as the "not inside the call" sentinel, so every
//! clock here must return values strictly greater than zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonic timestamps shared by the hooks and the scanner
pub trait Clock: Send + Sync {
    /// Current reading in nanoseconds, never 0
    fn now_nanos(&self) -> u64;
}

/// Wall-independent clock measured from the moment it was created
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_nanos(&self) -> u64 {
        // +1 keeps the first reading clear of the idle sentinel
        self.origin.elapsed().as_nanos() as u64 + 1
    }
}

/// Manually driven clock for deterministic tests
///
/// # Example
///
/// ```
/// use straggler::clock::{Clock, FakeClock};
///
/// let clock = FakeClock::new(1_000);
/// clock.advance(500);
/// assert_eq!(clock.now_nanos(), 1_500);
/// ```
#[derive(Debug)]
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    /// Create a clock reading `start` nanoseconds (clamped to at least 1)
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start.max(1)),
        }
    }

    pub fn set(&self, nanos: u64) {
        self.now.store(nanos.max(1), Ordering::SeqCst);
    }

    pub fn advance(&self, nanos: u64) {
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
