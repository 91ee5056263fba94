//! Monotonic time source (§6: "Time source with millisecond and
//! microsecond monotonic precision"). The controller never reads the wall
//! clock directly; every component that needs "now" takes a `&dyn Clock`
//! (or a concrete `Clock` generic), which keeps the watchdog and backoff
//! logic deterministically testable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic clock. Implementations must never go backwards.
pub trait Clock: Send + Sync {
    /// Milliseconds since some unspecified epoch fixed at clock creation.
    fn now_ms(&self) -> u64;

    /// Microseconds since the same epoch as [`Clock::now_ms`].
    fn now_us(&self) -> u64;
}

/// Production clock backed by [`std::time::Instant`].
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// A manually-advanced clock for deterministic tests of watchdog timeout
/// and backoff-jitter behavior (§8 scenarios 4-6).
#[derive(Default)]
pub struct FakeClock {
    now_ms: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now_ms: AtomicU64::new(0),
        }
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn now_us(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst) * 1000
    }
}
