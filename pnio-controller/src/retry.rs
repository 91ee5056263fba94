//! Exponential backoff with jitter for ABORT-state retries (§4.5,
//! §4.12). Factored out as a standalone, stateless policy independent
//! of the state machine so the math can be unit-tested on its own.

use std::time::Duration;

use crate::ar::Ar;

/// Maximum number of retry attempts before an AR gives up and moves to
/// `CLOSE` (§4.5).
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Exponential backoff: `5000ms << min(retry_count, 3)`, capped at
/// 30000ms, then jittered by up to 25% using `now_ms mod (2*jitter+1)`
/// (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_fraction: f64,
}

impl ExponentialBackoff {
    pub fn profinet_default() -> Self {
        Self {
            base_ms: 5000,
            cap_ms: 30_000,
            jitter_fraction: 0.25,
        }
    }

    /// Delay before the next retry attempt, given how many retries have
    /// already happened and the current time (used as the jitter seed).
    pub fn next(&self, retry_count: u32, now_ms: u64) -> Duration {
        let shift = retry_count.min(3);
        let base = self
            .base_ms
            .saturating_mul(1u64 << shift)
            .min(self.cap_ms);
        let jitter_range = ((base as f64) * self.jitter_fraction) as u64;
        if jitter_range == 0 {
            return Duration::from_millis(base);
        }
        let modulus = 2 * jitter_range + 1;
        let sample = now_ms % modulus;
        let offset = sample as i64 - jitter_range as i64;
        let delay = (base as i64 + offset).max(0) as u64;
        Duration::from_millis(delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::profinet_default()
    }
}

/// `true` if `ar`'s current `last_error` and `retry_count` permit another
/// ABORT -> ABORT retry attempt (§4.5: transient error and
/// `retry_count < MAX_RETRY_ATTEMPTS`).
pub fn should_retry(ar: &Ar) -> bool {
    if ar.retry_count >= MAX_RETRY_ATTEMPTS {
        return false;
    }
    match &ar.last_error {
        Some(e) => !e.is_permanent(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_falls_in_5s_plus_minus_25_percent() {
        let b = ExponentialBackoff::profinet_default();
        for now in [0, 1, 5000, 999_999] {
            let d = b.next(0, now).as_millis() as u64;
            assert!((3750..=6250).contains(&d), "delay {d} for now {now}");
        }
    }

    #[test]
    fn second_retry_falls_in_10s_plus_minus_25_percent() {
        let b = ExponentialBackoff::profinet_default();
        for now in [0, 3, 12345] {
            let d = b.next(1, now).as_millis() as u64;
            assert!((7500..=12500).contains(&d));
        }
    }

    #[test]
    fn third_retry_falls_in_20s_plus_minus_25_percent() {
        let b = ExponentialBackoff::profinet_default();
        for now in [0, 7, 999_999] {
            let d = b.next(2, now).as_millis() as u64;
            assert!((15000..=25000).contains(&d));
        }
    }

    #[test]
    fn delay_is_capped_at_30s_beyond_shift_3() {
        let b = ExponentialBackoff::profinet_default();
        let d = b.next(10, 0).as_millis() as u64;
        assert!(d <= 30_000 + 7_500);
    }
}
