//! AR state-machine transition rules (component C5, §4.5).
//!
//! This module holds the *pure* parts of the state machine: the timeout
//! constants, the state-change notification shape, and the small helpers
//! that decide whether a timeout or watchdog deadline has elapsed. The
//! orchestration that calls RPCs and drives the table lives in
//! [`crate::manager`]; keeping the decision logic here means it can be
//! unit-tested against a [`pnio_core::time::FakeClock`] without any
//! transport collaborator at all.

use pnio_core::error::PnioError;

use crate::ar::{Ar, ArState};

/// Controller-side connect timeout (§4.5: "CONNECT_REQ -> ABORT ...
/// last_activity_ms exceeds 10s").
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
/// How long READY waits for an inbound `ApplicationReady` before aborting
/// (§4.5).
pub const APPLICATION_READY_TIMEOUT_MS: u64 = 30_000;
/// Consecutive missed watchdog ticks before RUN -> ABORT (§4.5).
pub const WATCHDOG_MISS_THRESHOLD: u32 = 3;

/// A single state transition, reported to the registered callback whenever
/// `old != new` (§4.5 "State-change notifications").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: ArState,
    pub new: ArState,
}

/// Registered once per [`crate::manager::ArManager`] (§3 "Manager",
/// §4.5). Invoked under the manager lock — implementations must not call
/// back into the manager (§5).
pub trait StateChangeCallback: Send + Sync {
    fn on_state_change(&self, station_name: &str, change: StateChange);
}

/// Move `ar` to `new_state`, notifying `cb` only if the state actually
/// changes. Centralizing this keeps the "notify iff old != new" rule from
/// being reimplemented (and potentially forgotten) at every call site.
pub(crate) fn transition(
    ar: &mut Ar,
    new_state: ArState,
    cb: Option<&dyn StateChangeCallback>,
) {
    if ar.state == new_state {
        return;
    }
    let change = StateChange {
        old: ar.state,
        new: new_state,
    };
    ar.state = new_state;
    log::info!(
        "ar '{}': {} -> {}",
        ar.station_name,
        change.old.as_str(),
        change.new.as_str()
    );
    if let Some(cb) = cb {
        cb.on_state_change(&ar.station_name, change);
    }
}

/// Abort `ar` with `err`, logging at the level its classification implies
/// (§7: INFO/WARN/ERROR).
pub(crate) fn abort(ar: &mut Ar, err: PnioError, now_ms: u64, cb: Option<&dyn StateChangeCallback>) {
    log::log!(err.log_level(), "ar '{}': aborting: {}", ar.station_name, err);
    ar.last_error = Some(err);
    ar.last_activity_ms = now_ms;
    transition(ar, ArState::Abort, cb);
}

/// `true` if `ar` has been in `CONNECT_REQ` longer than
/// [`CONNECT_TIMEOUT_MS`] (§4.5).
pub fn connect_timed_out(ar: &Ar, now_ms: u64) -> bool {
    ar.state == ArState::ConnectReq && now_ms.saturating_sub(ar.last_activity_ms) > CONNECT_TIMEOUT_MS
}

/// `true` if `ar` has been in `READY` longer than
/// [`APPLICATION_READY_TIMEOUT_MS`] without an `ApplicationReady`
/// indication (§4.5).
pub fn application_ready_timed_out(ar: &Ar, now_ms: u64) -> bool {
    ar.state == ArState::Ready
        && now_ms.saturating_sub(ar.last_activity_ms) > APPLICATION_READY_TIMEOUT_MS
}

/// Watchdog evaluation for an AR in `RUN` (§4.5 "Watchdog
/// semantics"). Returns `true` if this tick counted as a miss. The caller
/// is responsible for comparing `ar.missed_cycles` against
/// [`WATCHDOG_MISS_THRESHOLD`] and transitioning to `ABORT` once reached —
/// kept as a caller decision since only the caller can raise the
/// state-change notification with a locked manager in scope.
pub fn watchdog_tick_is_miss(ar: &Ar, now_ms: u64) -> bool {
    ar.state == ArState::Run
        && now_ms.saturating_sub(ar.last_activity_ms) > ar.watchdog_ms as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnio_types::timing::TimingProfile;

    fn ar() -> Ar {
        Ar::new(
            &crate::ar::ArConfig {
                station_name: "rtu-a".to_string(),
                device_ip: "10.0.0.5".parse().unwrap(),
                device_mac: [0; 6],
                watchdog_ms: 1000,
                slot_info: vec![],
                timing: TimingProfile::default(),
            },
            uuid::Uuid::new_v4(),
            0,
        )
        .unwrap()
    }

    #[test]
    fn transition_no_ops_and_skips_callback_on_same_state() {
        struct Counter(std::sync::atomic::AtomicU32);
        impl StateChangeCallback for Counter {
            fn on_state_change(&self, _station_name: &str, _change: StateChange) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let counter = Counter(std::sync::atomic::AtomicU32::new(0));
        let mut a = ar();
        transition(&mut a, ArState::Init, Some(&counter));
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 0);
        transition(&mut a, ArState::ConnectReq, Some(&counter));
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn connect_timeout_fires_only_in_connect_req_past_threshold() {
        let mut a = ar();
        a.state = ArState::ConnectReq;
        a.last_activity_ms = 0;
        assert!(!connect_timed_out(&a, CONNECT_TIMEOUT_MS));
        assert!(connect_timed_out(&a, CONNECT_TIMEOUT_MS + 1));
        a.state = ArState::Run;
        assert!(!connect_timed_out(&a, CONNECT_TIMEOUT_MS + 1));
    }

    #[test]
    fn watchdog_miss_requires_run_state_and_elapsed_window() {
        let mut a = ar();
        a.state = ArState::Run;
        a.last_activity_ms = 0;
        a.watchdog_ms = 1000;
        assert!(!watchdog_tick_is_miss(&a, 1000));
        assert!(watchdog_tick_is_miss(&a, 1001));
    }
}
