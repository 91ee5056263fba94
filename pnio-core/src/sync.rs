//! Lock-tracing helpers around the coarse manager mutex.
//!
//! The engine deliberately uses a single coarse [`parking_lot::Mutex`] per
//! `ArManager` rather than a fine-grained per-AR lock (§5). These
//! macros wrap every acquisition of that mutex with a `trace!` log so that
//! lock contention and the lock-drop-and-reacquire pattern (§5, §9)
//! remain observable, and so no call site can reach for `.lock()` directly
//! and accidentally bypass the discipline.

/// Acquire `$mutex`, logging at `trace!` before and after acquisition.
#[macro_export]
macro_rules! trace_lock {
    ($mutex:expr) => {{
        log::trace!("waiting for AR table lock at {}:{}", file!(), line!());
        let guard = $mutex.lock();
        log::trace!("acquired AR table lock at {}:{}", file!(), line!());
        guard
    }};
}
