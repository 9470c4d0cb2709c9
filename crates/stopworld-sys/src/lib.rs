//! Signal-based stop-the-world handshake atop POSIX threads.
//!
//! This crate turns the safe data model in `stopworld-core` into a
//! working protocol: it installs the `SIG_SUSPEND`/`SIG_RESTART`
//! handlers, intercepts thread creation and termination so every live
//! thread has a table entry and a bound self-record, and exposes the
//! two operations a conservative collector actually calls —
//! [`begin_collection`] and [`end_collection`] — bracketing the
//! section where every other mutator is parked and its stack has been
//! pushed onto the collector's root set.
//!
//! Everything here is `unsafe_code = "allow"`: signal handlers and raw
//! `pthread_t` values have no safe expression, matching the split the
//! sibling `stopworld-core` crate documents at its own crate root.

pub mod controller;
pub mod lifecycle;
pub mod signal;
pub mod stack;
pub mod state;

pub use lifecycle::{create_thread, join, sigmask, thr_init, THREAD_STACK_SIZE_MAX};
pub use stopworld_core::{ClientError, FatalError, ThreadId};

/// Stop every other live thread, then push every live thread's stack
/// range (including the caller's own) onto the collector's root set.
/// Acquires the allocation lock, which is held until
/// [`end_collection`] releases it.
pub fn begin_collection() {
    state::lock().acquire();
    lifecycle::ensure_initialized_locked();
    // A collection is now underway for however long the host takes
    // between this call and `end_collection`; other threads contending
    // on the lock should skip straight to yielding rather than burn
    // cycles spinning against a holder that won't release soon (§4.1).
    stopworld_core::lock::set_collecting_hint(true);
    // SAFETY: the lock was just acquired above.
    unsafe {
        controller::stop_world();
        stack::record_own_stack_pointer();
        stack::push_all_stacks();
    }
}

/// Release every thread suspended by [`begin_collection`] and release
/// the allocation lock. The collector's own mark/sweep pass runs
/// between the two calls, with the lock held throughout.
pub fn end_collection() {
    // SAFETY: the lock has been held since `begin_collection`.
    unsafe {
        controller::start_world();
    }
    stopworld_core::lock::set_collecting_hint(false);
    state::lock().release();
}

/// Register a progress counter the host increments in its mutator
/// path, so `begin_collection`/`end_collection` can detect a thread
/// that kept running despite believing itself stopped.
pub use controller::set_progress_counter;
