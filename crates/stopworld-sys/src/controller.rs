//! The stop/start controller (§4.4).
//!
//! `stop_world` signals every other live, non-finished thread with
//! `SIG_SUSPEND` and waits for each to acknowledge; `start_world` does
//! the same with `SIG_RESTART`. Both tolerate a target thread having
//! exited between the table scan and the `pthread_kill` call — an
//! `ESRCH` there is a race with normal thread exit, not a protocol
//! violation, and is silently skipped rather than treated as fatal.

use crate::{signal, state};
use core::ffi::c_int;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use stopworld_core::record::ThreadRecord;
use stopworld_core::{flags, FatalError, ThreadId};

static SUSPEND_ACK: signal::Handshake = signal::handshake();

/// The suspend/restart handshake semaphore, shared by the controller
/// and the signal handlers.
pub(crate) fn suspend_ack() -> &'static signal::Handshake {
    &SUSPEND_ACK
}

/// # Safety
/// Must run exactly once, before `stop_world`/`start_world` can be
/// called from any thread.
pub(crate) unsafe fn init_handshake() {
    // SAFETY: caller guarantees single call, before any use.
    unsafe { SUSPEND_ACK.init() };
}

static PROGRESS_COUNTER: OnceLock<&'static AtomicUsize> = OnceLock::new();
static STOP_SNAPSHOT: AtomicUsize = AtomicUsize::new(0);

/// Register a counter the host increments somewhere in its mutator
/// path. If registered, `stop_world`/`start_world` use it to detect a
/// mutator that kept running across a supposed stop (§9, resolved
/// Open Question: no mutator loop is invented here — only the check,
/// and only if a counter is actually registered).
pub fn set_progress_counter(counter: &'static AtomicUsize) {
    let _ = PROGRESS_COUNTER.set(counter);
}

fn pthread_eq(a: ThreadId, b: ThreadId) -> bool {
    // SAFETY: both operands are native pthread_t values obtained from
    // this process's own pthread implementation.
    unsafe { libc::pthread_equal(state::raw_pthread(a), state::raw_pthread(b)) != 0 }
}

/// Send `sig` to the thread identified by `id`. Returns `false` if the
/// thread has already exited (`ESRCH`); any other failure is a
/// configuration or invariant violation and aborts the process.
fn send_signal(id: ThreadId, sig: c_int) -> bool {
    // SAFETY: `raw_pthread(id)` is a handle this process itself
    // created and has not yet reclaimed via `pthread_join`.
    let rc = unsafe { libc::pthread_kill(state::raw_pthread(id), sig) };
    match rc {
        0 => true,
        libc::ESRCH => false,
        _ => FatalError::Invariant("pthread_kill returned an unexpected error").abort(),
    }
}

/// Suspend every other live thread and wait for each to acknowledge
/// that it has captured its stack range and parked in `sigsuspend`
/// (§4.4 steps 1-3).
///
/// # Safety
/// The caller must already hold the allocation lock — this function
/// walks the thread table without locking it itself.
pub unsafe fn stop_world() {
    // Give a thread that was just restarted by a previous cycle a
    // chance to actually leave its SIG_SUSPEND handler before we try
    // to suspend it again; delivering SIG_SUSPEND to a thread still
    // inside the previous handler invocation would be lost or
    // badly ordered (§4.4 step 1).
    std::thread::yield_now();

    if let Some(counter) = PROGRESS_COUNTER.get() {
        STOP_SNAPSHOT.store(counter.load(Ordering::Acquire), Ordering::Relaxed);
    }

    let me = state::current_thread_id();
    let mut signaled = 0usize;
    state::table().for_each(|rec_ptr| {
        // SAFETY: reachable from the table under the caller's lock.
        let rec: &ThreadRecord = unsafe { &*rec_ptr };
        if rec.flags.contains(flags::FINISHED) || pthread_eq(rec.id, me) {
            return;
        }
        if send_signal(rec.id, signal::SIG_SUSPEND) {
            signaled += 1;
        }
    });

    for _ in 0..signaled {
        suspend_ack().wait();
    }
}

/// Verify the registered progress counter (if any) did not advance
/// while the world was believed stopped, then release every other
/// live thread that was suspended by [`stop_world`] (§4.4 step 5). The
/// comparison runs *before* any `SIG_RESTART` is sent: a peer released
/// partway through the table walk could otherwise leave its handler
/// and increment the counter before this function finishes, producing
/// a spurious abort on an otherwise correct cycle. No acknowledgement
/// wait is performed for the restart signals themselves: a peer's
/// resumption out of its `SIG_SUSPEND` handler is asynchronous and
/// harmless to the caller, per §4.4.
///
/// # Safety
/// The caller must already hold the allocation lock.
pub unsafe fn start_world() {
    if let Some(counter) = PROGRESS_COUNTER.get() {
        let before = STOP_SNAPSHOT.load(Ordering::Relaxed);
        let after = counter.load(Ordering::Acquire);
        if after != before {
            FatalError::Invariant("a mutator made progress while the world was stopped").abort();
        }
    }

    let me = state::current_thread_id();
    state::table().for_each(|rec_ptr| {
        // SAFETY: see `stop_world`.
        let rec: &ThreadRecord = unsafe { &*rec_ptr };
        if rec.flags.contains(flags::FINISHED) || pthread_eq(rec.id, me) {
            return;
        }
        send_signal(rec.id, signal::SIG_RESTART);
    });
}
