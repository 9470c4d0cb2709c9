//! Process-wide singletons.
//!
//! Everything in this subsystem hangs off exactly one [`ThreadTable`]
//! and one [`AllocLock`], both created once at process start and never
//! torn down — mirroring the original source's single pair of global
//! `GC_thread_table`/`GC_allocate_ml` definitions.

use core::sync::atomic::{AtomicBool, Ordering};
use stopworld_core::{AllocLock, ThreadId, ThreadTable};

static TABLE: ThreadTable = ThreadTable::new();
static LOCK: AllocLock = AllocLock::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The process-wide thread table.
#[must_use]
pub fn table() -> &'static ThreadTable {
    &TABLE
}

/// The process-wide allocation lock.
#[must_use]
pub fn lock() -> &'static AllocLock {
    &LOCK
}

/// Whether [`crate::lifecycle::thr_init`] has run.
#[must_use]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Mark initialization complete. Idempotent; only the first caller's
/// effect matters.
pub(crate) fn mark_initialized() {
    INITIALIZED.store(true, Ordering::Release);
}

/// The calling thread's native identity, wrapped as a [`ThreadId`].
#[must_use]
pub fn current_thread_id() -> ThreadId {
    // SAFETY: pthread_self never fails and returns a value valid for
    // the lifetime of the calling thread.
    ThreadId(unsafe { libc::pthread_self() } as usize)
}

/// Raw `pthread_t` for a [`ThreadId`], for passing to `libc` calls
/// that need the native handle back (`pthread_kill`, `pthread_join`,
/// `pthread_equal`).
#[must_use]
pub fn raw_pthread(id: ThreadId) -> libc::pthread_t {
    id.0 as libc::pthread_t
}
