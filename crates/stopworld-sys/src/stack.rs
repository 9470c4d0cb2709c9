//! Stack-extent discovery (§4.5).
//!
//! Every thread's stack range is `[stack_ptr, stack_end)`: `stack_end`
//! is fixed at thread-creation time (or, for the primordial thread, at
//! `primordial_stack_bottom`) and never changes; `stack_ptr` is
//! refreshed on every stop, either by the suspend handler (for a
//! parked thread) or directly by the caller (for the thread doing the
//! stopping, which can't signal itself and so samples its own stack
//! pointer inline).

use core::sync::atomic::Ordering;
use stopworld_core::record::ThreadRecord;
use stopworld_core::{flags, hooks, FatalError};

use crate::state;

/// Record the calling thread's own current stack pointer. Called by
/// the thread that initiated `stop_world`, which never receives
/// `SIG_SUSPEND` for itself and so must capture its own range directly
/// rather than through the signal handler.
///
/// # Safety
/// The caller must already hold the allocation lock.
pub unsafe fn record_own_stack_pointer() {
    let id = state::current_thread_id();
    let rec_ptr = state::table().lookup_thread(id);
    if rec_ptr.is_null() {
        FatalError::Invariant("current thread has no table record").abort();
    }
    // SAFETY: reachable from the table under the caller's lock.
    let rec: &ThreadRecord = unsafe { &*rec_ptr };
    rec.stack_ptr
        .store(hooks::hooks().approx_current_sp() as usize, Ordering::Release);
}

/// Push every live thread's stack range onto the collector's
/// conservative root set (§4.5, §4.4 step 4).
///
/// Asserts the subsystem is already initialized rather than lazily
/// initializing it (§9, resolved Open Question): a caller reaching
/// this function without having run [`crate::lifecycle::thr_init`]
/// first does not hold the allocation lock this function requires,
/// and silently acquiring it here would hide that bug instead of
/// surfacing it.
///
/// # Safety
/// The caller must already hold the allocation lock.
pub unsafe fn push_all_stacks() {
    if !state::is_initialized() {
        FatalError::Invariant("push_all_stacks called before thr_init").abort();
    }

    state::table().for_each(|rec_ptr| {
        // SAFETY: reachable from the table under the caller's lock.
        let rec: &ThreadRecord = unsafe { &*rec_ptr };
        if rec.flags.contains(flags::FINISHED) {
            return;
        }
        let lo = rec.stack_ptr.load(Ordering::Acquire);
        let hi = rec.stack_end.load(Ordering::Acquire);
        if lo == 0 || hi == 0 || lo > hi {
            FatalError::Invariant("thread has no usable stack range").abort();
        }
        hooks::hooks().push_stack_range(lo as *mut core::ffi::c_void, hi as *mut core::ffi::c_void);
    });
}
