//! Thread-creation/termination interception and subsystem bootstrap
//! (§4.6, §9).
//!
//! `thr_init` is split into a lock-assuming inner path and a
//! lock-acquiring public wrapper (§9, resolved Open Question): every
//! entry point that depends on the table and the signal handlers being
//! set up either already holds the allocation lock when it gets there
//! (`create_thread`, which must hold the lock anyway to register the
//! new thread) or acquires it explicitly (direct callers of
//! `thr_init`). Nothing silently re-enters the lock.

use core::ffi::c_void;
use core::mem::MaybeUninit;
use core::sync::atomic::Ordering;
use std::ptr;
use stopworld_core::record::ThreadRecord;
use stopworld_core::{flags, hooks, ClientError, FatalError, ThreadId};

use crate::{controller, signal, stack, state};

/// Stack size given to every thread this subsystem creates. Chosen to
/// match the original source's default rather than deferring to the
/// platform default, so stack ranges stay predictable across targets.
pub const THREAD_STACK_SIZE_MAX: usize = 2 * 1024 * 1024;

/// Run the lock-assuming half of initialization: install the signal
/// handlers, initialize the handshake semaphore, and register the
/// calling thread (almost always the primordial thread) in the table.
/// Idempotent.
///
/// # Safety
/// The caller must already hold the allocation lock.
unsafe fn thr_init_locked() {
    if state::is_initialized() {
        return;
    }

    signal::install_handler(signal::SIG_SUSPEND, signal::suspend_handler, signal::SIG_RESTART);
    signal::install_handler(signal::SIG_RESTART, signal::restart_handler, signal::SIG_RESTART);
    // SAFETY: this runs exactly once, here, before any thread can call
    // stop_world/start_world (both gated behind is_initialized below).
    unsafe {
        controller::init_handshake();
    }

    let id = state::current_thread_id();
    let rec_ptr = state::table().new_thread(id, flags::MAIN_THREAD | flags::DETACHED);
    if rec_ptr.is_null() {
        FatalError::Configuration("failed to allocate the primordial thread record").abort();
    }
    // SAFETY: rec_ptr was just published into the table by this thread
    // and is not yet visible to a signal handler (bound below).
    let rec: &ThreadRecord = unsafe { &*rec_ptr };
    rec.stack_end
        .store(hooks::hooks().primordial_stack_bottom() as usize, Ordering::Release);
    rec.stack_ptr
        .store(hooks::hooks().approx_current_sp() as usize, Ordering::Release);
    signal::bind_self_record(rec_ptr);

    state::mark_initialized();
}

/// Ensure the subsystem is initialized, assuming the caller already
/// holds the allocation lock. Used by `create_thread`, which must hold
/// the lock regardless to register its new thread.
pub(crate) fn ensure_initialized_locked() {
    // SAFETY: documented precondition of this function.
    unsafe { thr_init_locked() };
}

/// Public entry point for hosts that want to initialize this subsystem
/// before creating any threads through it, rather than relying on the
/// first `create_thread`/collection cycle to do it implicitly.
pub fn thr_init() {
    state::lock().acquire();
    ensure_initialized_locked();
    state::lock().release();
}

/// Per-thread bootstrap payload, handed to [`bootstrap_trampoline`]
/// through the one raw pointer `pthread_create` allows.
struct StartInfo {
    start: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
    detached: bool,
}

fn zeroed_attr() -> libc::pthread_attr_t {
    // SAFETY: a zeroed `pthread_attr_t` is always passed to
    // `pthread_attr_init` before any other attribute function reads it.
    unsafe { MaybeUninit::zeroed().assume_init() }
}

/// Create a new thread running `start(arg)`, registering it in the
/// thread table before `pthread_create` returns (§4.6).
pub fn create_thread(
    start: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
    detached: bool,
) -> Result<ThreadId, ClientError> {
    let info = Box::into_raw(Box::new(StartInfo {
        start,
        arg,
        detached,
    }));

    let mut attr = zeroed_attr();
    // SAFETY: `attr` is valid storage; every attribute function below
    // is given a pointer to it and nothing else aliases it.
    unsafe {
        libc::pthread_attr_init(&mut attr);
        libc::pthread_attr_setstacksize(&mut attr, THREAD_STACK_SIZE_MAX);
        if detached {
            libc::pthread_attr_setdetachstate(&mut attr, libc::PTHREAD_CREATE_DETACHED);
        }
    }

    state::lock().acquire();
    ensure_initialized_locked();

    let mut native: libc::pthread_t = unsafe { MaybeUninit::zeroed().assume_init() };
    // SAFETY: `native`, `attr`, and `bootstrap_trampoline` are all
    // valid for the duration of this call; `info` is a pointer this
    // module alone owns until the new thread takes it back.
    let rc = unsafe {
        libc::pthread_create(
            &mut native,
            &attr,
            bootstrap_trampoline,
            info.cast::<c_void>(),
        )
    };
    // SAFETY: `attr` was initialized above and is no longer needed.
    unsafe {
        libc::pthread_attr_destroy(&mut attr);
    }

    if rc != 0 {
        state::lock().release();
        // SAFETY: pthread_create failed, so the new thread never took
        // ownership of `info`; reclaim it here instead of leaking.
        unsafe {
            drop(Box::from_raw(info));
        }
        return Err(ClientError::from_errno(rc));
    }

    let id = ThreadId(native as usize);
    let bits = if detached { flags::DETACHED } else { 0 };
    let rec_ptr = state::table().new_thread(id, bits);
    state::lock().release();

    if rec_ptr.is_null() {
        FatalError::Configuration("failed to allocate a thread record").abort();
    }
    Ok(id)
}

/// Unblock `SIG_SUSPEND` for the calling thread. New threads are
/// created with it blocked (inherited from whatever mask the creating
/// thread happened to have — this subsystem does not itself block it
/// in the parent, since `pthread_create` already defers all signal
/// delivery until the child has a valid context) so the child gets a
/// chance to bind its own record and discover its stack extent before
/// it can be targeted by a stop.
fn unblock_suspend_signal() {
    let mut set: libc::sigset_t = unsafe { MaybeUninit::zeroed().assume_init() };
    // SAFETY: `set` is valid storage, populated immediately below.
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal::SIG_SUSPEND);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
    }
}

/// Entry point `pthread_create` actually calls. Binds the new thread's
/// own record, discovers its real stack extent from the platform,
/// then runs the user routine and publishes its result.
extern "C" fn bootstrap_trampoline(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the pointer `create_thread` produced via
    // `Box::into_raw`, passed through `pthread_create` untouched.
    let info = unsafe { Box::from_raw(arg.cast::<StartInfo>()) };
    let StartInfo {
        start,
        arg: user_arg,
        detached,
    } = *info;

    let id = state::current_thread_id();
    state::lock().acquire();
    let rec_ptr = state::table().lookup_thread(id);
    state::lock().release();
    if rec_ptr.is_null() {
        FatalError::Invariant("new thread has no table record").abort();
    }
    // SAFETY: the record was published by `create_thread` before this
    // thread could possibly run, and is never deallocated.
    let rec: &ThreadRecord = unsafe { &*rec_ptr };

    let mut attr = zeroed_attr();
    let mut stack_addr: *mut c_void = ptr::null_mut();
    let mut stack_size: usize = 0;
    // SAFETY: `attr`, `stack_addr`, `stack_size` are valid storage;
    // `pthread_getattr_np` is called on the current thread.
    unsafe {
        libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
    }
    let stack_end = stack_addr as usize + stack_size;
    rec.stack_end.store(stack_end, Ordering::Release);
    rec.stack_ptr
        .store(hooks::hooks().approx_current_sp() as usize, Ordering::Release);

    signal::bind_self_record(rec_ptr);
    unblock_suspend_signal();

    let result = start(user_arg);

    rec.set_status(result);
    rec.flags.insert(flags::FINISHED);

    if detached {
        state::lock().acquire();
        state::table().delete_specific(id, rec_ptr);
        state::lock().release();
    }

    result
}

/// Shadow `pthread_sigmask` so client code can never permanently mask
/// off `SIG_SUSPEND` on its own thread (§4.6, §3 invariant 5).
///
/// When `set` is non-null and `how` would add signals to the blocked
/// set (`SIG_BLOCK` or `SIG_SETMASK`), a copy of `set` has `SIG_SUSPEND`
/// forcibly removed before being passed to the underlying primitive.
/// `SIG_UNBLOCK` is passed through unchanged — unblocking can never
/// re-mask the signal. The client's intent for every other signal is
/// preserved exactly.
///
/// # Safety
/// `set` and `oset`, when non-null, must point at valid `sigset_t`
/// storage for the duration of the call, exactly as required by
/// `pthread_sigmask` itself.
pub unsafe fn sigmask(
    how: core::ffi::c_int,
    set: *const libc::sigset_t,
    oset: *mut libc::sigset_t,
) -> core::ffi::c_int {
    if set.is_null() || how == libc::SIG_UNBLOCK {
        // SAFETY: caller's contract; passed through unchanged.
        return unsafe { libc::pthread_sigmask(how, set, oset) };
    }

    // SAFETY: `set` is non-null and valid per the caller's contract.
    let mut copy: libc::sigset_t = unsafe { *set };
    // SAFETY: `copy` is a valid, already-initialized sigset_t.
    unsafe {
        libc::sigdelset(&mut copy, signal::SIG_SUSPEND);
        libc::pthread_sigmask(how, &copy, oset)
    }
}

/// Join a thread created with `detached = false`, returning the value
/// its routine returned and removing its table entry.
///
/// The record is looked up and captured *before* the underlying join,
/// not after (§4.6 step 3): by the time `pthread_join` returns, the
/// kernel may already have recycled `id` for a newly created thread,
/// at which point a fresh `lookup_thread(id)` would resolve to that
/// new, unrelated record rather than the one this call is meant to
/// reap — deleting it by pointer identity instead avoids that race.
pub fn join(id: ThreadId) -> Result<*mut c_void, ClientError> {
    state::lock().acquire();
    let rec_ptr = state::table().lookup_thread(id);
    if rec_ptr.is_null() {
        state::lock().release();
        FatalError::Invariant("join: no table record for this thread id").abort();
    }
    state::lock().release();

    let native = state::raw_pthread(id);
    let mut retval: *mut c_void = ptr::null_mut();
    // SAFETY: `native` identifies a joinable thread this process
    // created; `retval` is valid storage for the result.
    let rc = unsafe { libc::pthread_join(native, &mut retval) };
    if rc != 0 {
        return Err(ClientError::from_errno(rc));
    }

    state::lock().acquire();
    state::table().delete_specific(id, rec_ptr);
    state::lock().release();

    Ok(retval)
}
