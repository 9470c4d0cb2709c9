//! The suspend/restart signal protocol (§4.3).
//!
//! `SIG_SUSPEND` is `SIGPWR` and `SIG_RESTART` is `SIGCONT` — a
//! concrete choice carried forward from the Boehm GC source this
//! subsystem's design is based on, not re-derived from the abstract
//! "two distinct async signals" requirement. Both signals are
//! installed with `SA_RESTART` and a mask that blocks every signal
//! except the other one of the pair, so a suspended thread's
//! `sigsuspend` can only be woken by the restart signal.

use core::cell::Cell;
use core::ffi::c_int;
use core::mem::MaybeUninit;
use core::sync::atomic::Ordering;
use stopworld_core::record::ThreadRecord;
use stopworld_core::{hooks, FatalError};

/// Signal used to ask a thread to stop and publish its stack range.
pub const SIG_SUSPEND: c_int = libc::SIGPWR;
/// Signal used to release a suspended thread.
pub const SIG_RESTART: c_int = libc::SIGCONT;

thread_local! {
    /// The calling thread's own record, bound once at thread-entry
    /// time (§9) so the suspend/restart handlers never walk the
    /// shared thread table — a signal handler that acquires the
    /// allocation lock (held by the very thread requesting suspension
    /// in the first place) would deadlock the whole process.
    static MY_RECORD: Cell<*mut ThreadRecord> = const { Cell::new(core::ptr::null_mut()) };
}

/// Bind the calling thread's own record for later use by the signal
/// handlers. Must be called before this thread can receive
/// `SIG_SUSPEND` — i.e. before it is linked into the thread table.
pub fn bind_self_record(record: *mut ThreadRecord) {
    MY_RECORD.with(|cell| cell.set(record));
}

/// The calling thread's own bound record. Fatal-aborts if none was
/// ever bound — this is always a configuration error, since every
/// thread created or adopted by this subsystem binds one before it
/// can be targeted by a signal.
fn self_record() -> &'static ThreadRecord {
    let ptr = MY_RECORD.with(Cell::get);
    if ptr.is_null() {
        FatalError::Invariant("signal delivered to a thread with no bound record").abort();
    }
    // SAFETY: a bound record outlives the thread that bound it — it is
    // only unlinked from the table, never deallocated, by this
    // subsystem's design (§3, §6).
    unsafe { &*ptr }
}

/// Handshake semaphore: the target thread posts it once after
/// capturing its stack range, and again after observing the restart
/// signal, so the controller can wait out both halves of the protocol
/// without spinning.
pub struct Handshake(libc::sem_t);

// SAFETY: `sem_t` is safe to share between threads; all access here
// goes through the `libc` semaphore functions, which are themselves
// thread-safe.
unsafe impl Sync for Handshake {}

impl Handshake {
    /// # Safety
    /// Must be called exactly once, before any thread posts or waits
    /// on it.
    pub unsafe fn init(&self) {
        let sem = core::ptr::addr_of!(self.0) as *mut libc::sem_t;
        // SAFETY: caller guarantees single initialization; `sem` points
        // at valid, properly aligned storage for the lifetime of the
        // process.
        if unsafe { libc::sem_init(sem, 0, 0) } != 0 {
            FatalError::Configuration("sem_init failed").abort();
        }
    }

    pub fn post(&self) {
        let sem = core::ptr::addr_of!(self.0) as *mut libc::sem_t;
        // SAFETY: `sem` was initialized by `init` before any caller
        // could reach this method.
        if unsafe { libc::sem_post(sem) } != 0 {
            FatalError::Invariant("sem_post failed").abort();
        }
    }

    /// Block until a matching `post`. Retries transparently on
    /// `EINTR`, since a `sem_wait` interrupted by an unrelated signal
    /// is not a protocol violation.
    pub fn wait(&self) {
        let sem = core::ptr::addr_of!(self.0) as *mut libc::sem_t;
        loop {
            // SAFETY: see `post`.
            let rc = unsafe { libc::sem_wait(sem) };
            if rc == 0 {
                return;
            }
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            if errno != libc::EINTR {
                FatalError::Invariant("sem_wait failed").abort();
            }
        }
    }
}

/// Construct an uninitialized handshake semaphore suitable for
/// `static` storage. Callers must run [`Handshake::init`] once before
/// first use.
#[must_use]
pub const fn handshake() -> Handshake {
    // SAFETY: zero-initialized `sem_t` is a valid bit pattern to hand
    // to `sem_init`, which every caller of `handshake()` is required
    // to run before first `post`/`wait`.
    Handshake(unsafe { MaybeUninit::<libc::sem_t>::zeroed().assume_init() })
}

/// Build the signal mask used by both handlers: everything blocked
/// except the other half of the suspend/restart pair, so a suspended
/// thread's `sigsuspend` can only be interrupted by its release.
fn handler_mask(keep_open: c_int) -> libc::sigset_t {
    // SAFETY: `sigset_t` has no invalid bit patterns once fully
    // populated by `sigfillset`/`sigdelset` below.
    let mut set: libc::sigset_t = unsafe { MaybeUninit::zeroed().assume_init() };
    // SAFETY: `set` is valid, suitably sized storage.
    unsafe {
        libc::sigfillset(&mut set);
        libc::sigdelset(&mut set, keep_open);
    }
    set
}

/// Install `handler` for `signum` with `SA_RESTART` and a mask that
/// leaves `keep_open` deliverable. Used for both `SIG_SUSPEND` and
/// `SIG_RESTART`.
pub fn install_handler(signum: c_int, handler: extern "C" fn(c_int), keep_open: c_int) {
    // SAFETY: `act` is fully populated below before being passed to
    // `sigaction`.
    let mut act: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
    act.sa_sigaction = handler as usize;
    act.sa_mask = handler_mask(keep_open);
    act.sa_flags = libc::SA_RESTART;
    // SAFETY: `act` is a valid, fully initialized `sigaction`; the old
    // handler is discarded, which is fine since this subsystem owns
    // both signal numbers for the lifetime of the process.
    let rc = unsafe { libc::sigaction(signum, &act, core::ptr::null_mut()) };
    if rc != 0 {
        FatalError::Configuration("sigaction installation failed").abort();
    }
}

/// Handler for `SIG_SUSPEND`. Captures the thread's approximate stack
/// pointer, acknowledges suspension, then blocks in `sigsuspend` until
/// `SIG_RESTART` has been observed.
pub extern "C" fn suspend_handler(sig: c_int) {
    if sig != SIG_SUSPEND {
        FatalError::Invariant("suspend handler invoked for the wrong signal").abort();
    }
    let rec = self_record();
    rec.stack_ptr
        .store(hooks::hooks().approx_current_sp() as usize, Ordering::Release);

    crate::controller::suspend_ack().post();

    let mask = handler_mask(SIG_RESTART);
    loop {
        rec.signal.store(0, Ordering::Release);
        // SAFETY: `mask` blocks every signal but SIG_RESTART; this call
        // only returns once a deliverable signal has run its handler.
        unsafe {
            libc::sigsuspend(&mask);
        }
        if rec.signal.load(Ordering::Acquire) == SIG_RESTART {
            break;
        }
    }
}

/// Handler for `SIG_RESTART`. Records that this thread observed the
/// restart signal; the actual wakeup happens when `suspend_handler`'s
/// `sigsuspend` call returns.
pub extern "C" fn restart_handler(sig: c_int) {
    if sig != SIG_RESTART {
        FatalError::Invariant("restart handler invoked for the wrong signal").abort();
    }
    self_record().signal.store(SIG_RESTART, Ordering::Release);
}
