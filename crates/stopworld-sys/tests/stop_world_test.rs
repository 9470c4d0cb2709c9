#![cfg(target_os = "linux")]
//! Integration tests for the full stop/start handshake against real
//! OS threads (§8 scenarios).
//!
//! The subsystem under test is process-global (one thread table, one
//! pair of installed signal handlers, one set of collector hooks), so
//! every test in this file serializes behind [`GUARD`] rather than
//! relying on `cargo test`'s default of running test functions on
//! separate threads within the same process.

use core::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use stopworld_core::hooks::{install_hooks, CollectorHooks};
use stopworld_core::AllocKind;

struct TestHooks {
    ranges: Mutex<Vec<(usize, usize)>>,
}

impl CollectorHooks for TestHooks {
    fn allocate_inner(&self, size: usize, _kind: AllocKind) -> *mut c_void {
        let layout = std::alloc::Layout::from_size_align(size, 16).expect("valid layout");
        // SAFETY: layout has non-zero size; this subsystem never frees
        // thread records, so a plain leak-forever allocator is enough.
        unsafe { std::alloc::alloc(layout).cast() }
    }

    fn push_stack_range(&self, lo: *mut c_void, hi: *mut c_void) {
        self.ranges.lock().unwrap().push((lo as usize, hi as usize));
    }

    fn primordial_stack_bottom(&self) -> *mut c_void {
        // Not exact, but good enough for the sanity checks these tests
        // perform: any high, thread-local stack address works as a
        // stand-in origin.
        let local = 0u8;
        (&local as *const u8 as usize + 1) as *mut c_void
    }

    fn approx_current_sp(&self) -> *mut c_void {
        let local = 0u8;
        &local as *const u8 as *mut c_void
    }
}

static HOOKS: TestHooks = TestHooks {
    ranges: Mutex::new(Vec::new()),
};
static GUARD: Mutex<()> = Mutex::new(());

fn setup() -> MutexGuard<'static, ()> {
    let guard = GUARD.lock().unwrap();
    if !stopworld_core::hooks::hooks_installed() {
        install_hooks(&HOOKS);
    }
    HOOKS.ranges.lock().unwrap().clear();
    stopworld_sys::thr_init();
    guard
}

#[test]
fn single_thread_bootstrap_and_collection_cycle() {
    // §8 scenario 1: after thr_init, the primordial thread's record
    // carries MAIN_THREAD | DETACHED, and a bare stop/start cycle
    // returns promptly without involving any peer.
    let _g = setup();

    let id = stopworld_sys::state::current_thread_id();
    let rec_ptr = stopworld_sys::state::table().lookup_thread(id);
    assert!(!rec_ptr.is_null(), "primordial thread must have a record");
    // SAFETY: reachable from the table; no concurrent mutation while
    // the test holds GUARD.
    let flags = unsafe { (*rec_ptr).flags.get() };
    assert_eq!(
        flags,
        stopworld_core::flags::MAIN_THREAD | stopworld_core::flags::DETACHED,
        "primordial thread record must be MAIN_THREAD | DETACHED"
    );

    stopworld_sys::begin_collection();
    let ranges = HOOKS.ranges.lock().unwrap().clone();
    assert_eq!(ranges.len(), 1, "only the calling thread is registered");
    drop(ranges);
    stopworld_sys::end_collection();
}

// A single process-wide counter every worker thread hammers on, used
// to exercise the §4.4/§8 scenario 2 progress check: registered once
// via `set_progress_counter`, it must read as unchanged across a
// stop/start cycle even while workers are busy-looping outside it.
static MUTATOR_PROGRESS: AtomicUsize = AtomicUsize::new(0);

#[test]
fn two_busy_workers_are_stopped_and_resumed() {
    let _g = setup();
    stopworld_sys::set_progress_counter(&MUTATOR_PROGRESS);

    let counters: Vec<_> = (0..2).map(|_| std::sync::Arc::new(AtomicUsize::new(0))).collect();
    let mut handles = Vec::new();
    for counter in &counters {
        let counter = std::sync::Arc::clone(counter);
        handles.push(std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_millis(500);
            while std::time::Instant::now() < deadline {
                counter.fetch_add(1, Ordering::Relaxed);
                MUTATOR_PROGRESS.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    // Give the workers a moment to register themselves and start spinning.
    std::thread::sleep(Duration::from_millis(20));

    // §8 scenario 2: snapshot c = c0, hold the world stopped for a
    // while, then observe c == c0 throughout the window.
    let before = MUTATOR_PROGRESS.load(Ordering::Relaxed);
    stopworld_sys::begin_collection();
    let ranges = HOOKS.ranges.lock().unwrap().clone();
    // The calling thread plus both workers.
    assert_eq!(ranges.len(), 3);
    for (lo, hi) in &ranges {
        assert!(lo <= hi, "stack range must not be inverted");
    }
    std::thread::sleep(Duration::from_millis(100));
    let during = MUTATOR_PROGRESS.load(Ordering::Relaxed);
    assert_eq!(
        during, before,
        "mutator counter must not advance while the world is stopped"
    );
    // `end_collection` re-checks this same invariant internally and
    // would abort the process on a violation; reaching here is itself
    // part of the assertion.
    stopworld_sys::end_collection();

    for h in handles {
        h.join().unwrap();
    }
    let after = MUTATOR_PROGRESS.load(Ordering::Relaxed);
    assert!(after > before, "workers resumed and made progress after restart");
    for counter in &counters {
        assert!(counter.load(Ordering::Relaxed) > 0, "workers made progress");
    }
}

#[test]
fn stop_during_blocking_syscall_does_not_wedge_the_sleeper() {
    let _g = setup();

    let handle = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(200));
    });
    std::thread::sleep(Duration::from_millis(20));

    stopworld_sys::begin_collection();
    stopworld_sys::end_collection();

    // SA_RESTART means the suspend signal must not cause the sleeping
    // thread to wake early with a truncated sleep; join simply
    // succeeding (rather than hanging or panicking) is the assertion.
    handle.join().unwrap();
}

#[test]
fn sigmask_interceptor_never_leaves_suspend_blocked() {
    // §8 scenario 5: a client that tries to block SIG_SUSPEND (along
    // with other signals) on its own thread must find it still
    // deliverable afterwards, while the rest of its requested mask
    // takes effect normally.
    let _g = setup();

    let handle = std::thread::spawn(|| {
        // SAFETY: `set`/`oset` are fully populated before use.
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        let mut oset: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, stopworld_sys::signal::SIG_SUSPEND);
            libc::sigaddset(&mut set, libc::SIGUSR2);
            let rc = stopworld_sys::sigmask(libc::SIG_BLOCK, &set, &mut oset);
            assert_eq!(rc, 0);

            let mut effective: libc::sigset_t = unsafe { std::mem::zeroed() };
            libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut effective);
            assert_eq!(
                libc::sigismember(&effective, stopworld_sys::signal::SIG_SUSPEND),
                0,
                "sigmask must never leave SIG_SUSPEND blocked"
            );
            assert_eq!(
                libc::sigismember(&effective, libc::SIGUSR2),
                1,
                "the client's other requested signals must still be blocked"
            );

            let rc = stopworld_sys::sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
            assert_eq!(rc, 0);
        }
    });
    handle.join().unwrap();
}

#[test]
fn detached_thread_self_deletes_after_finishing() {
    let _g = setup();

    extern "C" fn noop(_: *mut c_void) -> *mut c_void {
        std::ptr::null_mut()
    }

    let before = HOOKS.ranges.lock().unwrap().len();
    let _ = before;

    let id = stopworld_sys::create_thread(noop, std::ptr::null_mut(), true)
        .expect("detached thread creation should succeed");
    let _ = id;

    // Give the detached thread time to run to completion and remove
    // its own table entry.
    std::thread::sleep(Duration::from_millis(50));

    stopworld_sys::begin_collection();
    let ranges = HOOKS.ranges.lock().unwrap().clone();
    // Only the calling thread remains registered; the finished
    // detached thread removed itself.
    assert_eq!(ranges.len(), 1);
    stopworld_sys::end_collection();
}

#[test]
fn joinable_thread_record_is_removed_after_join() {
    let _g = setup();

    extern "C" fn returns_marker(_: *mut c_void) -> *mut c_void {
        42 as *mut c_void
    }

    let id = stopworld_sys::create_thread(returns_marker, std::ptr::null_mut(), false)
        .expect("joinable thread creation should succeed");

    let result = stopworld_sys::join(id).expect("join should succeed");
    assert_eq!(result as usize, 42);

    stopworld_sys::begin_collection();
    let ranges = HOOKS.ranges.lock().unwrap().clone();
    assert_eq!(ranges.len(), 1, "joined thread's record was removed");
    stopworld_sys::end_collection();
}
