//! Adaptive test-and-set spin lock (§4.1).
//!
//! Protects the thread table and the allocator's internal state.
//! **Not reentrant** — the caller must track whether it already holds
//! it (the allocator holds it across its call into `stop_world`, so
//! the SUSPEND handler must never touch this lock at all). Safe to
//! take from any thread context except from inside the SUSPEND signal
//! handler.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Spin budget used when the last acquisition looked uncontended, or
/// while a collection is believed to be in progress.
const LOW_SPIN_MAX: u32 = 30;
/// Spin budget used after a previous acquisition succeeded by
/// spinning — evidence spinning pays off on this machine.
const HIGH_SPIN_MAX: u32 = 1000;

/// Hint set by long critical sections (a collection in progress). When
/// true, every `acquire` skips straight to the yield loop: spinning
/// against a holder that won't release for a while just burns CPU.
/// Global because it's observed by every lock, not owned by the one
/// currently held.
static COLLECTING: AtomicBool = AtomicBool::new(false);

/// Record whether the collector is in a long critical section.
pub fn set_collecting_hint(collecting: bool) {
    COLLECTING.store(collecting, Ordering::Release);
}

/// Current value of the collecting hint.
#[must_use]
pub fn collecting_hint() -> bool {
    COLLECTING.load(Ordering::Acquire)
}

#[inline]
fn test_and_set(word: &AtomicBool) -> bool {
    word.swap(true, Ordering::Acquire)
}

/// Test-and-set spin lock with adaptive back-off (§4.1).
pub struct AllocLock {
    locked: AtomicBool,
    spin_max: AtomicU32,
    last_spins: AtomicU32,
}

impl Default for AllocLock {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            spin_max: AtomicU32::new(LOW_SPIN_MAX),
            last_spins: AtomicU32::new(0),
        }
    }

    /// Acquire the lock: one fast test-and-set, then an adaptive spin
    /// budget, then a bounded `sched_yield`-style cooperative loop.
    pub fn acquire(&self) {
        if !test_and_set(&self.locked) {
            return;
        }

        if !collecting_hint() {
            let my_spin_max = self.spin_max.load(Ordering::Relaxed);
            let my_last_spins = self.last_spins.load(Ordering::Relaxed);

            for i in 0..my_spin_max {
                if collecting_hint() {
                    break;
                }
                if i < my_last_spins / 2 || self.locked.load(Ordering::Relaxed) {
                    core::hint::spin_loop();
                    continue;
                }
                if !test_and_set(&self.locked) {
                    // Spinning worked: we're probably not scheduled
                    // against the holder, so it pays to spin longer
                    // next time.
                    self.last_spins.store(i, Ordering::Relaxed);
                    self.spin_max.store(HIGH_SPIN_MAX, Ordering::Relaxed);
                    return;
                }
            }
            self.spin_max.store(LOW_SPIN_MAX, Ordering::Relaxed);
        }

        // We're probably being scheduled against the holder. Yield
        // instead of burning CPU.
        loop {
            if !test_and_set(&self.locked) {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Release the lock. The caller must currently hold it.
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Non-blocking probe. Not a substitute for ownership tracking —
    /// only tells you *someone* holds it — but good enough for
    /// `debug_assert!`s at entry points that require the caller to
    /// already hold the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}
