//! Thread record lifecycle flags (§3 Data Model).

use core::sync::atomic::{AtomicU32, Ordering};

/// The thread's user routine has returned; `status` holds its result.
pub const FINISHED: u32 = 1 << 0;
/// No one will join this thread; it deletes its own record on exit.
pub const DETACHED: u32 = 1 << 1;
/// This is the primordial thread, whose stack bottom is
/// `primordial_stack_bottom` rather than anything derivable
/// arithmetically.
pub const MAIN_THREAD: u32 = 1 << 2;

/// Atomic bitset of the flags above.
///
/// Every mutation happens with the allocation lock held (§3 invariant
/// 4), and bits are only ever added, never cleared concurrently, so
/// plain acquire/release atomics are enough — no CAS retry loop is
/// needed.
#[derive(Debug, Default)]
pub struct ThreadFlags(AtomicU32);

impl ThreadFlags {
    #[must_use]
    pub const fn new(bits: u32) -> Self {
        Self(AtomicU32::new(bits))
    }

    #[must_use]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn contains(&self, bit: u32) -> bool {
        self.get() & bit != 0
    }

    pub fn insert(&self, bit: u32) {
        self.0.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn set(&self, bits: u32) {
        self.0.store(bits, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_additive() {
        let f = ThreadFlags::new(0);
        f.insert(DETACHED);
        f.insert(MAIN_THREAD);
        assert!(f.contains(DETACHED));
        assert!(f.contains(MAIN_THREAD));
        assert!(!f.contains(FINISHED));
        assert_eq!(f.get(), DETACHED | MAIN_THREAD);
    }

    #[test]
    fn new_seeds_initial_bits() {
        let f = ThreadFlags::new(MAIN_THREAD | DETACHED);
        assert!(f.contains(MAIN_THREAD));
        assert!(f.contains(DETACHED));
    }
}
