//! Hash-bucketed thread table (§4.2).
//!
//! Each bucket is a singly linked list of [`ThreadRecord`]s, newest
//! insertion first. Head-most-match lookup is load-bearing, not just
//! an optimization: when a `pthread_t` value is recycled by the OS
//! after a detached thread exits and a new thread is created with the
//! same identity, the newest record for that id is always the live
//! one (§3 invariant on identity recycling).

#![allow(unsafe_code)]

use crate::hooks::{hooks, AllocKind};
use crate::record::{ThreadId, ThreadRecord};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Number of buckets. Must stay a power of two — [`ThreadId::bucket`]
/// masks rather than mods.
pub const TABLE_SIZE: usize = 128;

/// Storage for the static first-record slot. A bare `static
/// ThreadRecord` can't be written through a shared reference even once
/// — the `id` field has no interior mutability of its own — so the
/// slot is wrapped in `UnsafeCell` and guarded by [`FIRST_RECORD_USED`]
/// the same way `ThreadRecord` itself guards `status`.
struct FirstRecordSlot(UnsafeCell<ThreadRecord>);

// SAFETY: access is gated by a compare-exchange on FIRST_RECORD_USED;
// only the thread that wins the exchange touches the cell's contents
// before publishing it into a bucket, and every later access goes
// through the record's own atomic fields.
unsafe impl Sync for FirstRecordSlot {}

/// The very first thread record (almost always the primordial thread)
/// is carved out of static storage rather than allocated, so the table
/// can hand out a record before the host's allocator hooks are even
/// installed (§9, carried from the original source's `first_thread`
/// static).
static FIRST_RECORD_USED: AtomicBool = AtomicBool::new(false);
static FIRST_RECORD: FirstRecordSlot = FirstRecordSlot(UnsafeCell::new(ThreadRecord::new(ThreadId(0), 0)));

/// Allocate and placement-initialize a record through the collector's
/// `allocate_inner` hook. Returns null if the allocator is exhausted
/// or misaligned memory is returned.
fn alloc_via_hooks(id: ThreadId, flags: u32) -> *mut ThreadRecord {
    let raw = hooks().allocate_inner(core::mem::size_of::<ThreadRecord>(), AllocKind::ThreadRecord);
    if raw.is_null() {
        return ptr::null_mut();
    }
    let rec = raw.cast::<ThreadRecord>();
    if rec.align_offset(core::mem::align_of::<ThreadRecord>()) != 0 {
        return ptr::null_mut();
    }
    // SAFETY: `raw` is a fresh, suitably sized allocation from the
    // collector's own inner allocator, not yet aliased by anyone; we
    // own it until it's published into a bucket.
    unsafe {
        ptr::write(rec, ThreadRecord::new(id, flags));
    }
    rec
}

/// Claim the static first-record slot, if it hasn't been claimed yet.
fn try_claim_first_record(id: ThreadId, flags: u32) -> Option<*mut ThreadRecord> {
    if FIRST_RECORD_USED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        let rec = FIRST_RECORD.0.get();
        // SAFETY: we just won the compare-exchange, so no other caller
        // can be touching FIRST_RECORD's fields; this is the only
        // write before the record is published into a bucket.
        unsafe {
            ptr::write(ptr::addr_of_mut!((*rec).id), id);
            (*rec).flags.set(flags);
        }
        Some(rec)
    } else {
        None
    }
}

/// Hash-bucketed multimap from [`ThreadId`] to live [`ThreadRecord`]s.
///
/// Callers must hold the allocation lock for every mutating operation
/// (`new_thread`, `delete_thread`, `delete_specific`) — this type
/// performs no locking of its own, matching §3's invariant that the
/// table is only ever mutated with that lock held.
pub struct ThreadTable {
    buckets: [AtomicPtr<ThreadRecord>; TABLE_SIZE],
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadTable {
    #[must_use]
    pub const fn new() -> Self {
        const NULL: AtomicPtr<ThreadRecord> = AtomicPtr::new(ptr::null_mut());
        Self {
            buckets: [NULL; TABLE_SIZE],
        }
    }

    /// Insert a new record for `id`, linking it at the head of its
    /// bucket so it shadows any stale record left behind by a recycled
    /// identity. Returns null if allocation fails.
    pub fn new_thread(&self, id: ThreadId, flags: u32) -> *mut ThreadRecord {
        let rec = try_claim_first_record(id, flags).unwrap_or_else(|| alloc_via_hooks(id, flags));
        if rec.is_null() {
            return ptr::null_mut();
        }

        let bucket = &self.buckets[id.bucket(TABLE_SIZE)];
        let mut head = bucket.load(Ordering::Acquire);
        loop {
            // SAFETY: rec was just allocated/claimed and not yet
            // published; we are its sole owner at this point.
            unsafe {
                (*rec).next.store(head, Ordering::Relaxed);
            }
            match bucket.compare_exchange_weak(head, rec, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return rec,
                Err(actual) => head = actual,
            }
        }
    }

    /// Return the head-most (newest) record for `id`, or null if none
    /// is present.
    #[must_use]
    pub fn lookup_thread(&self, id: ThreadId) -> *mut ThreadRecord {
        let bucket = &self.buckets[id.bucket(TABLE_SIZE)];
        let mut cur = bucket.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: records are never freed while reachable from a
            // bucket; the allocation lock the caller holds prevents
            // concurrent unlinking during this walk.
            let rec = unsafe { &*cur };
            if rec.id == id {
                return cur;
            }
            cur = rec.next.load(Ordering::Acquire);
        }
        ptr::null_mut()
    }

    /// Remove the newest record for `id`. Fatal-aborts if none exists
    /// — callers are expected to check with `lookup_thread` first if
    /// absence is a possibility they handle, matching §7's "deleting a
    /// record that was never inserted" invariant violation.
    pub fn delete_thread(&self, id: ThreadId) {
        let bucket = &self.buckets[id.bucket(TABLE_SIZE)];
        let mut prev: *mut ThreadRecord = ptr::null_mut();
        let mut cur = bucket.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: see lookup_thread.
            let rec = unsafe { &*cur };
            if rec.id == id {
                self.unlink(bucket, prev, cur, rec.next.load(Ordering::Acquire));
                return;
            }
            prev = cur;
            cur = rec.next.load(Ordering::Acquire);
        }
        crate::error::FatalError::Invariant("delete_thread: record not present").abort();
    }

    /// Remove a specific record by pointer identity rather than by
    /// newest-match, for the case where the caller already holds the
    /// exact record (e.g. a thread deleting its own record on exit
    /// while an unrelated, newer record for a recycled id might have
    /// since been inserted).
    pub fn delete_specific(&self, id: ThreadId, record: *mut ThreadRecord) {
        let bucket = &self.buckets[id.bucket(TABLE_SIZE)];
        let mut prev: *mut ThreadRecord = ptr::null_mut();
        let mut cur = bucket.load(Ordering::Acquire);
        while !cur.is_null() {
            if cur == record {
                // SAFETY: see lookup_thread.
                let next = unsafe { (*cur).next.load(Ordering::Acquire) };
                self.unlink(bucket, prev, cur, next);
                return;
            }
            // SAFETY: see lookup_thread.
            prev = cur;
            cur = unsafe { (*cur).next.load(Ordering::Acquire) };
        }
        crate::error::FatalError::Invariant("delete_specific: record not present").abort();
    }

    fn unlink(
        &self,
        bucket: &AtomicPtr<ThreadRecord>,
        prev: *mut ThreadRecord,
        cur: *mut ThreadRecord,
        next: *mut ThreadRecord,
    ) {
        if prev.is_null() {
            bucket.store(next, Ordering::Release);
        } else {
            // SAFETY: prev is still linked into this bucket by the
            // caller's own traversal, under the allocation lock.
            unsafe {
                (*prev).next.store(next, Ordering::Release);
            }
        }
        let _ = cur;
    }

    /// Visit every live record across all buckets. Used by the
    /// stop/start controller to signal each thread and by the stack
    /// enumerator to push each thread's range; callers must hold the
    /// allocation lock for the duration.
    pub fn for_each(&self, mut f: impl FnMut(*mut ThreadRecord)) {
        for bucket in &self.buckets {
            let mut cur = bucket.load(Ordering::Acquire);
            while !cur.is_null() {
                f(cur);
                // SAFETY: see lookup_thread.
                cur = unsafe { (*cur).next.load(Ordering::Acquire) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{install_hooks, CollectorHooks};
    use core::ffi::c_void;
    use std::alloc::{alloc, Layout};
    use std::sync::Mutex;

    struct LeakyHooks;

    impl CollectorHooks for LeakyHooks {
        fn allocate_inner(&self, size: usize, _kind: AllocKind) -> *mut c_void {
            // Test-only: leak rather than track frees, since this
            // table never frees a record either.
            let layout = Layout::from_size_align(size, core::mem::align_of::<ThreadRecord>())
                .expect("valid layout");
            // SAFETY: layout has non-zero size.
            unsafe { alloc(layout).cast() }
        }
        fn push_stack_range(&self, _lo: *mut c_void, _hi: *mut c_void) {}
        fn primordial_stack_bottom(&self) -> *mut c_void {
            ptr::null_mut()
        }
        fn approx_current_sp(&self) -> *mut c_void {
            ptr::null_mut()
        }
    }

    static LEAKY_HOOKS: LeakyHooks = LeakyHooks;
    static GUARD: Mutex<()> = Mutex::new(());

    fn ensure_hooks() {
        if !crate::hooks::hooks_installed() {
            install_hooks(&LEAKY_HOOKS);
        }
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let _g = GUARD.lock().unwrap();
        ensure_hooks();
        let table = ThreadTable::new();
        let rec = table.new_thread(ThreadId(5), 0);
        assert!(!rec.is_null());
        let found = table.lookup_thread(ThreadId(5));
        assert_eq!(found, rec);
    }

    #[test]
    fn newest_insertion_shadows_recycled_identity() {
        let _g = GUARD.lock().unwrap();
        ensure_hooks();
        let table = ThreadTable::new();
        let old = table.new_thread(ThreadId(99), 0);
        let new = table.new_thread(ThreadId(99), 0);
        assert_ne!(old, new);
        assert_eq!(table.lookup_thread(ThreadId(99)), new);
    }

    #[test]
    fn delete_specific_removes_only_that_record() {
        let _g = GUARD.lock().unwrap();
        ensure_hooks();
        let table = ThreadTable::new();
        let old = table.new_thread(ThreadId(7), 0);
        let new = table.new_thread(ThreadId(7), 0);
        table.delete_specific(ThreadId(7), old);
        assert_eq!(table.lookup_thread(ThreadId(7)), new);
    }

    #[test]
    fn for_each_visits_every_bucket_entry() {
        let _g = GUARD.lock().unwrap();
        ensure_hooks();
        let table = ThreadTable::new();
        table.new_thread(ThreadId(1), 0);
        table.new_thread(ThreadId(2), 0);
        table.new_thread(ThreadId(129), 0); // same bucket as id 1
        let mut count = 0;
        table.for_each(|_| count += 1);
        assert_eq!(count, 3);
    }
}
