//! External collaborators (§1, §6).
//!
//! This subsystem is a stop-the-world *protocol*, not a collector: it
//! reaches into the mark/sweep heap and the conservative stack scanner
//! through a single trait object rather than linking either directly.
//! A heap and a scanner are not provided by this crate — only the test
//! suite's stand-ins implement `CollectorHooks`.

use core::ffi::c_void;
use std::sync::OnceLock;

/// Allocation request kind, passed through to `allocate_inner`
/// unchanged. A single variant today; kept as an enum rather than a
/// bare size so a real collector can distinguish record allocations
/// from other internal allocations without a second entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// A thread table record.
    ThreadRecord,
}

/// The operations this subsystem needs from its heap and its
/// conservative stack scanner, and can't provide itself (§1 Non-goals,
/// §6).
///
/// `allocate_inner` must be safe to call with the allocation lock
/// already held by the caller — it is the collector's own internal
/// allocation path, distinct from whatever public `malloc` surface it
/// exposes elsewhere, and must not itself try to reacquire that lock.
pub trait CollectorHooks: Send + Sync {
    /// Allocate `size` bytes for internal bookkeeping, returning a
    /// null pointer on failure. Called with the allocation lock held.
    fn allocate_inner(&self, size: usize, kind: AllocKind) -> *mut c_void;

    /// Register `[lo, hi)` as a range of conservative roots to scan.
    fn push_stack_range(&self, lo: *mut c_void, hi: *mut c_void);

    /// The stack bottom of the thread that called the collector's
    /// startup routine, for which no arithmetic derivation of the
    /// bottom is possible.
    fn primordial_stack_bottom(&self) -> *mut c_void;

    /// An approximation of the caller's current stack pointer, used as
    /// the top of the currently-running thread's live stack range.
    fn approx_current_sp(&self) -> *mut c_void;
}

static HOOKS: OnceLock<&'static dyn CollectorHooks> = OnceLock::new();

/// Register the collector's hooks. May be called at most once; a
/// second call is a configuration error in the host, not this crate,
/// so it panics rather than returning a `FatalError` of its own.
///
/// # Panics
/// Panics if hooks have already been installed.
pub fn install_hooks(hooks: &'static dyn CollectorHooks) {
    HOOKS
        .set(hooks)
        .unwrap_or_else(|_| panic!("collector hooks already installed"));
}

/// Fetch the registered hooks.
///
/// # Panics
/// Panics if [`install_hooks`] has not been called yet.
#[must_use]
pub fn hooks() -> &'static dyn CollectorHooks {
    *HOOKS
        .get()
        .expect("collector hooks not installed; call install_hooks first")
}

/// Whether hooks have been registered, for callers that want to assert
/// readiness before a fatal-aborting operation rather than panicking.
#[must_use]
pub fn hooks_installed() -> bool {
    HOOKS.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr;
    use std::sync::Mutex;

    struct NullHooks;

    impl CollectorHooks for NullHooks {
        fn allocate_inner(&self, _size: usize, _kind: AllocKind) -> *mut c_void {
            ptr::null_mut()
        }
        fn push_stack_range(&self, _lo: *mut c_void, _hi: *mut c_void) {}
        fn primordial_stack_bottom(&self) -> *mut c_void {
            ptr::null_mut()
        }
        fn approx_current_sp(&self) -> *mut c_void {
            ptr::null_mut()
        }
    }

    static NULL_HOOKS: NullHooks = NullHooks;
    // Installing global state from tests races other tests in the same
    // binary; serialize with a lock rather than relying on test order.
    static GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn hooks_installed_reflects_registration() {
        let _g = GUARD.lock().unwrap();
        if !hooks_installed() {
            install_hooks(&NULL_HOOKS);
        }
        assert!(hooks_installed());
        assert!(hooks().allocate_inner(8, AllocKind::ThreadRecord).is_null());
    }
}
