//! Error taxonomy (§7).
//!
//! Two of the design's four error classes are representable as
//! ordinary Rust values. Fatal conditions (configuration failures and
//! invariant violations) are not recoverable by contract — this
//! subsystem is a trust boundary, so their occurrence means something
//! else has already gone wrong, and the only correct response is to
//! crash loudly rather than limp on. Client-surface errors are ordinary
//! `Result`s returned from the lifecycle interceptors.

use std::fmt;

/// Errors surfaced to client code from the lifecycle interceptors
/// (§4.6). These wrap the underlying POSIX primitive's own failure
/// unchanged: `create_thread` returns whatever `pthread_create`
/// reported, `join` returns whatever `pthread_join` reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The underlying thread primitive failed with this `errno`.
    #[error("thread primitive failed with errno {0}")]
    Errno(i32),
}

impl ClientError {
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        Self::Errno(errno)
    }

    /// The wrapped `errno` value.
    #[must_use]
    pub fn errno(self) -> i32 {
        match self {
            Self::Errno(e) => e,
        }
    }
}

/// A condition that violates an invariant this subsystem maintains
/// exclusively (§7). Recoverable-at-boundary conditions (`ESRCH` from
/// a `pthread_kill` racing a thread's exit) are absorbed by the
/// stop/start controller and never reach this type.
#[derive(Debug, Clone, Copy)]
pub enum FatalError {
    /// Signal installation, semaphore init, or `sigfillset`-class setup
    /// failed.
    Configuration(&'static str),
    /// A stopped mutator made progress, a signal handler received the
    /// wrong signal number, `pthread_kill` returned an unexpected code,
    /// or a delete was requested for a record that isn't present.
    Invariant(&'static str),
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => {
                write!(f, "stop-the-world configuration failure: {msg}")
            }
            Self::Invariant(msg) => write!(f, "stop-the-world invariant violation: {msg}"),
        }
    }
}

impl FatalError {
    /// Print a diagnostic and abort the process. Never returns.
    ///
    /// No `panic!` is used anywhere on the signal-handler side of this
    /// subsystem — unwinding across a signal handler's return path into
    /// interrupted mutator code is undefined behavior, so every fatal
    /// path funnels through here instead.
    #[cold]
    pub fn abort(self) -> ! {
        eprintln!("{self}");
        std::process::abort();
    }
}
