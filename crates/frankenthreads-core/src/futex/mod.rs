//! Futex-style wait/wake primitive.
//!
//! The join protocol only needs "sleep while this word still holds the value
//! I last observed" and "wake whoever sleeps on this word". The trait keeps
//! that contract narrow so the kernel futex can be swapped for a test double.

use std::sync::atomic::AtomicU32;

use crate::time::Deadline;

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxFutex;

/// Wake count meaning "every waiter".
pub const WAKE_ALL: u32 = i32::MAX as u32;

/// Result of a single futex wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken, or the word no longer held `expected`. Callers re-check state.
    Woken,
    /// The absolute deadline passed.
    TimedOut,
    /// The deadline cannot be represented by the primitive.
    Overflow,
    /// Interrupted (signal or spurious return). Callers re-check state.
    Interrupted,
}

/// Address-keyed wait/wake primitive.
pub trait Futex: Send + Sync {
    /// Sleep while `word == expected`, until woken or `deadline` passes.
    ///
    /// `deadline` has already been validated by the caller. `shared` selects
    /// process-shared keying; waiters and wakers must agree on it.
    fn wait(
        &self,
        word: &AtomicU32,
        expected: u32,
        deadline: Option<&Deadline>,
        shared: bool,
    ) -> WaitOutcome;

    /// Wake up to `count` waiters on `word`. Returns how many were woken.
    fn wake(&self, word: &AtomicU32, count: u32, shared: bool) -> usize;
}

impl<F: Futex + ?Sized> Futex for &F {
    fn wait(
        &self,
        word: &AtomicU32,
        expected: u32,
        deadline: Option<&Deadline>,
        shared: bool,
    ) -> WaitOutcome {
        (**self).wait(word, expected, deadline, shared)
    }

    fn wake(&self, word: &AtomicU32, count: u32, shared: bool) -> usize {
        (**self).wake(word, count, shared)
    }
}
