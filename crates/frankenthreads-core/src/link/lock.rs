//! Process-wide slow-path lock for lazy links.
//!
//! A plain CAS word with spin-then-yield back-off. It never parks through the
//! futex or a `parking_lot` queue, so it has no dependency on anything that
//! might itself need the unwinder, and a child process can reset it after
//! `fork()` by storing a single word.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Iterations of busy spinning before yielding the CPU.
const SPIN_LIMIT: u32 = 64;

/// Non-reentrant mutual exclusion over a single atomic word.
#[derive(Debug)]
pub struct ProcessLock {
    state: AtomicU32,
}

/// Releases the [`ProcessLock`] on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ProcessLockGuard<'a> {
    lock: &'a ProcessLock,
}

impl ProcessLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire, spinning and then yielding until the holder releases.
    pub fn lock(&self) -> ProcessLockGuard<'_> {
        let mut spins = 0u32;
        while !self.try_acquire() {
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        ProcessLockGuard { lock: self }
    }

    /// Acquire only if currently free.
    pub fn try_lock(&self) -> Option<ProcessLockGuard<'_>> {
        self.try_acquire().then_some(ProcessLockGuard { lock: self })
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }

    /// Force the lock back to unlocked.
    ///
    /// Only sound when no live thread can be holding it, i.e. in a child
    /// process right after `fork()` whose holder did not survive.
    pub fn reset(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }

    fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for ProcessLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
