//! Post-fork callbacks for the child process.
//!
//! After `fork()` only the forking thread survives in the child. Any lock a
//! vanished thread held stays held forever unless something resets it, so
//! subsystems with process-wide slow-path locks register a [`ForkHandler`].
//! The platform layer arranges for [`run_child_hooks`] to run in the child
//! immediately after `fork()` returns, before user code.
//!
//! The registry is fixed-capacity and lock-free: running it in the child must
//! not take any lock that a dead parent thread could own.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Maximum number of handlers the process-wide registry holds.
pub const MAX_FORK_HOOKS: usize = 16;

/// Child-side reaction to `fork()`.
pub trait ForkHandler: Sync {
    /// Runs in the child with exactly one thread alive.
    fn after_fork_child(&self);
}

/// Fixed-capacity registry of child-side fork handlers.
pub struct ForkHooks {
    slots: [OnceLock<&'static dyn ForkHandler>; MAX_FORK_HOOKS],
    claimed: AtomicUsize,
    generation: AtomicU64,
}

impl ForkHooks {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { OnceLock::new() }; MAX_FORK_HOOKS],
            claimed: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Add `handler`. Returns `false` when the registry is full.
    pub fn register(&self, handler: &'static dyn ForkHandler) -> bool {
        let index = self.claimed.fetch_add(1, Ordering::AcqRel);
        if index >= MAX_FORK_HOOKS {
            self.claimed.fetch_sub(1, Ordering::AcqRel);
            log::warn!("fork hook registry full ({MAX_FORK_HOOKS} handlers)");
            return false;
        }
        // A freshly claimed index has never been set.
        let _ = self.slots[index].set(handler);
        true
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.claimed.load(Ordering::Acquire).min(MAX_FORK_HOOKS)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every handler in registration order and bump the fork generation.
    pub fn run_child(&self) {
        for slot in &self.slots[..self.len()] {
            // A slot claimed by a thread that died mid-registration stays empty.
            if let Some(handler) = slot.get() {
                handler.after_fork_child();
            }
        }
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// How many times [`ForkHooks::run_child`] has run in this process image.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for ForkHooks {
    fn default() -> Self {
        Self::new()
    }
}

static HOOKS: ForkHooks = ForkHooks::new();

/// The process-wide registry.
#[must_use]
pub fn fork_hooks() -> &'static ForkHooks {
    &HOOKS
}

/// Register `handler` with the process-wide registry.
pub fn register_fork_handler(handler: &'static dyn ForkHandler) -> bool {
    HOOKS.register(handler)
}

/// Entry point for the platform's child-side fork callback.
pub fn run_child_hooks() {
    HOOKS.run_child();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Counter(AtomicU32);

    impl ForkHandler for Counter {
        fn after_fork_child(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn handlers_run_once_per_child_callback() {
        static A: Counter = Counter(AtomicU32::new(0));
        static B: Counter = Counter(AtomicU32::new(0));
        let hooks = ForkHooks::new();
        assert!(hooks.is_empty());
        assert!(hooks.register(&A));
        assert!(hooks.register(&B));
        assert_eq!(hooks.len(), 2);

        hooks.run_child();
        assert_eq!(A.0.load(Ordering::SeqCst), 1);
        assert_eq!(B.0.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.generation(), 1);

        hooks.run_child();
        assert_eq!(A.0.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.generation(), 2);
    }

    #[test]
    fn registry_rejects_overflow() {
        static C: Counter = Counter(AtomicU32::new(0));
        let hooks = ForkHooks::new();
        for _ in 0..MAX_FORK_HOOKS {
            assert!(hooks.register(&C));
        }
        assert!(!hooks.register(&C));
        assert_eq!(hooks.len(), MAX_FORK_HOOKS);

        hooks.run_child();
        assert_eq!(C.0.load(Ordering::SeqCst), MAX_FORK_HOOKS as u32);
    }
}
