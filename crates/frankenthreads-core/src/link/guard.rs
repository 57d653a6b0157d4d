//! Pointer obfuscation for published capability slots.
//!
//! Function pointers sitting in writable static memory are attractive
//! overwrite targets. A [`PointerGuard`] transforms each pointer before it is
//! stored and reverses the transform on read. The transform only changes the
//! stored representation; callers always see the original address.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Reversible transform applied to stored pointers.
pub trait PointerGuard: Sync {
    fn mangle(&self, ptr: usize) -> usize;
    fn demangle(&self, stored: usize) -> usize;
}

/// Stores pointers verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityGuard;

impl PointerGuard for IdentityGuard {
    #[inline]
    fn mangle(&self, ptr: usize) -> usize {
        ptr
    }

    #[inline]
    fn demangle(&self, stored: usize) -> usize {
        stored
    }
}

const ROTATE_BITS: u32 = 2 * usize::BITS / 8 + 1;

/// XOR with a per-process secret, then rotate left.
///
/// `seed` must return the same value on every call within a process. It is
/// called on first use and again by any caller that finds the cache still
/// unfilled; nothing ever waits for another thread to finish seeding, so a
/// fork that interrupts the seed leaves the child able to seed again. A seed
/// returning `None` turns the guard into the identity transform.
pub struct XorRotateGuard {
    seed: fn() -> Option<usize>,
    state: AtomicU8,
    secret: AtomicUsize,
}

const SEED_UNRESOLVED: u8 = 0;
const SEED_NONE: u8 = 1;
const SEED_SOME: u8 = 2;

impl XorRotateGuard {
    #[must_use]
    pub const fn new(seed: fn() -> Option<usize>) -> Self {
        Self {
            seed,
            state: AtomicU8::new(SEED_UNRESOLVED),
            secret: AtomicUsize::new(0),
        }
    }

    fn secret(&self) -> Option<usize> {
        match self.state.load(Ordering::Acquire) {
            SEED_SOME => return Some(self.secret.load(Ordering::Relaxed)),
            SEED_NONE => return None,
            _ => {}
        }
        let seeded = (self.seed)();
        // Racing seeders store the same value.
        match seeded {
            Some(secret) => {
                self.secret.store(secret, Ordering::Relaxed);
                self.state.store(SEED_SOME, Ordering::Release);
            }
            None => self.state.store(SEED_NONE, Ordering::Release),
        }
        seeded
    }

    /// Whether mangling is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.secret().is_some()
    }
}

impl std::fmt::Debug for XorRotateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("XorRotateGuard")
            .field(
                "seeded",
                &(self.state.load(Ordering::Acquire) != SEED_UNRESOLVED),
            )
            .finish()
    }
}

impl PointerGuard for XorRotateGuard {
    #[inline]
    fn mangle(&self, ptr: usize) -> usize {
        match self.secret() {
            Some(secret) => (ptr ^ secret).rotate_left(ROTATE_BITS),
            None => ptr,
        }
    }

    #[inline]
    fn demangle(&self, stored: usize) -> usize {
        match self.secret() {
            Some(secret) => stored.rotate_right(ROTATE_BITS) ^ secret,
            None => stored,
        }
    }
}
