//! Per-process pointer-guard secret.
//!
//! The kernel hands every process 16 random bytes through `AT_RANDOM`; the
//! second word seeds the pointer guard, leaving the first for stack
//! protectors.

use frankenthreads_core::config;

/// Seed for [`frankenthreads_core::link::XorRotateGuard`].
///
/// `None` when the guard is switched off by configuration or the auxiliary
/// vector has no `AT_RANDOM` entry.
pub fn pointer_guard_seed() -> Option<usize> {
    if !config::pointer_guard_mode().enabled() {
        return None;
    }
    // SAFETY: getauxval has no preconditions.
    let at_random = unsafe { libc::getauxval(libc::AT_RANDOM) } as usize;
    if at_random == 0 {
        return None;
    }
    let offset = 16 - std::mem::size_of::<usize>();
    // SAFETY: AT_RANDOM points at 16 readable bytes for the process lifetime.
    let secret = unsafe { std::ptr::read_unaligned((at_random + offset) as *const usize) };
    Some(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_stable_within_a_process() {
        assert_eq!(pointer_guard_seed(), pointer_guard_seed());
    }
}
