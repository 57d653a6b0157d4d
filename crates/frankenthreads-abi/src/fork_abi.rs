//! `pthread_atfork` wiring for the child-side hook registry.

use std::sync::atomic::{AtomicBool, Ordering};

use frankenthreads_core::fork;

static INSTALLED: AtomicBool = AtomicBool::new(false);

unsafe extern "C" fn atfork_child() {
    fork::run_child_hooks();
}

/// Install the child callback with the host libc. Idempotent.
///
/// Later callers never wait for the first to finish, so a fork landing
/// mid-install cannot leave the child blocked here.
pub fn install_atfork() {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    // SAFETY: the callback only touches atomics and lock-free registries.
    let rc = unsafe { libc::pthread_atfork(None, None, Some(atfork_child)) };
    if rc != 0 {
        log::warn!("pthread_atfork failed: {rc}");
    }
}

/// Register `handler` and make sure the atfork callback is installed.
pub fn register(handler: &'static dyn fork::ForkHandler) -> bool {
    install_atfork();
    fork::register_fork_handler(handler)
}

/// Number of child callbacks run in this process image.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_fork_generation() -> u64 {
    fork::fork_hooks().generation()
}
