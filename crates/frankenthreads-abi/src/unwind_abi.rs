//! Lazy link to the GCC unwinder and forwarding entry points.
//!
//! `libgcc_s.so.1` is opened the first time unwinding needs it. Each
//! forwarding entry point aborts with a diagnostic when the library is
//! missing, since there is no meaningful fallback for a failed unwind.

use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};

use frankenthreads_core::config::{self, DEFAULT_UNWIND_SONAME};
use frankenthreads_core::link::{Capabilities, XorRotateGuard, fatal};
use frankenthreads_core::{LazyLink, LibraryHandle, LinkSpec, Loader};

use crate::dlfcn_abi::DlLoader;
use crate::fork_abi;
use crate::guard_abi::pointer_guard_seed;

pub const UNWIND_BACKTRACE: usize = 0;
pub const UNWIND_FORCED_UNWIND: usize = 1;
pub const UNWIND_GET_CFA: usize = 2;
pub const UNWIND_GET_IP: usize = 3;
pub const UNWIND_RESUME: usize = 4;
pub const GCC_PERSONALITY_V0: usize = 5;

/// Symbols bound from the unwinder, in slot order.
pub const UNWIND_SYMBOLS: [&str; 6] = [
    "_Unwind_Backtrace",
    "_Unwind_ForcedUnwind",
    "_Unwind_GetCFA",
    "_Unwind_GetIP",
    "_Unwind_Resume",
    "__gcc_personality_v0",
];

const UNWIND_MISSING: &str = "libgcc_s.so.1 must be installed for unwinding to work";

/// Trace callback passed to `_Unwind_Backtrace`.
pub type UnwindTraceFn = unsafe extern "C" fn(ctx: *mut c_void, arg: *mut c_void) -> c_int;

type BacktraceFn = unsafe extern "C" fn(trace: UnwindTraceFn, arg: *mut c_void) -> c_int;
type ForcedUnwindFn =
    unsafe extern "C" fn(exc: *mut c_void, stop: *mut c_void, stop_arg: *mut c_void) -> c_int;
type GetWordFn = unsafe extern "C" fn(ctx: *mut c_void) -> usize;
type ResumeFn = unsafe extern "C" fn(exc: *mut c_void) -> !;
type PersonalityFn = unsafe extern "C" fn(
    version: c_int,
    actions: c_int,
    exception_class: u64,
    exc: *mut c_void,
    ctx: *mut c_void,
) -> c_int;

/// [`DlLoader`] honoring `FRANKENTHREADS_UNWIND_SONAME`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnwindLoader;

impl Loader for UnwindLoader {
    fn open(&self, soname: &str) -> Option<LibraryHandle> {
        let configured = config::unwind_soname_override();
        DlLoader.open(configured.as_deref().unwrap_or(soname))
    }

    fn resolve(&self, handle: LibraryHandle, symbol: &str) -> Option<std::num::NonZeroUsize> {
        DlLoader.resolve(handle, symbol)
    }

    fn close(&self, handle: LibraryHandle) {
        DlLoader.close(handle);
    }
}

pub type UnwindLink = LazyLink<UnwindLoader, XorRotateGuard, 6>;

/// The process-wide unwinder link.
pub static UNWIND_LINK: UnwindLink = LazyLink::new(
    LinkSpec {
        soname: DEFAULT_UNWIND_SONAME,
        symbols: UNWIND_SYMBOLS,
    },
    UnwindLoader,
    XorRotateGuard::new(pointer_guard_seed),
);

static FORK_HOOK: AtomicBool = AtomicBool::new(false);

/// Unwinder capabilities, binding the library on first use.
///
/// Nothing on this path waits on a once-cell, so a child forked while
/// another thread was here can still bind.
pub fn unwind_link() -> Option<Capabilities<'static, 6>> {
    if !FORK_HOOK.swap(true, Ordering::AcqRel) && !fork_abi::register(&UNWIND_LINK) {
        log::warn!("unwind link fork hook not registered");
    }
    UNWIND_LINK.get()
}

fn require(slot: usize) -> usize {
    match unwind_link().and_then(|caps| caps.slot(slot)) {
        Some(addr) => addr,
        None => fatal(UNWIND_MISSING),
    }
}

/// Returns 1 if the unwinder is bound (binding it if needed), 0 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_unwind_link_get() -> c_int {
    c_int::from(unwind_link().is_some())
}

/// Address bound to unwinder slot `slot`, or null when unavailable.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_unwind_symbol(slot: c_int) -> *mut c_void {
    let Ok(slot) = usize::try_from(slot) else {
        return std::ptr::null_mut();
    };
    unwind_link()
        .and_then(|caps| caps.slot(slot))
        .map_or(std::ptr::null_mut(), |addr| addr as *mut c_void)
}

/// Close the unwinder at process-exit resource cleanup.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_unwind_link_freeres() {
    UNWIND_LINK.release();
}

/// Forwards to `_Unwind_Backtrace`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_unwind_backtrace(
    trace: UnwindTraceFn,
    arg: *mut c_void,
) -> c_int {
    // SAFETY: slot UNWIND_BACKTRACE holds `_Unwind_Backtrace`.
    let f = unsafe { std::mem::transmute::<usize, BacktraceFn>(require(UNWIND_BACKTRACE)) };
    // SAFETY: forwarded caller contract.
    unsafe { f(trace, arg) }
}

/// Forwards to `_Unwind_ForcedUnwind`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_unwind_forced_unwind(
    exc: *mut c_void,
    stop: *mut c_void,
    stop_arg: *mut c_void,
) -> c_int {
    // SAFETY: slot UNWIND_FORCED_UNWIND holds `_Unwind_ForcedUnwind`.
    let f = unsafe { std::mem::transmute::<usize, ForcedUnwindFn>(require(UNWIND_FORCED_UNWIND)) };
    // SAFETY: forwarded caller contract.
    unsafe { f(exc, stop, stop_arg) }
}

/// Forwards to `_Unwind_GetCFA`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_unwind_get_cfa(ctx: *mut c_void) -> usize {
    // SAFETY: slot UNWIND_GET_CFA holds `_Unwind_GetCFA`.
    let f = unsafe { std::mem::transmute::<usize, GetWordFn>(require(UNWIND_GET_CFA)) };
    // SAFETY: forwarded caller contract.
    unsafe { f(ctx) }
}

/// Forwards to `_Unwind_GetIP`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_unwind_get_ip(ctx: *mut c_void) -> usize {
    // SAFETY: slot UNWIND_GET_IP holds `_Unwind_GetIP`.
    let f = unsafe { std::mem::transmute::<usize, GetWordFn>(require(UNWIND_GET_IP)) };
    // SAFETY: forwarded caller contract.
    unsafe { f(ctx) }
}

/// Forwards to `_Unwind_Resume`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_unwind_resume(exc: *mut c_void) -> ! {
    // SAFETY: slot UNWIND_RESUME holds `_Unwind_Resume`.
    let f = unsafe { std::mem::transmute::<usize, ResumeFn>(require(UNWIND_RESUME)) };
    // SAFETY: forwarded caller contract.
    unsafe { f(exc) }
}

/// Forwards to `__gcc_personality_v0`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_gcc_personality_v0(
    version: c_int,
    actions: c_int,
    exception_class: u64,
    exc: *mut c_void,
    ctx: *mut c_void,
) -> c_int {
    // SAFETY: slot GCC_PERSONALITY_V0 holds `__gcc_personality_v0`.
    let f = unsafe { std::mem::transmute::<usize, PersonalityFn>(require(GCC_PERSONALITY_V0)) };
    // SAFETY: forwarded caller contract.
    unsafe { f(version, actions, exception_class, exc, ctx) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_constants_match_symbol_order() {
        let spec = UNWIND_LINK.spec();
        assert_eq!(spec.slot_of("_Unwind_Backtrace"), Some(UNWIND_BACKTRACE));
        assert_eq!(spec.slot_of("_Unwind_ForcedUnwind"), Some(UNWIND_FORCED_UNWIND));
        assert_eq!(spec.slot_of("_Unwind_GetCFA"), Some(UNWIND_GET_CFA));
        assert_eq!(spec.slot_of("_Unwind_GetIP"), Some(UNWIND_GET_IP));
        assert_eq!(spec.slot_of("_Unwind_Resume"), Some(UNWIND_RESUME));
        assert_eq!(spec.slot_of("__gcc_personality_v0"), Some(GCC_PERSONALITY_V0));
        assert_eq!(spec.soname, "libgcc_s.so.1");
    }

    #[test]
    fn out_of_range_slots_are_null() {
        assert!(frankenthreads_unwind_symbol(-1).is_null());
        assert!(frankenthreads_unwind_symbol(6).is_null());
    }
}
