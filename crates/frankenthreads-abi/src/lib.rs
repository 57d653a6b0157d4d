// extern "C" entry points take raw pointers from C callers and document their
// contracts on the module level.
#![allow(clippy::missing_safety_doc)]
//! # frankenthreads-abi
//!
//! `extern "C"` boundary for the FrankenThreads protocols.
//!
//! - [`unwind_abi`]: the process-wide lazy link to `libgcc_s.so.1` and the
//!   forwarding unwinder entry points that abort when it is missing.
//! - [`pthread_abi`]: the process-global thread table with errno-returning
//!   create/join/detach/cancel entry points.
//! - [`robust_abi`]: `set_robust_list` registration behind the cached
//!   availability flag.
//! - [`fork_abi`]: `pthread_atfork` wiring for child-side reset hooks.
//!
//! Exported symbols carry a `frankenthreads_` prefix so the library can be
//! loaded next to the host libc without interposing on it.

#![cfg(target_os = "linux")]

pub mod dlfcn_abi;
pub mod fork_abi;
pub mod guard_abi;
pub mod pthread_abi;
pub mod robust_abi;
pub mod unwind_abi;
