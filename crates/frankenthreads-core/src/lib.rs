//! # frankenthreads-core
//!
//! Safe Rust implementations of the synchronization protocols a POSIX thread
//! runtime keeps beneath its public API:
//!
//! - [`link`]: lazy, fork-safe binding of an optional companion library
//!   (the unwinder) into a statically allocated capability table.
//! - [`pthread`]: the join/detach state machine over a thread-record arena,
//!   with deadlock self-detection, timed and cancellable waits, and the
//!   cached robust-list registration.
//!
//! Platform collaborators (loader, futex, kernel syscalls, fork callbacks) are
//! consumed through traits so the protocols can be driven by test doubles.
//! No `unsafe` code is permitted at the crate level; the few modules that talk
//! to the kernel opt in explicitly.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod fork;
pub mod futex;
pub mod link;
pub mod pthread;
pub mod time;

pub use link::{CapabilityTable, LazyLink, LibraryHandle, LinkSpec, Loader};
pub use pthread::{ExitValue, JoinError, JoinState, SpawnError, ThreadId, ThreadTable};
