//! Kernel robust-mutex list registration.
//!
//! Each thread hands the kernel the head of its robust-mutex list so that
//! mutexes it still holds at death get flagged `OWNER_DIED`. Kernels without
//! `set_robust_list` fail the call every time; the first failure is cached in
//! a process-wide flag and later threads skip the syscall. The flag is only a
//! fast-path hint, so relaxed ordering is enough.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU8, Ordering};

/// Kernel `struct robust_list`.
#[repr(C)]
#[derive(Debug)]
pub struct RobustList {
    pub next: AtomicPtr<RobustList>,
}

/// Kernel `struct robust_list_head`.
#[repr(C)]
#[derive(Debug)]
pub struct RobustListHead {
    pub list: RobustList,
    pub futex_offset: AtomicIsize,
    pub list_op_pending: AtomicPtr<RobustList>,
}

/// Length argument the kernel expects for `set_robust_list`.
pub const ROBUST_LIST_HEAD_SIZE: usize = std::mem::size_of::<RobustListHead>();

impl RobustListHead {
    /// Zeroed head. Call [`RobustListHead::reset_empty`] once it has its final address.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            list: RobustList {
                next: AtomicPtr::new(std::ptr::null_mut()),
            },
            futex_offset: AtomicIsize::new(0),
            list_op_pending: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Make the list empty: it points back at itself.
    pub fn reset_empty(&self, futex_offset: isize) {
        let own = std::ptr::from_ref(&self.list).cast_mut();
        self.list.next.store(own, Ordering::Relaxed);
        self.futex_offset.store(futex_offset, Ordering::Relaxed);
        self.list_op_pending
            .store(std::ptr::null_mut(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        std::ptr::eq(self.list.next.load(Ordering::Relaxed), &self.list)
    }
}

impl Default for RobustListHead {
    fn default() -> Self {
        Self::new()
    }
}

/// Cached outcome of robust-list registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RobustListAvailability {
    Unknown = 0,
    Available = 1,
    Unavailable = 2,
}

impl RobustListAvailability {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Available,
            2 => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

/// The `set_robust_list` system call.
pub trait RobustListSyscall: Sync {
    /// Register `head` for the calling thread. `Err` carries the errno.
    ///
    /// # Safety
    ///
    /// `head` must point to a valid [`RobustListHead`] that stays at the same
    /// address until the calling thread exits or registers another head.
    unsafe fn set_robust_list(&self, head: NonNull<RobustListHead>, len: usize) -> Result<(), i32>;
}

/// Registration front-end that stops calling a syscall known to fail.
#[derive(Debug)]
pub struct RobustListRegistry<S> {
    availability: AtomicU8,
    syscall: S,
}

impl<S> RobustListRegistry<S> {
    #[must_use]
    pub const fn new(syscall: S) -> Self {
        Self {
            availability: AtomicU8::new(RobustListAvailability::Unknown as u8),
            syscall,
        }
    }

    #[must_use]
    pub fn availability(&self) -> RobustListAvailability {
        RobustListAvailability::from_raw(self.availability.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn syscall(&self) -> &S {
        &self.syscall
    }
}

impl<S: RobustListSyscall> RobustListRegistry<S> {
    /// Register `head` with the kernel unless registration is known to fail.
    ///
    /// # Safety
    ///
    /// Same contract as [`RobustListSyscall::set_robust_list`].
    pub unsafe fn register(&self, head: NonNull<RobustListHead>) -> bool {
        let cached = self.availability();
        if cached == RobustListAvailability::Unavailable {
            return false;
        }
        // SAFETY: forwarded caller contract.
        match unsafe { self.syscall.set_robust_list(head, ROBUST_LIST_HEAD_SIZE) } {
            Ok(()) => {
                if cached == RobustListAvailability::Unknown {
                    self.availability
                        .store(RobustListAvailability::Available as u8, Ordering::Relaxed);
                }
                true
            }
            Err(errno) => {
                self.availability
                    .store(RobustListAvailability::Unavailable as u8, Ordering::Relaxed);
                log::debug!("set_robust_list failed (errno {errno}); robust mutexes disabled");
                false
            }
        }
    }
}
