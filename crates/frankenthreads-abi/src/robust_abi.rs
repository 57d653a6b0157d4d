//! `set_robust_list` registration for threads in the global table.

use std::ffi::c_int;
use std::ptr::NonNull;

use frankenthreads_core::pthread::{
    RobustListAvailability, RobustListHead, RobustListRegistry, RobustListSyscall,
};

use crate::pthread_abi::thread_table;

/// The raw `set_robust_list(2)` system call.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelRobustList;

impl RobustListSyscall for KernelRobustList {
    unsafe fn set_robust_list(&self, head: NonNull<RobustListHead>, len: usize) -> Result<(), i32> {
        // SAFETY: caller guarantees `head` stays valid for the thread's lifetime.
        let rc = unsafe { libc::syscall(libc::SYS_set_robust_list, head.as_ptr(), len) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::ENOSYS))
        }
    }
}

/// Process-wide registration cache.
pub static ROBUST_LIST: RobustListRegistry<KernelRobustList> =
    RobustListRegistry::new(KernelRobustList);

/// Register the calling thread's robust list head from its table record.
///
/// Threads not yet known to the table are adopted first. The head stays
/// registered with the kernel until the OS thread is gone, which can be
/// after its record has been reissued; nothing here ever links a mutex into
/// it, so the kernel only ever walks an empty list.
pub fn register_current_thread() -> bool {
    let table = thread_table();
    let Ok(id) = table.adopt_current() else {
        return false;
    };
    let Ok(head) = table.robust_head(id) else {
        return false;
    };
    // SAFETY: the table is a process-lifetime static and never moves its
    // records, so the head keeps its address until this thread exits.
    unsafe { ROBUST_LIST.register(NonNull::from(head)) }
}

/// Register the calling thread's robust list. Returns 1 on success.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_robust_setup() -> c_int {
    c_int::from(register_current_thread())
}

/// Cached availability: 0 unknown, 1 available, 2 unavailable.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_robust_availability() -> c_int {
    match ROBUST_LIST.availability() {
        RobustListAvailability::Unknown => 0,
        RobustListAvailability::Available => 1,
        RobustListAvailability::Unavailable => 2,
    }
}
