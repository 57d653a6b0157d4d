//! Process-global thread table and its errno-returning entry points.
//!
//! Thread handles cross the boundary as the packed `u64` form of
//! [`ThreadId`]; an unknown or reclaimed handle is `ESRCH`.

use std::ffi::{c_int, c_void};
use std::sync::{Arc, OnceLock};

use frankenthreads_core::config::runtime_config;
use frankenthreads_core::futex::LinuxFutex;
use frankenthreads_core::pthread::{CancelState, ExitValue, JoinError, ThreadId, ThreadTable};
use frankenthreads_core::time::{Deadline, Timespec};

use crate::robust_abi;

/// C thread start routine.
pub type StartRoutine = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

pub const PTHREAD_CANCEL_ENABLE: c_int = 0;
pub const PTHREAD_CANCEL_DISABLE: c_int = 1;

static TABLE: OnceLock<Arc<ThreadTable<LinuxFutex>>> = OnceLock::new();

/// The process-global thread table, sized from configuration on first use.
pub fn thread_table() -> &'static Arc<ThreadTable<LinuxFutex>> {
    TABLE.get_or_init(|| {
        let capacity = runtime_config().max_threads;
        log::debug!("thread table capacity {capacity}");
        Arc::new(ThreadTable::new(LinuxFutex, capacity))
    })
}

fn decode(thread: u64) -> Result<ThreadId, c_int> {
    ThreadId::from_raw(thread).ok_or(libc::ESRCH)
}

unsafe fn finish_join(result: Result<ExitValue, JoinError>, retval: *mut *mut c_void) -> c_int {
    match result {
        Ok(value) => {
            if !retval.is_null() {
                // SAFETY: caller-provided output pointer.
                unsafe { *retval = value as *mut c_void };
            }
            0
        }
        Err(err) => err.errno(),
    }
}

fn timespec_from(ts: &libc::timespec) -> Timespec {
    Timespec::new(i64::from(ts.tv_sec), i64::from(ts.tv_nsec))
}

/// Start `start(arg)` on a new thread and store its handle in `thread_out`.
///
/// The new thread registers its robust-mutex list before running `start`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_thread_create(
    thread_out: *mut u64,
    start: Option<StartRoutine>,
    arg: *mut c_void,
) -> c_int {
    let Some(start) = start else {
        return libc::EINVAL;
    };
    if thread_out.is_null() {
        return libc::EINVAL;
    }
    let arg_addr = arg as usize;
    let spawned = thread_table().spawn(move || {
        robust_abi::register_current_thread();
        // SAFETY: the creator supplied a valid start routine and argument.
        let value = unsafe { start(arg_addr as *mut c_void) };
        value as usize
    });
    match spawned {
        Ok(id) => {
            // SAFETY: `thread_out` was checked non-null above.
            unsafe { *thread_out = id.to_raw() };
            0
        }
        Err(err) => {
            log::warn!("thread create failed: {err}");
            err.errno()
        }
    }
}

/// Handle for the calling thread, adopting it into the table if needed.
/// Returns 0 when the table is full.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_thread_self() -> u64 {
    thread_table().adopt_current().map_or(0, ThreadId::to_raw)
}

/// `pthread_join`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_thread_join(thread: u64, retval: *mut *mut c_void) -> c_int {
    let id = match decode(thread) {
        Ok(id) => id,
        Err(errno) => return errno,
    };
    // SAFETY: forwarded caller contract for `retval`.
    unsafe { finish_join(thread_table().join(id), retval) }
}

/// `pthread_tryjoin_np`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_thread_tryjoin_np(
    thread: u64,
    retval: *mut *mut c_void,
) -> c_int {
    let id = match decode(thread) {
        Ok(id) => id,
        Err(errno) => return errno,
    };
    // SAFETY: forwarded caller contract for `retval`.
    unsafe { finish_join(thread_table().try_join(id), retval) }
}

/// `pthread_timedjoin_np`: absolute `CLOCK_REALTIME` deadline; null waits forever.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_thread_timedjoin_np(
    thread: u64,
    retval: *mut *mut c_void,
    abstime: *const libc::timespec,
) -> c_int {
    // SAFETY: forwarded caller contract.
    unsafe { frankenthreads_thread_clockjoin_np(thread, retval, libc::CLOCK_REALTIME, abstime) }
}

/// `pthread_clockjoin_np`: absolute deadline on `clockid`; null waits forever.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_thread_clockjoin_np(
    thread: u64,
    retval: *mut *mut c_void,
    clockid: libc::clockid_t,
    abstime: *const libc::timespec,
) -> c_int {
    let id = match decode(thread) {
        Ok(id) => id,
        Err(errno) => return errno,
    };
    // SAFETY: a non-null `abstime` points at a readable timespec.
    let deadline = unsafe { abstime.as_ref() }
        .map(|ts| Deadline::new(clockid, timespec_from(ts)));
    let result = thread_table().timed_join(id, deadline.as_ref());
    // SAFETY: forwarded caller contract for `retval`.
    unsafe { finish_join(result, retval) }
}

/// `pthread_detach`.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_thread_detach(thread: u64) -> c_int {
    match decode(thread).and_then(|id| thread_table().detach(id).map_err(JoinError::errno)) {
        Ok(()) => 0,
        Err(errno) => errno,
    }
}

/// `pthread_cancel`.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_thread_cancel(thread: u64) -> c_int {
    match decode(thread).and_then(|id| thread_table().cancel(id).map_err(JoinError::errno)) {
        Ok(()) => 0,
        Err(errno) => errno,
    }
}

/// `pthread_setcancelstate` for the calling thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn frankenthreads_thread_setcancelstate(
    state: c_int,
    oldstate: *mut c_int,
) -> c_int {
    let state = match state {
        PTHREAD_CANCEL_ENABLE => CancelState::Enable,
        PTHREAD_CANCEL_DISABLE => CancelState::Disable,
        _ => return libc::EINVAL,
    };
    let table = thread_table();
    if let Err(err) = table.adopt_current() {
        return err.errno();
    }
    match table.set_cancel_state(state) {
        Ok(previous) => {
            if !oldstate.is_null() {
                let raw = match previous {
                    CancelState::Enable => PTHREAD_CANCEL_ENABLE,
                    CancelState::Disable => PTHREAD_CANCEL_DISABLE,
                };
                // SAFETY: caller-provided output pointer.
                unsafe { *oldstate = raw };
            }
            0
        }
        Err(err) => err.errno(),
    }
}

/// Returns 1 when the calling thread has a cancel request to act on.
#[unsafe(no_mangle)]
pub extern "C" fn frankenthreads_thread_testcancel() -> c_int {
    c_int::from(thread_table().test_cancel())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bogus_handles_are_esrch() {
        assert_eq!(frankenthreads_thread_detach(0), libc::ESRCH);
        assert_eq!(frankenthreads_thread_cancel(2 << 32), libc::ESRCH);
        // SAFETY: null retval is allowed.
        let rc = unsafe { frankenthreads_thread_join(0, std::ptr::null_mut()) };
        assert_eq!(rc, libc::ESRCH);
    }

    #[test]
    fn create_rejects_null_arguments() {
        unsafe extern "C" fn noop(_: *mut c_void) -> *mut c_void {
            std::ptr::null_mut()
        }
        let mut out = 0u64;
        // SAFETY: exercising argument validation only.
        unsafe {
            assert_eq!(
                frankenthreads_thread_create(&mut out, None, std::ptr::null_mut()),
                libc::EINVAL
            );
            assert_eq!(
                frankenthreads_thread_create(std::ptr::null_mut(), Some(noop), std::ptr::null_mut()),
                libc::EINVAL
            );
        }
    }

    #[test]
    fn invalid_cancel_state_is_einval() {
        // SAFETY: null oldstate is allowed.
        let rc = unsafe { frankenthreads_thread_setcancelstate(7, std::ptr::null_mut()) };
        assert_eq!(rc, libc::EINVAL);
    }
}
