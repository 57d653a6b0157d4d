//! Linux `futex(2)` backend.
//!
//! Timed waits use `FUTEX_WAIT_BITSET` with an absolute timeout, adding
//! `FUTEX_CLOCK_REALTIME` for realtime deadlines, so the deadline is never
//! converted to a relative interval and cannot drift across retries.

use std::sync::atomic::AtomicU32;

use super::{Futex, WaitOutcome};
use crate::errno;
use crate::time::{CLOCK_REALTIME, Deadline};

/// Kernel futex.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxFutex;

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl Futex for LinuxFutex {
    fn wait(
        &self,
        word: &AtomicU32,
        expected: u32,
        deadline: Option<&Deadline>,
        shared: bool,
    ) -> WaitOutcome {
        let mut op = libc::FUTEX_WAIT_BITSET;
        if !shared {
            op |= libc::FUTEX_PRIVATE_FLAG;
        }

        // SAFETY: timespec is plain old data; all-zero is a valid value.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        let ts_ptr: *const libc::timespec = match deadline {
            None => std::ptr::null(),
            Some(deadline) => {
                let at = deadline.at();
                // The kernel rejects negative absolute times; they have passed.
                if at.tv_sec < 0 {
                    return WaitOutcome::TimedOut;
                }
                if deadline.clock() == CLOCK_REALTIME {
                    op |= libc::FUTEX_CLOCK_REALTIME;
                }
                #[cfg(target_pointer_width = "64")]
                let tv_sec: libc::time_t = at.tv_sec;
                #[cfg(not(target_pointer_width = "64"))]
                let Ok(tv_sec) = libc::time_t::try_from(at.tv_sec) else {
                    return WaitOutcome::Overflow;
                };
                ts.tv_sec = tv_sec;
                ts.tv_nsec = at.tv_nsec as _;
                &ts
            }
        };

        // SAFETY: `word` is a live, aligned u32 for the duration of the call;
        // `ts_ptr` is null or points at `ts`, which outlives the syscall.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                op,
                expected,
                ts_ptr,
                std::ptr::null::<u32>(),
                libc::FUTEX_BITSET_MATCH_ANY,
            )
        };
        if rc == 0 {
            return WaitOutcome::Woken;
        }
        match last_errno() {
            errno::ETIMEDOUT => WaitOutcome::TimedOut,
            errno::EINTR => WaitOutcome::Interrupted,
            // EAGAIN: the word already changed.
            _ => WaitOutcome::Woken,
        }
    }

    fn wake(&self, word: &AtomicU32, count: u32, shared: bool) -> usize {
        let mut op = libc::FUTEX_WAKE;
        if !shared {
            op |= libc::FUTEX_PRIVATE_FLAG;
        }
        let count = count.min(i32::MAX as u32) as i32;
        // SAFETY: `word` is a live, aligned u32; FUTEX_WAKE only uses it as a key.
        let rc = unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), op, count) };
        usize::try_from(rc).unwrap_or(0)
    }
}
