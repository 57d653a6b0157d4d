//! Thread lifecycle: records, join/detach, cancellation, robust lists.
//!
//! [`ThreadTable`] owns a fixed arena of thread records. A record's
//! `joinstate` word moves `Joinable -> Detached` or `-> Exited`; the exit
//! path stores the result before the release-store of `Exited` and wakes
//! every waiter keyed on that word. A joiner that acquire-loads `Exited`
//! takes the result exactly once and hands the slot back to the arena.

mod cancel;
mod join;
mod record;
#[allow(unsafe_code)]
mod robust;
mod table;

pub use cancel::{
    CANCELED, CANCELING, CANCELSTATE_DISABLED, CancelState, EXITING, LEAVING_MASK, TERMINATED,
    cancel_enabled_and_canceled,
};
pub use record::{JoinState, ThreadId};
pub use robust::{
    ROBUST_LIST_HEAD_SIZE, RobustList, RobustListAvailability, RobustListHead, RobustListRegistry,
    RobustListSyscall,
};
pub use table::ThreadTable;

use crate::errno;

/// Opaque thread exit value (`void *` at the C boundary).
pub type ExitValue = usize;

/// Exit value of a canceled thread, `(void *) -1`.
pub const PTHREAD_CANCELED: ExitValue = usize::MAX;

/// Errors from the join family, detach and cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("joining would deadlock")]
    WouldDeadlock,
    #[error("deadline passed before the thread exited")]
    TimedOut,
    #[error("deadline cannot be represented")]
    Overflow,
    #[error("thread has not exited yet")]
    Busy,
    #[error("no such thread")]
    NoSuchThread,
    #[error("calling thread was canceled")]
    Canceled,
}

impl JoinError {
    /// POSIX errno for this error.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => errno::EINVAL,
            Self::WouldDeadlock => errno::EDEADLK,
            Self::TimedOut => errno::ETIMEDOUT,
            Self::Overflow => errno::EOVERFLOW,
            Self::Busy => errno::EBUSY,
            Self::NoSuchThread => errno::ESRCH,
            Self::Canceled => errno::ECANCELED,
        }
    }
}

/// Errors from creating a thread.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("thread table exhausted")]
    Exhausted,
    #[error("failed to start OS thread: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Exhausted => errno::EAGAIN,
            Self::Io(err) => err.raw_os_error().unwrap_or(errno::EAGAIN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_errors_map_to_posix_errno() {
        assert_eq!(JoinError::InvalidArgument.errno(), errno::EINVAL);
        assert_eq!(JoinError::WouldDeadlock.errno(), errno::EDEADLK);
        assert_eq!(JoinError::TimedOut.errno(), errno::ETIMEDOUT);
        assert_eq!(JoinError::Overflow.errno(), errno::EOVERFLOW);
        assert_eq!(JoinError::Busy.errno(), errno::EBUSY);
        assert_eq!(JoinError::NoSuchThread.errno(), errno::ESRCH);
        assert_eq!(JoinError::Canceled.errno(), errno::ECANCELED);
    }

    #[test]
    fn spawn_errors_map_to_posix_errno() {
        assert_eq!(SpawnError::Exhausted.errno(), errno::EAGAIN);
        let io = SpawnError::from(std::io::Error::from_raw_os_error(errno::EINVAL));
        assert_eq!(io.errno(), errno::EINVAL);
        let other = SpawnError::from(std::io::Error::other("no errno"));
        assert_eq!(other.errno(), errno::EAGAIN);
    }
}
