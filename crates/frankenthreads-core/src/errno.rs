//! POSIX errno values used by the threading protocols (Linux numbering).

pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EAGAIN: i32 = 11;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const EDEADLK: i32 = 35;
pub const ENOSYS: i32 = 38;
pub const EOVERFLOW: i32 = 75;
pub const ETIMEDOUT: i32 = 110;
pub const ECANCELED: i32 = 125;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn values_match_host_libc() {
        assert_eq!(ESRCH, libc::ESRCH);
        assert_eq!(EINTR, libc::EINTR);
        assert_eq!(EAGAIN, libc::EAGAIN);
        assert_eq!(EBUSY, libc::EBUSY);
        assert_eq!(EINVAL, libc::EINVAL);
        assert_eq!(EDEADLK, libc::EDEADLK);
        assert_eq!(ENOSYS, libc::ENOSYS);
        assert_eq!(EOVERFLOW, libc::EOVERFLOW);
        assert_eq!(ETIMEDOUT, libc::ETIMEDOUT);
        assert_eq!(ECANCELED, libc::ECANCELED);
    }
}
