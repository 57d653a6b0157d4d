//! Clocks, timespecs and absolute wait deadlines.
//!
//! A [`Deadline`] is an absolute point on a named clock, the representation
//! the futex wait primitive consumes directly. Validation mirrors what the
//! wait primitive accepts: only `CLOCK_REALTIME` and `CLOCK_MONOTONIC`, and a
//! sub-second field in `[0, 1e9)`.

use std::time::Duration;

/// Represents a timespec value (seconds + nanoseconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    /// Seconds.
    pub tv_sec: i64,
    /// Nanoseconds (0 to 999_999_999 when well formed).
    pub tv_nsec: i64,
}

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Clock identifiers for `clock_gettime`.
pub const CLOCK_REALTIME: i32 = 0;
pub const CLOCK_MONOTONIC: i32 = 1;
pub const CLOCK_PROCESS_CPUTIME_ID: i32 = 2;

/// Returns `true` if `ns` is a valid sub-second nanosecond count.
#[inline]
#[must_use]
pub const fn valid_nanoseconds(ns: i64) -> bool {
    ns >= 0 && ns < NSEC_PER_SEC
}

/// Returns `true` if the futex wait primitive can sleep against `clock_id`.
#[inline]
#[must_use]
pub const fn futex_abstimed_supported_clockid(clock_id: i32) -> bool {
    matches!(clock_id, CLOCK_REALTIME | CLOCK_MONOTONIC)
}

impl Timespec {
    #[must_use]
    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }

    /// `self + delta`, or `None` if the seconds field overflows.
    #[must_use]
    pub fn checked_add(self, delta: Duration) -> Option<Self> {
        let secs = i64::try_from(delta.as_secs()).ok()?;
        let mut tv_sec = self.tv_sec.checked_add(secs)?;
        let mut tv_nsec = self.tv_nsec + i64::from(delta.subsec_nanos());
        if tv_nsec >= NSEC_PER_SEC {
            tv_nsec -= NSEC_PER_SEC;
            tv_sec = tv_sec.checked_add(1)?;
        }
        Some(Self { tv_sec, tv_nsec })
    }
}

/// Absolute deadline for a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    clock: i32,
    at: Timespec,
}

impl Deadline {
    /// Deadline at `at` on `clock`. Not validated until used.
    #[must_use]
    pub const fn new(clock: i32, at: Timespec) -> Self {
        Self { clock, at }
    }

    #[must_use]
    pub const fn realtime(at: Timespec) -> Self {
        Self::new(CLOCK_REALTIME, at)
    }

    #[must_use]
    pub const fn monotonic(at: Timespec) -> Self {
        Self::new(CLOCK_MONOTONIC, at)
    }

    /// Deadline `delta` from now on `clock`.
    ///
    /// Returns `None` if the clock cannot be read or the sum overflows.
    #[must_use]
    pub fn after(clock: i32, delta: Duration) -> Option<Self> {
        let now = clock_now(clock)?;
        Some(Self::new(clock, now.checked_add(delta)?))
    }

    #[must_use]
    pub const fn clock(&self) -> i32 {
        self.clock
    }

    #[must_use]
    pub const fn at(&self) -> Timespec {
        self.at
    }

    /// Clock supported by the wait primitive and a well-formed nanosecond field.
    #[must_use]
    pub const fn is_well_formed(&self) -> bool {
        futex_abstimed_supported_clockid(self.clock) && valid_nanoseconds(self.at.tv_nsec)
    }
}

/// Read `clock_id`. Returns `None` for clocks the host rejects.
#[allow(unsafe_code)]
#[must_use]
pub fn clock_now(clock_id: i32) -> Option<Timespec> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(clock_id as libc::clockid_t, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(Timespec {
        tv_sec: i64::from(ts.tv_sec),
        tv_nsec: i64::from(ts.tv_nsec),
    })
}
