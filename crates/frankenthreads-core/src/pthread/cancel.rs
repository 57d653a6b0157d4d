//! Deferred-cancellation bits kept in each record's `cancelhandling` word.

/// Cancellation disabled by the thread itself.
pub const CANCELSTATE_DISABLED: u32 = 1 << 0;
/// A cancel request is being delivered.
pub const CANCELING: u32 = 1 << 1;
/// A cancel request is pending.
pub const CANCELED: u32 = 1 << 2;
/// The thread has started its exit path.
pub const EXITING: u32 = 1 << 3;
/// The thread has published its exit state.
pub const TERMINATED: u32 = 1 << 4;

/// Any of the bits meaning the thread is on its way out.
pub const LEAVING_MASK: u32 = CANCELING | CANCELED | EXITING | TERMINATED;

/// True when a pending cancel would act at the next cancellation point:
/// canceled, cancellation enabled, and not already exiting.
#[inline]
#[must_use]
pub const fn cancel_enabled_and_canceled(value: u32) -> bool {
    value & (CANCELSTATE_DISABLED | CANCELED | EXITING | TERMINATED) == CANCELED
}

/// `pthread_setcancelstate` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelState {
    Enable,
    Disable,
}

impl CancelState {
    #[must_use]
    pub const fn from_bits(value: u32) -> Self {
        if value & CANCELSTATE_DISABLED != 0 {
            Self::Disable
        } else {
            Self::Enable
        }
    }
}
