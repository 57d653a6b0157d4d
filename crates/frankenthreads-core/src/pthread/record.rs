//! Thread records and identifiers.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use super::ExitValue;
use super::robust::RobustListHead;

/// Lifecycle of a record's `joinstate` word.
///
/// `Joinable -> Detached`, `Joinable | Detached -> Exited`; `Exited` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum JoinState {
    Joinable = 0,
    Detached = 1,
    Exited = 2,
}

impl JoinState {
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Decode a `joinstate` word. Unknown values read as `Exited`.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Joinable,
            1 => Self::Detached,
            _ => Self::Exited,
        }
    }
}

/// Arena slot plus the generation it was issued under.
///
/// Live generations are odd; reclaiming a slot bumps it to even, so an id
/// that outlives its thread is recognised as stale instead of aliasing the
/// slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId {
    index: u32,
    generation: u32,
}

impl ThreadId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a single word (`generation << 32 | index`). Never zero.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`ThreadId::to_raw`]. Rejects words that cannot name a
    /// live record.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation % 2 == 0 {
            return None;
        }
        Some(Self {
            index: raw as u32,
            generation,
        })
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Per-thread state shared between the thread and its joiner.
#[derive(Debug)]
pub(crate) struct ThreadRecord {
    pub(crate) generation: AtomicU32,
    pub(crate) joinstate: AtomicU32,
    pub(crate) cancelhandling: AtomicU32,
    /// `index + 1` of the record this thread is blocked joining, or 0.
    pub(crate) blocked_on: AtomicU32,
    /// Exit value, written once by the exiting thread and taken once.
    pub(crate) result: Mutex<Option<ExitValue>>,
    /// Kernel robust-mutex list head. Once the record is reclaimed the slot
    /// can be reissued while the previous OS thread is still unwinding with
    /// this head registered, so the list must be empty whenever the owner
    /// calls `on_exit`; `register` resets it to empty in place.
    pub(crate) robust: RobustListHead,
}

impl ThreadRecord {
    pub(crate) fn vacant() -> Self {
        Self {
            generation: AtomicU32::new(0),
            joinstate: AtomicU32::new(JoinState::Exited.as_raw()),
            cancelhandling: AtomicU32::new(0),
            blocked_on: AtomicU32::new(0),
            result: Mutex::new(None),
            robust: RobustListHead::new(),
        }
    }

    #[inline]
    pub(crate) fn is_current(&self, id: ThreadId) -> bool {
        self.generation.load(Ordering::Acquire) == id.generation
    }

    #[inline]
    pub(crate) fn state(&self) -> JoinState {
        JoinState::from_raw(self.joinstate.load(Ordering::Acquire))
    }
}
