//! Thread-record arena: registration, exit, detach and cancellation.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::cancel::{
    CANCELED, CANCELING, CANCELSTATE_DISABLED, CancelState, EXITING, TERMINATED,
    cancel_enabled_and_canceled,
};
use super::record::{JoinState, ThreadId, ThreadRecord};
use super::robust::RobustListHead;
use super::{ExitValue, JoinError, PTHREAD_CANCELED, SpawnError};
use crate::futex::{Futex, WAKE_ALL};

static NEXT_TABLE_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// `(table id, thread id)` for every table the calling thread belongs to.
    static BINDINGS: RefCell<Vec<(usize, ThreadId)>> = const { RefCell::new(Vec::new()) };
}

/// Fixed-capacity arena of thread records sharing one futex backend.
pub struct ThreadTable<F> {
    table_id: usize,
    pub(crate) futex: F,
    pub(crate) records: Box<[ThreadRecord]>,
    free: Mutex<Vec<u32>>,
}

impl<F: Futex> std::fmt::Debug for ThreadTable<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadTable")
            .field("table_id", &self.table_id)
            .field("capacity", &self.records.len())
            .field("live", &self.live_count())
            .finish()
    }
}

impl<F: Futex> ThreadTable<F> {
    /// Arena with room for `capacity` concurrently live threads.
    #[must_use]
    pub fn new(futex: F, capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize);
        let records: Box<[ThreadRecord]> = (0..capacity).map(|_| ThreadRecord::vacant()).collect();
        // Reversed so that low indices are handed out first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            table_id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            futex,
            records,
            free: Mutex::new(free),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Records currently issued (live or exited but not yet joined).
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.records.len() - self.free.lock().len()
    }

    #[must_use]
    pub fn futex(&self) -> &F {
        &self.futex
    }

    /// Issue a fresh `Joinable` record.
    pub fn register(&self) -> Result<ThreadId, SpawnError> {
        let Some(index) = self.free.lock().pop() else {
            log::warn!("thread table {} exhausted", self.table_id);
            return Err(SpawnError::Exhausted);
        };
        let record = &self.records[index as usize];
        {
            let mut result = record.result.lock();
            *result = None;
            record
                .joinstate
                .store(JoinState::Joinable.as_raw(), Ordering::Relaxed);
            record.cancelhandling.store(0, Ordering::Relaxed);
            record.blocked_on.store(0, Ordering::Relaxed);
            record.robust.reset_empty(0);
        }
        let generation = record.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let id = ThreadId::new(index, generation);
        log::trace!("thread {id} registered");
        Ok(id)
    }

    pub(crate) fn record(&self, id: ThreadId) -> Result<&ThreadRecord, JoinError> {
        let record = self
            .records
            .get(id.index() as usize)
            .ok_or(JoinError::NoSuchThread)?;
        if record.is_current(id) {
            Ok(record)
        } else {
            Err(JoinError::NoSuchThread)
        }
    }

    /// Whether `id` still names an issued record.
    #[must_use]
    pub fn contains(&self, id: ThreadId) -> bool {
        self.record(id).is_ok()
    }

    /// Current lifecycle state of `id`.
    pub fn state(&self, id: ThreadId) -> Result<JoinState, JoinError> {
        Ok(self.record(id)?.state())
    }

    /// Raw cancellation bits of `id`.
    pub fn cancel_bits(&self, id: ThreadId) -> Result<u32, JoinError> {
        Ok(self.record(id)?.cancelhandling.load(Ordering::Acquire))
    }

    /// Robust-mutex list head owned by `id`.
    ///
    /// The head lives inside the arena and keeps its address for as long as
    /// the table does.
    pub fn robust_head(&self, id: ThreadId) -> Result<&RobustListHead, JoinError> {
        Ok(&self.record(id)?.robust)
    }

    /// Hand the slot of `id` back to the arena. Returns `false` if some other
    /// path already reclaimed it.
    pub(crate) fn reclaim(&self, id: ThreadId) -> bool {
        let record = &self.records[id.index() as usize];
        let released = record
            .generation
            .compare_exchange(
                id.generation(),
                id.generation().wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok();
        if released {
            self.free.lock().push(id.index());
            log::trace!("thread {id} reclaimed");
        }
        released
    }

    /// Associate the calling OS thread with `id` for deadlock and cancel checks.
    pub fn bind(&self, id: ThreadId) {
        let table_id = self.table_id;
        let _ = BINDINGS.try_with(|bindings| {
            let mut bindings = bindings.borrow_mut();
            bindings.retain(|(table, _)| *table != table_id);
            bindings.push((table_id, id));
        });
    }

    /// Drop the calling thread's association with this table.
    pub fn unbind(&self) {
        let table_id = self.table_id;
        let _ = BINDINGS.try_with(|bindings| {
            bindings
                .borrow_mut()
                .retain(|(table, _)| *table != table_id);
        });
    }

    /// Record bound to the calling thread, if any.
    #[must_use]
    pub fn current(&self) -> Option<ThreadId> {
        let table_id = self.table_id;
        BINDINGS
            .try_with(|bindings| {
                bindings
                    .borrow()
                    .iter()
                    .find(|(table, _)| *table == table_id)
                    .map(|(_, id)| *id)
            })
            .ok()
            .flatten()
    }

    /// Record for the calling thread, registering and binding one if needed.
    ///
    /// Used for threads not started through [`ThreadTable::spawn`], such as
    /// the main thread.
    pub fn adopt_current(&self) -> Result<ThreadId, SpawnError> {
        if let Some(id) = self.current() {
            if self.record(id).is_ok() {
                return Ok(id);
            }
        }
        let id = self.register()?;
        self.bind(id);
        Ok(id)
    }

    pub(crate) fn current_record(&self) -> Option<(ThreadId, &ThreadRecord)> {
        let id = self.current()?;
        self.record(id).ok().map(|record| (id, record))
    }

    /// Thread-termination hook.
    ///
    /// Stores `value`, release-stores `Exited` and wakes every joiner. A
    /// thread that was detached is reclaimed here since nobody will join it.
    pub fn on_exit(&self, id: ThreadId, value: ExitValue) -> Result<(), JoinError> {
        let record = self.record(id)?;
        record.cancelhandling.fetch_or(EXITING, Ordering::SeqCst);
        *record.result.lock() = Some(value);
        // Once `Exited` is visible a joiner may reclaim and reissue the slot,
        // so every record write has to happen before the swap.
        record.cancelhandling.fetch_or(TERMINATED, Ordering::SeqCst);
        let previous = JoinState::from_raw(
            record
                .joinstate
                .swap(JoinState::Exited.as_raw(), Ordering::AcqRel),
        );
        log::trace!("thread {id} exited ({previous:?})");

        if previous == JoinState::Detached {
            self.reclaim(id);
        } else {
            self.futex.wake(&record.joinstate, WAKE_ALL, true);
        }
        Ok(())
    }

    /// Mark `id` detached.
    ///
    /// Detaching twice is `InvalidArgument`. A thread that already exited is
    /// joined here so its record is not leaked.
    pub fn detach(&self, id: ThreadId) -> Result<(), JoinError> {
        let record = self.record(id)?;
        let mut current = record.joinstate.load(Ordering::Acquire);
        loop {
            match JoinState::from_raw(current) {
                JoinState::Detached => return Err(JoinError::InvalidArgument),
                JoinState::Exited => {
                    log::trace!("thread {id} detached after exit; reclaiming");
                    return self.join(id).map(|_| ());
                }
                JoinState::Joinable => {}
            }
            match record.joinstate.compare_exchange_weak(
                current,
                JoinState::Detached.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        // Sleeping joiners re-check and report the thread as not joinable.
        self.futex.wake(&record.joinstate, WAKE_ALL, true);
        log::trace!("thread {id} detached");
        Ok(())
    }

    /// Request cancellation of `id`.
    ///
    /// Cancellation is deferred: it acts when the target next reaches a
    /// cancellation point (a join, or [`ThreadTable::test_cancel`]).
    pub fn cancel(&self, id: ThreadId) -> Result<(), JoinError> {
        let record = self.record(id)?;
        let previous = record
            .cancelhandling
            .fetch_or(CANCELING | CANCELED, Ordering::SeqCst);
        if previous & CANCELED == 0 {
            log::debug!("thread {id} cancel requested");
        }
        self.kick_blocked_joiner(record);
        Ok(())
    }

    // The joiner publishes `blocked_on` and then re-reads its cancel bits; the
    // canceler sets the bits and then reads `blocked_on`. Whichever runs
    // second sees the other's store. A wake can still land just before the
    // joiner sleeps, so keep waking until it leaves the wait.
    fn kick_blocked_joiner(&self, record: &ThreadRecord) {
        loop {
            let target = record.blocked_on.load(Ordering::SeqCst);
            if target == 0 {
                return;
            }
            if !cancel_enabled_and_canceled(record.cancelhandling.load(Ordering::SeqCst)) {
                return;
            }
            if let Some(joined) = self.records.get(target as usize - 1) {
                self.futex.wake(&joined.joinstate, WAKE_ALL, true);
            }
            std::thread::yield_now();
        }
    }

    /// Set the calling thread's cancel state; returns the previous state.
    pub fn set_cancel_state(&self, state: CancelState) -> Result<CancelState, JoinError> {
        let (_, record) = self.current_record().ok_or(JoinError::NoSuchThread)?;
        let previous = match state {
            CancelState::Disable => record
                .cancelhandling
                .fetch_or(CANCELSTATE_DISABLED, Ordering::SeqCst),
            CancelState::Enable => record
                .cancelhandling
                .fetch_and(!CANCELSTATE_DISABLED, Ordering::SeqCst),
        };
        Ok(CancelState::from_bits(previous))
    }

    /// Whether the calling thread has a cancel request it should act on now.
    #[must_use]
    pub fn test_cancel(&self) -> bool {
        self.current_record().is_some_and(|(_, record)| {
            cancel_enabled_and_canceled(record.cancelhandling.load(Ordering::SeqCst))
        })
    }
}

impl<F: Futex + 'static> ThreadTable<F> {
    /// Start `body` on a new OS thread bound to a fresh record.
    ///
    /// The body's return value becomes the exit value; a panicking body exits
    /// with [`PTHREAD_CANCELED`].
    pub fn spawn<B>(self: &Arc<Self>, body: B) -> Result<ThreadId, SpawnError>
    where
        B: FnOnce() -> ExitValue + Send + 'static,
    {
        let id = self.register()?;
        let table = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("frankenthread-{}", id.index()))
            .spawn(move || {
                table.bind(id);
                let value = catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|_| {
                    log::warn!("thread {id} panicked; exiting as canceled");
                    PTHREAD_CANCELED
                });
                table.unbind();
                if let Err(err) = table.on_exit(id, value) {
                    log::error!("thread {id} exit bookkeeping failed: {err}");
                }
            });
        match spawned {
            Ok(_detached) => Ok(id),
            Err(err) => {
                self.reclaim(id);
                Err(SpawnError::Io(err))
            }
        }
    }
}

impl<F> Drop for ThreadTable<F> {
    fn drop(&mut self) {
        let table_id = self.table_id;
        let _ = BINDINGS.try_with(|bindings| {
            if let Ok(mut bindings) = bindings.try_borrow_mut() {
                bindings.retain(|(table, _)| *table != table_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::futex::WaitOutcome;
    use crate::time::Deadline;
    use std::sync::atomic::AtomicU32;

    /// Futex that never sleeps; counts wakes.
    #[derive(Default)]
    struct NullFutex {
        wakes: AtomicU32,
    }

    impl Futex for NullFutex {
        fn wait(&self, _: &AtomicU32, _: u32, _: Option<&Deadline>, _: bool) -> WaitOutcome {
            WaitOutcome::Interrupted
        }

        fn wake(&self, _: &AtomicU32, _: u32, _: bool) -> usize {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[test]
    fn register_hands_out_low_indices_with_odd_generations() {
        let table = ThreadTable::new(NullFutex::default(), 4);
        let a = table.register().unwrap();
        let b = table.register().unwrap();
        assert_eq!((a.index(), a.generation()), (0, 1));
        assert_eq!((b.index(), b.generation()), (1, 1));
        assert_eq!(table.live_count(), 2);
        assert_eq!(table.state(a), Ok(JoinState::Joinable));
    }

    #[test]
    fn exhaustion_is_reported() {
        let table = ThreadTable::new(NullFutex::default(), 1);
        let _a = table.register().unwrap();
        assert!(matches!(table.register(), Err(SpawnError::Exhausted)));
    }

    #[test]
    fn reclaimed_ids_go_stale() {
        let table = ThreadTable::new(NullFutex::default(), 1);
        let a = table.register().unwrap();
        assert!(table.reclaim(a));
        assert!(!table.reclaim(a));
        assert_eq!(table.state(a), Err(JoinError::NoSuchThread));
        let b = table.register().unwrap();
        assert_eq!(b.index(), a.index());
        assert_eq!(b.generation(), 3);
        assert!(!table.contains(a));
        assert!(table.contains(b));
    }

    #[test]
    fn exit_of_joinable_thread_keeps_record_and_wakes() {
        let table = ThreadTable::new(NullFutex::default(), 2);
        let id = table.register().unwrap();
        table.on_exit(id, 42).unwrap();
        assert_eq!(table.state(id), Ok(JoinState::Exited));
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.futex().wakes.load(Ordering::SeqCst), 1);
        let bits = table.cancel_bits(id).unwrap();
        assert_eq!(bits & (EXITING | TERMINATED), EXITING | TERMINATED);
    }

    #[test]
    fn exited_state_is_published_after_terminated_bit() {
        let table = ThreadTable::new(NullFutex::default(), 1);
        for _ in 0..2000 {
            let id = table.register().unwrap();
            std::thread::scope(|scope| {
                scope.spawn(|| table.on_exit(id, 9).unwrap());
                while table.state(id) != Ok(JoinState::Exited) {
                    std::hint::spin_loop();
                }
                let bits = table.cancel_bits(id).unwrap();
                assert_eq!(bits & TERMINATED, TERMINATED);
                assert_eq!(table.join(id), Ok(9));
            });
            // The slot is reused; nothing from the previous owner leaks in.
            let next = table.register().unwrap();
            assert_eq!(next.index(), id.index());
            assert_eq!(table.cancel_bits(next), Ok(0));
            assert!(table.reclaim(next));
        }
    }

    #[test]
    fn robust_head_is_stable_and_empty_across_slot_reuse() {
        let table = ThreadTable::new(NullFutex::default(), 1);
        let first = table.register().unwrap();
        let address = std::ptr::from_ref(table.robust_head(first).unwrap());
        table.on_exit(first, 0).unwrap();
        assert_eq!(table.join(first), Ok(0));
        let second = table.register().unwrap();
        let head = table.robust_head(second).unwrap();
        assert_eq!(std::ptr::from_ref(head), address);
        assert!(head.is_empty());
    }

    #[test]
    fn debug_reports_capacity_and_live_records() {
        let table = ThreadTable::new(NullFutex::default(), 3);
        let _id = table.register().unwrap();
        let text = format!("{table:?}");
        assert!(text.contains("capacity: 3"), "{text}");
        assert!(text.contains("live: 1"), "{text}");
    }

    #[test]
    fn exit_of_detached_thread_reclaims_immediately() {
        let table = ThreadTable::new(NullFutex::default(), 2);
        let id = table.register().unwrap();
        table.detach(id).unwrap();
        assert_eq!(table.detach(id), Err(JoinError::InvalidArgument));
        table.on_exit(id, 7).unwrap();
        assert_eq!(table.live_count(), 0);
        assert_eq!(table.state(id), Err(JoinError::NoSuchThread));
    }

    #[test]
    fn detaching_an_exited_thread_reclaims_it() {
        let table = ThreadTable::new(NullFutex::default(), 2);
        let id = table.register().unwrap();
        table.on_exit(id, 1).unwrap();
        table.detach(id).unwrap();
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn binding_is_per_table() {
        let first = ThreadTable::new(NullFutex::default(), 2);
        let second = ThreadTable::new(NullFutex::default(), 2);
        let id = first.register().unwrap();
        first.bind(id);
        assert_eq!(first.current(), Some(id));
        assert_eq!(second.current(), None);
        first.unbind();
        assert_eq!(first.current(), None);
    }

    #[test]
    fn adopt_current_is_idempotent() {
        let table = ThreadTable::new(NullFutex::default(), 2);
        let a = table.adopt_current().unwrap();
        let b = table.adopt_current().unwrap();
        assert_eq!(a, b);
        assert_eq!(table.live_count(), 1);
        table.unbind();
    }

    #[test]
    fn cancel_state_round_trip() {
        let table = ThreadTable::new(NullFutex::default(), 2);
        assert_eq!(
            table.set_cancel_state(CancelState::Disable),
            Err(JoinError::NoSuchThread)
        );
        let me = table.adopt_current().unwrap();
        assert_eq!(
            table.set_cancel_state(CancelState::Disable),
            Ok(CancelState::Enable)
        );
        table.cancel(me).unwrap();
        assert!(!table.test_cancel());
        assert_eq!(
            table.set_cancel_state(CancelState::Enable),
            Ok(CancelState::Disable)
        );
        assert!(table.test_cancel());
        table.unbind();
    }
}
