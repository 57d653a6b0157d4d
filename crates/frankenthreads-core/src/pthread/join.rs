//! The join family: `timed_join`, `join`, `try_join`, `clock_join`.

use std::sync::atomic::Ordering;

use super::cancel::{LEAVING_MASK, cancel_enabled_and_canceled};
use super::record::{JoinState, ThreadId, ThreadRecord};
use super::table::ThreadTable;
use super::{ExitValue, JoinError};
use crate::futex::{Futex, WaitOutcome};
use crate::time::{Deadline, Timespec};

impl<F: Futex> ThreadTable<F> {
    /// Wait for `id` to exit and take its exit value.
    ///
    /// `deadline` is absolute on its own clock and checked before anything
    /// else: an unsupported clock or a nanosecond field outside `[0, 1e9)` is
    /// `InvalidArgument` with no side effects. The wait is a cancellation
    /// point; a canceled caller returns `Canceled` and leaves the target's
    /// result in place.
    ///
    /// At most one join per thread may succeed. A second joiner racing the
    /// first is a caller error; it gets `NoSuchThread` or blocks, but the
    /// record is never handed back twice.
    pub fn timed_join(
        &self,
        id: ThreadId,
        deadline: Option<&Deadline>,
    ) -> Result<ExitValue, JoinError> {
        if deadline.is_some_and(|deadline| !deadline.is_well_formed()) {
            return Err(JoinError::InvalidArgument);
        }
        let target = self.record(id)?;
        let caller = self.current_record();

        loop {
            if !target.is_current(id) {
                return Err(JoinError::NoSuchThread);
            }
            let observed = target.joinstate.load(Ordering::Acquire);
            let state = JoinState::from_raw(observed);
            if state == JoinState::Exited {
                break;
            }
            if would_deadlock(id, target, caller) {
                log::debug!("join of thread {id} would deadlock");
                return Err(JoinError::WouldDeadlock);
            }
            if state == JoinState::Detached {
                return Err(JoinError::InvalidArgument);
            }

            let outcome = match caller {
                Some((_, me)) => self.wait_cancelable(me, id, target, observed, deadline)?,
                None => self.futex.wait(&target.joinstate, observed, deadline, true),
            };
            match outcome {
                WaitOutcome::TimedOut => return Err(JoinError::TimedOut),
                WaitOutcome::Overflow => return Err(JoinError::Overflow),
                WaitOutcome::Woken | WaitOutcome::Interrupted => {}
            }
        }

        self.consume(id, target)
    }

    /// One futex wait that gives up early if `me` is canceled.
    fn wait_cancelable(
        &self,
        me: &ThreadRecord,
        id: ThreadId,
        target: &ThreadRecord,
        observed: u32,
        deadline: Option<&Deadline>,
    ) -> Result<WaitOutcome, JoinError> {
        if cancel_enabled_and_canceled(me.cancelhandling.load(Ordering::SeqCst)) {
            return Err(JoinError::Canceled);
        }
        me.blocked_on.store(id.index() + 1, Ordering::SeqCst);
        if cancel_enabled_and_canceled(me.cancelhandling.load(Ordering::SeqCst)) {
            me.blocked_on.store(0, Ordering::SeqCst);
            return Err(JoinError::Canceled);
        }
        let outcome = self.futex.wait(&target.joinstate, observed, deadline, true);
        me.blocked_on.store(0, Ordering::SeqCst);
        if cancel_enabled_and_canceled(me.cancelhandling.load(Ordering::SeqCst))
            && target.state() != JoinState::Exited
        {
            log::debug!("join of thread {id} canceled");
            return Err(JoinError::Canceled);
        }
        Ok(outcome)
    }

    /// Take the exit value of an `Exited` record and reclaim its slot.
    fn consume(&self, id: ThreadId, target: &ThreadRecord) -> Result<ExitValue, JoinError> {
        let value = {
            let mut result = target.result.lock();
            // A reused slot resets `result` under this lock after bumping the
            // generation, so a matching generation here means it is ours.
            if !target.is_current(id) {
                return Err(JoinError::NoSuchThread);
            }
            result.take()
        };
        let Some(value) = value else {
            return Err(JoinError::NoSuchThread);
        };
        self.reclaim(id);
        log::trace!("thread {id} joined");
        Ok(value)
    }

    /// Wait without a deadline.
    pub fn join(&self, id: ThreadId) -> Result<ExitValue, JoinError> {
        self.timed_join(id, None)
    }

    /// Join only if `id` has already exited; `Busy` otherwise.
    pub fn try_join(&self, id: ThreadId) -> Result<ExitValue, JoinError> {
        if self.record(id)?.state() != JoinState::Exited {
            return Err(JoinError::Busy);
        }
        self.timed_join(id, None)
    }

    /// Join with an absolute deadline on `clock`.
    pub fn clock_join(
        &self,
        id: ThreadId,
        clock: i32,
        abstime: Timespec,
    ) -> Result<ExitValue, JoinError> {
        self.timed_join(id, Some(&Deadline::new(clock, abstime)))
    }

    /// Join with an absolute `CLOCK_REALTIME` deadline.
    pub fn timed_join_realtime(
        &self,
        id: ThreadId,
        abstime: Timespec,
    ) -> Result<ExitValue, JoinError> {
        self.timed_join(id, Some(&Deadline::realtime(abstime)))
    }
}

/// Best-effort self-deadlock detection; misses are possible.
///
/// Joining yourself always deadlocks. A detached caller joining a thread that
/// is not already on its way out is also reported, unless the caller has a
/// pending cancel that the wait would act on anyway.
fn would_deadlock(
    id: ThreadId,
    target: &ThreadRecord,
    caller: Option<(ThreadId, &ThreadRecord)>,
) -> bool {
    let Some((me, mine)) = caller else {
        return false;
    };
    if cancel_enabled_and_canceled(mine.cancelhandling.load(Ordering::Relaxed)) {
        return false;
    }
    me == id
        || (mine.state() == JoinState::Detached
            && target.cancelhandling.load(Ordering::Relaxed) & LEAVING_MASK == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pthread::CANCELED;
    use crate::time::{CLOCK_MONOTONIC, CLOCK_PROCESS_CPUTIME_ID, NSEC_PER_SEC};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    /// Futex that replays scripted outcomes and records every wait.
    #[derive(Default)]
    struct ScriptedFutex {
        script: parking_lot::Mutex<VecDeque<WaitOutcome>>,
        waits: AtomicU32,
    }

    impl ScriptedFutex {
        fn with(outcomes: &[WaitOutcome]) -> Self {
            Self {
                script: parking_lot::Mutex::new(outcomes.iter().copied().collect()),
                waits: AtomicU32::new(0),
            }
        }
    }

    impl Futex for ScriptedFutex {
        fn wait(&self, word: &AtomicU32, expected: u32, _: Option<&Deadline>, _: bool) -> WaitOutcome {
            self.waits.fetch_add(1, Ordering::SeqCst);
            if word.load(Ordering::SeqCst) != expected {
                return WaitOutcome::Woken;
            }
            self.script
                .lock()
                .pop_front()
                .unwrap_or(WaitOutcome::TimedOut)
        }

        fn wake(&self, _: &AtomicU32, _: u32, _: bool) -> usize {
            0
        }
    }

    fn table(outcomes: &[WaitOutcome]) -> ThreadTable<ScriptedFutex> {
        ThreadTable::new(ScriptedFutex::with(outcomes), 8)
    }

    #[test]
    fn exited_thread_joins_without_waiting() {
        let table = table(&[]);
        let id = table.register().unwrap();
        table.on_exit(id, 99).unwrap();
        assert_eq!(table.join(id), Ok(99));
        assert_eq!(table.futex().waits.load(Ordering::SeqCst), 0);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn second_join_sees_a_stale_id() {
        let table = table(&[]);
        let id = table.register().unwrap();
        table.on_exit(id, 5).unwrap();
        assert_eq!(table.join(id), Ok(5));
        assert_eq!(table.join(id), Err(JoinError::NoSuchThread));
        assert_eq!(table.live_count(), 0);
        // The slot is reusable exactly once.
        let next = table.register().unwrap();
        assert_eq!(next.index(), id.index());
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn malformed_deadline_is_rejected_before_waiting() {
        let table = table(&[]);
        let id = table.register().unwrap();
        let bad_nanos = Deadline::monotonic(Timespec::new(1, NSEC_PER_SEC));
        assert_eq!(
            table.timed_join(id, Some(&bad_nanos)),
            Err(JoinError::InvalidArgument)
        );
        let bad_clock = Deadline::new(CLOCK_PROCESS_CPUTIME_ID, Timespec::new(1, 0));
        assert_eq!(
            table.timed_join(id, Some(&bad_clock)),
            Err(JoinError::InvalidArgument)
        );
        assert_eq!(table.futex().waits.load(Ordering::SeqCst), 0);
        assert_eq!(table.state(id), Ok(JoinState::Joinable));
    }

    #[test]
    fn timeout_and_overflow_surface_unchanged() {
        let table = table(&[WaitOutcome::TimedOut, WaitOutcome::Overflow]);
        let id = table.register().unwrap();
        let deadline = Deadline::monotonic(Timespec::new(0, 0));
        assert_eq!(
            table.timed_join(id, Some(&deadline)),
            Err(JoinError::TimedOut)
        );
        assert_eq!(
            table.clock_join(id, CLOCK_MONOTONIC, Timespec::new(i64::MAX, 0)),
            Err(JoinError::Overflow)
        );
        assert_eq!(table.state(id), Ok(JoinState::Joinable));
    }

    #[test]
    fn spurious_wakes_loop_until_exit() {
        let table = table(&[WaitOutcome::Interrupted, WaitOutcome::Woken]);
        let id = table.register().unwrap();
        // Both scripted wakes are spurious; the third wait times out.
        assert_eq!(table.join(id), Err(JoinError::TimedOut));
        assert_eq!(table.futex().waits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn self_join_would_deadlock() {
        let table = table(&[]);
        let me = table.adopt_current().unwrap();
        assert_eq!(table.join(me), Err(JoinError::WouldDeadlock));
        assert_eq!(table.futex().waits.load(Ordering::SeqCst), 0);
        table.unbind();
    }

    #[test]
    fn detached_caller_joining_a_running_thread_would_deadlock() {
        let table = table(&[]);
        let me = table.adopt_current().unwrap();
        let other = table.register().unwrap();
        table.detach(me).unwrap();
        assert_eq!(table.join(other), Err(JoinError::WouldDeadlock));

        // Not reported once the target is already leaving.
        table.cancel(other).unwrap();
        assert_eq!(table.join(other), Err(JoinError::TimedOut));
        table.unbind();
    }

    #[test]
    fn joining_a_detached_thread_is_invalid() {
        let table = table(&[]);
        let id = table.register().unwrap();
        table.detach(id).unwrap();
        assert_eq!(table.join(id), Err(JoinError::InvalidArgument));
    }

    #[test]
    fn canceled_joiner_leaves_result_in_place() {
        let table = table(&[]);
        let me = table.adopt_current().unwrap();
        let other = table.register().unwrap();
        table.cancel(me).unwrap();
        assert_ne!(table.cancel_bits(me).unwrap() & CANCELED, 0);
        assert_eq!(table.join(other), Err(JoinError::Canceled));
        assert_eq!(table.futex().waits.load(Ordering::SeqCst), 0);

        // A canceled self-join acts on the cancel rather than the deadlock.
        assert_eq!(table.join(me), Err(JoinError::Canceled));

        table.on_exit(other, 11).unwrap();
        table.unbind();
        assert_eq!(table.join(other), Ok(11));
    }

    #[test]
    fn try_join_is_busy_until_exit() {
        let table = table(&[]);
        let id = table.register().unwrap();
        assert_eq!(table.try_join(id), Err(JoinError::Busy));
        table.on_exit(id, 3).unwrap();
        assert_eq!(table.try_join(id), Ok(3));
    }

    #[test]
    fn realtime_join_uses_the_deadline() {
        let table = table(&[WaitOutcome::TimedOut]);
        let id = table.register().unwrap();
        assert_eq!(
            table.timed_join_realtime(id, Timespec::new(0, 0)),
            Err(JoinError::TimedOut)
        );
    }
}
