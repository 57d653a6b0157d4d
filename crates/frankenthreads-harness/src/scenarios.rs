//! Stress scenarios over the real futex backend.
//!
//! Every scenario checks its own postconditions and emits one JSONL record
//! per check, ending with a `scenario_done` summary.

use std::io::Write;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::time::{Duration, Instant};

use frankenthreads_core::futex::LinuxFutex;
use frankenthreads_core::link::IdentityGuard;
use frankenthreads_core::pthread::{JoinError, JoinState, SpawnError};
use frankenthreads_core::time::{CLOCK_MONOTONIC, Deadline};
use frankenthreads_core::{LazyLink, LibraryHandle, LinkSpec, Loader, ThreadId, ThreadTable};

use crate::structured_log::{LogEmitter, LogLevel, Outcome};

/// Harness scenario names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    JoinStress,
    JoinTimeout,
    CancelJoiner,
    DetachReclaim,
    LinkRace,
}

impl Scenario {
    pub const ALL: [Self; 5] = [
        Self::JoinStress,
        Self::JoinTimeout,
        Self::CancelJoiner,
        Self::DetachReclaim,
        Self::LinkRace,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::JoinStress => "join-stress",
            Self::JoinTimeout => "join-timeout",
            Self::CancelJoiner => "cancel-joiner",
            Self::DetachReclaim => "detach-reclaim",
            Self::LinkRace => "link-race",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ScenarioError> {
        Self::ALL
            .into_iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| ScenarioError::Unknown(name.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("unknown scenario '{0}'")]
    Unknown(String),
    #[error("{scenario}: {detail}")]
    Mismatch {
        scenario: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("log write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Knobs shared by all scenarios.
#[derive(Debug, Clone, Copy)]
pub struct ScenarioConfig {
    pub threads: usize,
    pub iterations: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            threads: 16,
            iterations: 8,
        }
    }
}

/// Summary of one scenario run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub checks: u64,
    pub duration_ms: u64,
}

struct Run<'a, W: Write> {
    scenario: Scenario,
    log: &'a mut LogEmitter<W>,
    checks: u64,
}

impl<W: Write> Run<'_, W> {
    fn pass(&mut self, event: &str, thread: Option<ThreadId>, latency: Duration) -> std::io::Result<()> {
        self.checks += 1;
        let mut entry = self
            .log
            .entry(LogLevel::Info, event)
            .with_scenario(self.scenario.name())
            .with_outcome(Outcome::Pass)
            .with_latency_ns(u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX));
        if let Some(id) = thread {
            entry = entry.with_thread(id);
        }
        self.log.emit_entry(entry)
    }

    fn fail(&mut self, event: &str, detail: String, errno: Option<i32>) -> ScenarioError {
        let mut entry = self
            .log
            .entry(LogLevel::Error, event)
            .with_scenario(self.scenario.name())
            .with_outcome(Outcome::Fail)
            .with_details(serde_json::json!({ "detail": detail }));
        if let Some(errno) = errno {
            entry = entry.with_errno(errno);
        }
        if let Err(err) = self.log.emit_entry(entry) {
            return ScenarioError::Io(err);
        }
        ScenarioError::Mismatch {
            scenario: self.scenario.name(),
            detail,
        }
    }

    fn expect_join(
        &mut self,
        event: &str,
        got: Result<usize, JoinError>,
        want: Result<usize, JoinError>,
        thread: ThreadId,
        latency: Duration,
    ) -> Result<(), ScenarioError> {
        if got == want {
            self.pass(event, Some(thread), latency)?;
            Ok(())
        } else {
            let errno = got.err().map(JoinError::errno);
            Err(self.fail(event, format!("thread {thread}: got {got:?}, want {want:?}"), errno))
        }
    }
}

/// Run `scenario`, logging each check to `log`.
pub fn run<W: Write>(
    scenario: Scenario,
    config: &ScenarioConfig,
    log: &mut LogEmitter<W>,
) -> Result<ScenarioReport, ScenarioError> {
    let started = Instant::now();
    let mut run = Run {
        scenario,
        log,
        checks: 0,
    };
    match scenario {
        Scenario::JoinStress => join_stress(&mut run, config)?,
        Scenario::JoinTimeout => join_timeout(&mut run)?,
        Scenario::CancelJoiner => cancel_joiner(&mut run)?,
        Scenario::DetachReclaim => detach_reclaim(&mut run, config)?,
        Scenario::LinkRace => link_race(&mut run, config)?,
    }
    let report = ScenarioReport {
        scenario: scenario.name(),
        checks: run.checks,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    let done = run
        .log
        .entry(LogLevel::Info, "scenario_done")
        .with_scenario(scenario.name())
        .with_outcome(Outcome::Pass)
        .with_duration_ms(report.duration_ms)
        .with_details(serde_json::json!({ "checks": report.checks }));
    run.log.emit_entry(done)?;
    Ok(report)
}

fn new_table(capacity: usize) -> Arc<ThreadTable<LinuxFutex>> {
    Arc::new(ThreadTable::new(LinuxFutex, capacity.max(4)))
}

fn spawn_gated(
    table: &Arc<ThreadTable<LinuxFutex>>,
    value: usize,
) -> Result<(ThreadId, mpsc::Sender<()>), SpawnError> {
    let (tx, rx) = mpsc::channel::<()>();
    let id = table.spawn(move || {
        let _ = rx.recv();
        value
    })?;
    Ok((id, tx))
}

fn join_stress<W: Write>(run: &mut Run<'_, W>, config: &ScenarioConfig) -> Result<(), ScenarioError> {
    let table = new_table(config.threads);
    for round in 0..config.iterations {
        let ids = (0..config.threads)
            .map(|i| table.spawn(move || i * 31 + round))
            .collect::<Result<Vec<_>, _>>()?;
        for (i, id) in ids.into_iter().enumerate() {
            let start = Instant::now();
            let got = table.join(id);
            run.expect_join("join_value", got, Ok(i * 31 + round), id, start.elapsed())?;
        }
    }
    if table.live_count() != 0 {
        let live = table.live_count();
        return Err(run.fail("records_reclaimed", format!("{live} records still live"), None));
    }
    run.pass("records_reclaimed", None, Duration::ZERO)?;
    Ok(())
}

fn join_timeout<W: Write>(run: &mut Run<'_, W>) -> Result<(), ScenarioError> {
    let table = new_table(4);
    let (id, release) = spawn_gated(&table, 11)?;

    let start = Instant::now();
    let deadline = Deadline::after(CLOCK_MONOTONIC, Duration::from_millis(20))
        .ok_or(JoinError::Overflow)?;
    let got = table.timed_join(id, Some(&deadline));
    run.expect_join("timed_join_expires", got, Err(JoinError::TimedOut), id, start.elapsed())?;

    if table.state(id)? != JoinState::Joinable {
        return Err(run.fail("target_untouched", format!("thread {id} left joinable state"), None));
    }
    run.pass("target_untouched", Some(id), Duration::ZERO)?;

    let _ = release.send(());
    let start = Instant::now();
    let got = table.join(id);
    run.expect_join("join_after_timeout", got, Ok(11), id, start.elapsed())
}

fn cancel_joiner<W: Write>(run: &mut Run<'_, W>) -> Result<(), ScenarioError> {
    let table = new_table(4);
    let (target, release) = spawn_gated(&table, 5)?;
    let inner = Arc::clone(&table);
    let joiner = table.spawn(move || match inner.join(target) {
        Err(JoinError::Canceled) => 1,
        _ => 0,
    })?;

    std::thread::sleep(Duration::from_millis(20));
    let start = Instant::now();
    table.cancel(joiner)?;
    let got = table.join(joiner);
    run.expect_join("canceled_joiner_returns", got, Ok(1), joiner, start.elapsed())?;

    let _ = release.send(());
    let start = Instant::now();
    let got = table.join(target);
    run.expect_join("target_result_kept", got, Ok(5), target, start.elapsed())
}

fn detach_reclaim<W: Write>(run: &mut Run<'_, W>, config: &ScenarioConfig) -> Result<(), ScenarioError> {
    let table = new_table(config.threads);
    let mut gated = Vec::with_capacity(config.threads);
    for i in 0..config.threads {
        let (id, release) = spawn_gated(&table, i)?;
        table.detach(id)?;
        gated.push((id, release));
    }
    for (id, release) in &gated {
        let got = table.join(*id);
        run.expect_join("join_detached_rejected", got, Err(JoinError::InvalidArgument), *id, Duration::ZERO)?;
        let _ = release.send(());
    }

    let start = Instant::now();
    while table.live_count() != 0 {
        if start.elapsed() > Duration::from_secs(5) {
            let live = table.live_count();
            return Err(run.fail("detached_self_reclaim", format!("{live} records still live"), None));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    run.pass("detached_self_reclaim", None, start.elapsed())?;
    Ok(())
}

const RACE_SPEC: LinkSpec<3> = LinkSpec {
    soname: "libharness-companion.so.1",
    symbols: ["open_stream", "read_stream", "close_stream"],
};

/// In-memory loader that counts opens and closes.
#[derive(Debug, Default)]
struct CountingLoader {
    opens: AtomicU32,
    closes: AtomicU32,
}

impl Loader for CountingLoader {
    fn open(&self, _soname: &str) -> Option<LibraryHandle> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst) as usize;
        std::thread::sleep(Duration::from_millis(1));
        LibraryHandle::from_raw(0x1000 + n)
    }

    fn resolve(&self, _handle: LibraryHandle, symbol: &str) -> Option<NonZeroUsize> {
        NonZeroUsize::new(0x10_0000 + symbol.len())
    }

    fn close(&self, _handle: LibraryHandle) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn link_race<W: Write>(run: &mut Run<'_, W>, config: &ScenarioConfig) -> Result<(), ScenarioError> {
    let callers = config.threads.max(2);
    for _ in 0..config.iterations {
        let link = LazyLink::new(RACE_SPEC, CountingLoader::default(), IdentityGuard);
        let barrier = Barrier::new(callers);
        let start = Instant::now();
        let tables: Vec<Option<usize>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..callers)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        link.get().map(|caps| std::ptr::from_ref(caps.table()) as usize)
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap_or(None))
                .collect()
        });
        let elapsed = start.elapsed();

        let first = tables.first().copied().flatten();
        if first.is_none() || tables.iter().any(|t| *t != first) {
            return Err(run.fail("single_publication", format!("tables differ: {tables:?}"), None));
        }
        let opens = link.loader().opens.load(Ordering::SeqCst);
        let closes = link.loader().closes.load(Ordering::SeqCst);
        if opens.checked_sub(closes) != Some(1) {
            return Err(run.fail(
                "one_reference_kept",
                format!("{opens} opens, {closes} closes"),
                None,
            ));
        }
        run.pass("single_publication", None, elapsed)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured_log::validate_log_line;

    fn run_and_validate(scenario: Scenario) -> ScenarioReport {
        let mut log = LogEmitter::to_buffer("ft", "unit");
        let config = ScenarioConfig {
            threads: 4,
            iterations: 2,
        };
        let report = run(scenario, &config, &mut log).unwrap();
        let text = String::from_utf8(log.into_writer()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len() as u64, report.checks + 1);
        for (i, line) in lines.iter().enumerate() {
            let entry = validate_log_line(line, i + 1).unwrap();
            assert_eq!(entry.scenario.as_deref(), Some(scenario.name()));
            assert_eq!(entry.outcome, Some(Outcome::Pass));
        }
        report
    }

    #[test]
    fn names_round_trip() {
        for scenario in Scenario::ALL {
            assert_eq!(Scenario::from_name(scenario.name()).unwrap(), scenario);
        }
        assert!(matches!(
            Scenario::from_name("nope"),
            Err(ScenarioError::Unknown(name)) if name == "nope"
        ));
    }

    #[test]
    fn join_stress_checks_every_thread() {
        let report = run_and_validate(Scenario::JoinStress);
        assert_eq!(report.checks, 4 * 2 + 1);
    }

    #[test]
    fn join_timeout_passes() {
        assert_eq!(run_and_validate(Scenario::JoinTimeout).checks, 3);
    }

    #[test]
    fn cancel_joiner_passes() {
        assert_eq!(run_and_validate(Scenario::CancelJoiner).checks, 2);
    }

    #[test]
    fn detach_reclaim_passes() {
        assert_eq!(run_and_validate(Scenario::DetachReclaim).checks, 4 + 1);
    }

    #[test]
    fn link_race_passes() {
        assert_eq!(run_and_validate(Scenario::LinkRace).checks, 2);
    }

    #[test]
    fn failures_are_logged_with_details() {
        let mut log = LogEmitter::to_buffer("ft", "unit");
        let mut run = Run {
            scenario: Scenario::JoinStress,
            log: &mut log,
            checks: 0,
        };
        let err = run.fail("join_value", "boom".to_string(), Some(110));
        assert!(matches!(err, ScenarioError::Mismatch { scenario: "join-stress", .. }));
        let text = String::from_utf8(log.into_writer()).unwrap();
        let entry = validate_log_line(text.trim(), 1).unwrap();
        assert_eq!(entry.outcome, Some(Outcome::Fail));
        assert_eq!(entry.errno, Some(110));
    }
}
