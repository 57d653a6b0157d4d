//! CLI entrypoint for the FrankenThreads harness.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use frankenthreads_harness::structured_log::{ArtifactIndex, LogEmitter, validate_log_file};

/// Stress and conformance tooling for FrankenThreads.
#[derive(Debug, Parser)]
#[command(name = "frankenthreads-harness")]
#[command(about = "Stress and conformance harness for FrankenThreads")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one scenario (or `all`) and emit JSONL results.
    Run {
        /// Scenario name, or `all`.
        #[arg(long, default_value = "all")]
        scenario: String,
        /// Threads per round.
        #[arg(long, default_value_t = 16)]
        threads: usize,
        /// Rounds per scenario.
        #[arg(long, default_value_t = 8)]
        iterations: usize,
        /// Run identifier embedded in trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
        /// JSONL output path (stdout if omitted).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Artifact index output path; requires `--log`.
        #[arg(long, requires = "log")]
        artifact_index: Option<PathBuf>,
    },
    /// List scenario names.
    List,
    /// Validate a JSONL log file against the schema.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

#[cfg(target_os = "linux")]
fn run_scenarios<W: Write>(
    names: &str,
    config: &frankenthreads_harness::scenarios::ScenarioConfig,
    log: &mut LogEmitter<W>,
) -> Result<(), String> {
    use frankenthreads_harness::scenarios::{Scenario, run};

    let selected = if names == "all" {
        Scenario::ALL.to_vec()
    } else {
        vec![Scenario::from_name(names).map_err(|e| e.to_string())?]
    };
    let mut failures = 0usize;
    for scenario in selected {
        match run(scenario, config, log) {
            Ok(report) => eprintln!(
                "PASS {} ({} checks, {} ms)",
                report.scenario, report.checks, report.duration_ms
            ),
            Err(err) => {
                failures += 1;
                eprintln!("FAIL {}: {err}", scenario.name());
            }
        }
    }
    log.flush().map_err(|e| format!("flushing log: {e}"))?;
    if failures == 0 {
        Ok(())
    } else {
        Err(format!("{failures} scenario(s) failed"))
    }
}

#[cfg(not(target_os = "linux"))]
fn run_scenarios<W: Write>(
    _names: &str,
    _config: &(),
    _log: &mut LogEmitter<W>,
) -> Result<(), String> {
    Err("scenarios require Linux futexes".to_string())
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run {
            scenario,
            threads,
            iterations,
            run_id,
            log,
            artifact_index,
        } => {
            #[cfg(target_os = "linux")]
            let config = frankenthreads_harness::scenarios::ScenarioConfig {
                threads,
                iterations,
            };
            #[cfg(not(target_os = "linux"))]
            let config = {
                let _ = (threads, iterations);
            };
            let ran = match &log {
                Some(path) => LogEmitter::to_file(path, "frankenthreads", &run_id)
                    .map_err(|e| format!("creating {}: {e}", path.display()))
                    .and_then(|mut emitter| run_scenarios(&scenario, &config, &mut emitter)),
                None => {
                    let mut emitter =
                        LogEmitter::new(std::io::stdout().lock(), "frankenthreads", &run_id);
                    run_scenarios(&scenario, &config, &mut emitter)
                }
            };
            ran.and_then(|()| match (log, artifact_index) {
                (Some(log), Some(index_path)) => {
                    let mut index = ArtifactIndex::new(&run_id);
                    index
                        .add_file(&log, "log")
                        .map_err(|e| format!("hashing {}: {e}", log.display()))?;
                    let json = index.to_json().map_err(|e| e.to_string())?;
                    std::fs::write(&index_path, json)
                        .map_err(|e| format!("writing {}: {e}", index_path.display()))
                }
                _ => Ok(()),
            })
        }
        Command::List => {
            #[cfg(target_os = "linux")]
            for scenario in frankenthreads_harness::scenarios::Scenario::ALL {
                println!("{}", scenario.name());
            }
            Ok(())
        }
        Command::ValidateLog { log } => match validate_log_file(&log) {
            Ok((lines, errors)) if errors.is_empty() => {
                println!("{}: {lines} lines valid", log.display());
                Ok(())
            }
            Ok((lines, errors)) => {
                for err in &errors {
                    eprintln!("{err}");
                }
                Err(format!("{} errors in {lines} lines", errors.len()))
            }
            Err(err) => Err(format!("reading {}: {err}", log.display())),
        },
    };

    if let Err(message) = result {
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}
