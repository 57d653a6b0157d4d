//! # frankenthreads-harness
//!
//! Stress scenarios for the join coordinator and the lazy link, reported as
//! canonical JSONL through [`structured_log`].

#![forbid(unsafe_code)]

#[cfg(target_os = "linux")]
pub mod scenarios;
pub mod structured_log;
