//! Runtime configuration.
//!
//! Configuration is read from the environment once and cached:
//! - `FRANKENTHREADS_MAX_THREADS`: capacity of the process-global thread record
//!   arena (default 1024, clamped to `[16, 65536]`).
//! - `FRANKENTHREADS_UNWIND_SONAME`: companion unwinder library to bind
//!   (default `libgcc_s.so.1`).
//! - `FRANKENTHREADS_POINTER_GUARD`: `on` (default) mangles published capability
//!   pointers, `off` stores them verbatim.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

pub const ENV_MAX_THREADS: &str = "FRANKENTHREADS_MAX_THREADS";
pub const ENV_UNWIND_SONAME: &str = "FRANKENTHREADS_UNWIND_SONAME";
pub const ENV_POINTER_GUARD: &str = "FRANKENTHREADS_POINTER_GUARD";

pub const DEFAULT_MAX_THREADS: usize = 1024;
pub const MIN_MAX_THREADS: usize = 16;
pub const MAX_MAX_THREADS: usize = 65536;

/// Shared object name of the GCC unwinder.
pub const DEFAULT_UNWIND_SONAME: &str = "libgcc_s.so.1";

/// Whether capability pointers are obfuscated before publication.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerGuardMode {
    /// Mangle with the per-process guard value.
    #[default]
    On,
    /// Identity transform.
    Off,
}

impl PointerGuardMode {
    /// Parse from string (case-insensitive). Unknown values keep the guard on.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" | "false" | "none" | "disabled" => Self::Off,
            _ => Self::On,
        }
    }

    #[must_use]
    pub const fn enabled(self) -> bool {
        matches!(self, Self::On)
    }
}

/// Parsed runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub max_threads: usize,
    pub unwind_soname: Option<String>,
    pub pointer_guard: PointerGuardMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            unwind_soname: None,
            pointer_guard: PointerGuardMode::On,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_threads = lookup(ENV_MAX_THREADS)
            .and_then(|raw| parse_max_threads(&raw))
            .unwrap_or(DEFAULT_MAX_THREADS);
        let unwind_soname = lookup(ENV_UNWIND_SONAME).and_then(|raw| parse_unwind_soname(&raw));
        let pointer_guard = lookup(ENV_POINTER_GUARD)
            .map(|raw| PointerGuardMode::from_str_loose(&raw))
            .unwrap_or_default();
        Self {
            max_threads,
            unwind_soname,
            pointer_guard,
        }
    }

    /// Build a configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Library name the unwind link should open.
    #[must_use]
    pub fn unwind_soname(&self) -> &str {
        self.unwind_soname.as_deref().unwrap_or(DEFAULT_UNWIND_SONAME)
    }
}

fn parse_max_threads(raw: &str) -> Option<usize> {
    let value: usize = raw.trim().parse().ok()?;
    Some(value.clamp(MIN_MAX_THREADS, MAX_MAX_THREADS))
}

fn parse_unwind_soname(raw: &str) -> Option<String> {
    let name = raw.trim();
    (!name.is_empty() && !name.contains('\0')).then(|| name.to_string())
}

/// `FRANKENTHREADS_UNWIND_SONAME`, read from the environment on every call.
///
/// The unwind link's slow path consults this instead of [`runtime_config`]:
/// it must never wait on a once-cell that a thread lost to `fork` left
/// mid-initialization.
#[must_use]
pub fn unwind_soname_override() -> Option<String> {
    parse_unwind_soname(&std::env::var(ENV_UNWIND_SONAME).ok()?)
}

/// Process-wide configuration, resolved from the environment on first use.
pub fn runtime_config() -> &'static RuntimeConfig {
    static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();
    CONFIG.get_or_init(RuntimeConfig::from_env)
}

// Atomic cache: 0=unresolved, 1=On, 2=Off, 255=resolving.
// The pointer guard mode is consulted from the unwinder's slow path, which
// must never block on a once-cell that may itself be mid-initialization.
static CACHED_GUARD: AtomicU8 = AtomicU8::new(0);

const GUARD_UNRESOLVED: u8 = 0;
const GUARD_ON: u8 = 1;
const GUARD_OFF: u8 = 2;
const GUARD_RESOLVING: u8 = 255;

fn guard_to_u8(mode: PointerGuardMode) -> u8 {
    match mode {
        PointerGuardMode::On => GUARD_ON,
        PointerGuardMode::Off => GUARD_OFF,
    }
}

fn u8_to_guard(v: u8) -> PointerGuardMode {
    match v {
        GUARD_OFF => PointerGuardMode::Off,
        _ => PointerGuardMode::On,
    }
}

/// Get the configured pointer guard mode (reads env var on first call, caches thereafter).
///
/// A call that races the resolving thread sees `On`.
#[must_use]
pub fn pointer_guard_mode() -> PointerGuardMode {
    let cached = CACHED_GUARD.load(Ordering::Acquire);
    if cached != GUARD_UNRESOLVED && cached != GUARD_RESOLVING {
        return u8_to_guard(cached);
    }
    if cached == GUARD_RESOLVING {
        return PointerGuardMode::On;
    }

    if CACHED_GUARD
        .compare_exchange(
            GUARD_UNRESOLVED,
            GUARD_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_GUARD.load(Ordering::Acquire);
        return if v != GUARD_UNRESOLVED && v != GUARD_RESOLVING {
            u8_to_guard(v)
        } else {
            PointerGuardMode::On
        };
    }

    let mode = std::env::var(ENV_POINTER_GUARD)
        .map(|v| PointerGuardMode::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_GUARD.store(guard_to_u8(mode), Ordering::Release);
    mode
}
