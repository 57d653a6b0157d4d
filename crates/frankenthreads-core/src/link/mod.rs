//! Lazy, fork-safe binding of an optional companion library.
//!
//! A [`LazyLink`] opens a shared object on first use, resolves a fixed list of
//! symbols into a statically allocated [`CapabilityTable`] and publishes it
//! with a release-store of the library handle. Readers acquire-load the
//! handle; once it is non-zero the table is complete and immutable, so the
//! steady-state path is a single atomic load with no lock and no allocation.
//!
//! First callers race through the slow path: each opens and resolves outside
//! the lock, then the first to take [`ProcessLock`] publishes and every loser
//! closes its own handle. A failed open is not cached; the next caller tries
//! again. A library that opens but lacks a required symbol is corrupt and the
//! process aborts rather than expose a partial table.

mod guard;
mod lock;

pub use guard::{IdentityGuard, PointerGuard, XorRotateGuard};
pub use lock::{ProcessLock, ProcessLockGuard};

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::fork::ForkHandler;

/// Opaque, non-null handle for an opened library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryHandle(NonZeroUsize);

impl LibraryHandle {
    #[must_use]
    pub const fn new(raw: NonZeroUsize) -> Self {
        Self(raw)
    }

    /// `None` for the null handle.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0.get()
    }
}

/// Dynamic loader used to bind a [`LazyLink`].
pub trait Loader: Sync {
    /// Open `soname`. `None` when the library is absent or unusable.
    fn open(&self, soname: &str) -> Option<LibraryHandle>;

    /// Address of `symbol` in `handle`.
    fn resolve(&self, handle: LibraryHandle, symbol: &str) -> Option<NonZeroUsize>;

    /// Drop one reference to `handle`.
    fn close(&self, handle: LibraryHandle);
}

/// What to open and which symbols must resolve, in slot order.
#[derive(Debug, Clone, Copy)]
pub struct LinkSpec<const N: usize> {
    pub soname: &'static str,
    pub symbols: [&'static str; N],
}

impl<const N: usize> LinkSpec<N> {
    /// Slot index of `symbol`.
    #[must_use]
    pub fn slot_of(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|s| *s == symbol)
    }
}

/// Statically allocated slots holding mangled symbol addresses.
///
/// Slots are written with relaxed stores before the owning link's
/// release-store of its handle and are never written again while published.
#[derive(Debug)]
pub struct CapabilityTable<const N: usize> {
    slots: [AtomicUsize; N],
}

impl<const N: usize> CapabilityTable<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicUsize::new(0) }; N],
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        N
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// Stored (mangled) value of slot `index`.
    #[must_use]
    pub fn stored(&self, index: usize) -> Option<usize> {
        self.slots.get(index).map(|slot| slot.load(Ordering::Relaxed))
    }

    fn fill(&self, values: &[usize; N]) {
        for (slot, value) in self.slots.iter().zip(values) {
            slot.store(*value, Ordering::Relaxed);
        }
    }
}

impl<const N: usize> Default for CapabilityTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Failures of the link slow path that are not plain absence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("{soname}: required symbol `{symbol}` is missing")]
    MissingSymbol {
        soname: &'static str,
        symbol: &'static str,
    },
}

/// Log and abort. Used for integrity violations that must not be survived.
pub fn fatal(message: &str) -> ! {
    log::error!("fatal: {message}");
    eprintln!("{message}");
    std::process::abort()
}

/// Read-only view of a published table with pointers demangled.
#[derive(Clone, Copy)]
pub struct Capabilities<'a, const N: usize> {
    table: &'a CapabilityTable<N>,
    symbols: &'a [&'static str; N],
    guard: &'a dyn PointerGuard,
}

impl<'a, const N: usize> Capabilities<'a, N> {
    /// Demangled address held in slot `index`.
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<usize> {
        self.table
            .stored(index)
            .map(|stored| self.guard.demangle(stored))
    }

    /// Demangled address bound to `symbol`.
    #[must_use]
    pub fn lookup(&self, symbol: &str) -> Option<usize> {
        let index = self.symbols.iter().position(|s| *s == symbol)?;
        self.slot(index)
    }

    /// The backing static table (stored representation).
    #[must_use]
    pub fn table(&self) -> &'a CapabilityTable<N> {
        self.table
    }

    /// `(symbol, address)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.symbols
            .iter()
            .enumerate()
            .filter_map(|(index, name)| Some((*name, self.slot(index)?)))
    }
}

impl<const N: usize> std::fmt::Debug for Capabilities<'_, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(name, addr)| (name, format!("{addr:#x}"))))
            .finish()
    }
}

/// Lazily bound companion library with a fork-safe slow path.
pub struct LazyLink<L, G, const N: usize> {
    spec: LinkSpec<N>,
    loader: L,
    guard: G,
    /// 0 = unbound, otherwise the published [`LibraryHandle`].
    handle: AtomicUsize,
    table: CapabilityTable<N>,
    lock: ProcessLock,
}

impl<L, G, const N: usize> LazyLink<L, G, N> {
    /// Unbound link; usable as a `static` initializer.
    #[must_use]
    pub const fn new(spec: LinkSpec<N>, loader: L, guard: G) -> Self {
        Self {
            spec,
            loader,
            guard,
            handle: AtomicUsize::new(0),
            table: CapabilityTable::new(),
            lock: ProcessLock::new(),
        }
    }

    #[must_use]
    pub fn spec(&self) -> &LinkSpec<N> {
        &self.spec
    }

    #[must_use]
    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Whether a table is currently published.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.handle.load(Ordering::Acquire) != 0
    }

    /// Published handle, if any.
    #[must_use]
    pub fn handle(&self) -> Option<LibraryHandle> {
        LibraryHandle::from_raw(self.handle.load(Ordering::Acquire))
    }
}

impl<L: Loader, G: PointerGuard, const N: usize> LazyLink<L, G, N> {
    fn view(&self) -> Capabilities<'_, N> {
        Capabilities {
            table: &self.table,
            symbols: &self.spec.symbols,
            guard: &self.guard,
        }
    }

    /// Published capabilities, binding the library on first use.
    ///
    /// `None` when the library cannot be opened; later calls retry. Aborts the
    /// process if the library opens but a required symbol is missing.
    pub fn get(&self) -> Option<Capabilities<'_, N>> {
        if self.handle.load(Ordering::Acquire) != 0 {
            return Some(self.view());
        }
        match self.bind() {
            Ok(view) => view,
            Err(err) => fatal(&err.to_string()),
        }
    }

    /// Like [`LazyLink::get`] but reports a missing symbol instead of
    /// aborting. The offending handle is closed and nothing is published.
    pub fn try_get(&self) -> Result<Option<Capabilities<'_, N>>, LinkError> {
        if self.handle.load(Ordering::Acquire) != 0 {
            return Ok(Some(self.view()));
        }
        self.bind()
    }

    fn bind(&self) -> Result<Option<Capabilities<'_, N>>, LinkError> {
        let Some(handle) = self.loader.open(self.spec.soname) else {
            log::debug!("link {}: library unavailable", self.spec.soname);
            return Ok(None);
        };

        // Resolve outside the lock; the loader may take its own locks.
        let mut local = [0usize; N];
        for (value, symbol) in local.iter_mut().zip(self.spec.symbols) {
            match self.loader.resolve(handle, symbol) {
                Some(addr) => *value = self.guard.mangle(addr.get()),
                None => {
                    self.loader.close(handle);
                    return Err(LinkError::MissingSymbol {
                        soname: self.spec.soname,
                        symbol,
                    });
                }
            }
        }

        let _guard = self.lock.lock();
        if self.handle.load(Ordering::Relaxed) != 0 {
            // Another caller published first; keep exactly one reference.
            self.loader.close(handle);
            log::trace!("link {}: lost publish race", self.spec.soname);
        } else {
            self.table.fill(&local);
            self.handle.store(handle.get(), Ordering::Release);
            log::debug!(
                "link {}: published {} capabilities",
                self.spec.soname,
                N
            );
        }
        Ok(Some(self.view()))
    }

    /// Close the library and return to the unbound state.
    ///
    /// Process-exit cleanup only; must not run concurrently with `get`.
    pub fn release(&self) {
        let _guard = self.lock.lock();
        let raw = self.handle.swap(0, Ordering::AcqRel);
        if let Some(handle) = LibraryHandle::from_raw(raw) {
            self.loader.close(handle);
            log::debug!("link {}: released", self.spec.soname);
        }
    }

    /// Child-side fork reset.
    ///
    /// If the lock was free nobody was mid-initialization and a published
    /// table stays valid. If it was held, the holder is gone: reset the lock
    /// and forget the handle so the next `get` binds from scratch.
    pub fn reset_after_fork(&self) {
        if let Some(guard) = self.lock.try_lock() {
            drop(guard);
            return;
        }
        self.lock.reset();
        self.handle.store(0, Ordering::Relaxed);
        log::debug!(
            "link {}: slow path interrupted by fork, state reset",
            self.spec.soname
        );
    }
}

impl<L: Loader, G: PointerGuard, const N: usize> ForkHandler for LazyLink<L, G, N> {
    fn after_fork_child(&self) {
        self.reset_after_fork();
    }
}
