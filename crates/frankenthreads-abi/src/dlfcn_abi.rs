//! System dynamic loader behind the [`Loader`] trait.

use std::ffi::CString;
use std::num::NonZeroUsize;

use frankenthreads_core::{LibraryHandle, Loader};

/// `dlopen`/`dlsym`/`dlclose` from the host libc.
#[derive(Debug, Default, Clone, Copy)]
pub struct DlLoader;

impl Loader for DlLoader {
    fn open(&self, soname: &str) -> Option<LibraryHandle> {
        let name = CString::new(soname).ok()?;
        // SAFETY: `name` is a valid NUL-terminated string for the call.
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            log::debug!("dlopen({soname}) failed");
        }
        LibraryHandle::from_raw(handle as usize)
    }

    fn resolve(&self, handle: LibraryHandle, symbol: &str) -> Option<NonZeroUsize> {
        let name = CString::new(symbol).ok()?;
        // SAFETY: `handle` came from a successful dlopen that has not been
        // closed; `name` is NUL-terminated.
        let addr = unsafe { libc::dlsym(handle.get() as *mut libc::c_void, name.as_ptr()) };
        NonZeroUsize::new(addr as usize)
    }

    fn close(&self, handle: LibraryHandle) {
        // SAFETY: each handle is closed at most once by the link that opened it.
        let rc = unsafe { libc::dlclose(handle.get() as *mut libc::c_void) };
        if rc != 0 {
            log::warn!("dlclose({:#x}) failed", handle.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_opens_to_none() {
        assert!(DlLoader.open("libfrankenthreads-does-not-exist.so.9").is_none());
        assert!(DlLoader.open("bad\0name").is_none());
    }

    #[test]
    #[cfg(target_env = "gnu")]
    fn libc_resolves_known_symbols() {
        let handle = DlLoader.open("libc.so.6").expect("libc.so.6 is loadable");
        assert!(DlLoader.resolve(handle, "getpid").is_some());
        assert!(DlLoader.resolve(handle, "frankenthreads_no_such_symbol").is_none());
        DlLoader.close(handle);
    }
}
