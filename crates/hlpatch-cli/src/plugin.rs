//! Patch plugin loading
//!
//! A plugin is a dynamic library (.so, .dylib, .dll) built with
//! `hlpatch_bytecode::export_patch!`. Each library provides exactly one
//! patch through its exported constructor.

use std::ffi::CString;
use std::path::Path;

use hlpatch_bytecode::patch::{
    PatchAbiVersion, PatchConstructor, PATCH_ABI_SYMBOL, PATCH_ABI_VERSION,
    PATCH_CONSTRUCTOR_SYMBOL,
};
use hlpatch_bytecode::{Patch, PatchError};
use thiserror::Error;

/// Why a plugin could not be loaded
#[derive(Debug, Error)]
pub enum LoadError {
    /// The dynamic loader rejected the file
    #[error("cannot open library: {0}")]
    Open(String),

    /// A required export is missing
    #[error("missing export {symbol}: {reason}")]
    MissingExport {
        /// Export name
        symbol: &'static str,
        /// Loader message
        reason: String,
    },

    /// Plugin was built against a different patch interface
    #[error("plugin interface version {found}, expected {expected}")]
    AbiMismatch {
        /// Version the plugin reports
        found: u32,
        /// Version this host speaks
        expected: u32,
    },

    /// Constructor returned nothing
    #[error("{0} returned null")]
    NullPatch(&'static str),

    /// Path cannot be passed to the loader
    #[error("unusable path {0}")]
    InvalidPath(String),
}

/// A patch together with the library its code lives in
///
/// Field order matters: the patch is dropped before the library is unloaded.
pub struct LoadedPatch {
    patch: Box<dyn Patch>,
    _library: Library,
}

impl LoadedPatch {
    /// Open `path` and construct its patch
    pub fn load(path: &Path) -> Result<Self, PatchError> {
        Self::construct(path).map_err(|e| PatchError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn construct(path: &Path) -> Result<Self, LoadError> {
        let library = Library::open(path)?;

        // SAFETY: both exports come from export_patch! with these exact
        // signatures, and `library` outlives the returned patch
        let patch = unsafe {
            let abi: PatchAbiVersion = library.export(PATCH_ABI_SYMBOL)?;
            let found = abi();
            if found != PATCH_ABI_VERSION {
                return Err(LoadError::AbiMismatch {
                    found,
                    expected: PATCH_ABI_VERSION,
                });
            }

            let create: PatchConstructor = library.export(PATCH_CONSTRUCTOR_SYMBOL)?;
            let raw = create();
            if raw.is_null() {
                return Err(LoadError::NullPatch(PATCH_CONSTRUCTOR_SYMBOL));
            }
            *Box::from_raw(raw)
        };

        Ok(Self {
            patch,
            _library: library,
        })
    }

    /// The loaded patch
    pub fn patch(&self) -> &dyn Patch {
        self.patch.as_ref()
    }
}

/// Open dynamic library, unloaded on drop
struct Library(sys::Handle);

impl Library {
    fn open(path: &Path) -> Result<Self, LoadError> {
        sys::open(path).map(Self)
    }

    /// Look up an exported function
    ///
    /// # Safety
    ///
    /// `T` must be a function pointer type matching the export.
    unsafe fn export<T: Copy>(&self, symbol: &'static str) -> Result<T, LoadError> {
        let name = CString::new(symbol).map_err(|e| LoadError::MissingExport {
            symbol,
            reason: e.to_string(),
        })?;
        let address = sys::lookup(self.0, &name)
            .map_err(|reason| LoadError::MissingExport { symbol, reason })?;
        Ok(std::mem::transmute_copy(&address))
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: the handle came from sys::open and is closed once
        unsafe { sys::close(self.0) }
    }
}

#[cfg(unix)]
mod sys {
    use std::ffi::{c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use super::LoadError;

    pub type Handle = *mut c_void;

    pub fn open(path: &Path) -> Result<Handle, LoadError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| LoadError::InvalidPath(path.display().to_string()))?;

        // RTLD_LOCAL keeps one plugin's exports out of the next one's lookups
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(LoadError::Open(last_error()));
        }
        Ok(handle)
    }

    pub unsafe fn lookup(handle: Handle, name: &CStr) -> Result<*mut c_void, String> {
        libc::dlerror();
        let address = libc::dlsym(handle, name.as_ptr());
        if address.is_null() {
            return Err(last_error());
        }
        Ok(address)
    }

    pub unsafe fn close(handle: Handle) {
        libc::dlclose(handle);
    }

    fn last_error() -> String {
        // SAFETY: dlerror returns null or a NUL-terminated thread-local string
        unsafe {
            let message = libc::dlerror();
            if message.is_null() {
                "unknown loader error".to_string()
            } else {
                CStr::from_ptr(message).to_string_lossy().into_owned()
            }
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::{c_char, c_void, CStr};
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;

    use super::LoadError;

    pub type Handle = *mut c_void;

    extern "system" {
        fn LoadLibraryW(filename: *const u16) -> Handle;
        fn GetProcAddress(module: Handle, name: *const c_char) -> *mut c_void;
        fn FreeLibrary(module: Handle) -> i32;
        fn GetLastError() -> u32;
    }

    pub fn open(path: &Path) -> Result<Handle, LoadError> {
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        if wide[..wide.len() - 1].contains(&0) {
            return Err(LoadError::InvalidPath(path.display().to_string()));
        }

        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            return Err(LoadError::Open(last_error()));
        }
        Ok(handle)
    }

    pub unsafe fn lookup(handle: Handle, name: &CStr) -> Result<*mut c_void, String> {
        let address = GetProcAddress(handle, name.as_ptr());
        if address.is_null() {
            return Err(last_error());
        }
        Ok(address)
    }

    pub unsafe fn close(handle: Handle) {
        FreeLibrary(handle);
    }

    fn last_error() -> String {
        format!("error code {}", unsafe { GetLastError() })
    }
}
