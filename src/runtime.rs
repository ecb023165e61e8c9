//! lbug runtime loader and process-wide API singleton.
//!
//! This module is responsible for:
//! - Locating the lbug shared library for the current platform.
//! - Dynamically loading it and resolving ABI symbols into an [`Api`] handle.
//! - Exposing a process-wide, reference-counted [`Runtime`] via [`runtime()`].
//!
//! ## Environment variables
//!
//! - `LBUG_RUNTIME_PATH` *(optional)*: load the runtime from this path instead of asking the
//!   platform loader for the default library name.
//!
//! ## Teardown order
//!
//! Every [`Database`](crate::Database) holds an `Arc<Runtime>`, every native connection holds the
//! database, and every result handle holds its connection. The library therefore cannot be
//! unloaded while any handle derived from it is alive, independent of the order in which callers
//! drop things.

use std::{
    env,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use libloading::Library;
use tracing::debug;

use crate::{api::Api, RuntimeError};

/// Environment variable that overrides the runtime library location.
pub const RUNTIME_PATH_ENV: &str = "LBUG_RUNTIME_PATH";

/// Process-wide singleton storage for the runtime.
///
/// A failed initialization is cached too, and returned (cloned) on every later call.
static RUNTIME: OnceLock<std::result::Result<Arc<Runtime>, RuntimeError>> = OnceLock::new();

/// Loaded lbug runtime and resolved ABI API.
///
/// - `_lib` keeps the dynamic library loaded; `api` entrypoints are only valid while it is.
/// - `path` is where the library was loaded from.
pub struct Runtime {
    /// Keep the library alive for as long as anything references the runtime.
    _lib: Library,
    /// ABI entrypoints resolved from the loaded runtime library.
    pub api: Api,
    /// Filesystem path (or bare library name) from which the runtime was loaded.
    pub path: PathBuf,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("path", &self.path).finish()
    }
}

/// Get the process-wide lbug runtime.
///
/// The runtime is lazily initialized on first call. If initialization fails, the error is cached
/// and later returned by subsequent calls.
///
/// # Errors
///
/// Returns a [`RuntimeError`] if the library cannot be loaded or does not export the lbug ABI.
pub fn runtime() -> std::result::Result<Arc<Runtime>, RuntimeError> {
    RUNTIME.get_or_init(Runtime::init).clone()
}

impl Runtime {
    fn init() -> std::result::Result<Arc<Self>, RuntimeError> {
        let path = match env::var_os(RUNTIME_PATH_ENV) {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from(default_library_name()),
        };
        Self::load(&path).map(Arc::new)
    }

    /// Load a runtime from an explicit path, bypassing the process-wide singleton.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Load`] if the library cannot be opened and
    /// [`RuntimeError::Symbols`] if it does not export the expected ABI.
    pub fn load(path: &Path) -> std::result::Result<Self, RuntimeError> {
        // SAFETY: loading runs the library's initializers; callers point us at an lbug runtime.
        let lib = unsafe { Library::new(path) }.map_err(|e| RuntimeError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        // SAFETY: `lib` is moved into the returned runtime, so the symbols outlive `api`.
        let api = unsafe { Api::load(&lib) }.map_err(|e| RuntimeError::Symbols {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        debug!(path = %path.display(), "loaded lbug runtime");
        Ok(Self {
            _lib: lib,
            api,
            path: path.to_path_buf(),
        })
    }
}

/// Library name handed to the platform loader when no override is set.
fn default_library_name() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "liblbug.dylib"
    }

    #[cfg(target_os = "windows")]
    {
        "lbug_shared.dll"
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        "liblbug.so"
    }
}
