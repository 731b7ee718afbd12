//! Discovery and loading of algorithm module binaries.

use crate::abi::ContextWrapper;
use crate::abi::layout::{IPA_ABI_VERSION, IpaModuleDescriptor};
use crate::error::{Error, Result};
use crate::interface::IpaInterface;
use crate::proxy::{InProcessProxy, IsolatedProxy, ProxyKind};
use libloading::{Library, Symbol};
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Entry point every algorithm module must export.
pub const MODULE_ENTRY_POINT: &str = "ipa_module_descriptor";

type ModuleEntryPoint = unsafe extern "C" fn() -> *const IpaModuleDescriptor;

/// A loaded algorithm module.
///
/// Holds the shared library open; contexts created from the module borrow
/// its code, so callers keep the module (or its [`Library`] handle) alive
/// for as long as any context exists.
pub struct IpaModule {
    library: Arc<Library>,
    descriptor: *const IpaModuleDescriptor,
    name: String,
    version: String,
}

// SAFETY: the descriptor is static data inside the loaded binary, which the
// Arc<Library> keeps mapped.
unsafe impl Send for IpaModule {}
unsafe impl Sync for IpaModule {}

impl IpaModule {
    /// Module name from the descriptor.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module version string from the descriptor.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Handle that keeps the module binary mapped.
    pub fn library(&self) -> Arc<Library> {
        Arc::clone(&self.library)
    }

    /// Create a fresh algorithm context from this module.
    pub fn create_context(&self) -> Result<ContextWrapper> {
        // SAFETY: the descriptor was validated at load time and the library
        // is still mapped.
        let ctx = unsafe { ((*self.descriptor).create)() };
        if ctx.is_null() {
            return Err(Error::LoadFailed(format!(
                "module '{}' returned a null context",
                self.name
            )));
        }
        // SAFETY: a non-null context from a validated module carries a valid
        // ops table.
        Ok(unsafe { ContextWrapper::new(ctx) })
    }
}

impl std::fmt::Debug for IpaModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpaModule")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

/// Locates and loads algorithm modules from the filesystem.
pub struct ModuleManager {
    search_paths: Vec<PathBuf>,
    worker_path: Option<PathBuf>,
}

impl ModuleManager {
    /// Create a manager with the default search paths.
    pub fn new() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("."),
                PathBuf::from("/usr/lib/iris/modules"),
                PathBuf::from("/usr/local/lib/iris/modules"),
            ],
            worker_path: None,
        }
    }

    /// Prepend a search path. Later additions win over defaults.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.insert(0, path.into());
    }

    /// Set the worker binary used for isolated execution.
    pub fn set_worker_path(&mut self, path: impl Into<PathBuf>) {
        self.worker_path = Some(path.into());
    }

    /// Resolve a module name to its binary path without loading it.
    pub fn find(&self, name: &str) -> Result<PathBuf> {
        let file_name = format!("lib{name}.so");
        self.search_paths
            .iter()
            .map(|p| p.join(&file_name))
            .find(|p| p.exists())
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }

    /// Load a module from a specific binary.
    ///
    /// # Safety
    ///
    /// Loading a module executes code from the binary. The caller must
    /// trust it to export a valid `ipa_module_descriptor` entry point
    /// returning a static, well-formed descriptor.
    pub unsafe fn load_from_path(&self, path: impl AsRef<Path>) -> Result<IpaModule> {
        let path = path.as_ref();

        // SAFETY: caller ensures the binary is trusted.
        let library =
            unsafe { Library::new(path).map_err(|e| Error::LoadFailed(e.to_string()))? };

        // SAFETY: the library was just loaded.
        let entry_point: Symbol<ModuleEntryPoint> = unsafe {
            library.get(b"ipa_module_descriptor\0").map_err(|_| {
                Error::LoadFailed(format!(
                    "{}: missing entry point {MODULE_ENTRY_POINT}",
                    path.display()
                ))
            })?
        };

        // SAFETY: caller guarantees the entry point is well-behaved.
        let descriptor = unsafe { entry_point() };
        if descriptor.is_null() {
            return Err(Error::LoadFailed(format!(
                "{}: null module descriptor",
                path.display()
            )));
        }

        // SAFETY: the entry point returned non-null; the descriptor is
        // static data in the mapped binary.
        let desc = unsafe { &*descriptor };
        if desc.abi_version != IPA_ABI_VERSION {
            return Err(Error::IncompatibleAbi {
                expected: IPA_ABI_VERSION,
                actual: desc.abi_version,
            });
        }
        if desc.name.is_null() || desc.version.is_null() {
            return Err(Error::LoadFailed(format!(
                "{}: descriptor with null name or version",
                path.display()
            )));
        }

        // SAFETY: both pointers were checked non-null and point at
        // NUL-terminated strings per the module contract.
        let (name, version) = unsafe {
            (
                CStr::from_ptr(desc.name).to_string_lossy().into_owned(),
                CStr::from_ptr(desc.version).to_string_lossy().into_owned(),
            )
        };

        tracing::info!(name, version, path = %path.display(), "loaded IPA module");

        Ok(IpaModule {
            library: Arc::new(library),
            descriptor,
            name,
            version,
        })
    }

    /// Load a module by name, searching all search paths.
    ///
    /// The name maps to `lib<name>.so`; the descriptor's declared name must
    /// match the requested name exactly.
    ///
    /// # Safety
    ///
    /// See [`load_from_path`](Self::load_from_path).
    pub unsafe fn load(&self, name: &str) -> Result<IpaModule> {
        let path = self.find(name)?;
        // SAFETY: forwarded caller guarantee.
        let module = unsafe { self.load_from_path(&path)? };
        if module.name() != name {
            return Err(Error::LoadFailed(format!(
                "{}: declares name '{}', expected '{}'",
                path.display(),
                module.name(),
                name
            )));
        }
        Ok(module)
    }

    /// Load a module and construct the requested execution variant for it.
    ///
    /// The in-process variant loads the module binary into this process.
    /// The isolated variant spawns the configured worker binary instead
    /// (see [`set_worker_path`](Self::set_worker_path)) and hands it the
    /// module path; the module's code never enters this address space.
    ///
    /// # Safety
    ///
    /// The named module's code will be executed, in this process or in the
    /// spawned worker. See [`load_from_path`](Self::load_from_path).
    pub unsafe fn create_interface(
        &self,
        name: &str,
        kind: ProxyKind,
    ) -> Result<Box<dyn IpaInterface>> {
        match kind {
            ProxyKind::InProcess => {
                // SAFETY: forwarded caller guarantee.
                let module = unsafe { self.load(name)? };
                let wrapper = module.create_context()?;
                Ok(Box::new(InProcessProxy::with_library(
                    wrapper,
                    module.library(),
                )))
            }
            ProxyKind::Isolated => {
                let path = self.find(name)?;
                let worker = self.worker_path.as_deref().ok_or_else(|| {
                    Error::LoadFailed("no worker binary configured for isolated execution".into())
                })?;
                Ok(Box::new(IsolatedProxy::spawn(worker, &path)?))
            }
        }
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_search_paths() {
        let manager = ModuleManager::new();
        assert!(!manager.search_paths.is_empty());
    }

    #[test]
    fn test_added_path_takes_precedence() {
        let mut manager = ModuleManager::new();
        manager.add_search_path("/custom/modules");
        assert_eq!(manager.search_paths[0], PathBuf::from("/custom/modules"));
    }

    #[test]
    fn test_isolated_without_worker_rejected() {
        let dir = std::env::temp_dir().join("iris-worker-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("libstub.so");
        std::fs::write(&path, b"stub").unwrap();

        let mut manager = ModuleManager::new();
        manager.add_search_path(&dir);
        let result = unsafe { manager.create_interface("stub", ProxyKind::Isolated) };
        assert!(matches!(result, Err(Error::LoadFailed(_))));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_module_reported_by_name() {
        let manager = ModuleManager::new();
        let result = unsafe { manager.load("no_such_module_xyz") };
        assert!(matches!(result, Err(Error::ModuleNotFound(name)) if name == "no_such_module_xyz"));
    }

    #[test]
    fn test_unloadable_binary_is_load_failed() {
        let dir = std::env::temp_dir().join("iris-module-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("libnot_a_module.so");
        std::fs::write(&path, b"not an elf").unwrap();

        let manager = ModuleManager::new();
        let result = unsafe { manager.load_from_path(&path) };
        assert!(matches!(result, Err(Error::LoadFailed(_))));

        let _ = std::fs::remove_file(&path);
    }
}
