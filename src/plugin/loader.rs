//! RAII wrapper around one loaded driver library.
//!
//! Loading resolves all four required entry points up front; a missing symbol
//! is a fatal load failure. The metadata's `api_version` is checked against
//! the host's [`abi::PLUGIN_API_VERSION`] before the plugin is accepted.
//! `plugin_shutdown` runs on drop iff `plugin_initialize` was ever called,
//! and the library handle is released afterwards.

#![allow(unsafe_code)] // FFI into untrusted driver libraries

use crate::error::{ServerError, ServerResult};
use crate::plugin::abi;
use libloading::Library;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Decoded plugin metadata.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub api_version: u32,
    pub name: String,
    pub version: String,
    pub protocol_type: String,
    pub description: String,
}

impl From<&abi::PluginMetadata> for PluginInfo {
    fn from(m: &abi::PluginMetadata) -> Self {
        Self {
            api_version: m.api_version,
            name: abi::read_str(&m.name),
            version: abi::read_str(&m.version),
            protocol_type: abi::read_str(&m.protocol_type),
            description: abi::read_str(&m.description),
        }
    }
}

/// One loaded driver library.
#[derive(Debug)]
pub struct PluginHandle {
    library: Library,
    path: PathBuf,
    info: PluginInfo,
    initialized: bool,
}

impl PluginHandle {
    /// Load a library, resolve the ABI symbols and gate on the API version.
    pub fn load(path: &Path) -> ServerResult<Self> {
        debug!(path = %path.display(), "loading plugin");
        let library = unsafe { Library::new(path) }
            .map_err(|e| ServerError::Plugin(format!("load {}: {e}", path.display())))?;

        // All four entry points must resolve.
        for symbol in [
            abi::SYM_GET_METADATA,
            abi::SYM_INITIALIZE,
            abi::SYM_EXECUTE_COMMAND,
            abi::SYM_SHUTDOWN,
        ] {
            unsafe { library.get::<*const ()>(symbol) }.map_err(|e| {
                ServerError::Plugin(format!(
                    "{}: missing required symbol {}: {e}",
                    path.display(),
                    String::from_utf8_lossy(&symbol[..symbol.len() - 1])
                ))
            })?;
        }

        let metadata = unsafe {
            let get: libloading::Symbol<'_, abi::GetMetadataFn> =
                library.get(abi::SYM_GET_METADATA).map_err(|e| {
                    ServerError::Plugin(format!("{}: {e}", path.display()))
                })?;
            get()
        };
        let info = PluginInfo::from(&metadata);

        if info.api_version != abi::PLUGIN_API_VERSION {
            return Err(ServerError::Plugin(format!(
                "{}: API version mismatch: plugin reports {}, host expects {}",
                path.display(),
                info.api_version,
                abi::PLUGIN_API_VERSION
            )));
        }

        info!(
            plugin = %info.name,
            version = %info.version,
            protocol = %info.protocol_type,
            "loaded plugin"
        );
        Ok(Self {
            library,
            path: path.to_path_buf(),
            info,
            initialized: false,
        })
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call `plugin_initialize`; non-zero status is a failure.
    pub fn initialize(&mut self, config: &abi::PluginConfig) -> ServerResult<()> {
        let status = unsafe {
            let init: libloading::Symbol<'_, abi::InitializeFn> = self
                .library
                .get(abi::SYM_INITIALIZE)
                .map_err(|e| ServerError::Plugin(e.to_string()))?;
            init(config)
        };
        if status != 0 {
            return Err(ServerError::Plugin(format!(
                "plugin initialization failed with status {status}"
            )));
        }
        self.initialized = true;
        Ok(())
    }

    /// Call `plugin_execute_command`, returning the plugin's status code.
    pub fn execute_command(
        &self,
        command: &abi::PluginCommand,
        response: &mut abi::PluginResponse,
    ) -> ServerResult<i32> {
        let status = unsafe {
            let exec: libloading::Symbol<'_, abi::ExecuteCommandFn> = self
                .library
                .get(abi::SYM_EXECUTE_COMMAND)
                .map_err(|e| ServerError::Plugin(e.to_string()))?;
            exec(command, response)
        };
        Ok(status)
    }

    /// Idempotent explicit shutdown; also runs on drop.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        self.initialized = false;
        unsafe {
            match self.library.get::<abi::ShutdownFn>(abi::SYM_SHUTDOWN) {
                Ok(stop) => stop(),
                Err(e) => warn!(plugin = %self.info.name, error = %e, "shutdown symbol lookup failed"),
            }
        }
        debug!(plugin = %self.info.name, "plugin shut down");
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Probe a library without keeping it loaded: load, read metadata, unload.
pub fn probe(path: &Path) -> ServerResult<PluginInfo> {
    let handle = PluginHandle::load(path)?;
    Ok(handle.info().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_fails_to_load() {
        let err = PluginHandle::load(Path::new("/nonexistent/driver.so")).unwrap_err();
        assert!(matches!(err, ServerError::Plugin(_)));
    }

    #[test]
    fn non_library_file_fails_to_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("not_a_library.so");
        std::fs::write(&path, b"just text").unwrap();
        assert!(PluginHandle::load(&path).is_err());
    }
}
