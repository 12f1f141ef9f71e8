//! Process-wide registry of discovered driver plugins, keyed by protocol
//! type.
//!
//! The registry stores the *path* of each registered driver; instruments get
//! their own plugin instance inside their worker process, so the daemon only
//! ever probes libraries (load, read metadata, unload).

use crate::error::{ServerError, ServerResult};
use crate::plugin::loader::{probe, PluginInfo};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Platform shared-library extension.
#[cfg(target_os = "macos")]
pub const LIBRARY_EXTENSION: &str = "dylib";
#[cfg(target_os = "windows")]
pub const LIBRARY_EXTENSION: &str = "dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const LIBRARY_EXTENSION: &str = "so";

/// Canonical locations probed for built-in drivers, in order.
fn builtin_plugins() -> Vec<(&'static str, Vec<PathBuf>)> {
    vec![(
        "SIM",
        vec![
            PathBuf::from("/usr/local/lib/instrument-plugins/libsim_instrument.so"),
            PathBuf::from("/usr/lib/instrument-plugins/libsim_instrument.so"),
            PathBuf::from("./plugins/libsim_instrument.so"),
            PathBuf::from("./target/release/libsim_instrument.so"),
            PathBuf::from("./target/debug/libsim_instrument.so"),
        ],
    )]
}

#[derive(Debug, Clone)]
struct RegisteredPlugin {
    path: PathBuf,
    info: PluginInfo,
}

/// Protocol type → driver library map.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Mutex<HashMap<String, RegisteredPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe a library and register it under its advertised protocol type.
    ///
    /// Returns the protocol type. The first registration for a protocol
    /// wins; later ones are rejected.
    pub fn load_plugin(&self, path: &Path) -> ServerResult<String> {
        let info = probe(path)?;
        let protocol = info.protocol_type.clone();

        let mut plugins = self.lock();
        if plugins.contains_key(&protocol) {
            warn!(protocol, path = %path.display(), "protocol already has a registered plugin");
            return Err(ServerError::Plugin(format!(
                "protocol '{protocol}' already registered"
            )));
        }

        info!(
            protocol,
            plugin = %info.name,
            version = %info.version,
            path = %path.display(),
            "registered plugin"
        );
        plugins.insert(
            protocol.clone(),
            RegisteredPlugin {
                path: path.to_path_buf(),
                info,
            },
        );
        Ok(protocol)
    }

    /// Probe the fixed builtin list at its canonical paths.
    ///
    /// A protocol that already has a plugin keeps it; probe failures are
    /// logged and skipped.
    pub fn load_builtin_plugins(&self) {
        for (protocol, paths) in builtin_plugins() {
            if self.has_plugin(protocol) {
                debug!(protocol, "builtin already registered");
                continue;
            }
            let loaded = paths.iter().any(|path| {
                path.exists() && self.load_plugin(path).is_ok()
            });
            if !loaded {
                debug!(protocol, "no builtin plugin found");
            }
        }
    }

    /// Enumerate shared libraries in `search_paths` and register every one
    /// that survives a probe. Returns the protocol types seen (including
    /// duplicates that were skipped).
    pub fn discover_plugins(&self, search_paths: &[PathBuf]) -> Vec<String> {
        let mut seen = Vec::new();
        for dir in search_paths {
            let Ok(entries) = std::fs::read_dir(dir) else {
                debug!(dir = %dir.display(), "skipping unreadable plugin directory");
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file()
                    || path.extension().and_then(|e| e.to_str()) != Some(LIBRARY_EXTENSION)
                {
                    continue;
                }
                match probe(&path) {
                    Ok(info) => {
                        seen.push(info.protocol_type.clone());
                        if !self.has_plugin(&info.protocol_type) {
                            let _ = self.load_plugin(&path);
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "plugin probe failed");
                    }
                }
            }
        }
        seen
    }

    pub fn has_plugin(&self, protocol_type: &str) -> bool {
        self.lock().contains_key(protocol_type)
    }

    pub fn get_plugin_path(&self, protocol_type: &str) -> Option<PathBuf> {
        self.lock().get(protocol_type).map(|p| p.path.clone())
    }

    pub fn get_plugin_info(&self, protocol_type: &str) -> Option<PluginInfo> {
        self.lock().get(protocol_type).map(|p| p.info.clone())
    }

    pub fn unload_plugin(&self, protocol_type: &str) {
        if self.lock().remove(protocol_type).is_some() {
            info!(protocol = protocol_type, "unregistered plugin");
        }
    }

    pub fn list_protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self.lock().keys().cloned().collect();
        protocols.sort();
        protocols
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RegisteredPlugin>> {
        self.plugins.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_protocols() {
        let registry = PluginRegistry::new();
        assert!(registry.list_protocols().is_empty());
        assert!(!registry.has_plugin("VISA"));
        assert!(registry.get_plugin_path("VISA").is_none());
    }

    #[test]
    fn discovery_skips_non_library_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), "not a plugin").unwrap();
        std::fs::write(dir.path().join("broken.so"), "not elf").unwrap();

        let registry = PluginRegistry::new();
        let seen = registry.discover_plugins(&[dir.path().to_path_buf()]);
        assert!(seen.is_empty());
        assert!(registry.list_protocols().is_empty());
    }

    #[test]
    fn load_of_missing_library_fails() {
        let registry = PluginRegistry::new();
        assert!(registry.load_plugin(Path::new("/no/such/driver.so")).is_err());
    }
}
