//! Instrument registry: the daemon's name → instrument map.
//!
//! The registry exclusively owns the instrument handles; creating an
//! instrument loads its YAML config, resolves the API definition, picks a
//! driver (explicit `connection.plugin` path or the plugin registry entry
//! for the API's protocol type) and starts a worker proxy. Names are the
//! primary key: creating a second instrument under an existing name fails.

use crate::config::InstrumentConfig;
use crate::error::{ServerError, ServerResult};
use crate::plugin::PluginRegistry;
use crate::server::proxy::{Instrument, WorkerProxy};
use crate::server::sync::SyncCoordinator;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub struct InstrumentRegistry {
    instruments: Mutex<HashMap<String, Arc<dyn Instrument>>>,
    plugins: Arc<PluginRegistry>,
    coordinator: Arc<SyncCoordinator>,
}

impl InstrumentRegistry {
    pub fn new(plugins: Arc<PluginRegistry>, coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            instruments: Mutex::new(HashMap::new()),
            plugins,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Load a YAML config and start a worker for it. Returns the instrument
    /// name on success.
    pub fn create_instrument(&self, config_path: &Path) -> ServerResult<String> {
        let config = InstrumentConfig::load(config_path)?;
        self.create_from_config(&config)
    }

    pub fn create_from_config(&self, config: &InstrumentConfig) -> ServerResult<String> {
        let name = config.name.clone();
        if self.has_instrument(&name) {
            warn!(instrument = %name, "instrument already exists");
            return Err(ServerError::Instrument(format!(
                "instrument '{name}' already exists"
            )));
        }

        let plugin_path = match config.plugin_override() {
            Some(path) => path,
            None => {
                let protocol = config.protocol_type()?;
                self.plugins.get_plugin_path(&protocol).ok_or_else(|| {
                    ServerError::Plugin(format!("no plugin registered for protocol '{protocol}'"))
                })?
            }
        };

        info!(instrument = %name, plugin = %plugin_path.display(), "creating instrument");
        let connection_json = config.connection().to_string();
        let api_json = config.api_def.to_string();

        let proxy = WorkerProxy::start(
            &name,
            &plugin_path,
            &connection_json,
            &api_json,
            Arc::clone(&self.coordinator),
        )?;

        self.insert(proxy)?;
        info!(instrument = %name, "instrument created");
        Ok(name)
    }

    /// Register an already-started instrument handle.
    ///
    /// Also the hook tests use to install mock instruments.
    pub fn insert(&self, instrument: Arc<dyn Instrument>) -> ServerResult<()> {
        let name = instrument.name().to_string();
        let mut instruments = self.lock();
        if instruments.contains_key(&name) {
            instrument.stop();
            return Err(ServerError::Instrument(format!(
                "instrument '{name}' already exists"
            )));
        }
        instruments.insert(name, instrument);
        Ok(())
    }

    pub fn get_instrument(&self, name: &str) -> Option<Arc<dyn Instrument>> {
        self.lock().get(name).cloned()
    }

    pub fn has_instrument(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Stop and remove one instrument. Returns whether it existed.
    pub fn remove_instrument(&self, name: &str) -> bool {
        let removed = self.lock().remove(name);
        match removed {
            Some(instrument) => {
                // Stop outside the lock; joins can take seconds.
                instrument.stop();
                info!(instrument = name, "removed instrument");
                true
            }
            None => false,
        }
    }

    pub fn list_instruments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Restart any instruments whose worker died. Idempotent.
    pub fn start_all(&self) {
        let instruments: Vec<Arc<dyn Instrument>> = self.lock().values().cloned().collect();
        for instrument in instruments {
            if !instrument.is_alive() {
                error!(
                    instrument = instrument.name(),
                    "worker not alive; restart requires re-creating the instrument"
                );
            }
        }
    }

    /// Stop every instrument. Snapshots the handles under the lock, then
    /// stops outside it so multi-second joins don't serialize callers.
    pub fn stop_all(&self) {
        let instruments: Vec<Arc<dyn Instrument>> = {
            let mut map = self.lock();
            map.drain().map(|(_, v)| v).collect()
        };
        if instruments.is_empty() {
            return;
        }
        info!(count = instruments.len(), "stopping all instruments");
        for instrument in instruments {
            instrument.stop();
        }
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn Instrument>>> {
        self.instruments.lock().unwrap()
    }
}

impl Drop for InstrumentRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandResponse, SerializedCommand};
    use crate::server::proxy::{ProxyStats, ResponseFuture};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct StubInstrument {
        name: String,
        stopped: AtomicBool,
    }

    impl Instrument for StubInstrument {
        fn name(&self) -> &str {
            &self.name
        }
        fn execute(&self, cmd: SerializedCommand) -> ResponseFuture {
            ResponseFuture::ready(CommandResponse::failure(cmd.id, self.name.clone(), "stub"))
        }
        fn execute_sync(&self, cmd: SerializedCommand, _timeout: Duration) -> CommandResponse {
            CommandResponse::failure(cmd.id, self.name.clone(), "stub")
        }
        fn send_sync_continue(&self, _token: u64) -> bool {
            true
        }
        fn is_alive(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }
        fn stats(&self) -> ProxyStats {
            ProxyStats::default()
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn registry() -> InstrumentRegistry {
        InstrumentRegistry::new(
            Arc::new(PluginRegistry::new()),
            Arc::new(SyncCoordinator::new()),
        )
    }

    fn stub(name: &str) -> Arc<StubInstrument> {
        Arc::new(StubInstrument {
            name: name.to_string(),
            stopped: AtomicBool::new(false),
        })
    }

    #[test]
    fn names_are_a_primary_key() {
        let registry = registry();
        registry.insert(stub("DMM1")).unwrap();
        assert!(registry.insert(stub("DMM1")).is_err());
        assert_eq!(registry.list_instruments(), vec!["DMM1".to_string()]);
    }

    #[test]
    fn remove_stops_the_instrument() {
        let registry = registry();
        let inst = stub("DAC1");
        registry.insert(inst.clone()).unwrap();

        assert!(registry.remove_instrument("DAC1"));
        assert!(inst.stopped.load(Ordering::SeqCst));
        assert!(!registry.has_instrument("DAC1"));
        // Removing again is a no-op.
        assert!(!registry.remove_instrument("DAC1"));
    }

    #[test]
    fn stop_all_clears_the_map() {
        let registry = registry();
        let a = stub("A");
        let b = stub("B");
        registry.insert(a.clone()).unwrap();
        registry.insert(b.clone()).unwrap();

        registry.stop_all();
        assert!(registry.list_instruments().is_empty());
        assert!(a.stopped.load(Ordering::SeqCst));
        assert!(b.stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn missing_plugin_fails_create() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("api.yaml"), "protocol:\n  type: NOPE\n").unwrap();
        let cfg = dir.path().join("inst.yaml");
        std::fs::write(&cfg, "name: X1\napi_ref: api.yaml\n").unwrap();

        let err = registry().create_instrument(&cfg).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }
}
