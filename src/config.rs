//! Instrument configuration loading.
//!
//! An instrument is described by a YAML file:
//!
//! ```yaml
//! name: DMM1
//! connection:
//!   plugin: ./plugins/libsim_instrument.so   # optional explicit driver
//!   resource: "GPIB0::22::INSTR"
//! api_ref: ./apis/dmm_scpi.yaml
//! ```
//!
//! `api_ref` points at the logical API definition (also YAML) whose
//! `protocol.type` selects a driver from the plugin registry when no explicit
//! plugin path is given. The reference may be absolute, a `file://` URI, or
//! relative to the config file's parent directory.
//!
//! Both documents are converted to JSON values once at load time; everything
//! downstream (worker spawn arguments, plugin initialization) speaks JSON.

use crate::error::{ServerError, ServerResult};
use std::path::{Path, PathBuf};
use tracing::info;

/// Parsed instrument configuration plus its resolved API definition.
#[derive(Debug, Clone)]
pub struct InstrumentConfig {
    pub name: String,
    /// Full config document as JSON.
    pub config: serde_json::Value,
    /// Resolved API definition document as JSON.
    pub api_def: serde_json::Value,
    /// Absolute path of the API definition file.
    pub api_path: PathBuf,
}

impl InstrumentConfig {
    /// Load an instrument config file and its API definition.
    pub fn load(config_path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(config_path).map_err(|e| {
            ServerError::Config(format!("cannot read {}: {e}", config_path.display()))
        })?;
        let config = yaml_str_to_json(&text)?;

        let name = config
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServerError::Config("missing required field 'name'".into()))?
            .to_string();
        let api_ref = config
            .get("api_ref")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServerError::Config("missing required field 'api_ref'".into()))?;

        let api_path = resolve_api_ref(api_ref, config_path)?;
        let api_text = std::fs::read_to_string(&api_path).map_err(|e| {
            ServerError::Config(format!("cannot read {}: {e}", api_path.display()))
        })?;
        let api_def = yaml_str_to_json(&api_text)?;

        info!(instrument = %name, api = %api_path.display(), "loaded instrument config");
        Ok(Self {
            name,
            config,
            api_def,
            api_path,
        })
    }

    /// Connection section of the config (empty object when absent).
    pub fn connection(&self) -> serde_json::Value {
        self.config
            .get("connection")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }

    /// Explicit driver path from `connection.plugin`, if any.
    pub fn plugin_override(&self) -> Option<PathBuf> {
        self.config
            .get("connection")
            .and_then(|c| c.get("plugin"))
            .and_then(|p| p.as_str())
            .map(PathBuf::from)
    }

    /// Protocol type declared by the API definition (`protocol.type`).
    pub fn protocol_type(&self) -> ServerResult<String> {
        self.api_def
            .get("protocol")
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ServerError::Config("API definition missing 'protocol.type'".into())
            })
    }
}

/// Resolve an `api_ref` value against the config file that contained it.
///
/// Accepts absolute paths, `file://` URIs (scheme stripped) and relative
/// paths (resolved against the config file's parent). The target must exist.
pub fn resolve_api_ref(api_ref: &str, config_path: &Path) -> ServerResult<PathBuf> {
    if api_ref.is_empty() {
        return Err(ServerError::Config("empty api_ref".into()));
    }

    let candidate = api_ref.strip_prefix("file://").unwrap_or(api_ref);
    if candidate.is_empty() {
        return Err(ServerError::Config(format!("invalid api_ref: '{api_ref}'")));
    }

    let mut path = PathBuf::from(candidate);
    if path.is_relative() {
        let parent = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        path = parent.join(path);
    }

    if !path.exists() {
        return Err(ServerError::Config(format!(
            "API definition file not found: {}",
            path.display()
        )));
    }

    Ok(path
        .canonicalize()
        .unwrap_or(path))
}

/// Parse a YAML document and convert it to a JSON value.
pub fn yaml_str_to_json(text: &str) -> ServerResult<serde_json::Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text)?;
    Ok(yaml_to_json(yaml))
}

/// Structural YAML → JSON conversion.
///
/// Non-string mapping keys are stringified; tagged values collapse to their
/// inner value.
pub fn yaml_to_json(value: serde_yaml::Value) -> serde_json::Value {
    use serde_json::Value as J;
    use serde_yaml::Value as Y;
    match value {
        Y::Null => J::Null,
        Y::Bool(b) => J::Bool(b),
        Y::Number(n) => {
            if let Some(i) = n.as_i64() {
                J::from(i)
            } else if let Some(u) = n.as_u64() {
                J::from(u)
            } else {
                n.as_f64().map(J::from).unwrap_or(J::Null)
            }
        }
        Y::String(s) => J::String(s),
        Y::Sequence(items) => J::Array(items.into_iter().map(yaml_to_json).collect()),
        Y::Mapping(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    Y::String(s) => s,
                    other => yaml_to_json(other).to_string(),
                };
                obj.insert(key, yaml_to_json(v));
            }
            J::Object(obj)
        }
        Y::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}
