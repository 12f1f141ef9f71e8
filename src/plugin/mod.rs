//! Driver plugin loading and registration.
//!
//! The ABI itself lives in the `instrument-plugin-api` crate (re-exported
//! here as [`abi`]); this module provides the host-side wrapper around a
//! loaded library and the process-wide registry keyed by protocol type.

pub mod loader;
pub mod registry;

pub use instrument_plugin_api as abi;
pub use loader::{PluginHandle, PluginInfo};
pub use registry::PluginRegistry;
