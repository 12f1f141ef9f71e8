//! Custom error types for the server.
//!
//! `ServerError` consolidates the error sources of the whole daemon: config
//! parsing, plugin loading, IPC transport, worker lifecycle, job execution and
//! script evaluation. Variants created from underlying error types use
//! `#[from]` so call sites can propagate with `?`.
//!
//! Errors are first-class values here: nothing is recovered silently, and a
//! per-instrument failure never takes the daemon down. Handlers at the RPC
//! boundary turn any `ServerError` into a `{"ok": false, "error": …}` body.

use thiserror::Error;

/// Convenience alias for results using the server error type.
pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("instrument '{0}' not found")]
    InstrumentNotFound(String),

    #[error("instrument error: {0}")]
    Instrument(String),

    #[error("buffer pool error: {0}")]
    Buffer(String),

    #[error("job error: {0}")]
    Job(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("daemon error: {0}")]
    Daemon(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::Instrument("worker died".to_string());
        assert_eq!(err.to_string(), "instrument error: worker died");
    }

    #[test]
    fn test_not_found_names_instrument() {
        let err = ServerError::InstrumentNotFound("DMM1".to_string());
        assert!(err.to_string().contains("DMM1"));
    }
}
