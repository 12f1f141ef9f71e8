//! Daemon lifecycle: runtime directory, pid/lock files and the foreground
//! run loop.
//!
//! The daemon is a singleton per user: `server.pid` in the runtime directory
//! records the live process, and starting a second instance fails while the
//! recorded pid still answers signal 0. `daemon stop` sends SIGTERM to that
//! pid; the run loop exits on SIGINT, SIGTERM or a `shutdown` RPC command.

use crate::error::{ServerError, ServerResult};
use crate::server::rpc;
use crate::server::ServerContext;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

/// Default loopback RPC port.
pub const DEFAULT_RPC_PORT: u16 = 8555;

/// Environment override for the RPC port.
pub const RPC_PORT_ENV: &str = "INSTRUMENT_SERVER_RPC_PORT";

/// Per-user runtime directory (`XDG_RUNTIME_DIR` when available).
pub fn runtime_dir() -> PathBuf {
    if let Some(dir) = dirs::runtime_dir() {
        return dir.join("instrument-server");
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    std::env::temp_dir().join(format!("instrument-server-{user}"))
}

pub fn pid_file_path() -> PathBuf {
    runtime_dir().join("server.pid")
}

pub fn lock_file_path() -> PathBuf {
    runtime_dir().join("server.lock")
}

/// The RPC port: `INSTRUMENT_SERVER_RPC_PORT` when valid, else the default.
pub fn rpc_port() -> u16 {
    match std::env::var(RPC_PORT_ENV) {
        Ok(value) => match value.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                warn!(%value, "ignoring invalid {RPC_PORT_ENV}");
                DEFAULT_RPC_PORT
            }
        },
        Err(_) => DEFAULT_RPC_PORT,
    }
}

/// Pid recorded in the pid file, if any.
pub fn read_daemon_pid() -> Option<i32> {
    let text = std::fs::read_to_string(pid_file_path()).ok()?;
    text.trim().parse().ok()
}

/// Whether the recorded daemon pid is a live process.
pub fn is_daemon_running() -> bool {
    match read_daemon_pid() {
        // Signal 0 probes for existence without delivering anything.
        Some(pid) => kill(Pid::from_raw(pid), None).is_ok(),
        None => false,
    }
}

/// Write this process's pid file; fails if another instance is live.
pub fn create_pid_file() -> ServerResult<()> {
    if is_daemon_running() {
        return Err(ServerError::Daemon(format!(
            "another server instance is already running (pid {})",
            read_daemon_pid().unwrap_or(-1)
        )));
    }
    let dir = runtime_dir();
    std::fs::create_dir_all(&dir)?;

    let mut file = std::fs::File::create(pid_file_path())?;
    writeln!(file, "{}", std::process::id())?;
    std::fs::File::create(lock_file_path())?;
    info!(pid = std::process::id(), path = %pid_file_path().display(), "created pid file");
    Ok(())
}

pub fn remove_pid_file() {
    let _ = std::fs::remove_file(pid_file_path());
    let _ = std::fs::remove_file(lock_file_path());
}

/// Ask a running daemon to stop (SIGTERM to the recorded pid).
pub fn signal_daemon_stop() -> ServerResult<()> {
    let pid = read_daemon_pid()
        .ok_or_else(|| ServerError::Daemon("daemon not running".into()))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| ServerError::Daemon(format!("signal pid {pid}: {e}")))?;
    Ok(())
}

/// Run the daemon in the foreground until a signal or shutdown command.
pub fn run_daemon(port: u16) -> ServerResult<()> {
    create_pid_file()?;
    let ctx = ServerContext::new()?;
    ctx.plugins.load_builtin_plugins();

    info!(port, pid = std::process::id(), "server daemon starting");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ServerError::Daemon(format!("tokio runtime: {e}")))?;

    let serve_ctx = ctx.clone();
    let result = runtime.block_on(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(|e| ServerError::Daemon(format!("signal handler: {e}")))?;
        tokio::select! {
            r = rpc::serve(serve_ctx.clone(), port) => r,
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                Ok(())
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                Ok(())
            }
            _ = serve_ctx.shutdown.notified() => {
                info!("received shutdown command");
                Ok(())
            }
        }
    });

    info!("server daemon stopping");
    ctx.jobs.stop();
    ctx.registry.stop_all();
    remove_pid_file();
    info!("server daemon stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn runtime_dir_is_stable() {
        assert_eq!(runtime_dir(), runtime_dir());
        assert!(pid_file_path().ends_with("server.pid"));
        assert!(lock_file_path().ends_with("server.lock"));
    }

    #[test]
    #[serial]
    fn rpc_port_env_override() {
        std::env::set_var(RPC_PORT_ENV, "9123");
        assert_eq!(rpc_port(), 9123);
        std::env::set_var(RPC_PORT_ENV, "not-a-port");
        assert_eq!(rpc_port(), DEFAULT_RPC_PORT);
        std::env::set_var(RPC_PORT_ENV, "0");
        assert_eq!(rpc_port(), DEFAULT_RPC_PORT);
        std::env::remove_var(RPC_PORT_ENV);
        assert_eq!(rpc_port(), DEFAULT_RPC_PORT);
    }
}
