//! `instrument-worker` entry point.
//!
//! Launched by the daemon once per instrument:
//!
//! ```text
//! instrument-worker --instrument DMM1 --plugin ./libsim_instrument.so \
//!     --connection-json '{"resource":"sim://0"}' --api-json '{…}'
//! ```
//!
//! Logs go to `worker_<instrument>.log` in the runtime directory. SIGINT and
//! SIGTERM request a clean exit at the next loop iteration.

use clap::Parser;
use instrument_server::server::daemon;
use instrument_server::worker::{self, WorkerOptions};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "instrument-worker", version, about = "Instrument worker subprocess")]
struct Args {
    /// Instrument name; selects the IPC queue pair to open.
    #[arg(long)]
    instrument: String,
    /// Driver plugin shared library.
    #[arg(long)]
    plugin: PathBuf,
    /// Connection config JSON passed to the plugin.
    #[arg(long, default_value = "{}")]
    connection_json: String,
    /// API definition JSON passed to the plugin.
    #[arg(long, default_value = "{}")]
    api_json: String,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_dir = daemon::runtime_dir();
    std::fs::create_dir_all(&log_dir).ok();
    let appender = tracing_appender::rolling::daily(
        &log_dir,
        format!("worker_{}.log", args.instrument),
    );
    let (writer, _guard) = tracing_appender::non_blocking(appender);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    let term = Arc::new(AtomicBool::new(false));
    if let Err(e) = worker::install_signal_handlers(&term) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let opts = WorkerOptions {
        instrument: args.instrument,
        plugin_path: args.plugin,
        connection_json: args.connection_json,
        api_json: args.api_json,
    };
    if let Err(e) = worker::run(&opts, term) {
        tracing::error!(error = %e, "worker failed");
        eprintln!("{e}");
        std::process::exit(1);
    }
}
