//! `instrument-server` command-line interface.
//!
//! `daemon start` runs the server in the foreground; the instrument and job
//! subcommands are loopback RPC clients of that daemon. `test`, `discover`
//! and `plugins` manage their own short-lived state and run locally.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use instrument_server::command::ParamValue;
use instrument_server::server::daemon;
use instrument_server::server::handlers;
use instrument_server::server::rpc;
use instrument_server::server::ServerContext;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "instrument-server",
    version,
    about = "Instrument control server",
    long_about = "Drives laboratory instruments through isolated worker subprocesses and \
                  multiplexes measurement scripts over them."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the server daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Start an instrument from a YAML config file
    Start {
        config: PathBuf,
        /// Custom driver plugin (.so/.dylib/.dll)
        #[arg(long)]
        plugin: Option<PathBuf>,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Stop a running instrument
    Stop { name: String },
    /// Query instrument status and statistics
    Status { name: String },
    /// List running instruments
    List,
    /// Run a measurement script on the daemon
    Measure {
        script: PathBuf,
        /// Print the full results document as JSON
        #[arg(long)]
        json: bool,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// One-shot command against a freshly created instrument
    Test {
        config: PathBuf,
        verb: String,
        /// Command parameters as key=value pairs
        #[arg(value_name = "KEY=VALUE")]
        params: Vec<String>,
        #[arg(long)]
        plugin: Option<PathBuf>,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Submit a measurement script as a background job
    Submit { script: PathBuf },
    /// Inspect and manage background jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Probe directories for driver plugins
    Discover { paths: Vec<PathBuf> },
    /// List registered driver plugins
    Plugins,
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Run the daemon in the foreground
    Start {
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Stop the running daemon
    Stop,
    /// Report whether a daemon is running
    Status,
}

#[derive(Subcommand)]
enum JobAction {
    Status { job_id: String },
    Result { job_id: String },
    Cancel { job_id: String },
    List,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// RPC call that fails the CLI with the daemon's error message.
fn rpc(command: &str, params: Value) -> Result<Value> {
    let (status, body) = rpc_raw(command, params)?;
    if status != 200 || body.get("ok").and_then(Value::as_bool) != Some(true) {
        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("request failed");
        bail!("{error}");
    }
    Ok(body)
}

fn rpc_raw(command: &str, params: Value) -> Result<(u16, Value)> {
    rpc::rpc_request(daemon::rpc_port(), command, &params).map_err(Into::into)
}

fn absolute(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Parse a `key=value` pair, guessing the value type the way the RPC
/// surface does: float when a dot is present, then integer, bool, string.
fn parse_kv(pair: &str) -> Option<(String, Value)> {
    let (key, value) = pair.split_once('=')?;
    let parsed = if value.contains('.') {
        value
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(value))
    } else if let Ok(int) = value.parse::<i64>() {
        Value::from(int)
    } else if value == "true" || value == "false" {
        Value::from(value == "true")
    } else {
        Value::from(value)
    };
    Some((key.to_string(), parsed))
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Daemon { action } => run_daemon_action(action),
        Command::Start {
            config,
            plugin,
            log_level,
        } => {
            init_logging(&log_level);
            let mut params = json!({ "config_path": absolute(&config) });
            if let Some(plugin) = plugin {
                params["plugin"] = json!(absolute(&plugin));
            }
            let body = rpc("start", params)?;
            println!(
                "Started instrument: {}",
                body["instrument"].as_str().unwrap_or("?")
            );
            Ok(0)
        }
        Command::Stop { name } => {
            let _ = rpc("stop", json!({ "name": name }))?;
            println!("Stopped instrument: {name}");
            Ok(0)
        }
        Command::Status { name } => {
            let body = rpc("status", json!({ "name": name }))?;
            println!("Instrument: {name}");
            println!(
                "  Status: {}",
                if body["alive"].as_bool().unwrap_or(false) {
                    "RUNNING"
                } else {
                    "STOPPED"
                }
            );
            let stats = &body["stats"];
            println!("  Commands sent:      {}", stats["commands_sent"]);
            println!("  Commands completed: {}", stats["commands_completed"]);
            println!("  Commands failed:    {}", stats["commands_failed"]);
            println!("  Commands timeout:   {}", stats["commands_timeout"]);
            Ok(0)
        }
        Command::List => {
            let body = rpc("list", json!({}))?;
            let instruments = body["instruments"].as_array().cloned().unwrap_or_default();
            if instruments.is_empty() {
                println!("No instruments running");
                return Ok(1);
            }
            println!("Running instruments:");
            for name in instruments {
                println!("  {}", name.as_str().unwrap_or("?"));
            }
            Ok(0)
        }
        Command::Measure {
            script,
            json: json_output,
            log_level,
        } => {
            init_logging(&log_level);
            let body = rpc("measure", json!({ "script_path": absolute(&script) }))?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("Measurement complete");
            }
            Ok(0)
        }
        Command::Test {
            config,
            verb,
            params,
            plugin,
            log_level,
        } => {
            init_logging(&log_level);
            let mut request = json!({
                "config_path": absolute(&config),
                "verb": verb,
            });
            if let Some(plugin) = plugin {
                request["plugin"] = json!(absolute(&plugin));
            }
            let kv: serde_json::Map<String, Value> =
                params.iter().filter_map(|p| parse_kv(p)).collect();
            request["params"] = Value::Object(kv);

            // Local execution: the instrument lives and dies in this process.
            let ctx = ServerContext::new().context("server context")?;
            let (rc, body) = handlers::dispatch(&ctx, "test", &request);
            ctx.jobs.stop();
            if rc != 0 {
                bail!(
                    "{}",
                    body["error"]
                        .as_str()
                        .or(body["error_message"].as_str())
                        .unwrap_or("test failed")
                );
            }
            if let Some(text) = body["text_response"].as_str() {
                if !text.is_empty() {
                    println!("{text}");
                }
            }
            if !body["return_value"].is_null() {
                println!("{}", body["return_value"]);
            }
            Ok(0)
        }
        Command::Submit { script } => {
            let body = rpc("submit_measure", json!({ "script_path": absolute(&script) }))?;
            println!("{}", body["job_id"].as_str().unwrap_or("?"));
            Ok(0)
        }
        Command::Job { action } => run_job_action(action),
        Command::Discover { paths } => {
            init_logging("info");
            let ctx = ServerContext::new().context("server context")?;
            let params = if paths.is_empty() {
                json!({})
            } else {
                json!({ "paths": paths.iter().map(|p| absolute(p)).collect::<Vec<_>>() })
            };
            let (rc, body) = handlers::dispatch(&ctx, "discover", &params);
            ctx.jobs.stop();
            let protocols = body["protocols"].as_array().cloned().unwrap_or_default();
            println!("Found {} plugin(s):", protocols.len());
            for protocol in protocols {
                println!("  {}", protocol.as_str().unwrap_or("?"));
            }
            Ok(rc)
        }
        Command::Plugins => {
            init_logging("info");
            let ctx = ServerContext::new().context("server context")?;
            let (rc, body) = handlers::dispatch(&ctx, "plugins", &json!({}));
            ctx.jobs.stop();
            let plugins = body["plugins"].as_array().cloned().unwrap_or_default();
            if plugins.is_empty() {
                println!("No plugins found");
            } else {
                println!("Available plugins:");
                for plugin in plugins {
                    println!(
                        "  {} -> {}",
                        plugin["protocol"].as_str().unwrap_or("?"),
                        plugin["path"].as_str().unwrap_or("?")
                    );
                }
            }
            Ok(rc)
        }
    }
}

fn run_daemon_action(action: DaemonAction) -> Result<i32> {
    match action {
        DaemonAction::Start { log_level } => {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
            let log_dir = daemon::runtime_dir();
            std::fs::create_dir_all(&log_dir).ok();
            let appender = tracing_appender::rolling::daily(&log_dir, "instrument-server.log");
            let (writer, _guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();

            daemon::run_daemon(daemon::rpc_port())?;
            Ok(0)
        }
        DaemonAction::Stop => {
            if !daemon::is_daemon_running() {
                println!("daemon not running");
                return Ok(0);
            }
            daemon::signal_daemon_stop()?;
            println!("daemon stopped");
            Ok(0)
        }
        DaemonAction::Status => {
            if daemon::is_daemon_running() {
                let pid = daemon::read_daemon_pid().unwrap_or(-1);
                println!("daemon running (pid={pid})");
            } else {
                println!("daemon not running");
            }
            Ok(0)
        }
    }
}

fn run_job_action(action: JobAction) -> Result<i32> {
    match action {
        JobAction::Status { job_id } => {
            let body = rpc("job_status", json!({ "job_id": job_id }))?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(0)
        }
        JobAction::Result { job_id } => {
            let body = rpc("job_result", json!({ "job_id": job_id }))?;
            println!("{}", serde_json::to_string_pretty(&body["result"])?);
            Ok(0)
        }
        JobAction::Cancel { job_id } => {
            let _ = rpc("job_cancel", json!({ "job_id": job_id }))?;
            println!("canceled {job_id}");
            Ok(0)
        }
        JobAction::List => {
            let body = rpc("job_list", json!({}))?;
            for job in body["jobs"].as_array().cloned().unwrap_or_default() {
                println!(
                    "{}  {:10}  {}",
                    job["job_id"].as_str().unwrap_or("?"),
                    job["status"].as_str().unwrap_or("?"),
                    job["type"].as_str().unwrap_or("?")
                );
            }
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_parsing_guesses_types() {
        assert_eq!(parse_kv("range=10.5"), Some(("range".into(), json!(10.5))));
        assert_eq!(parse_kv("samples=100"), Some(("samples".into(), json!(100))));
        assert_eq!(parse_kv("fast=true"), Some(("fast".into(), json!(true))));
        assert_eq!(parse_kv("mode=dc"), Some(("mode".into(), json!("dc"))));
        assert_eq!(parse_kv("no_equals"), None);
    }

    #[test]
    fn cli_parses_representative_commands() {
        Cli::try_parse_from(["instrument-server", "daemon", "start"]).unwrap();
        Cli::try_parse_from(["instrument-server", "start", "dmm1.yaml", "--plugin", "x.so"])
            .unwrap();
        Cli::try_parse_from(["instrument-server", "measure", "scan.rhai", "--json"]).unwrap();
        Cli::try_parse_from([
            "instrument-server",
            "test",
            "dmm1.yaml",
            "MEASURE_VOLTAGE",
            "range=10.0",
            "samples=100",
        ])
        .unwrap();
        Cli::try_parse_from(["instrument-server", "job", "status", "job-1-1"]).unwrap();
        assert!(Cli::try_parse_from(["instrument-server", "bogus"]).is_err());
    }

    #[test]
    fn kv_values_bridge_to_param_values() {
        // CLI k=v parsing must agree with the untyped JSON bridge used by
        // the test handler.
        let v = ParamValue::from_untyped_json(&json!(10.5));
        assert_eq!(v, ParamValue::F64(10.5));
        let v = ParamValue::from_untyped_json(&json!(100));
        assert_eq!(v, ParamValue::I64(100));
    }
}
