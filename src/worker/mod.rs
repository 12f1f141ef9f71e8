//! Per-instrument worker process.
//!
//! One worker hosts exactly one driver plugin instance and serializes all
//! command execution for its instrument. The loop receives frames from the
//! request queue with a one-second timeout, emitting a heartbeat whenever it
//! is idle so the daemon's liveness tracking keeps seeing it.
//!
//! Commands tagged with a sync token are part of a parallel block: the
//! worker acknowledges the token with a `SyncAck` frame, then holds the
//! command until the daemon releases the token with `SyncContinue`. Held
//! commands execute strictly in arrival order, so per-instrument FIFO
//! semantics are preserved across the barrier.

pub mod convert;

use crate::command::SerializedCommand;
use crate::error::{ServerError, ServerResult};
use crate::ipc::frame::{Frame, FrameKind, MAX_FRAME_PAYLOAD};
use crate::ipc::queue::FrameQueue;
use crate::plugin::{abi, PluginHandle};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Receive timeout of the main loop; also the heartbeat cadence.
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);
/// Send timeout for heartbeats; losing one is harmless.
const HEARTBEAT_SEND_TIMEOUT: Duration = Duration::from_millis(100);
/// Send timeout for responses.
const RESPONSE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Startup parameters, straight from the command line.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub instrument: String,
    pub plugin_path: PathBuf,
    /// Connection config as a JSON document.
    pub connection_json: String,
    /// API definition as a JSON document.
    pub api_json: String,
}

/// A command waiting to execute, keyed by the daemon's message id.
struct HeldCommand {
    message_id: u64,
    command: SerializedCommand,
}

/// Run the worker loop until shutdown. Blocks the calling thread.
///
/// `term` is the signal flag: set by SIGINT/SIGTERM, checked once per loop
/// iteration.
pub fn run(opts: &WorkerOptions, term: Arc<AtomicBool>) -> ServerResult<()> {
    info!(
        instrument = %opts.instrument,
        plugin = %opts.plugin_path.display(),
        "worker starting"
    );

    let queue = FrameQueue::open_worker(&opts.instrument)?;
    let mut plugin = PluginHandle::load(&opts.plugin_path)?;

    let mut config = abi::PluginConfig::default();
    abi::fill_str(&mut config.instrument_name, &opts.instrument);
    abi::fill_str(&mut config.connection_json, &opts.connection_json);
    abi::fill_str(&mut config.api_definition_json, &opts.api_json);
    plugin.initialize(&config)?;

    info!(instrument = %opts.instrument, "plugin initialized, entering command loop");

    let mut pending: VecDeque<HeldCommand> = VecDeque::new();
    let mut released: HashSet<u64> = HashSet::new();
    let mut acked: HashSet<u64> = HashSet::new();

    while !term.load(Ordering::SeqCst) {
        let Some(frame) = queue.recv(LOOP_TIMEOUT) else {
            // Idle: let the daemon know we are alive.
            queue.send(&Frame::heartbeat(), HEARTBEAT_SEND_TIMEOUT);
            continue;
        };

        match frame.kind {
            FrameKind::Shutdown => {
                info!(instrument = %opts.instrument, "received shutdown");
                break;
            }
            FrameKind::SyncContinue => {
                debug!(instrument = %opts.instrument, token = frame.sync_token, "sync token released");
                released.insert(frame.sync_token);
                drain(&queue, &plugin, &mut pending, &released);
            }
            FrameKind::Command => {
                let command = match SerializedCommand::from_json(
                    &String::from_utf8_lossy(&frame.payload),
                ) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        error!(instrument = %opts.instrument, error = %e, "undecodable command payload");
                        continue;
                    }
                };
                debug!(instrument = %opts.instrument, command = %command.id, verb = %command.verb, "received command");

                if frame.sync_token != 0 && acked.insert(frame.sync_token) {
                    queue.send(&Frame::sync_ack(frame.sync_token), RESPONSE_SEND_TIMEOUT);
                }
                pending.push_back(HeldCommand {
                    message_id: frame.message_id,
                    command,
                });
                drain(&queue, &plugin, &mut pending, &released);
            }
            other => {
                warn!(instrument = %opts.instrument, kind = ?other, "unexpected frame on request queue");
            }
        }
    }

    info!(instrument = %opts.instrument, "worker shutting down");
    plugin.shutdown();
    Ok(())
}

/// Execute queued commands in order, stopping at the first one whose sync
/// token has not been released yet.
fn drain(
    queue: &FrameQueue,
    plugin: &PluginHandle,
    pending: &mut VecDeque<HeldCommand>,
    released: &HashSet<u64>,
) {
    while let Some(front) = pending.front() {
        if let Some(token) = front.command.sync_token {
            if !released.contains(&token) {
                return;
            }
        }
        let Some(held) = pending.pop_front() else {
            return;
        };
        execute_one(queue, plugin, &held);
    }
}

fn execute_one(queue: &FrameQueue, plugin: &PluginHandle, held: &HeldCommand) {
    let cmd = &held.command;
    let started = Instant::now();

    let plugin_cmd = convert::command_to_plugin(cmd);
    let mut plugin_resp = abi::PluginResponse::default();
    let status = match plugin.execute_command(&plugin_cmd, &mut plugin_resp) {
        Ok(status) => status,
        Err(e) => {
            error!(command = %cmd.id, error = %e, "plugin call failed");
            -1
        }
    };

    let resp = convert::plugin_to_response(&plugin_resp, cmd, status, started);
    debug!(command = %cmd.id, success = resp.success, "command executed");

    let payload = match resp.to_json() {
        Ok(json) => json.into_bytes(),
        Err(e) => {
            error!(command = %cmd.id, error = %e, "response serialization failed");
            return;
        }
    };
    let payload = if payload.len() > MAX_FRAME_PAYLOAD {
        // Oversized responses should have gone through the buffer pool; a
        // truncated body will not parse on the daemon side.
        warn!(
            command = %cmd.id,
            bytes = payload.len(),
            "response exceeds the frame payload cap, truncating"
        );
        payload[..MAX_FRAME_PAYLOAD].to_vec()
    } else {
        payload
    };

    if !queue.send(&Frame::response(held.message_id, payload), RESPONSE_SEND_TIMEOUT) {
        error!(command = %cmd.id, "failed to send response frame");
    }
}

/// Install SIGINT/SIGTERM handlers that raise the termination flag.
///
/// A second signal falls through to the default action, so a stuck worker
/// can still be stopped.
pub fn install_signal_handlers(term: &Arc<AtomicBool>) -> ServerResult<()> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register_conditional_default(signal, Arc::clone(term))
            .map_err(|e| ServerError::Daemon(format!("signal handler: {e}")))?;
        signal_hook::flag::register(signal, Arc::clone(term))
            .map_err(|e| ServerError::Daemon(format!("signal handler: {e}")))?;
    }
    Ok(())
}
