//! Daemon-side handle for one instrument worker.
//!
//! [`WorkerProxy`] owns the queue pair and the worker child process, runs a
//! response-listener thread, and correlates responses to in-flight commands
//! by message id. Callers get a [`ResponseFuture`] they can wait on with a
//! timeout; every future is resolved exactly once — by a response, a send
//! failure, a wait timeout, or worker death.
//!
//! [`Instrument`] is the seam the registry and script runtime program
//! against, so the dispatch machinery is testable without real worker
//! processes.

use crate::command::{CommandResponse, SerializedCommand};
use crate::error::{ServerError, ServerResult};
use crate::ipc::frame::{Frame, FrameKind, MAX_FRAME_PAYLOAD};
use crate::ipc::queue::FrameQueue;
use crate::server::sync::SyncCoordinator;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Grace period for a worker to exit after a shutdown frame.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Listener receive timeout; bounds how quickly worker death is noticed.
const LISTENER_TIMEOUT: Duration = Duration::from_secs(1);
/// Startup settling time before the first liveness check.
const STARTUP_SETTLE: Duration = Duration::from_millis(300);

/// Monotonic per-proxy command counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProxyStats {
    pub commands_sent: u64,
    pub commands_completed: u64,
    pub commands_failed: u64,
    pub commands_timeout: u64,
}

/// One-shot handle to a response that has not arrived yet.
pub struct ResponseFuture {
    rx: mpsc::Receiver<CommandResponse>,
    command_id: String,
    instrument_name: String,
}

impl ResponseFuture {
    /// Wait up to `timeout` for the response.
    pub fn wait(&self, timeout: Duration) -> Option<CommandResponse> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Id the command was dispatched under.
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn instrument_name(&self) -> &str {
        &self.instrument_name
    }

    /// An unresolved future plus the sender that resolves it.
    pub fn channel(
        command_id: impl Into<String>,
        instrument_name: impl Into<String>,
    ) -> (mpsc::SyncSender<CommandResponse>, Self) {
        let (tx, rx) = mpsc::sync_channel(1);
        (
            tx,
            Self {
                rx,
                command_id: command_id.into(),
                instrument_name: instrument_name.into(),
            },
        )
    }

    /// An already-resolved future.
    pub fn ready(resp: CommandResponse) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        let command_id = resp.command_id.clone();
        let instrument_name = resp.instrument_name.clone();
        let _ = tx.send(resp);
        Self {
            rx,
            command_id,
            instrument_name,
        }
    }
}

/// Command transport for one instrument.
pub trait Instrument: Send + Sync {
    fn name(&self) -> &str;

    /// Dispatch a command; the returned future resolves exactly once.
    fn execute(&self, cmd: SerializedCommand) -> ResponseFuture;

    /// Dispatch and wait. On timeout returns a synthetic failure and the
    /// eventual response, if any, is discarded.
    fn execute_sync(&self, cmd: SerializedCommand, timeout: Duration) -> CommandResponse;

    /// Release commands held under `token` in the worker.
    fn send_sync_continue(&self, token: u64) -> bool;

    fn is_alive(&self) -> bool;
    fn stats(&self) -> ProxyStats;

    /// Idempotent teardown.
    fn stop(&self);
}

struct PendingEntry {
    tx: mpsc::SyncSender<CommandResponse>,
    command_id: String,
}

struct ProxyShared {
    instrument: String,
    queue: FrameQueue,
    child: Mutex<Child>,
    running: AtomicBool,
    alive: AtomicBool,
    next_message_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    stats: Mutex<ProxyStats>,
    last_heartbeat: Mutex<Instant>,
    coordinator: Arc<SyncCoordinator>,
}

impl ProxyShared {
    /// Fail every in-flight command with a synthetic response.
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<PendingEntry> = {
            #[allow(clippy::unwrap_used)]
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if drained.is_empty() {
            return;
        }
        warn!(
            instrument = %self.instrument,
            count = drained.len(),
            reason,
            "failing pending commands"
        );
        #[allow(clippy::unwrap_used)]
        let mut stats = self.stats.lock().unwrap();
        for entry in drained {
            stats.commands_failed += 1;
            let _ = entry.tx.send(CommandResponse::failure(
                entry.command_id.clone(),
                self.instrument.clone(),
                reason,
            ));
        }
    }

    fn child_exited(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut child = self.child.lock().unwrap();
        matches!(child.try_wait(), Ok(Some(_)))
    }
}

/// Production [`Instrument`] backed by a worker subprocess.
pub struct WorkerProxy {
    shared: Arc<ProxyShared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerProxy {
    /// Create the queue pair, spawn the worker and start the listener.
    ///
    /// Fails if the queues cannot be created, the worker cannot be spawned,
    /// or the worker dies during the settling window.
    pub fn start(
        instrument: &str,
        plugin_path: &Path,
        connection_json: &str,
        api_json: &str,
        coordinator: Arc<SyncCoordinator>,
    ) -> ServerResult<Arc<Self>> {
        info!(instrument, plugin = %plugin_path.display(), "starting worker proxy");

        let queue = FrameQueue::create_daemon(instrument)?;
        let child = spawn_worker(instrument, plugin_path, connection_json, api_json)?;
        info!(instrument, pid = child.id(), "worker process spawned");

        let shared = Arc::new(ProxyShared {
            instrument: instrument.to_string(),
            queue,
            child: Mutex::new(child),
            running: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            next_message_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            stats: Mutex::new(ProxyStats::default()),
            last_heartbeat: Mutex::new(Instant::now()),
            coordinator,
        });

        let listener = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("listener-{instrument}"))
                .spawn(move || listener_loop(&shared))
                .map_err(|e| ServerError::Instrument(format!("listener spawn: {e}")))?
        };

        let proxy = Arc::new(Self {
            shared,
            listener: Mutex::new(Some(listener)),
        });

        std::thread::sleep(STARTUP_SETTLE);
        if proxy.shared.child_exited() {
            error!(instrument, "worker died during startup");
            proxy.stop();
            return Err(ServerError::Instrument(format!(
                "worker for '{instrument}' died during startup"
            )));
        }

        info!(instrument, "worker proxy started");
        Ok(proxy)
    }

    /// Time of the last heartbeat or response from the worker.
    pub fn last_heartbeat(&self) -> Instant {
        #[allow(clippy::unwrap_used)]
        let hb = self.shared.last_heartbeat.lock().unwrap();
        *hb
    }
}

impl Instrument for WorkerProxy {
    fn name(&self) -> &str {
        &self.shared.instrument
    }

    fn execute(&self, mut cmd: SerializedCommand) -> ResponseFuture {
        let shared = &self.shared;
        if !shared.alive.load(Ordering::SeqCst) {
            return ResponseFuture::ready(CommandResponse::failure(
                cmd.id,
                shared.instrument.clone(),
                "Worker process died",
            ));
        }

        let msg_id = shared.next_message_id.fetch_add(1, Ordering::SeqCst);
        cmd.id = format!("{}-{}", shared.instrument, msg_id);
        debug!(instrument = %shared.instrument, command = %cmd.id, verb = %cmd.verb, "enqueueing command");

        let (tx, rx) = mpsc::sync_channel(1);
        {
            #[allow(clippy::unwrap_used)]
            let mut pending = shared.pending.lock().unwrap();
            pending.insert(
                msg_id,
                PendingEntry {
                    tx,
                    command_id: cmd.id.clone(),
                },
            );
        }

        let future = ResponseFuture {
            rx,
            command_id: cmd.id.clone(),
            instrument_name: shared.instrument.clone(),
        };

        let mut payload = match cmd.to_json() {
            Ok(json) => json.into_bytes(),
            Err(e) => {
                error!(command = %cmd.id, error = %e, "command serialization failed");
                self.resolve_failed(msg_id, &cmd.id, "command serialization failed");
                return future;
            }
        };
        // Documented cap: oversized command payloads are truncated.
        if payload.len() > MAX_FRAME_PAYLOAD {
            warn!(command = %cmd.id, bytes = payload.len(), "truncating command payload");
            payload.truncate(MAX_FRAME_PAYLOAD);
        }

        let frame = Frame::command(msg_id, cmd.sync_token.unwrap_or(0), payload);
        if shared.queue.send(&frame, cmd.timeout) {
            #[allow(clippy::unwrap_used)]
            let mut stats = shared.stats.lock().unwrap();
            stats.commands_sent += 1;
        } else {
            error!(command = %cmd.id, "IPC send failed");
            self.resolve_failed(msg_id, &cmd.id, "IPC send timeout");
        }
        future
    }

    fn execute_sync(&self, cmd: SerializedCommand, timeout: Duration) -> CommandResponse {
        let future = self.execute(cmd);
        match future.wait(timeout) {
            Some(resp) => resp,
            None => {
                #[allow(clippy::unwrap_used)]
                {
                    self.shared.stats.lock().unwrap().commands_timeout += 1;
                }
                // The promise may still resolve later; it will be discarded.
                CommandResponse::failure(
                    future.command_id().to_string(),
                    self.shared.instrument.clone(),
                    "Command timeout",
                )
            }
        }
    }

    fn send_sync_continue(&self, token: u64) -> bool {
        self.shared
            .queue
            .send(&Frame::sync_continue(token), Duration::from_secs(1))
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst) && !self.shared.child_exited()
    }

    fn stats(&self) -> ProxyStats {
        #[allow(clippy::unwrap_used)]
        let stats = self.shared.stats.lock().unwrap();
        *stats
    }

    fn stop(&self) {
        let shared = &self.shared;
        if !shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(instrument = %shared.instrument, "stopping worker proxy");

        // Best effort: ask the worker to exit cleanly.
        shared.queue.send(&Frame::shutdown(), Duration::from_secs(1));

        let deadline = Instant::now() + STOP_GRACE;
        let mut exited = false;
        while Instant::now() < deadline {
            if shared.child_exited() {
                exited = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        if !exited {
            warn!(instrument = %shared.instrument, "worker did not exit, killing");
            #[allow(clippy::unwrap_used)]
            let mut child = shared.child.lock().unwrap();
            let _ = child.kill();
            let _ = child.wait();
        }

        #[allow(clippy::unwrap_used)]
        let listener = self.listener.lock().unwrap().take();
        if let Some(handle) = listener {
            let _ = handle.join();
        }

        shared.alive.store(false, Ordering::SeqCst);
        shared.fail_pending("Worker process died");
        FrameQueue::unlink(&shared.instrument);
        info!(instrument = %shared.instrument, "worker proxy stopped");
    }
}

impl WorkerProxy {
    /// Remove a pending entry and resolve its future with a failure.
    fn resolve_failed(&self, msg_id: u64, command_id: &str, reason: &str) {
        let entry = {
            #[allow(clippy::unwrap_used)]
            let mut pending = self.shared.pending.lock().unwrap();
            pending.remove(&msg_id)
        };
        if let Some(entry) = entry {
            #[allow(clippy::unwrap_used)]
            {
                self.shared.stats.lock().unwrap().commands_failed += 1;
            }
            let _ = entry.tx.send(CommandResponse::failure(
                command_id.to_string(),
                self.shared.instrument.clone(),
                reason,
            ));
        }
    }
}

impl Drop for WorkerProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listener_loop(shared: &ProxyShared) {
    debug!(instrument = %shared.instrument, "response listener started");

    while shared.running.load(Ordering::SeqCst) {
        let Some(frame) = shared.queue.recv(LISTENER_TIMEOUT) else {
            // Idle window: notice worker death and fail in-flight commands.
            if shared.running.load(Ordering::SeqCst) && shared.child_exited() {
                error!(instrument = %shared.instrument, "worker process died");
                shared.alive.store(false, Ordering::SeqCst);
                shared.fail_pending("Worker process died");
                break;
            }
            continue;
        };

        match frame.kind {
            FrameKind::Heartbeat => {
                #[allow(clippy::unwrap_used)]
                let mut hb = shared.last_heartbeat.lock().unwrap();
                *hb = Instant::now();
            }
            FrameKind::SyncAck => {
                shared
                    .coordinator
                    .handle_ack(frame.sync_token, &shared.instrument);
            }
            FrameKind::Response => {
                let resp = match CommandResponse::from_json(&String::from_utf8_lossy(
                    &frame.payload,
                )) {
                    Ok(resp) => resp,
                    Err(e) => {
                        error!(instrument = %shared.instrument, error = %e, "undecodable response payload");
                        continue;
                    }
                };
                debug!(
                    instrument = %shared.instrument,
                    command = %resp.command_id,
                    success = resp.success,
                    "received response"
                );

                let entry = {
                    #[allow(clippy::unwrap_used)]
                    let mut pending = shared.pending.lock().unwrap();
                    pending.remove(&frame.message_id)
                };
                match entry {
                    Some(entry) => {
                        {
                            #[allow(clippy::unwrap_used)]
                            let mut stats = shared.stats.lock().unwrap();
                            if resp.success {
                                stats.commands_completed += 1;
                            } else {
                                stats.commands_failed += 1;
                            }
                        }
                        let _ = entry.tx.send(resp);
                    }
                    None => {
                        warn!(
                            instrument = %shared.instrument,
                            message_id = frame.message_id,
                            command = %resp.command_id,
                            "response for unknown message id"
                        );
                    }
                }
            }
            other => {
                warn!(instrument = %shared.instrument, kind = ?other, "unexpected frame on response queue");
            }
        }
    }

    debug!(instrument = %shared.instrument, "response listener stopped");
}

/// Locate the worker executable: `INSTRUMENT_WORKER_PATH` wins, otherwise a
/// sibling of the current executable.
fn worker_binary() -> ServerResult<PathBuf> {
    if let Ok(path) = std::env::var("INSTRUMENT_WORKER_PATH") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| ServerError::Instrument("cannot locate executable directory".into()))?;
    Ok(dir.join("instrument-worker"))
}

fn spawn_worker(
    instrument: &str,
    plugin_path: &Path,
    connection_json: &str,
    api_json: &str,
) -> ServerResult<Child> {
    let binary = worker_binary()?;
    Command::new(&binary)
        .arg("--instrument")
        .arg(instrument)
        .arg("--plugin")
        .arg(plugin_path)
        .arg("--connection-json")
        .arg(connection_json)
        .arg("--api-json")
        .arg(api_json)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| {
            ServerError::Instrument(format!(
                "spawn worker {} for '{instrument}': {e}",
                binary.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_future_resolves_immediately() {
        let future = ResponseFuture::ready(CommandResponse::failure(
            "DMM1-1",
            "DMM1",
            "Worker process died",
        ));
        let resp = future.wait(Duration::from_millis(10)).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error_message, "Worker process died");
    }

    #[test]
    fn future_wait_times_out_when_unresolved() {
        let (_tx, rx) = mpsc::sync_channel::<CommandResponse>(1);
        let future = ResponseFuture {
            rx,
            command_id: "X-1".into(),
            instrument_name: "X".into(),
        };
        let start = Instant::now();
        assert!(future.wait(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
