//! Shared test fixtures: a scriptable in-process instrument.

use instrument_server::command::{CommandResponse, ParamValue, SerializedCommand};
use instrument_server::server::proxy::{Instrument, ProxyStats, ResponseFuture};
use instrument_server::server::sync::SyncCoordinator;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-process [`Instrument`] that records every command, follows the
/// barrier protocol (acks sync tokens against the coordinator) and answers
/// each command with a fixed value, optionally after a delay.
pub struct MockInstrument {
    name: String,
    coordinator: Arc<SyncCoordinator>,
    delay: Duration,
    return_value: f64,
    next_id: AtomicU64,
    alive: AtomicBool,
    commands: Mutex<Vec<SerializedCommand>>,
    continues: Mutex<Vec<u64>>,
    stats: Mutex<ProxyStats>,
}

impl MockInstrument {
    pub fn new(name: &str, coordinator: Arc<SyncCoordinator>) -> Arc<Self> {
        Self::with_delay(name, coordinator, Duration::ZERO)
    }

    pub fn with_delay(
        name: &str,
        coordinator: Arc<SyncCoordinator>,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            coordinator,
            delay,
            return_value: 42.0,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            commands: Mutex::new(Vec::new()),
            continues: Mutex::new(Vec::new()),
            stats: Mutex::new(ProxyStats::default()),
        })
    }

    /// Every command dispatched so far, in order.
    pub fn commands(&self) -> Vec<SerializedCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Sync tokens released to this instrument, in order.
    pub fn continues(&self) -> Vec<u64> {
        self.continues.lock().unwrap().clone()
    }

    fn respond(&self, cmd: &SerializedCommand) -> CommandResponse {
        let mut resp = CommandResponse::failure(cmd.id.clone(), self.name.clone(), "");
        resp.success = true;
        resp.error_message.clear();
        resp.return_value = Some(ParamValue::F64(self.return_value));
        resp
    }
}

impl Instrument for MockInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, mut cmd: SerializedCommand) -> ResponseFuture {
        let msg_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        cmd.id = format!("{}-{}", self.name, msg_id);
        self.stats.lock().unwrap().commands_sent += 1;

        // Barrier protocol: ack the token when the command arrives.
        if let Some(token) = cmd.sync_token {
            self.coordinator.handle_ack(token, &self.name);
        }

        let resp = self.respond(&cmd);
        self.commands.lock().unwrap().push(cmd);

        if self.delay.is_zero() {
            self.stats.lock().unwrap().commands_completed += 1;
            ResponseFuture::ready(resp)
        } else {
            let (tx, future) =
                ResponseFuture::channel(resp.command_id.clone(), self.name.clone());
            let delay = self.delay;
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                let _ = tx.send(resp);
            });
            self.stats.lock().unwrap().commands_completed += 1;
            future
        }
    }

    fn execute_sync(&self, cmd: SerializedCommand, timeout: Duration) -> CommandResponse {
        let future = self.execute(cmd);
        future.wait(timeout).unwrap_or_else(|| {
            CommandResponse::failure(
                future.command_id().to_string(),
                self.name.clone(),
                "Command timeout",
            )
        })
    }

    fn send_sync_continue(&self, token: u64) -> bool {
        self.continues.lock().unwrap().push(token);
        true
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn stats(&self) -> ProxyStats {
        *self.stats.lock().unwrap()
    }

    fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
