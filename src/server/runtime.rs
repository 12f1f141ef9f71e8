//! Measurement script runtime.
//!
//! Scripts are rhai and talk to instruments through three functions:
//!
//! - `call("Inst[:channel].Verb", args…)` — issue a command. Positional
//!   arguments become `arg0`, `arg1`, …; a single map argument becomes named
//!   parameters; a `:channel` suffix adds a `channel` parameter.
//! - `parallel(|| { … })` — every `call` inside the closure is buffered and
//!   dispatched at block exit under one sync token, with a barrier across
//!   the participating instruments.
//! - `log("message")` — script-level logging.
//!
//! The runtime has two modes. **Inline** (interactive `measure`): `call`
//! blocks on the response and returns the marshaled value. **Enqueue-first**
//! (the job manager's measurement path): `call` dispatches and returns
//! immediately; every call — standalone or parallel — gets a sync token, and
//! [`ScriptRuntime::process_tokens_and_wait`] later releases tokens strictly
//! in creation order, so interleaved parallel blocks and plain calls keep
//! their programmatic order.

use crate::command::{CommandResponse, ParamValue, SerializedCommand};
use crate::error::{ServerError, ServerResult};
use crate::ipc::pool::{DataBufferPool, DataType};
use crate::server::proxy::ResponseFuture;
use crate::server::registry::InstrumentRegistry;
use crate::server::sync::SyncCoordinator;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, NativeCallContext};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long to wait for every participant of a barrier to ack.
const BARRIER_TIMEOUT: Duration = Duration::from_secs(10);
/// Slack added on top of a command's own timeout when waiting its future.
const RESPONSE_WAIT_SLACK: Duration = Duration::from_secs(1);
/// Abort runaway scripts after this many rhai operations.
const SCRIPT_OPERATION_LIMIT: u64 = 10_000_000;

/// Outcome of a single `call`, kept for job result reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    pub command_id: String,
    pub instrument_name: String,
    pub verb: String,
    pub params: HashMap<String, ParamValue>,
    /// Wall-clock dispatch time, ms since the Unix epoch.
    pub executed_at_ms: i64,
    pub return_value: Option<ParamValue>,
    pub return_type: String,
    pub has_large_data: bool,
    pub buffer_id: String,
    pub element_count: u64,
    pub data_type: String,
    pub success: bool,
    pub error_message: String,
}

impl CallResult {
    fn dispatched(cmd: &SerializedCommand) -> Self {
        Self {
            command_id: cmd.id.clone(),
            instrument_name: cmd.instrument_name.clone(),
            verb: cmd.verb.clone(),
            params: cmd.params.clone(),
            executed_at_ms: chrono::Utc::now().timestamp_millis(),
            return_value: None,
            return_type: String::new(),
            has_large_data: false,
            buffer_id: String::new(),
            element_count: 0,
            data_type: String::new(),
            success: false,
            error_message: "pending".to_string(),
        }
    }

    fn absorb(&mut self, resp: &CommandResponse) {
        self.command_id = resp.command_id.clone();
        self.success = resp.success;
        self.error_message = resp.error_message.clone();
        self.return_value = resp.return_value.clone();
        self.return_type = resp
            .return_value
            .as_ref()
            .map(|v| v.type_tag().to_string())
            .unwrap_or_default();
        if let Some(large) = &resp.large_data {
            self.has_large_data = true;
            self.buffer_id = large.buffer_id.clone();
            self.element_count = large.element_count;
            self.data_type = large.data_type.clone();
        }
    }

    fn to_json(&self, index: usize) -> serde_json::Value {
        let params: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_untyped_json()))
            .collect();

        let return_json = if self.has_large_data {
            serde_json::json!({
                "type": "buffer",
                "buffer_id": self.buffer_id,
                "element_count": self.element_count,
                "data_type": self.data_type,
            })
        } else if let Some(value) = &self.return_value {
            serde_json::json!({
                "type": self.return_type,
                "value": value.to_untyped_json(),
            })
        } else {
            serde_json::json!({})
        };

        serde_json::json!({
            "index": index,
            "instrument": self.instrument_name,
            "verb": self.verb,
            "params": params,
            "executed_at_ms": self.executed_at_ms,
            "return": return_json,
            "success": self.success,
            "error": self.error_message,
        })
    }
}

/// A dispatched command whose response has not been collected yet.
struct PendingDispatch {
    future: ResponseFuture,
    result_index: usize,
    wait: Duration,
}

#[derive(Default)]
struct RuntimeState {
    in_parallel: bool,
    parallel_buffer: Vec<SerializedCommand>,
    results: Vec<CallResult>,
    /// Tokens in creation order; release order must match.
    token_order: Vec<u64>,
    token_instruments: HashMap<u64, BTreeSet<String>>,
    token_pending: HashMap<u64, Vec<PendingDispatch>>,
}

/// Script-facing execution context.
pub struct ScriptRuntime {
    registry: Arc<InstrumentRegistry>,
    coordinator: Arc<SyncCoordinator>,
    enqueue_mode: bool,
    /// Daemon-side pool; responses carrying a buffer reference get their
    /// segment mapped here so results stay readable after the worker drops
    /// its own reference.
    pool: Option<Arc<DataBufferPool>>,
    state: Mutex<RuntimeState>,
}

impl ScriptRuntime {
    pub fn new(registry: Arc<InstrumentRegistry>, enqueue_mode: bool) -> Self {
        let coordinator = Arc::clone(registry.coordinator());
        Self {
            registry,
            coordinator,
            enqueue_mode,
            pool: None,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    pub fn with_pool(mut self, pool: Arc<DataBufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Map a response's bulk-data segment into the daemon-side pool.
    fn mirror_large_data(&self, resp: &CommandResponse) {
        let (Some(pool), Some(large)) = (&self.pool, &resp.large_data) else {
            return;
        };
        let Some(data_type) = DataType::parse(&large.data_type) else {
            warn!(buffer = %large.buffer_id, data_type = %large.data_type, "unknown buffer element type");
            return;
        };
        if let Err(e) = pool.open_buffer(
            &large.buffer_id,
            &resp.instrument_name,
            &resp.command_id,
            data_type,
            large.element_count,
        ) {
            warn!(buffer = %large.buffer_id, error = %e, "failed to map result buffer");
        }
    }

    /// Issue one call. Returns the response value in inline mode, `None`
    /// when the command was buffered or enqueued.
    pub fn invoke(
        &self,
        qualified_verb: &str,
        mut params: HashMap<String, ParamValue>,
    ) -> ServerResult<Option<ParamValue>> {
        let (instrument, channel, verb) = parse_qualified_verb(qualified_verb)?;
        if let Some(channel) = channel {
            params.insert("channel".to_string(), ParamValue::I64(i64::from(channel)));
        }

        let mut cmd = SerializedCommand::new(instrument.clone(), verb.clone());
        cmd.params = params;
        cmd.channel_number = channel;
        // Query heuristic mirrors the driver conventions.
        cmd.expects_response =
            verb.contains("Read") || verb.contains("Get") || verb.contains("Measure");

        {
            let mut state = self.lock();
            if state.in_parallel {
                debug!(instrument = %instrument, verb = %verb, "buffered parallel command");
                state.parallel_buffer.push(cmd);
                return Ok(None);
            }
        }

        if self.enqueue_mode {
            self.enqueue_group(vec![cmd])?;
            return Ok(None);
        }

        // Inline path: execute synchronously and record the outcome.
        let handle = self
            .registry
            .get_instrument(&instrument)
            .ok_or_else(|| ServerError::InstrumentNotFound(instrument.clone()))?;
        let timeout = cmd.timeout + RESPONSE_WAIT_SLACK;
        let mut result = CallResult::dispatched(&cmd);
        let resp = handle.execute_sync(cmd, timeout);
        result.absorb(&resp);

        self.mirror_large_data(&resp);
        let return_value = resp.return_value.clone();
        if !resp.success {
            warn!(
                instrument = %instrument,
                verb = %verb,
                error = %resp.error_message,
                "command failed"
            );
        }
        self.lock().results.push(result);
        Ok(return_value)
    }

    /// Enter a parallel block; `call`s start buffering.
    pub fn begin_parallel(&self) -> ServerResult<()> {
        let mut state = self.lock();
        if state.in_parallel {
            return Err(ServerError::Script(
                "nested parallel blocks are not supported".into(),
            ));
        }
        state.in_parallel = true;
        state.parallel_buffer.clear();
        Ok(())
    }

    /// Discard a parallel block after a script error inside it.
    pub fn abort_parallel(&self) {
        let mut state = self.lock();
        state.in_parallel = false;
        state.parallel_buffer.clear();
    }

    /// Leave a parallel block and dispatch its buffered commands under one
    /// fresh sync token.
    pub fn end_parallel(&self) -> ServerResult<()> {
        let buffered = {
            let mut state = self.lock();
            state.in_parallel = false;
            std::mem::take(&mut state.parallel_buffer)
        };
        if buffered.is_empty() {
            return Ok(());
        }
        info!(commands = buffered.len(), "dispatching parallel block");

        if self.enqueue_mode {
            self.enqueue_group(buffered)
        } else {
            let (token, pending) = self.dispatch_group(buffered)?;
            self.release_and_collect(token, pending);
            Ok(())
        }
    }

    /// Tag a command group with a fresh token, register its barrier and
    /// dispatch every command. Missing instruments get failed results and do
    /// not join the barrier.
    fn dispatch_group(
        &self,
        mut commands: Vec<SerializedCommand>,
    ) -> ServerResult<(u64, Vec<PendingDispatch>)> {
        let token = self.coordinator.allocate_token();

        // Only instruments that can actually receive a command participate.
        let mut instruments = BTreeSet::new();
        for cmd in &commands {
            if self.registry.has_instrument(&cmd.instrument_name) {
                instruments.insert(cmd.instrument_name.clone());
            }
        }
        self.coordinator
            .register_barrier(token, instruments.iter().cloned());

        // Record results and bookkeeping under the lock; dispatch outside it
        // (queue sends carry their own timeouts).
        let mut to_dispatch = Vec::new();
        {
            let mut state = self.lock();
            for cmd in &mut commands {
                cmd.sync_token = Some(token);
                let result_index = state.results.len();
                state.results.push(CallResult::dispatched(cmd));

                if instruments.contains(&cmd.instrument_name) {
                    to_dispatch.push((cmd.clone(), result_index));
                } else {
                    error!(instrument = %cmd.instrument_name, "instrument not found");
                    state.results[result_index].error_message =
                        format!("Instrument not found: {}", cmd.instrument_name);
                }
            }
            state.token_order.push(token);
            state.token_instruments.insert(token, instruments);
        }

        let mut pending = Vec::new();
        for (cmd, result_index) in to_dispatch {
            let Some(handle) = self.registry.get_instrument(&cmd.instrument_name) else {
                let mut state = self.lock();
                state.results[result_index].error_message =
                    format!("Instrument not found: {}", cmd.instrument_name);
                continue;
            };
            debug!(
                instrument = %cmd.instrument_name,
                verb = %cmd.verb,
                token,
                "dispatching sync command"
            );
            let wait = cmd.timeout + RESPONSE_WAIT_SLACK;
            let future = handle.execute(cmd);
            pending.push(PendingDispatch {
                future,
                result_index,
                wait,
            });
        }
        Ok((token, pending))
    }

    /// Enqueue-first path: dispatch now, collect later in token order.
    fn enqueue_group(&self, commands: Vec<SerializedCommand>) -> ServerResult<()> {
        let (token, pending) = self.dispatch_group(commands)?;
        self.lock().token_pending.insert(token, pending);
        Ok(())
    }

    /// Wait for a token's barrier, release it, and collect its responses.
    fn release_and_collect(&self, token: u64, pending: Vec<PendingDispatch>) {
        if !self.coordinator.wait_complete(token, BARRIER_TIMEOUT) {
            let waiting = self.coordinator.get_waiting_instruments(token);
            warn!(token, ?waiting, "barrier did not complete, releasing anyway");
            self.coordinator.clear_barrier(token);
        }

        let instruments = {
            let state = self.lock();
            state
                .token_instruments
                .get(&token)
                .cloned()
                .unwrap_or_default()
        };
        for name in &instruments {
            if let Some(handle) = self.registry.get_instrument(name) {
                if !handle.send_sync_continue(token) {
                    warn!(instrument = %name, token, "failed to send sync continue");
                }
            }
        }

        for dispatch in pending {
            let resp = dispatch.future.wait(dispatch.wait).unwrap_or_else(|| {
                CommandResponse::failure(
                    dispatch.future.command_id().to_string(),
                    dispatch.future.instrument_name().to_string(),
                    "Command timeout",
                )
            });
            if !resp.success {
                error!(
                    command = %resp.command_id,
                    error = %resp.error_message,
                    "parallel command failed"
                );
            }
            self.mirror_large_data(&resp);
            let mut state = self.lock();
            if let Some(result) = state.results.get_mut(dispatch.result_index) {
                result.absorb(&resp);
            }
        }
        debug!(token, "parallel group complete");
    }

    /// Release every enqueued token in creation order and wait for all of
    /// their commands to finish. Intended for the job monitor thread.
    pub fn process_tokens_and_wait(&self) {
        loop {
            let (token, pending) = {
                let mut state = self.lock();
                if state.token_order.is_empty() {
                    return;
                }
                let token = state.token_order.remove(0);
                let pending = state.token_pending.remove(&token).unwrap_or_default();
                (token, pending)
            };
            debug!(token, commands = pending.len(), "releasing token");
            self.release_and_collect(token, pending);
        }
    }

    /// Alias kept for the job manager monitor.
    pub fn wait_for_all_enqueued(&self) {
        self.process_tokens_and_wait();
    }

    /// Script-level log line.
    pub fn log(&self, message: &str) {
        info!(target: "script", "{message}");
    }

    /// Snapshot of collected results.
    pub fn results(&self) -> Vec<CallResult> {
        self.lock().results.clone()
    }

    /// Aggregated results document for job reporting.
    pub fn collect_results_json(&self) -> serde_json::Value {
        let state = self.lock();
        let results: Vec<serde_json::Value> = state
            .results
            .iter()
            .enumerate()
            .map(|(i, r)| r.to_json(i))
            .collect();
        serde_json::json!({ "results": results })
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }
}

/// Split `Inst[:channel].Verb` into its parts.
fn parse_qualified_verb(qualified: &str) -> ServerResult<(String, Option<i32>, String)> {
    let (spec, verb) = qualified.split_once('.').ok_or_else(|| {
        ServerError::Script(format!(
            "invalid call target '{qualified}', expected '<instrument>.<verb>'"
        ))
    })?;
    if spec.is_empty() || verb.is_empty() {
        return Err(ServerError::Script(format!(
            "invalid call target '{qualified}'"
        )));
    }

    match spec.split_once(':') {
        Some((instrument, channel)) => {
            let channel: i32 = channel.parse().map_err(|_| {
                ServerError::Script(format!("invalid channel in '{qualified}'"))
            })?;
            Ok((instrument.to_string(), Some(channel), verb.to_string()))
        }
        None => Ok((spec.to_string(), None, verb.to_string())),
    }
}

// =============================================================================
// rhai bindings
// =============================================================================

fn dynamic_to_param(value: &Dynamic) -> ParamValue {
    if value.is_unit() {
        ParamValue::None
    } else if value.is_bool() {
        ParamValue::Bool(value.as_bool().unwrap_or_default())
    } else if value.is_int() {
        ParamValue::I64(value.as_int().unwrap_or_default())
    } else if value.is_float() {
        ParamValue::F64(value.as_float().unwrap_or_default())
    } else if value.is_string() {
        ParamValue::Str(value.clone().into_string().unwrap_or_default())
    } else if value.is_array() {
        let items = value.clone().into_array().unwrap_or_default();
        if items.iter().all(rhai::Dynamic::is_int) {
            ParamValue::I32Array(
                items
                    .iter()
                    .map(|v| v.as_int().unwrap_or_default() as i32)
                    .collect(),
            )
        } else {
            ParamValue::F64Array(
                items
                    .iter()
                    .map(|v| {
                        v.as_float()
                            .or_else(|_| v.as_int().map(|i| i as f64))
                            .unwrap_or_default()
                    })
                    .collect(),
            )
        }
    } else {
        ParamValue::Str(value.to_string())
    }
}

fn param_to_dynamic(value: &ParamValue) -> Dynamic {
    match value {
        ParamValue::None => Dynamic::UNIT,
        ParamValue::I32(v) => Dynamic::from(i64::from(*v)),
        ParamValue::I64(v) => Dynamic::from(*v),
        ParamValue::U32(v) => Dynamic::from(i64::from(*v)),
        ParamValue::U64(v) => Dynamic::from(*v as i64),
        ParamValue::F32(v) => Dynamic::from(f64::from(*v)),
        ParamValue::F64(v) => Dynamic::from(*v),
        ParamValue::Bool(v) => Dynamic::from(*v),
        ParamValue::Str(v) => Dynamic::from(v.clone()),
        ParamValue::Bytes(v) => {
            Dynamic::from(v.iter().map(|b| Dynamic::from(i64::from(*b))).collect::<rhai::Array>())
        }
        ParamValue::F64Array(v) => {
            Dynamic::from(v.iter().map(|x| Dynamic::from(*x)).collect::<rhai::Array>())
        }
        ParamValue::I32Array(v) => {
            Dynamic::from(v.iter().map(|x| Dynamic::from(i64::from(*x))).collect::<rhai::Array>())
        }
    }
}

fn script_error(e: ServerError) -> Box<EvalAltResult> {
    e.to_string().into()
}

/// Convert call arguments: one map argument becomes named parameters,
/// positional arguments become `arg0`, `arg1`, ….
fn args_to_params(args: &[Dynamic]) -> HashMap<String, ParamValue> {
    let mut params = HashMap::new();
    if args.len() == 1 && args[0].is_map() {
        if let Some(map) = args[0].read_lock::<rhai::Map>() {
            for (key, value) in map.iter() {
                params.insert(key.to_string(), dynamic_to_param(value));
            }
        }
        return params;
    }
    for (i, arg) in args.iter().enumerate() {
        params.insert(format!("arg{i}"), dynamic_to_param(arg));
    }
    params
}

fn do_call(
    runtime: &ScriptRuntime,
    target: &str,
    args: &[Dynamic],
) -> Result<Dynamic, Box<EvalAltResult>> {
    let params = args_to_params(args);
    match runtime.invoke(target, params) {
        Ok(Some(value)) => Ok(param_to_dynamic(&value)),
        Ok(None) => Ok(Dynamic::UNIT),
        Err(e) => Err(script_error(e)),
    }
}

/// Build a rhai engine with `call`, `parallel` and `log` bound to `runtime`.
pub fn build_engine(runtime: Arc<ScriptRuntime>) -> Engine {
    let mut engine = Engine::new();

    engine.on_progress(|count| {
        if count > SCRIPT_OPERATION_LIMIT {
            Some("script operation limit exceeded".into())
        } else {
            None
        }
    });

    {
        let rt = Arc::clone(&runtime);
        engine.register_fn("call", move |target: &str| do_call(&rt, target, &[]));
    }
    {
        let rt = Arc::clone(&runtime);
        engine.register_fn("call", move |target: &str, a: Dynamic| {
            do_call(&rt, target, &[a])
        });
    }
    {
        let rt = Arc::clone(&runtime);
        engine.register_fn("call", move |target: &str, a: Dynamic, b: Dynamic| {
            do_call(&rt, target, &[a, b])
        });
    }
    {
        let rt = Arc::clone(&runtime);
        engine.register_fn(
            "call",
            move |target: &str, a: Dynamic, b: Dynamic, c: Dynamic| {
                do_call(&rt, target, &[a, b, c])
            },
        );
    }
    {
        let rt = Arc::clone(&runtime);
        engine.register_fn(
            "call",
            move |target: &str, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
                do_call(&rt, target, &[a, b, c, d])
            },
        );
    }
    {
        let rt = Arc::clone(&runtime);
        engine.register_fn(
            "parallel",
            move |context: NativeCallContext, block: FnPtr| -> Result<(), Box<EvalAltResult>> {
                rt.begin_parallel().map_err(script_error)?;
                let body: Result<Dynamic, _> = block.call_within_context(&context, ());
                match body {
                    Ok(_) => rt.end_parallel().map_err(script_error),
                    Err(e) => {
                        rt.abort_parallel();
                        Err(e)
                    }
                }
            },
        );
    }
    {
        let rt = Arc::clone(&runtime);
        engine.register_fn("log", move |message: &str| rt.log(message));
    }

    engine
}

/// Run a script file against `runtime`.
pub fn run_script_file(runtime: &Arc<ScriptRuntime>, path: &Path) -> ServerResult<()> {
    let engine = build_engine(Arc::clone(runtime));
    engine
        .run_file(path.to_path_buf())
        .map_err(|e| ServerError::Script(e.to_string()))
}

/// Run script source against `runtime`.
pub fn run_script_source(runtime: &Arc<ScriptRuntime>, source: &str) -> ServerResult<()> {
    let engine = build_engine(Arc::clone(runtime));
    engine
        .run(source)
        .map_err(|e| ServerError::Script(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_verb_parsing() {
        assert_eq!(
            parse_qualified_verb("DMM1.MeasureVoltage").unwrap(),
            ("DMM1".to_string(), None, "MeasureVoltage".to_string())
        );
        assert_eq!(
            parse_qualified_verb("DAC1:3.SetVoltage").unwrap(),
            ("DAC1".to_string(), Some(3), "SetVoltage".to_string())
        );
        assert!(parse_qualified_verb("no_dot_here").is_err());
        assert!(parse_qualified_verb("DAC1:x.SetVoltage").is_err());
        assert!(parse_qualified_verb(".Verb").is_err());
    }

    #[test]
    fn positional_args_become_numbered_params() {
        let args = [Dynamic::from(1.5_f64), Dynamic::from("fast")];
        let params = args_to_params(&args);
        assert_eq!(params["arg0"], ParamValue::F64(1.5));
        assert_eq!(params["arg1"], ParamValue::Str("fast".to_string()));
    }

    #[test]
    fn single_map_arg_becomes_named_params() {
        let mut map = rhai::Map::new();
        map.insert("range".into(), Dynamic::from(10.0_f64));
        map.insert("samples".into(), Dynamic::from(100_i64));
        let args = [Dynamic::from(map)];
        let params = args_to_params(&args);
        assert_eq!(params["range"], ParamValue::F64(10.0));
        assert_eq!(params["samples"], ParamValue::I64(100));
    }

    #[test]
    fn arrays_marshal_both_ways() {
        let dynamic = param_to_dynamic(&ParamValue::F64Array(vec![1.0, 2.0]));
        assert!(dynamic.is_array());
        let back = dynamic_to_param(&dynamic);
        assert_eq!(back, ParamValue::F64Array(vec![1.0, 2.0]));

        let ints = param_to_dynamic(&ParamValue::I32Array(vec![3, 4]));
        assert_eq!(dynamic_to_param(&ints), ParamValue::I32Array(vec![3, 4]));
    }
}
