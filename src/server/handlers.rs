//! JSON command handlers.
//!
//! One handler per RPC command; the CLI reuses the same functions for its
//! locally-executed subcommands (`test`, `discover`, `plugins`). Every
//! handler takes a params object and returns `(rc, body)` where `body`
//! contains at least `{"ok": bool}`; `rc` 0 maps to HTTP 200, anything else
//! to 500 and a non-zero CLI exit code.

use crate::command::{ParamValue, SerializedCommand};
use crate::server::runtime::{self, ScriptRuntime};
use crate::server::ServerContext;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Handler result: process exit / HTTP mapping code plus the JSON body.
pub type HandlerResult = (i32, Value);

fn ok(body: Value) -> HandlerResult {
    (0, body)
}

fn fail(message: impl Into<String>) -> HandlerResult {
    (1, json!({ "ok": false, "error": message.into() }))
}

fn param_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Route a command name to its handler.
pub fn dispatch(ctx: &Arc<ServerContext>, command: &str, params: &Value) -> HandlerResult {
    match command {
        "daemon" => handle_daemon(ctx, params),
        "start" => handle_start(ctx, params),
        "stop" => handle_stop(ctx, params),
        "status" => handle_status(ctx, params),
        "list" => handle_list(ctx, params),
        "measure" => handle_measure(ctx, params),
        "test" => handle_test(ctx, params),
        "discover" => handle_discover(ctx, params),
        "plugins" => handle_plugins(ctx, params),
        "submit_job" => handle_submit_job(ctx, params),
        "submit_measure" => handle_submit_measure(ctx, params),
        "job_status" => handle_job_status(ctx, params),
        "job_result" => handle_job_result(ctx, params),
        "job_list" => handle_job_list(ctx, params),
        "job_cancel" => handle_job_cancel(ctx, params),
        "shutdown" => handle_shutdown(ctx, params),
        other => fail(format!("unknown command: {other}")),
    }
}

/// `daemon` over RPC only reports on or stops the already-running instance.
fn handle_daemon(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    match param_str(params, "action").as_deref() {
        Some("status") => ok(json!({
            "ok": true,
            "running": true,
            "pid": std::process::id(),
            "instruments": ctx.registry.list_instruments(),
        })),
        Some("stop") => {
            ctx.shutdown.notify_waiters();
            ok(json!({ "ok": true }))
        }
        Some(other) => fail(format!("unsupported daemon action over RPC: {other}")),
        None => fail("missing action"),
    }
}

fn handle_start(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(config_path) = param_str(params, "config_path") else {
        return fail("missing config_path");
    };

    if let Some(plugin) = param_str(params, "plugin") {
        let path = PathBuf::from(&plugin);
        if !path.exists() {
            return fail(format!("plugin file not found: {plugin}"));
        }
        // Re-registering the same protocol is fine; first registration wins.
        if let Err(e) = ctx.plugins.load_plugin(&path) {
            warn!(error = %e, "custom plugin registration failed");
        }
    }

    match ctx.registry.create_instrument(Path::new(&config_path)) {
        Ok(name) => ok(json!({ "ok": true, "instrument": name })),
        Err(e) => fail(e.to_string()),
    }
}

fn handle_stop(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(name) = param_str(params, "name") else {
        return fail("missing name");
    };
    if !ctx.registry.has_instrument(&name) {
        return fail("instrument not found");
    }
    ctx.registry.remove_instrument(&name);
    ok(json!({ "ok": true, "instrument": name }))
}

fn handle_status(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(name) = param_str(params, "name") else {
        return fail("missing name");
    };
    let Some(instrument) = ctx.registry.get_instrument(&name) else {
        return fail("instrument not found");
    };
    let stats = instrument.stats();
    ok(json!({
        "ok": true,
        "name": name,
        "alive": instrument.is_alive(),
        "stats": stats,
    }))
}

fn handle_list(ctx: &Arc<ServerContext>, _params: &Value) -> HandlerResult {
    ok(json!({ "ok": true, "instruments": ctx.registry.list_instruments() }))
}

/// Run a measurement script inline and return its collected results.
fn handle_measure(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(script_path) = param_str(params, "script_path") else {
        return fail("missing script_path");
    };
    if ctx.registry.list_instruments().is_empty() {
        return fail("no instruments running");
    }

    info!(script = %script_path, "running measurement");
    let runtime_ctx = Arc::new(
        ScriptRuntime::new(Arc::clone(&ctx.registry), false).with_pool(Arc::clone(&ctx.pool)),
    );
    if let Err(e) = runtime::run_script_file(&runtime_ctx, Path::new(&script_path)) {
        return fail(e.to_string());
    }

    let script_name = Path::new(&script_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| script_path.clone());
    let mut body = runtime_ctx.collect_results_json();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("ok".to_string(), json!(true));
        obj.insert("script".to_string(), json!(script_name));
    }
    ok(body)
}

/// One-shot command against a freshly created, then torn down, instrument.
fn handle_test(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(config_path) = param_str(params, "config_path") else {
        return fail("missing config_path");
    };
    let Some(verb) = param_str(params, "verb") else {
        return fail("missing verb");
    };

    if let Some(plugin) = param_str(params, "plugin") {
        let path = PathBuf::from(&plugin);
        if !path.exists() {
            return fail(format!("plugin file not found: {plugin}"));
        }
        if let Err(e) = ctx.plugins.load_plugin(&path) {
            warn!(error = %e, "custom plugin registration failed");
        }
    }

    let name = match ctx.registry.create_instrument(Path::new(&config_path)) {
        Ok(name) => name,
        Err(e) => return fail(e.to_string()),
    };
    let Some(instrument) = ctx.registry.get_instrument(&name) else {
        return fail("failed to get instrument");
    };

    let mut cmd = SerializedCommand::new(name.clone(), verb);
    cmd.id = "rpc-test-cmd".to_string();
    cmd.expects_response = true;
    if let Some(obj) = params.get("params").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            cmd.params
                .insert(key.clone(), ParamValue::from_untyped_json(value));
        }
    }

    let resp = instrument.execute_sync(cmd, Duration::from_secs(5));
    ctx.registry.remove_instrument(&name);

    let mut body = json!({
        "ok": resp.success,
        "success": resp.success,
        "error_message": resp.error_message,
        "text_response": resp.text_response,
    });
    if let Some(value) = &resp.return_value {
        body["return_value"] = value.to_untyped_json();
    }
    if resp.success {
        ok(body)
    } else {
        (1, body)
    }
}

fn default_plugin_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/lib/instrument-plugins"),
        PathBuf::from("/usr/lib/instrument-plugins"),
        PathBuf::from("./plugins"),
        PathBuf::from("."),
    ]
}

fn handle_discover(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let paths: Vec<PathBuf> = match params.get("paths").and_then(|p| p.as_array()) {
        Some(paths) if !paths.is_empty() => paths
            .iter()
            .filter_map(|p| p.as_str())
            .map(PathBuf::from)
            .collect(),
        _ => default_plugin_paths(),
    };

    ctx.plugins.load_builtin_plugins();
    ctx.plugins.discover_plugins(&paths);
    ok(json!({
        "ok": true,
        "protocols": ctx.plugins.list_protocols(),
        "paths": paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
    }))
}

fn handle_plugins(ctx: &Arc<ServerContext>, _params: &Value) -> HandlerResult {
    ctx.plugins.load_builtin_plugins();
    let plugins: Vec<Value> = ctx
        .plugins
        .list_protocols()
        .into_iter()
        .map(|protocol| {
            let path = ctx
                .plugins
                .get_plugin_path(&protocol)
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            json!({ "protocol": protocol, "path": path })
        })
        .collect();
    ok(json!({ "ok": true, "total": plugins.len(), "plugins": plugins }))
}

fn handle_submit_job(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(job_type) = param_str(params, "job_type") else {
        return fail("missing job_type");
    };
    let job_params = params.get("params").cloned().unwrap_or_else(|| json!({}));
    let job_id = ctx.jobs.submit_job(&job_type, job_params);
    ok(json!({ "ok": true, "job_id": job_id }))
}

fn handle_submit_measure(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(script_path) = param_str(params, "script_path") else {
        return fail("missing script_path");
    };
    let job_id = ctx.jobs.submit_measure(&script_path, params.clone());
    ok(json!({ "ok": true, "job_id": job_id }))
}

fn handle_job_status(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(job_id) = param_str(params, "job_id") else {
        return fail("missing job_id");
    };
    let Some(info) = ctx.jobs.get_job_info(&job_id) else {
        return fail("job not found");
    };
    let mut body = json!({
        "ok": true,
        "job_id": info.id,
        "status": info.status.as_str(),
        "created_at": info.created_at_ms,
    });
    if let Some(started) = info.started_at_ms {
        body["started_at"] = json!(started);
    }
    if let Some(finished) = info.finished_at_ms {
        body["finished_at"] = json!(finished);
    }
    if let Some(error) = &info.error {
        body["error"] = json!(error);
    }
    ok(body)
}

fn handle_job_result(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(job_id) = param_str(params, "job_id") else {
        return fail("missing job_id");
    };
    match ctx.jobs.get_job_result(&job_id) {
        Some(result) => ok(json!({ "ok": true, "job_id": job_id, "result": result })),
        None => match ctx.jobs.get_job_info(&job_id) {
            Some(info) => fail(format!("job not completed (status: {})", info.status.as_str())),
            None => fail("job not found"),
        },
    }
}

fn handle_job_list(ctx: &Arc<ServerContext>, _params: &Value) -> HandlerResult {
    let jobs: Vec<Value> = ctx
        .jobs
        .list_jobs()
        .into_iter()
        .map(|info| {
            json!({
                "job_id": info.id,
                "type": info.job_type,
                "status": info.status.as_str(),
                "created_at": info.created_at_ms,
            })
        })
        .collect();
    ok(json!({ "ok": true, "jobs": jobs }))
}

fn handle_job_cancel(ctx: &Arc<ServerContext>, params: &Value) -> HandlerResult {
    let Some(job_id) = param_str(params, "job_id") else {
        return fail("missing job_id");
    };
    if ctx.jobs.cancel_job(&job_id) {
        ok(json!({ "ok": true, "job_id": job_id }))
    } else {
        fail("job cannot be canceled")
    }
}

fn handle_shutdown(ctx: &Arc<ServerContext>, _params: &Value) -> HandlerResult {
    info!("shutdown requested over RPC");
    ctx.shutdown.notify_waiters();
    ok(json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Arc<ServerContext> {
        ServerContext::new().unwrap()
    }

    #[test]
    fn unknown_command_fails() {
        let ctx = context();
        let (rc, body) = dispatch(&ctx, "frobnicate", &json!({}));
        assert_eq!(rc, 1);
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("unknown command"));
    }

    #[test]
    fn list_is_empty_but_ok() {
        let ctx = context();
        let (rc, body) = dispatch(&ctx, "list", &json!({}));
        assert_eq!(rc, 0);
        assert_eq!(body["ok"], true);
        assert!(body["instruments"].as_array().unwrap().is_empty());
    }

    #[test]
    fn status_of_missing_instrument_fails() {
        let ctx = context();
        let (rc, body) = dispatch(&ctx, "status", &json!({ "name": "GHOST" }));
        assert_eq!(rc, 1);
        assert_eq!(body["error"], "instrument not found");
    }

    #[test]
    fn job_round_trip_through_handlers() {
        let ctx = context();
        let (rc, body) = dispatch(
            &ctx,
            "submit_job",
            &json!({ "job_type": "sleep", "params": { "duration_ms": 20 } }),
        );
        assert_eq!(rc, 0);
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let (_, status) = dispatch(&ctx, "job_status", &json!({ "job_id": job_id }));
            if status["status"] == "completed" {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never completed");
            std::thread::sleep(Duration::from_millis(10));
        }

        let (rc, result) = dispatch(&ctx, "job_result", &json!({ "job_id": job_id }));
        assert_eq!(rc, 0);
        assert_eq!(result["result"]["message"], "slept");

        let (rc, _) = dispatch(&ctx, "job_cancel", &json!({ "job_id": job_id }));
        assert_eq!(rc, 1, "terminal job must not cancel");
        ctx.jobs.stop();
    }

    #[test]
    fn measure_without_instruments_fails() {
        let ctx = context();
        let (rc, body) = dispatch(&ctx, "measure", &json!({ "script_path": "x.rhai" }));
        assert_eq!(rc, 1);
        assert_eq!(body["error"], "no instruments running");
    }
}
