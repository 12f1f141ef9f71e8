//! Simulated instrument driver.
//!
//! Implements the host plugin ABI over an in-memory model of a bench
//! multimeter with DAC outputs. Useful for exercising the full daemon →
//! worker → plugin path without hardware.
//!
//! Verbs:
//!
//! - `IDN` — identification string in `text_response`
//! - `SET_VOLTAGE(arg0 | voltage [, channel])` — store an output voltage
//! - `GET_VOLTAGE([channel])` — read it back
//! - `MEASURE_VOLTAGE([range, samples])` — simulated reading around the
//!   last set voltage
//! - `READ_WAVEFORM([points])` — bulk sine waveform through the host
//!   buffer pool (`has_large_data`)
//! - `RESET` — clear all channels

#![allow(unsafe_code)]

use instrument_plugin_api::{
    self as abi, data_type_tag, fill_str, param_tag, read_str, PluginCommand, PluginConfig,
    PluginMetadata, PluginParamValue, PluginResponse, PLUGIN_API_VERSION, PLUGIN_MAX_STRING_LEN,
};
use std::collections::HashMap;
use std::sync::Mutex;

struct SimState {
    initialized: bool,
    instrument_name: String,
    /// Channel → output voltage.
    outputs: HashMap<i64, f64>,
    /// Deterministic noise phase for simulated measurements.
    phase: u64,
}

static STATE: Mutex<Option<SimState>> = Mutex::new(None);

fn param<'a>(cmd: &'a PluginCommand, name: &str) -> Option<&'a PluginParamValue> {
    cmd.params[..cmd.param_count as usize]
        .iter()
        .find(|p| read_str(&p.name) == name)
        .map(|p| &p.value)
}

fn as_f64(value: &PluginParamValue) -> Option<f64> {
    match value.tag {
        param_tag::F32 | param_tag::F64 => Some(value.float_value),
        param_tag::I32 | param_tag::I64 => Some(value.int_value as f64),
        param_tag::U32 | param_tag::U64 => Some(value.uint_value as f64),
        _ => None,
    }
}

fn as_i64(value: &PluginParamValue) -> Option<i64> {
    match value.tag {
        param_tag::I32 | param_tag::I64 => Some(value.int_value),
        param_tag::U32 | param_tag::U64 => Some(value.uint_value as i64),
        param_tag::F32 | param_tag::F64 => Some(value.float_value as i64),
        _ => None,
    }
}

fn fail(resp: &mut PluginResponse, code: i32, message: &str) -> i32 {
    resp.success = 0;
    resp.error_code = code;
    fill_str(&mut resp.error_message, message);
    code
}

#[no_mangle]
pub extern "C" fn plugin_get_metadata() -> PluginMetadata {
    let mut meta = PluginMetadata {
        api_version: PLUGIN_API_VERSION,
        ..PluginMetadata::default()
    };
    fill_str(&mut meta.name, "Simulated Instrument");
    fill_str(&mut meta.version, "0.1.0");
    fill_str(&mut meta.protocol_type, "SIM");
    fill_str(&mut meta.description, "Simulated DMM/DAC driver for testing");
    meta
}

/// # Safety
///
/// `config` must point at a valid `PluginConfig`.
#[no_mangle]
pub unsafe extern "C" fn plugin_initialize(config: *const PluginConfig) -> i32 {
    if config.is_null() {
        return -1;
    }
    let config = &*config;
    let mut state = match STATE.lock() {
        Ok(state) => state,
        Err(_) => return -2,
    };
    *state = Some(SimState {
        initialized: true,
        instrument_name: read_str(&config.instrument_name),
        outputs: HashMap::new(),
        phase: 0,
    });
    0
}

/// # Safety
///
/// `command` and `response` must point at valid structs; array parameters
/// must satisfy the ABI contract.
#[no_mangle]
pub unsafe extern "C" fn plugin_execute_command(
    command: *const PluginCommand,
    response: *mut PluginResponse,
) -> i32 {
    if command.is_null() || response.is_null() {
        return -1;
    }
    let cmd = &*command;
    let resp = &mut *response;
    *resp = PluginResponse::default();
    resp.command_id = cmd.id;
    resp.instrument_name = cmd.instrument_name;

    let mut guard = match STATE.lock() {
        Ok(guard) => guard,
        Err(_) => return fail(resp, -2, "driver state poisoned"),
    };
    let Some(state) = guard.as_mut().filter(|s| s.initialized) else {
        return fail(resp, -3, "plugin not initialized");
    };

    let verb = read_str(&cmd.verb);
    let channel = param(cmd, "channel").and_then(as_i64).unwrap_or(0);

    match verb.as_str() {
        "IDN" => {
            resp.success = 1;
            fill_str(
                &mut resp.text_response,
                &format!("SIM,{},0,0.1.0", state.instrument_name),
            );
        }
        "SET_VOLTAGE" => {
            let value = param(cmd, "voltage")
                .or_else(|| param(cmd, "arg0"))
                .and_then(as_f64);
            let Some(value) = value else {
                return fail(resp, 1, "SET_VOLTAGE requires a numeric voltage");
            };
            state.outputs.insert(channel, value);
            resp.success = 1;
            fill_str(&mut resp.text_response, "OK");
        }
        "GET_VOLTAGE" => {
            let value = state.outputs.get(&channel).copied().unwrap_or(0.0);
            resp.success = 1;
            resp.return_value.tag = param_tag::F64;
            resp.return_value.float_value = value;
        }
        "MEASURE_VOLTAGE" => {
            let base = state.outputs.get(&channel).copied().unwrap_or(0.0);
            // Deterministic pseudo-noise, ±0.5 mV.
            state.phase = state.phase.wrapping_mul(6364136223846793005).wrapping_add(1);
            let noise = ((state.phase >> 33) as f64 / (u32::MAX as f64) - 0.5) * 1e-3;
            resp.success = 1;
            resp.return_value.tag = param_tag::F64;
            resp.return_value.float_value = base + noise;
        }
        "READ_WAVEFORM" => {
            let points = param(cmd, "points")
                .or_else(|| param(cmd, "arg0"))
                .and_then(as_i64)
                .unwrap_or(4096)
                .clamp(1, 1 << 20) as usize;
            let waveform: Vec<f32> = (0..points)
                .map(|i| (2.0 * std::f64::consts::PI * i as f64 / 100.0).sin() as f32)
                .collect();

            let mut buffer_id = [0u8; PLUGIN_MAX_STRING_LEN];
            let rc = abi::instrument_host_buffer_create(
                cmd.instrument_name.as_ptr(),
                cmd.id.as_ptr(),
                data_type_tag::F32,
                points as u64,
                waveform.as_ptr().cast(),
                buffer_id.as_mut_ptr(),
                buffer_id.len(),
            );
            if rc != 0 {
                return fail(resp, rc, "host buffer allocation failed");
            }
            resp.success = 1;
            resp.has_large_data = 1;
            resp.buffer_id = buffer_id;
            resp.element_count = points as u64;
            resp.data_type = data_type_tag::F32;
        }
        "RESET" => {
            state.outputs.clear();
            resp.success = 1;
            fill_str(&mut resp.text_response, "OK");
        }
        _ => {
            return fail(resp, 2, &format!("unknown verb: {verb}"));
        }
    }
    0
}

#[no_mangle]
pub extern "C" fn plugin_shutdown() {
    if let Ok(mut state) = STATE.lock() {
        *state = None;
    }
}
