//! Translation between the JSON command model and the plugin ABI structs.
//!
//! Array-valued parameters are passed as pointer + element count borrowing
//! the command's own storage, which outlives the `plugin_execute_command`
//! call; array values returned by the plugin are copied out immediately,
//! since the plugin only guarantees them until its next call.

#![allow(unsafe_code)]

use crate::command::{CommandResponse, LargeDataRef, ParamValue, SerializedCommand};
use crate::ipc::pool::DataType;
use crate::plugin::abi;
use std::time::Instant;
use tracing::warn;

/// Build the ABI command from a serialized command.
///
/// At most [`abi::PLUGIN_MAX_PARAMS`] parameters are carried; extras are
/// dropped with a warning. Strings are truncated to the ABI field sizes.
pub fn command_to_plugin(cmd: &SerializedCommand) -> abi::PluginCommand {
    let mut out = abi::PluginCommand::default();
    abi::fill_str(&mut out.id, &cmd.id);
    abi::fill_str(&mut out.instrument_name, &cmd.instrument_name);
    abi::fill_str(&mut out.verb, &cmd.verb);
    out.timeout_ms = cmd.timeout.as_millis() as u32;
    out.expects_response = cmd.expects_response as u8;

    for (key, value) in &cmd.params {
        if out.param_count as usize >= abi::PLUGIN_MAX_PARAMS {
            warn!(
                command = %cmd.id,
                max = abi::PLUGIN_MAX_PARAMS,
                "dropping parameters beyond the ABI limit"
            );
            break;
        }
        let slot = &mut out.params[out.param_count as usize];
        abi::fill_str(&mut slot.name, key);
        slot.value = param_to_abi(value);
        out.param_count += 1;
    }
    out
}

fn param_to_abi(value: &ParamValue) -> abi::PluginParamValue {
    use abi::param_tag as tag;
    let mut v = abi::PluginParamValue::none();
    match value {
        ParamValue::None => v.tag = tag::NONE,
        ParamValue::I32(x) => {
            v.tag = tag::I32;
            v.int_value = i64::from(*x);
        }
        ParamValue::I64(x) => {
            v.tag = tag::I64;
            v.int_value = *x;
        }
        ParamValue::U32(x) => {
            v.tag = tag::U32;
            v.uint_value = u64::from(*x);
        }
        ParamValue::U64(x) => {
            v.tag = tag::U64;
            v.uint_value = *x;
        }
        ParamValue::F32(x) => {
            v.tag = tag::F32;
            v.float_value = f64::from(*x);
        }
        ParamValue::F64(x) => {
            v.tag = tag::F64;
            v.float_value = *x;
        }
        ParamValue::Bool(x) => {
            v.tag = tag::BOOL;
            v.bool_value = *x as u8;
        }
        ParamValue::Str(s) => {
            v.tag = tag::STRING;
            abi::fill_str(&mut v.text, s);
        }
        ParamValue::Bytes(b) => {
            v.tag = tag::BINARY;
            v.array_ptr = b.as_ptr();
            v.array_len = b.len();
        }
        ParamValue::F64Array(a) => {
            v.tag = tag::F64_ARRAY;
            v.array_ptr = a.as_ptr().cast();
            v.array_len = a.len();
        }
        ParamValue::I32Array(a) => {
            v.tag = tag::I32_ARRAY;
            v.array_ptr = a.as_ptr().cast();
            v.array_len = a.len();
        }
    }
    v
}

/// Decode the plugin's return value.
fn abi_to_param(value: &abi::PluginParamValue) -> Option<ParamValue> {
    use abi::param_tag as tag;
    Some(match value.tag {
        tag::NONE => return None,
        tag::I32 => ParamValue::I32(value.int_value as i32),
        tag::I64 => ParamValue::I64(value.int_value),
        tag::U32 => ParamValue::U32(value.uint_value as u32),
        tag::U64 => ParamValue::U64(value.uint_value),
        tag::F32 => ParamValue::F32(value.float_value as f32),
        tag::F64 => ParamValue::F64(value.float_value),
        tag::BOOL => ParamValue::Bool(value.bool_value != 0),
        tag::STRING => ParamValue::Str(abi::read_str(&value.text)),
        tag::BINARY => {
            if value.array_ptr.is_null() {
                return None;
            }
            ParamValue::Bytes(
                unsafe { std::slice::from_raw_parts(value.array_ptr, value.array_len) }.to_vec(),
            )
        }
        tag::F64_ARRAY => {
            if value.array_ptr.is_null() {
                return None;
            }
            ParamValue::F64Array(
                unsafe {
                    std::slice::from_raw_parts(value.array_ptr.cast::<f64>(), value.array_len)
                }
                .to_vec(),
            )
        }
        tag::I32_ARRAY => {
            if value.array_ptr.is_null() {
                return None;
            }
            ParamValue::I32Array(
                unsafe {
                    std::slice::from_raw_parts(value.array_ptr.cast::<i32>(), value.array_len)
                }
                .to_vec(),
            )
        }
        other => {
            warn!(tag = other, "unknown return value tag from plugin");
            return None;
        }
    })
}

/// Build the response model from what the plugin filled in.
///
/// A non-zero `status` with `success` still set is normalized to a failure
/// carrying the status as `error_code`.
pub fn plugin_to_response(
    plugin_resp: &abi::PluginResponse,
    cmd: &SerializedCommand,
    status: i32,
    started: Instant,
) -> CommandResponse {
    let mut resp = CommandResponse {
        command_id: {
            let id = abi::read_str(&plugin_resp.command_id);
            if id.is_empty() {
                cmd.id.clone()
            } else {
                id
            }
        },
        instrument_name: cmd.instrument_name.clone(),
        success: plugin_resp.success != 0,
        return_value: abi_to_param(&plugin_resp.return_value),
        text_response: abi::read_str(&plugin_resp.text_response),
        large_data: None,
        error_code: plugin_resp.error_code,
        error_message: abi::read_str(&plugin_resp.error_message),
        started,
        finished: Instant::now(),
    };

    if plugin_resp.has_large_data != 0 {
        let data_type = DataType::from_tag(plugin_resp.data_type);
        match data_type {
            Some(data_type) => {
                resp.large_data = Some(LargeDataRef {
                    buffer_id: abi::read_str(&plugin_resp.buffer_id),
                    element_count: plugin_resp.element_count,
                    data_type: data_type.as_str().to_string(),
                });
            }
            None => warn!(
                command = %cmd.id,
                tag = plugin_resp.data_type,
                "plugin flagged large data with an unknown element type"
            ),
        }
    }

    if status != 0 && resp.success {
        resp.success = false;
        resp.error_code = status;
        resp.error_message = format!("plugin execution returned error code {status}");
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SerializedCommand;

    #[test]
    fn command_translation_carries_typed_params() {
        let cmd = SerializedCommand::new("DMM1", "CONFIGURE")
            .with_param("range", ParamValue::F64(10.0))
            .with_param("samples", ParamValue::I64(100))
            .with_param("mode", ParamValue::Str("dc".to_string()));

        let plugin_cmd = command_to_plugin(&cmd);
        assert_eq!(abi::read_str(&plugin_cmd.verb), "CONFIGURE");
        assert_eq!(plugin_cmd.param_count, 3);

        let find = |name: &str| {
            plugin_cmd.params[..plugin_cmd.param_count as usize]
                .iter()
                .find(|p| abi::read_str(&p.name) == name)
                .map(|p| p.value)
                .unwrap()
        };
        assert_eq!(find("range").tag, abi::param_tag::F64);
        assert_eq!(find("range").float_value, 10.0);
        assert_eq!(find("samples").tag, abi::param_tag::I64);
        assert_eq!(find("samples").int_value, 100);
        assert_eq!(abi::read_str(&find("mode").text), "dc");
    }

    #[test]
    fn array_params_borrow_command_storage() {
        let cmd = SerializedCommand::new("DAC1", "WRITE_WAVEFORM")
            .with_param("wave", ParamValue::F64Array(vec![0.0, 0.5, 1.0]));
        let plugin_cmd = command_to_plugin(&cmd);
        let value = plugin_cmd.params[0].value;
        assert_eq!(value.tag, abi::param_tag::F64_ARRAY);
        assert_eq!(value.array_len, 3);
        let wave =
            unsafe { std::slice::from_raw_parts(value.array_ptr.cast::<f64>(), value.array_len) };
        assert_eq!(wave, &[0.0, 0.5, 1.0]);
    }

    #[test]
    fn nonzero_status_normalizes_to_failure() {
        let cmd = SerializedCommand::new("DMM1", "MEASURE");
        let mut plugin_resp = abi::PluginResponse::default();
        plugin_resp.success = 1;
        let resp = plugin_to_response(&plugin_resp, &cmd, 7, Instant::now());
        assert!(!resp.success);
        assert_eq!(resp.error_code, 7);
        assert!(resp.error_message.contains('7'));
    }

    #[test]
    fn large_data_reference_is_propagated() {
        let cmd = SerializedCommand::new("SCOPE1", "READ_WAVEFORM");
        let mut plugin_resp = abi::PluginResponse::default();
        plugin_resp.success = 1;
        plugin_resp.has_large_data = 1;
        abi::fill_str(&mut plugin_resp.buffer_id, "buffer_1_1");
        plugin_resp.element_count = 4096;
        plugin_resp.data_type = abi::data_type_tag::F32;

        let resp = plugin_to_response(&plugin_resp, &cmd, 0, Instant::now());
        let large = resp.large_data.unwrap();
        assert_eq!(large.buffer_id, "buffer_1_1");
        assert_eq!(large.element_count, 4096);
        assert_eq!(large.data_type, "f32");
    }
}
