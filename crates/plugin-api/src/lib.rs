//! C-compatible ABI shared between the instrument server and driver plugins.
//!
//! A driver plugin is a shared library exposing four C-linkage entry points:
//!
//! - `plugin_get_metadata() -> PluginMetadata`
//! - `plugin_initialize(*const PluginConfig) -> i32` (0 = success)
//! - `plugin_execute_command(*const PluginCommand, *mut PluginResponse) -> i32`
//! - `plugin_shutdown()`
//!
//! All structs are `#[repr(C)]` with fixed-size string fields so they can be
//! passed by pointer across the library boundary without any host-side
//! allocation. The parameter value is a flattened tagged struct rather than a
//! C union: one discriminant plus one field per value family, with array
//! payloads carried as pointer + length into memory owned by the caller for
//! the duration of the call.
//!
//! The ABI is versioned: the host rejects any library whose metadata reports
//! an `api_version` different from [`PLUGIN_API_VERSION`].

#![allow(unsafe_code)]

/// ABI revision implemented by this header. Bump on any layout change.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Maximum length of any fixed-size string field, including room for NUL.
pub const PLUGIN_MAX_STRING_LEN: usize = 128;
/// Maximum number of parameters carried by one command.
pub const PLUGIN_MAX_PARAMS: usize = 16;
/// Maximum size of text/JSON payload fields.
pub const PLUGIN_MAX_PAYLOAD: usize = 4096;

/// Discriminants for [`PluginParamValue::tag`].
pub mod param_tag {
    pub const NONE: u32 = 0;
    pub const I32: u32 = 1;
    pub const I64: u32 = 2;
    pub const U32: u32 = 3;
    pub const U64: u32 = 4;
    pub const F32: u32 = 5;
    pub const F64: u32 = 6;
    pub const BOOL: u32 = 7;
    pub const STRING: u32 = 8;
    pub const BINARY: u32 = 9;
    pub const F64_ARRAY: u32 = 10;
    pub const I32_ARRAY: u32 = 11;
}

/// Discriminants for bulk-data element types (mirrors the host buffer pool).
pub mod data_type_tag {
    pub const F32: u32 = 0;
    pub const F64: u32 = 1;
    pub const I32: u32 = 2;
    pub const I64: u32 = 3;
    pub const U32: u32 = 4;
    pub const U64: u32 = 5;
    pub const U8: u32 = 6;
}

/// Tagged parameter value.
///
/// Only the field selected by `tag` is meaningful; the rest are zeroed.
/// `f32` values are widened into `float_value`. Array pointers borrow caller
/// memory and must not be retained past the call.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PluginParamValue {
    pub tag: u32,
    pub int_value: i64,
    pub uint_value: u64,
    pub float_value: f64,
    pub bool_value: u8,
    pub text: [u8; PLUGIN_MAX_STRING_LEN],
    pub array_ptr: *const u8,
    pub array_len: usize,
}

impl PluginParamValue {
    pub const fn none() -> Self {
        Self {
            tag: param_tag::NONE,
            int_value: 0,
            uint_value: 0,
            float_value: 0.0,
            bool_value: 0,
            text: [0; PLUGIN_MAX_STRING_LEN],
            array_ptr: std::ptr::null(),
            array_len: 0,
        }
    }
}

impl Default for PluginParamValue {
    fn default() -> Self {
        Self::none()
    }
}

/// One named command parameter.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PluginParam {
    pub name: [u8; PLUGIN_MAX_STRING_LEN],
    pub value: PluginParamValue,
}

impl Default for PluginParam {
    fn default() -> Self {
        Self {
            name: [0; PLUGIN_MAX_STRING_LEN],
            value: PluginParamValue::none(),
        }
    }
}

/// Command handed to `plugin_execute_command`.
#[repr(C)]
pub struct PluginCommand {
    pub id: [u8; PLUGIN_MAX_STRING_LEN],
    pub instrument_name: [u8; PLUGIN_MAX_STRING_LEN],
    pub verb: [u8; PLUGIN_MAX_STRING_LEN],
    pub params: [PluginParam; PLUGIN_MAX_PARAMS],
    pub param_count: u32,
    pub timeout_ms: u32,
    pub expects_response: u8,
}

impl Default for PluginCommand {
    fn default() -> Self {
        Self {
            id: [0; PLUGIN_MAX_STRING_LEN],
            instrument_name: [0; PLUGIN_MAX_STRING_LEN],
            verb: [0; PLUGIN_MAX_STRING_LEN],
            params: [PluginParam::default(); PLUGIN_MAX_PARAMS],
            param_count: 0,
            timeout_ms: 0,
            expects_response: 0,
        }
    }
}

/// Response filled by `plugin_execute_command`.
///
/// Responses whose payload would not fit `text_response`/`binary_response`
/// should be routed through the host buffer pool instead: set
/// `has_large_data`, and fill `buffer_id`/`element_count`/`data_type` with
/// the values returned by [`instrument_host_buffer_create`].
#[repr(C)]
pub struct PluginResponse {
    pub command_id: [u8; PLUGIN_MAX_STRING_LEN],
    pub instrument_name: [u8; PLUGIN_MAX_STRING_LEN],
    pub success: u8,
    pub return_value: PluginParamValue,
    pub text_response: [u8; PLUGIN_MAX_PAYLOAD],
    pub binary_response: [u8; PLUGIN_MAX_PAYLOAD],
    pub binary_response_size: u32,
    pub error_code: i32,
    pub error_message: [u8; PLUGIN_MAX_STRING_LEN],
    pub has_large_data: u8,
    pub buffer_id: [u8; PLUGIN_MAX_STRING_LEN],
    pub element_count: u64,
    pub data_type: u32,
}

impl Default for PluginResponse {
    fn default() -> Self {
        Self {
            command_id: [0; PLUGIN_MAX_STRING_LEN],
            instrument_name: [0; PLUGIN_MAX_STRING_LEN],
            success: 0,
            return_value: PluginParamValue::none(),
            text_response: [0; PLUGIN_MAX_PAYLOAD],
            binary_response: [0; PLUGIN_MAX_PAYLOAD],
            binary_response_size: 0,
            error_code: 0,
            error_message: [0; PLUGIN_MAX_STRING_LEN],
            has_large_data: 0,
            buffer_id: [0; PLUGIN_MAX_STRING_LEN],
            element_count: 0,
            data_type: 0,
        }
    }
}

/// Configuration passed once to `plugin_initialize`.
#[repr(C)]
pub struct PluginConfig {
    pub instrument_name: [u8; PLUGIN_MAX_STRING_LEN],
    /// Connection description as a JSON document.
    pub connection_json: [u8; PLUGIN_MAX_PAYLOAD],
    /// Logical API definition as a JSON document.
    pub api_definition_json: [u8; PLUGIN_MAX_PAYLOAD],
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            instrument_name: [0; PLUGIN_MAX_STRING_LEN],
            connection_json: [0; PLUGIN_MAX_PAYLOAD],
            api_definition_json: [0; PLUGIN_MAX_PAYLOAD],
        }
    }
}

/// Metadata reported by `plugin_get_metadata`, read before initialization.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PluginMetadata {
    pub api_version: u32,
    pub name: [u8; PLUGIN_MAX_STRING_LEN],
    pub version: [u8; PLUGIN_MAX_STRING_LEN],
    pub protocol_type: [u8; PLUGIN_MAX_STRING_LEN],
    pub description: [u8; PLUGIN_MAX_STRING_LEN],
}

impl Default for PluginMetadata {
    fn default() -> Self {
        Self {
            api_version: 0,
            name: [0; PLUGIN_MAX_STRING_LEN],
            version: [0; PLUGIN_MAX_STRING_LEN],
            protocol_type: [0; PLUGIN_MAX_STRING_LEN],
            description: [0; PLUGIN_MAX_STRING_LEN],
        }
    }
}

/// Symbol name and signature of each required entry point.
pub const SYM_GET_METADATA: &[u8] = b"plugin_get_metadata\0";
pub const SYM_INITIALIZE: &[u8] = b"plugin_initialize\0";
pub const SYM_EXECUTE_COMMAND: &[u8] = b"plugin_execute_command\0";
pub const SYM_SHUTDOWN: &[u8] = b"plugin_shutdown\0";

pub type GetMetadataFn = unsafe extern "C" fn() -> PluginMetadata;
pub type InitializeFn = unsafe extern "C" fn(*const PluginConfig) -> i32;
pub type ExecuteCommandFn =
    unsafe extern "C" fn(*const PluginCommand, *mut PluginResponse) -> i32;
pub type ShutdownFn = unsafe extern "C" fn();

extern "C" {
    /// Host buffer-pool entry point, exported by the worker executable.
    ///
    /// Allocates a buffer of `element_count` elements of `data_type` (one of
    /// [`data_type_tag`]), copying from `data` when non-null, and writes the
    /// NUL-terminated buffer id into `out_id` (capacity `out_id_len`, at
    /// least [`PLUGIN_MAX_STRING_LEN`]). Returns 0 on success.
    pub fn instrument_host_buffer_create(
        instrument_name: *const u8,
        command_id: *const u8,
        data_type: u32,
        element_count: u64,
        data: *const u8,
        out_id: *mut u8,
        out_id_len: usize,
    ) -> i32;
}

/// Copy `src` into a fixed-size NUL-terminated field, truncating as needed.
pub fn fill_str(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    for b in dst[n..].iter_mut() {
        *b = 0;
    }
}

/// Read a NUL-terminated fixed-size field back into a `String` (lossy).
pub fn read_str(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_read_round_trip() {
        let mut field = [0u8; PLUGIN_MAX_STRING_LEN];
        fill_str(&mut field, "MEASURE_VOLTAGE");
        assert_eq!(read_str(&field), "MEASURE_VOLTAGE");
    }

    #[test]
    fn fill_truncates_oversized_input() {
        let mut field = [0u8; 8];
        fill_str(&mut field, "0123456789");
        // Room for 7 bytes plus the terminator.
        assert_eq!(read_str(&field), "0123456");
    }

    #[test]
    fn response_defaults_to_failure() {
        let resp = PluginResponse::default();
        assert_eq!(resp.success, 0);
        assert_eq!(resp.has_large_data, 0);
        assert_eq!(resp.return_value.tag, param_tag::NONE);
    }
}
