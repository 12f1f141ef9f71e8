//! C entry points exported to driver plugins.
//!
//! Plugins hand bulk payloads to the host through
//! `instrument_host_buffer_create`, declared in the `instrument-plugin-api`
//! crate and resolved at load time against the executable that loaded the
//! plugin (binaries are linked with `-rdynamic` for this). All calls operate
//! on [`DataBufferPool::process_pool`].

#![allow(unsafe_code)]

use crate::ipc::pool::{DataBufferPool, DataType};
use instrument_plugin_api::PLUGIN_MAX_STRING_LEN;
use std::ffi::CStr;
use tracing::error;

/// # Safety
///
/// `instrument_name` and `command_id` must be NUL-terminated strings;
/// `data`, when non-null, must point at `element_count * element size`
/// readable bytes; `out_id` must point at `out_id_len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn instrument_host_buffer_create(
    instrument_name: *const u8,
    command_id: *const u8,
    data_type: u32,
    element_count: u64,
    data: *const u8,
    out_id: *mut u8,
    out_id_len: usize,
) -> i32 {
    if instrument_name.is_null() || command_id.is_null() || out_id.is_null() {
        return -1;
    }
    if out_id_len < PLUGIN_MAX_STRING_LEN {
        return -1;
    }
    let Some(data_type) = DataType::from_tag(data_type) else {
        return -2;
    };

    let instrument = CStr::from_ptr(instrument_name.cast()).to_string_lossy();
    let command = CStr::from_ptr(command_id.cast()).to_string_lossy();

    let payload = if data.is_null() {
        None
    } else {
        let byte_size = element_count as usize * data_type.size();
        Some(std::slice::from_raw_parts(data, byte_size))
    };

    match DataBufferPool::process_pool().create_buffer(
        &instrument,
        &command,
        data_type,
        element_count,
        payload,
    ) {
        Ok(buffer_id) => {
            let bytes = buffer_id.as_bytes();
            let n = bytes.len().min(out_id_len - 1);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), out_id, n);
            *out_id.add(n) = 0;
            0
        }
        Err(e) => {
            error!(instrument = %instrument, error = %e, "plugin buffer create failed");
            -3
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn create_via_c_api_lands_in_process_pool() {
        let data: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mut out = [0u8; PLUGIN_MAX_STRING_LEN];
        let rc = unsafe {
            instrument_host_buffer_create(
                b"DMM1\0".as_ptr(),
                b"cmd-7\0".as_ptr(),
                instrument_plugin_api::data_type_tag::F32,
                2,
                data.as_ptr(),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        assert_eq!(rc, 0);
        let id = instrument_plugin_api::read_str(&out);
        assert!(id.starts_with("buffer_"));

        let pool = DataBufferPool::process_pool();
        assert_eq!(pool.read_f32(&id).unwrap(), vec![1.0, 2.0]);
        pool.release_buffer(&id);
    }

    #[test]
    #[serial]
    fn unknown_data_type_is_rejected() {
        let mut out = [0u8; PLUGIN_MAX_STRING_LEN];
        let rc = unsafe {
            instrument_host_buffer_create(
                b"DMM1\0".as_ptr(),
                b"cmd-8\0".as_ptr(),
                999,
                2,
                std::ptr::null(),
                out.as_mut_ptr(),
                out.len(),
            )
        };
        assert_eq!(rc, -2);
    }
}
