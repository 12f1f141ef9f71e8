//! Ref-counted pool for bulk numeric payloads.
//!
//! Responses whose data would not fit the fixed-size IPC frame park it here
//! and send only an opaque buffer id. Buffers are named OS shared-memory
//! segments whose id doubles as the segment's OS id, so an id minted in a
//! worker process can be opened by the daemon (`open_buffer`) without any
//! extra copying through the queue.
//!
//! Each process keeps its own pool: a map from buffer id to mapped segment,
//! metadata and reference count, guarded by one mutex. The creating process
//! owns the segment; when its count reaches zero the mapping is dropped and
//! the segment unlinked. A non-owning process merely unmaps.

#![allow(unsafe_code)] // raw segment access, confined to this module

use crate::error::{ServerError, ServerResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    F32,
    F64,
    I32,
    I64,
    U32,
    U64,
    U8,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::U8 => 1,
        }
    }

    /// ABI discriminant used across the plugin boundary.
    pub fn to_tag(self) -> u32 {
        use instrument_plugin_api::data_type_tag as t;
        match self {
            DataType::F32 => t::F32,
            DataType::F64 => t::F64,
            DataType::I32 => t::I32,
            DataType::I64 => t::I64,
            DataType::U32 => t::U32,
            DataType::U64 => t::U64,
            DataType::U8 => t::U8,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        use instrument_plugin_api::data_type_tag as t;
        Some(match tag {
            t::F32 => DataType::F32,
            t::F64 => DataType::F64,
            t::I32 => DataType::I32,
            t::I64 => DataType::I64,
            t::U32 => DataType::U32,
            t::U64 => DataType::U64,
            t::U8 => DataType::U8,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
            DataType::U8 => "u8",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "f32" => DataType::F32,
            "f64" => DataType::F64,
            "i32" => DataType::I32,
            "i64" => DataType::I64,
            "u32" => DataType::U32,
            "u64" => DataType::U64,
            "u8" => DataType::U8,
            _ => return None,
        })
    }
}

/// Read-only description of a pooled buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBufferMetadata {
    pub buffer_id: String,
    pub instrument_name: String,
    pub command_id: String,
    pub data_type: DataType,
    pub element_count: u64,
    pub byte_size: usize,
    /// Capture time, milliseconds since the Unix epoch.
    pub created_at_ms: i64,
}

/// Mapped segment wrapper.
///
/// `Shmem` holds a raw mapping pointer and is not `Send`; entries are only
/// ever touched while holding the pool mutex, which serializes all access.
struct Segment(Shmem);

unsafe impl Send for Segment {}

impl Segment {
    fn bytes(&self, len: usize) -> &[u8] {
        // The mapping is at least `len` bytes (checked at insert time).
        unsafe { std::slice::from_raw_parts(self.0.as_ptr(), len) }
    }

    fn bytes_mut(&mut self, len: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.0.as_ptr(), len) }
    }
}

struct BufferEntry {
    segment: Segment,
    metadata: DataBufferMetadata,
    ref_count: u32,
}

/// Process-local buffer pool.
pub struct DataBufferPool {
    buffers: Mutex<HashMap<String, BufferEntry>>,
    next_id: AtomicU64,
}

impl Default for DataBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DataBufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The pool shared with the plugin C API in this process.
    ///
    /// Worker processes route everything through this instance so that
    /// buffers created by a driver via `instrument_host_buffer_create` are
    /// visible to the worker loop.
    pub fn process_pool() -> &'static DataBufferPool {
        static POOL: Lazy<DataBufferPool> = Lazy::new(DataBufferPool::new);
        &POOL
    }

    fn generate_buffer_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ms = chrono::Utc::now().timestamp_millis();
        format!("buffer_{ms}_{n}")
    }

    /// Allocate a buffer of `element_count` elements, copying `data` when
    /// given (must be exactly `element_count * type size` bytes) and
    /// zero-filling otherwise. The new buffer starts with a reference count
    /// of one.
    pub fn create_buffer(
        &self,
        instrument_name: &str,
        command_id: &str,
        data_type: DataType,
        element_count: u64,
        data: Option<&[u8]>,
    ) -> ServerResult<String> {
        if element_count == 0 {
            return Err(ServerError::Buffer("element count must be non-zero".into()));
        }
        let byte_size = element_count as usize * data_type.size();
        if let Some(data) = data {
            if data.len() != byte_size {
                return Err(ServerError::Buffer(format!(
                    "data length {} does not match {} elements of {}",
                    data.len(),
                    element_count,
                    data_type.as_str()
                )));
            }
        }

        let buffer_id = self.generate_buffer_id();
        let shmem = ShmemConf::new()
            .size(byte_size)
            .os_id(&buffer_id)
            .create()
            .map_err(|e| ServerError::Buffer(format!("create segment {buffer_id}: {e}")))?;

        let mut segment = Segment(shmem);
        match data {
            Some(data) => segment.bytes_mut(byte_size).copy_from_slice(data),
            None => segment.bytes_mut(byte_size).fill(0),
        }

        let metadata = DataBufferMetadata {
            buffer_id: buffer_id.clone(),
            instrument_name: instrument_name.to_string(),
            command_id: command_id.to_string(),
            data_type,
            element_count,
            byte_size,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        info!(
            buffer = %buffer_id,
            instrument = instrument_name,
            command = command_id,
            elements = element_count,
            bytes = byte_size,
            "created buffer"
        );

        let mut buffers = self.lock();
        buffers.insert(
            buffer_id.clone(),
            BufferEntry {
                segment,
                metadata,
                ref_count: 1,
            },
        );
        Ok(buffer_id)
    }

    /// Map a buffer created by another process into this pool.
    ///
    /// The element type and count come from the response that referenced the
    /// buffer; the mapped segment must be large enough to hold them. Starts
    /// with a reference count of one in this process.
    pub fn open_buffer(
        &self,
        buffer_id: &str,
        instrument_name: &str,
        command_id: &str,
        data_type: DataType,
        element_count: u64,
    ) -> ServerResult<()> {
        let mut buffers = self.lock();
        if let Some(entry) = buffers.get_mut(buffer_id) {
            entry.ref_count += 1;
            return Ok(());
        }

        let byte_size = element_count as usize * data_type.size();
        let shmem = ShmemConf::new()
            .os_id(buffer_id)
            .open()
            .map_err(|e| ServerError::Buffer(format!("open segment {buffer_id}: {e}")))?;
        if shmem.len() < byte_size {
            return Err(ServerError::Buffer(format!(
                "segment {buffer_id} holds {} bytes, need {byte_size}",
                shmem.len()
            )));
        }

        buffers.insert(
            buffer_id.to_string(),
            BufferEntry {
                segment: Segment(shmem),
                metadata: DataBufferMetadata {
                    buffer_id: buffer_id.to_string(),
                    instrument_name: instrument_name.to_string(),
                    command_id: command_id.to_string(),
                    data_type,
                    element_count,
                    byte_size,
                    created_at_ms: chrono::Utc::now().timestamp_millis(),
                },
                ref_count: 1,
            },
        );
        debug!(buffer = buffer_id, "mapped foreign buffer");
        Ok(())
    }

    /// Increment the reference count; returns the metadata snapshot.
    pub fn get_buffer(&self, buffer_id: &str) -> Option<DataBufferMetadata> {
        let mut buffers = self.lock();
        let entry = buffers.get_mut(buffer_id)?;
        entry.ref_count += 1;
        Some(entry.metadata.clone())
    }

    /// Decrement the reference count, dropping the buffer at zero.
    pub fn release_buffer(&self, buffer_id: &str) {
        let mut buffers = self.lock();
        let Some(entry) = buffers.get_mut(buffer_id) else {
            warn!(buffer = buffer_id, "release of unknown buffer");
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        debug!(buffer = buffer_id, refs = entry.ref_count, "released buffer reference");
        if entry.ref_count == 0 {
            info!(buffer = buffer_id, "dropping buffer");
            buffers.remove(buffer_id);
        }
    }

    /// Metadata snapshot without touching the reference count.
    pub fn get_metadata(&self, buffer_id: &str) -> Option<DataBufferMetadata> {
        self.lock().get(buffer_id).map(|e| e.metadata.clone())
    }

    pub fn list_buffers(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn total_memory_usage(&self) -> usize {
        self.lock().values().map(|e| e.metadata.byte_size).sum()
    }

    pub fn clear_all(&self) {
        let mut buffers = self.lock();
        if !buffers.is_empty() {
            info!(count = buffers.len(), "clearing all buffers");
        }
        buffers.clear();
    }

    /// Raw contents of a buffer.
    pub fn read_bytes(&self, buffer_id: &str) -> ServerResult<Vec<u8>> {
        let buffers = self.lock();
        let entry = self.entry(&buffers, buffer_id)?;
        Ok(entry.segment.bytes(entry.metadata.byte_size).to_vec())
    }

    /// Typed read; fails unless the buffer's element type matches.
    pub fn read_f32(&self, buffer_id: &str) -> ServerResult<Vec<f32>> {
        self.read_typed(buffer_id, DataType::F32, |b| {
            f32::from_ne_bytes([b[0], b[1], b[2], b[3]])
        })
    }

    pub fn read_f64(&self, buffer_id: &str) -> ServerResult<Vec<f64>> {
        self.read_typed(buffer_id, DataType::F64, |b| {
            f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    pub fn read_i32(&self, buffer_id: &str) -> ServerResult<Vec<i32>> {
        self.read_typed(buffer_id, DataType::I32, |b| {
            i32::from_ne_bytes([b[0], b[1], b[2], b[3]])
        })
    }

    pub fn read_i64(&self, buffer_id: &str) -> ServerResult<Vec<i64>> {
        self.read_typed(buffer_id, DataType::I64, |b| {
            i64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    pub fn read_u32(&self, buffer_id: &str) -> ServerResult<Vec<u32>> {
        self.read_typed(buffer_id, DataType::U32, |b| {
            u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
        })
    }

    pub fn read_u64(&self, buffer_id: &str) -> ServerResult<Vec<u64>> {
        self.read_typed(buffer_id, DataType::U64, |b| {
            u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    pub fn read_u8(&self, buffer_id: &str) -> ServerResult<Vec<u8>> {
        self.read_typed(buffer_id, DataType::U8, |b| b[0])
    }

    /// Write raw element bytes, native endian, no header.
    pub fn export_to_file(&self, buffer_id: &str, path: &Path) -> ServerResult<()> {
        let bytes = self.read_bytes(buffer_id)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Write one element per line; `u8` rendered as a decimal integer.
    pub fn export_to_csv(&self, buffer_id: &str, path: &Path) -> ServerResult<()> {
        let metadata = self
            .get_metadata(buffer_id)
            .ok_or_else(|| ServerError::Buffer(format!("unknown buffer: {buffer_id}")))?;
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        match metadata.data_type {
            DataType::F32 => write_lines(&mut file, &self.read_f32(buffer_id)?)?,
            DataType::F64 => write_lines(&mut file, &self.read_f64(buffer_id)?)?,
            DataType::I32 => write_lines(&mut file, &self.read_i32(buffer_id)?)?,
            DataType::I64 => write_lines(&mut file, &self.read_i64(buffer_id)?)?,
            DataType::U32 => write_lines(&mut file, &self.read_u32(buffer_id)?)?,
            DataType::U64 => write_lines(&mut file, &self.read_u64(buffer_id)?)?,
            DataType::U8 => {
                for v in self.read_u8(buffer_id)? {
                    writeln!(file, "{}", v as u32)?;
                }
            }
        }
        file.flush()?;
        Ok(())
    }

    fn read_typed<T>(
        &self,
        buffer_id: &str,
        expected: DataType,
        decode: impl Fn(&[u8]) -> T,
    ) -> ServerResult<Vec<T>> {
        let buffers = self.lock();
        let entry = self.entry(&buffers, buffer_id)?;
        if entry.metadata.data_type != expected {
            return Err(ServerError::Buffer(format!(
                "buffer {buffer_id} holds {}, not {}",
                entry.metadata.data_type.as_str(),
                expected.as_str()
            )));
        }
        let bytes = entry.segment.bytes(entry.metadata.byte_size);
        Ok(bytes.chunks_exact(expected.size()).map(decode).collect())
    }

    fn entry<'a>(
        &self,
        buffers: &'a HashMap<String, BufferEntry>,
        buffer_id: &str,
    ) -> ServerResult<&'a BufferEntry> {
        buffers
            .get(buffer_id)
            .ok_or_else(|| ServerError::Buffer(format!("unknown buffer: {buffer_id}")))
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BufferEntry>> {
        self.buffers.lock().unwrap()
    }
}

fn write_lines<W: Write, T: std::fmt::Display>(w: &mut W, values: &[T]) -> std::io::Result<()> {
    for v in values {
        writeln!(w, "{v}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    #[serial]
    fn buffer_lifecycle_with_ref_counts() {
        let pool = DataBufferPool::new();
        let data = f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let id = pool
            .create_buffer("DMM1", "cmd-1", DataType::F32, 5, Some(&data))
            .unwrap();

        // Initial ref plus three gets: four releases drop the buffer.
        assert!(pool.get_buffer(&id).is_some());
        assert!(pool.get_buffer(&id).is_some());
        assert!(pool.get_buffer(&id).is_some());

        pool.release_buffer(&id);
        pool.release_buffer(&id);
        pool.release_buffer(&id);
        assert!(pool.get_metadata(&id).is_some());
        pool.release_buffer(&id);
        assert!(pool.get_metadata(&id).is_none());
        assert!(!pool.list_buffers().contains(&id));
    }

    #[test]
    #[serial]
    fn byte_size_invariant_and_typed_reads() {
        let pool = DataBufferPool::new();
        let data = f32_bytes(&[1.5, -2.5]);
        let id = pool
            .create_buffer("SCOPE1", "cmd-2", DataType::F32, 2, Some(&data))
            .unwrap();

        let meta = pool.get_metadata(&id).unwrap();
        assert_eq!(meta.byte_size, meta.element_count as usize * meta.data_type.size());

        assert_eq!(pool.read_f32(&id).unwrap(), vec![1.5, -2.5]);
        // Type-checked accessor refuses a mismatched element type.
        assert!(pool.read_i32(&id).is_err());

        pool.release_buffer(&id);
    }

    #[test]
    #[serial]
    fn zero_fill_when_no_data_given() {
        let pool = DataBufferPool::new();
        let id = pool
            .create_buffer("DAC1", "cmd-3", DataType::U8, 8, None)
            .unwrap();
        assert_eq!(pool.read_u8(&id).unwrap(), vec![0; 8]);
        pool.release_buffer(&id);
    }

    #[test]
    #[serial]
    fn export_round_trips_raw_bytes() {
        let pool = DataBufferPool::new();
        let data = f32_bytes(&[0.5, 1.5, 2.5]);
        let id = pool
            .create_buffer("SCOPE1", "cmd-4", DataType::F32, 3, Some(&data))
            .unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        let raw = dir.path().join("wave.bin");
        pool.export_to_file(&id, &raw).unwrap();
        assert_eq!(std::fs::read(&raw).unwrap(), data);

        let csv = dir.path().join("wave.csv");
        pool.export_to_csv(&id, &csv).unwrap();
        let text = std::fs::read_to_string(&csv).unwrap();
        assert_eq!(text.lines().count(), 3);

        pool.release_buffer(&id);
    }

    #[test]
    #[serial]
    fn foreign_buffer_can_be_opened_by_id() {
        let creator = DataBufferPool::new();
        let data = f32_bytes(&[9.0, 8.0]);
        let id = creator
            .create_buffer("DMM1", "cmd-5", DataType::F32, 2, Some(&data))
            .unwrap();

        // A second pool (standing in for the daemon process) maps it by id.
        let mirror = DataBufferPool::new();
        mirror.open_buffer(&id, "DMM1", "cmd-5", DataType::F32, 2).unwrap();
        assert_eq!(mirror.read_f32(&id).unwrap(), vec![9.0, 8.0]);

        mirror.release_buffer(&id);
        creator.release_buffer(&id);
    }

    #[test]
    #[serial]
    fn mismatched_data_length_is_rejected() {
        let pool = DataBufferPool::new();
        let err = pool
            .create_buffer("DMM1", "cmd-6", DataType::F64, 4, Some(&[0u8; 3]))
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
