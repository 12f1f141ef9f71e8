//! Fixed-size IPC frame.
//!
//! Every message between the daemon and a worker is one frame: a type tag, a
//! 64-bit message id, a 64-bit sync token (0 when absent) and a bounded
//! payload. Frames always occupy exactly [`FRAME_SIZE`] bytes on the queue —
//! the bincode encoding is padded with zeros — so a received message of any
//! other size is a programming or version-skew error and is discarded.
//!
//! Payloads larger than [`MAX_FRAME_PAYLOAD`] never travel in a frame; bulk
//! data goes through the buffer pool and only its id crosses the queue.

use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};

/// Maximum payload bytes carried by one frame (4 KiB).
pub const MAX_FRAME_PAYLOAD: usize = 4096;

/// On-queue size of every frame: payload capacity plus encoding overhead
/// (enum tag, two u64 fields, payload length prefix).
pub const FRAME_SIZE: usize = MAX_FRAME_PAYLOAD + 32;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Daemon → worker: execute a serialized command (JSON payload).
    Command,
    /// Worker → daemon: command result (JSON payload).
    Response,
    /// Worker → daemon: liveness signal, sent when the request queue is idle.
    Heartbeat,
    /// Daemon → worker: exit the command loop.
    Shutdown,
    /// Worker → daemon: a sync-tagged command reached its barrier point.
    SyncAck,
    /// Daemon → worker: release commands held under the frame's sync token.
    SyncContinue,
}

/// One IPC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    /// Request/response correlation id (0 for control frames).
    pub message_id: u64,
    /// Sync token, 0 when absent.
    pub sync_token: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn command(message_id: u64, sync_token: u64, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Command,
            message_id,
            sync_token,
            payload,
        }
    }

    pub fn response(message_id: u64, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Response,
            message_id,
            sync_token: 0,
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: FrameKind::Heartbeat,
            message_id: 0,
            sync_token: 0,
            payload: Vec::new(),
        }
    }

    pub fn shutdown() -> Self {
        Self {
            kind: FrameKind::Shutdown,
            message_id: 0,
            sync_token: 0,
            payload: Vec::new(),
        }
    }

    pub fn sync_ack(sync_token: u64) -> Self {
        Self {
            kind: FrameKind::SyncAck,
            message_id: 0,
            sync_token,
            payload: Vec::new(),
        }
    }

    pub fn sync_continue(sync_token: u64) -> Self {
        Self {
            kind: FrameKind::SyncContinue,
            message_id: 0,
            sync_token,
            payload: Vec::new(),
        }
    }

    /// Encode into a zero-padded [`FRAME_SIZE`] buffer.
    pub fn encode(&self) -> ServerResult<Box<[u8; FRAME_SIZE]>> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(ServerError::Ipc(format!(
                "frame payload of {} bytes exceeds the {} byte cap",
                self.payload.len(),
                MAX_FRAME_PAYLOAD
            )));
        }
        let encoded = bincode::serialize(self)
            .map_err(|e| ServerError::Ipc(format!("frame encode failed: {e}")))?;
        debug_assert!(encoded.len() <= FRAME_SIZE);

        let mut buf = Box::new([0u8; FRAME_SIZE]);
        buf[..encoded.len()].copy_from_slice(&encoded);
        Ok(buf)
    }

    /// Decode from a buffer of exactly [`FRAME_SIZE`] bytes.
    ///
    /// Trailing padding after the bincode body is ignored.
    pub fn decode(buf: &[u8]) -> ServerResult<Frame> {
        if buf.len() != FRAME_SIZE {
            return Err(ServerError::Ipc(format!(
                "received {} bytes, expected the fixed frame size of {}",
                buf.len(),
                FRAME_SIZE
            )));
        }
        bincode::deserialize(buf)
            .map_err(|e| ServerError::Ipc(format!("frame decode failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::command(17, 42, b"{\"verb\":\"MEASURE\"}".to_vec());
        let buf = frame.encode().unwrap();
        assert_eq!(buf.len(), FRAME_SIZE);
        let back = Frame::decode(&buf[..]).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn control_frames_round_trip() {
        for frame in [
            Frame::heartbeat(),
            Frame::shutdown(),
            Frame::sync_ack(7),
            Frame::sync_continue(7),
        ] {
            let buf = frame.encode().unwrap();
            assert_eq!(Frame::decode(&buf[..]).unwrap(), frame);
        }
    }

    #[test]
    fn max_payload_fits_exactly() {
        let frame = Frame::command(1, 0, vec![0xA5; MAX_FRAME_PAYLOAD]);
        let buf = frame.encode().unwrap();
        assert_eq!(Frame::decode(&buf[..]).unwrap().payload.len(), MAX_FRAME_PAYLOAD);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let frame = Frame::command(1, 0, vec![0; MAX_FRAME_PAYLOAD + 1]);
        assert!(frame.encode().is_err());
    }

    #[test]
    fn wrong_size_buffer_is_rejected() {
        let frame = Frame::heartbeat();
        let buf = frame.encode().unwrap();
        assert!(Frame::decode(&buf[..FRAME_SIZE - 1]).is_err());
    }
}
