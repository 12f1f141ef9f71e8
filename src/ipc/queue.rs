//! Named bounded frame queues between the daemon and one worker.
//!
//! Each instrument gets a pair of POSIX message queues,
//! `/instrument_<name>_req` (daemon → worker) and `/instrument_<name>_resp`
//! (worker → daemon), each holding up to [`QUEUE_CAPACITY`] frames of exactly
//! [`FRAME_SIZE`] bytes. The daemon creates both (removing any stale queues a
//! crashed prior run left behind); the worker opens both.
//!
//! Queues are opened non-blocking and both `send` and `recv` poll against a
//! deadline, so no operation ever blocks indefinitely. A full queue surfaces
//! as a send timeout (`false`), which the proxy turns into a failed command.

use crate::error::{ServerError, ServerResult};
use crate::ipc::frame::{Frame, FRAME_SIZE};
use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Maximum number of frames queued in each direction.
pub const QUEUE_CAPACITY: usize = 100;

/// Poll interval for the bounded send/receive loops.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Which side of the queue pair this handle represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Sends on `_req`, receives on `_resp`.
    Daemon,
    /// Receives on `_req`, sends on `_resp`.
    Worker,
}

/// Queue name for an instrument; POSIX requires the leading slash.
fn queue_name(instrument: &str, suffix: &str) -> ServerResult<CString> {
    CString::new(format!("/instrument_{instrument}_{suffix}"))
        .map_err(|_| ServerError::Ipc(format!("invalid instrument name: {instrument}")))
}

/// Bidirectional frame-queue pair for one instrument.
pub struct FrameQueue {
    req: Option<MqdT>,
    resp: Option<MqdT>,
    role: Role,
    instrument: String,
}

impl FrameQueue {
    /// Create both queues (daemon side), removing stale ones first.
    pub fn create_daemon(instrument: &str) -> ServerResult<Self> {
        let req_name = queue_name(instrument, "req")?;
        let resp_name = queue_name(instrument, "resp")?;

        // Recover from a crashed prior run.
        let _ = mq_unlink(req_name.as_c_str());
        let _ = mq_unlink(resp_name.as_c_str());

        let req = create_queue(&req_name)?;
        let resp = create_queue(&resp_name)?;
        debug!(instrument, "created IPC queue pair");

        Ok(Self {
            req: Some(req),
            resp: Some(resp),
            role: Role::Daemon,
            instrument: instrument.to_string(),
        })
    }

    /// Open both queues (worker side); they must already exist.
    pub fn open_worker(instrument: &str) -> ServerResult<Self> {
        let req_name = queue_name(instrument, "req")?;
        let resp_name = queue_name(instrument, "resp")?;
        let flags = MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK;
        let mode = Mode::from_bits_truncate(0o600);

        let req = mq_open(req_name.as_c_str(), flags, mode, None)
            .map_err(|e| ServerError::Ipc(format!("open {req_name:?}: {e}")))?;
        let resp = mq_open(resp_name.as_c_str(), flags, mode, None)
            .map_err(|e| ServerError::Ipc(format!("open {resp_name:?}: {e}")))?;
        debug!(instrument, "opened IPC queue pair");

        Ok(Self {
            req: Some(req),
            resp: Some(resp),
            role: Role::Worker,
            instrument: instrument.to_string(),
        })
    }

    /// Send a frame, waiting at most `timeout` for queue space.
    ///
    /// Returns `false` on timeout or error; never blocks past the deadline.
    pub fn send(&self, frame: &Frame, timeout: Duration) -> bool {
        let buf = match frame.encode() {
            Ok(buf) => buf,
            Err(e) => {
                error!(instrument = %self.instrument, error = %e, "frame encode failed");
                return false;
            }
        };
        let queue = match self.role {
            Role::Daemon => &self.req,
            Role::Worker => &self.resp,
        };
        let Some(queue) = queue.as_ref() else {
            return false;
        };

        let deadline = Instant::now() + timeout;
        loop {
            match mq_send(queue, &buf[..], 0) {
                Ok(()) => return true,
                Err(Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        warn!(instrument = %self.instrument, "IPC send timeout (queue full)");
                        return false;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    error!(instrument = %self.instrument, error = %e, "IPC send failed");
                    return false;
                }
            }
        }
    }

    /// Receive a frame, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout. A message whose size does not match
    /// [`FRAME_SIZE`] is logged and discarded.
    pub fn recv(&self, timeout: Duration) -> Option<Frame> {
        let queue = match self.role {
            Role::Daemon => &self.resp,
            Role::Worker => &self.req,
        };
        let queue = queue.as_ref()?;

        let mut buf = vec![0u8; FRAME_SIZE];
        let mut priority = 0u32;
        let deadline = Instant::now() + timeout;
        loop {
            match mq_receive(queue, &mut buf, &mut priority) {
                Ok(n) => {
                    if n != FRAME_SIZE {
                        error!(
                            instrument = %self.instrument,
                            received = n,
                            expected = FRAME_SIZE,
                            "discarding frame with mismatched size"
                        );
                        return None;
                    }
                    match Frame::decode(&buf) {
                        Ok(frame) => return Some(frame),
                        Err(e) => {
                            error!(instrument = %self.instrument, error = %e, "discarding undecodable frame");
                            return None;
                        }
                    }
                }
                Err(Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    error!(instrument = %self.instrument, error = %e, "IPC receive failed");
                    return None;
                }
            }
        }
    }

    /// Remove both named queues for an instrument.
    ///
    /// Called by the daemon when an instrument stops; harmless if the queues
    /// are already gone.
    pub fn unlink(instrument: &str) {
        if let Ok(name) = queue_name(instrument, "req") {
            let _ = mq_unlink(name.as_c_str());
        }
        if let Ok(name) = queue_name(instrument, "resp") {
            let _ = mq_unlink(name.as_c_str());
        }
        debug!(instrument, "unlinked IPC queues");
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        if let Some(q) = self.req.take() {
            let _ = mq_close(q);
        }
        if let Some(q) = self.resp.take() {
            let _ = mq_close(q);
        }
    }
}

fn create_queue(name: &CString) -> ServerResult<MqdT> {
    let flags = MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK;
    let mode = Mode::from_bits_truncate(0o600);
    let attr = MqAttr::new(0, QUEUE_CAPACITY as _, FRAME_SIZE as _, 0);

    match mq_open(name.as_c_str(), flags, mode, Some(&attr)) {
        Ok(q) => Ok(q),
        // Linux caps mq_maxmsg for unprivileged processes (fs.mqueue.msg_max,
        // often 10); retry with the system default depth.
        Err(Errno::EINVAL) => {
            warn!(queue = ?name, "requested queue depth rejected, using system default");
            mq_open(name.as_c_str(), flags, mode, None)
                .map_err(|e| ServerError::Ipc(format!("create {name:?}: {e}")))
        }
        Err(e) => Err(ServerError::Ipc(format!("create {name:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn round_trip_between_roles() {
        let daemon = FrameQueue::create_daemon("qtest_rt").unwrap();
        let worker = FrameQueue::open_worker("qtest_rt").unwrap();

        let cmd = Frame::command(5, 0, b"{}".to_vec());
        assert!(daemon.send(&cmd, Duration::from_millis(200)));
        assert_eq!(worker.recv(Duration::from_millis(200)), Some(cmd));

        let resp = Frame::response(5, b"{\"ok\":true}".to_vec());
        assert!(worker.send(&resp, Duration::from_millis(200)));
        assert_eq!(daemon.recv(Duration::from_millis(200)), Some(resp));

        drop(worker);
        drop(daemon);
        FrameQueue::unlink("qtest_rt");
    }

    #[test]
    #[serial]
    fn recv_times_out_when_empty() {
        let daemon = FrameQueue::create_daemon("qtest_empty").unwrap();
        let start = Instant::now();
        assert_eq!(daemon.recv(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
        drop(daemon);
        FrameQueue::unlink("qtest_empty");
    }

    #[test]
    #[serial]
    fn send_fails_within_timeout_when_full() {
        let daemon = FrameQueue::create_daemon("qtest_full").unwrap();
        let frame = Frame::heartbeat();
        // Fill the request queue; depth depends on system limits.
        let mut sent = 0;
        while daemon.send(&frame, Duration::from_millis(10)) {
            sent += 1;
            if sent > QUEUE_CAPACITY {
                break;
            }
        }
        assert!(sent > 0);
        let start = Instant::now();
        assert!(!daemon.send(&frame, Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_secs(2));
        drop(daemon);
        FrameQueue::unlink("qtest_full");
    }

    #[test]
    #[serial]
    fn create_removes_stale_queues() {
        let first = FrameQueue::create_daemon("qtest_stale").unwrap();
        assert!(first.send(&Frame::heartbeat(), Duration::from_millis(100)));
        drop(first);

        // A fresh create must not observe the message left in the stale queue.
        let second = FrameQueue::create_daemon("qtest_stale").unwrap();
        let worker = FrameQueue::open_worker("qtest_stale").unwrap();
        assert_eq!(worker.recv(Duration::from_millis(50)), None);
        drop(worker);
        drop(second);
        FrameQueue::unlink("qtest_stale");
    }
}
