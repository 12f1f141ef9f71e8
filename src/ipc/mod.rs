//! Inter-process plumbing: fixed-size frames, named queue pairs and the
//! shared-memory buffer pool.

pub mod c_api;
pub mod frame;
pub mod pool;
pub mod queue;

pub use frame::{Frame, FrameKind, FRAME_SIZE, MAX_FRAME_PAYLOAD};
pub use pool::{DataBufferMetadata, DataBufferPool, DataType};
pub use queue::{FrameQueue, QUEUE_CAPACITY};
