//! Daemon-side components: worker proxies, the instrument registry, barrier
//! coordination, the job manager, the script runtime and the RPC surface.

pub mod daemon;
pub mod handlers;
pub mod jobs;
pub mod proxy;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod sync;

use crate::error::ServerResult;
use crate::ipc::pool::DataBufferPool;
use crate::plugin::PluginRegistry;
use std::sync::Arc;

pub use jobs::{JobInfo, JobManager, JobStatus};
pub use proxy::{Instrument, ProxyStats, ResponseFuture, WorkerProxy};
pub use registry::InstrumentRegistry;
pub use runtime::{CallResult, ScriptRuntime};
pub use sync::SyncCoordinator;

/// Top-level holder for the daemon's singletons.
///
/// Everything here is process-wide state: one instrument registry, one sync
/// coordinator, one plugin registry, one job manager, one daemon-side buffer
/// pool. Components receive the pieces they need as `Arc`s; nothing reaches
/// for globals.
pub struct ServerContext {
    pub registry: Arc<InstrumentRegistry>,
    pub coordinator: Arc<SyncCoordinator>,
    pub plugins: Arc<PluginRegistry>,
    pub jobs: Arc<JobManager>,
    pub pool: Arc<DataBufferPool>,
    /// Notified to stop the RPC loop and bring the daemon down.
    pub shutdown: Arc<tokio::sync::Notify>,
}

impl ServerContext {
    pub fn new() -> ServerResult<Arc<Self>> {
        let coordinator = Arc::new(SyncCoordinator::new());
        let plugins = Arc::new(PluginRegistry::new());
        let registry = Arc::new(InstrumentRegistry::new(
            Arc::clone(&plugins),
            Arc::clone(&coordinator),
        ));
        let pool = Arc::new(DataBufferPool::new());
        let jobs = Arc::new(JobManager::new(Arc::clone(&registry), Arc::clone(&pool))?);
        Ok(Arc::new(Self {
            registry,
            coordinator,
            plugins,
            jobs,
            pool,
            shutdown: Arc::new(tokio::sync::Notify::new()),
        }))
    }
}
