//! Background job manager.
//!
//! Jobs are consumed from a FIFO deque by a single worker thread.
//! Measurement jobs use the enqueue-first script runtime: the worker thread
//! only runs the script's enqueue phase, then a detached monitor thread
//! releases the sync tokens, waits for the enqueued commands and finalizes
//! the job — so the queue keeps moving while measurements run.
//!
//! Scheduling rule: measure jobs may overlap each other, but a non-measure
//! job at the head of the queue waits until every active measure job has
//! finished.

use crate::error::{ServerError, ServerResult};
use crate::ipc::pool::DataBufferPool;
use crate::server::registry::InstrumentRegistry;
use crate::server::runtime::{self, ScriptRuntime};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cancellation poll slice for cooperative sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Canceling,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Canceling => "canceling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

/// One job record; lives for the lifetime of the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub job_type: String,
    pub params: serde_json::Value,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
}

#[derive(Default)]
struct JobState {
    jobs: HashMap<String, JobInfo>,
    queue: VecDeque<String>,
    active_measures: HashSet<String>,
}

struct JobManagerInner {
    state: Mutex<JobState>,
    /// Signaled on submit and stop.
    queue_cv: Condvar,
    /// Signaled when the active-measure set shrinks.
    measure_cv: Condvar,
    running: AtomicBool,
    next_id: AtomicU64,
    registry: Arc<InstrumentRegistry>,
    pool: Arc<DataBufferPool>,
}

/// FIFO job queue with one consumer thread.
pub struct JobManager {
    inner: Arc<JobManagerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        pool: Arc<DataBufferPool>,
    ) -> ServerResult<Self> {
        let inner = Arc::new(JobManagerInner {
            state: Mutex::new(JobState::default()),
            queue_cv: Condvar::new(),
            measure_cv: Condvar::new(),
            running: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            registry,
            pool,
        });
        let worker = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("job-manager".to_string())
                .spawn(move || worker_loop(&inner))
                .map_err(|e| ServerError::Job(format!("worker spawn: {e}")))?
        };
        info!("job manager started");
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn make_job_id(&self) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let ms = chrono::Utc::now().timestamp_millis();
        format!("job-{ms}-{n}")
    }

    /// Queue a job; returns its id.
    pub fn submit_job(&self, job_type: &str, params: serde_json::Value) -> String {
        let id = self.make_job_id();
        let info = JobInfo {
            id: id.clone(),
            job_type: job_type.to_string(),
            params,
            status: JobStatus::Queued,
            result: None,
            error: None,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            started_at_ms: None,
            finished_at_ms: None,
        };
        {
            let mut state = self.inner.lock();
            state.jobs.insert(id.clone(), info);
            state.queue.push_back(id.clone());
        }
        self.inner.queue_cv.notify_one();
        info!(job = %id, job_type, "submitted job");
        id
    }

    /// Queue a measurement script.
    pub fn submit_measure(&self, script_path: &str, params: serde_json::Value) -> String {
        let mut params = params;
        if let Some(obj) = params.as_object_mut() {
            obj.insert(
                "script_path".to_string(),
                serde_json::Value::String(script_path.to_string()),
            );
        } else {
            params = serde_json::json!({ "script_path": script_path });
        }
        self.submit_job("measure", params)
    }

    pub fn get_job_info(&self, job_id: &str) -> Option<JobInfo> {
        self.inner.lock().jobs.get(job_id).cloned()
    }

    /// The result document, only once the job has completed.
    pub fn get_job_result(&self, job_id: &str) -> Option<serde_json::Value> {
        let state = self.inner.lock();
        let job = state.jobs.get(job_id)?;
        if job.status != JobStatus::Completed {
            return None;
        }
        job.result.clone()
    }

    /// All job records, oldest first.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let state = self.inner.lock();
        let mut jobs: Vec<JobInfo> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Cancel a job.
    ///
    /// Queued jobs are removed and marked canceled; running jobs are marked
    /// canceling and must cooperate; terminal jobs are untouched (`false`).
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let mut state = self.inner.lock();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return false;
        };
        match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Canceled;
                job.error = Some("canceled".to_string());
                job.finished_at_ms = Some(chrono::Utc::now().timestamp_millis());
                state.queue.retain(|id| id != job_id);
                info!(job = job_id, "canceled queued job");
                true
            }
            JobStatus::Running => {
                job.status = JobStatus::Canceling;
                info!(job = job_id, "requested cooperative cancel");
                true
            }
            _ => false,
        }
    }

    /// Stop the worker thread. Queued jobs stay queued; running measure
    /// monitors finish on their own.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.queue_cv.notify_all();
        self.inner.measure_cv.notify_all();
        #[allow(clippy::unwrap_used)]
        let worker = self.worker.lock().unwrap().take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
        info!("job manager stopped");
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl JobManagerInner {
    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap()
    }

    fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.status = status;
            job.result = result;
            job.error = error;
            job.finished_at_ms = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.lock().jobs.get(job_id).map(|j| j.status)
    }
}

#[allow(clippy::unwrap_used)] // condvar waits; poisoning is unrecoverable
fn worker_loop(inner: &Arc<JobManagerInner>) {
    loop {
        let job_id = {
            let mut state = inner.lock();
            loop {
                if !inner.running.load(Ordering::SeqCst) && state.queue.is_empty() {
                    return;
                }
                let Some(head) = state.queue.front().cloned() else {
                    state = inner.queue_cv.wait(state).unwrap();
                    continue;
                };

                // Measure priority: a non-measure head waits for the active
                // measure set to drain.
                let head_is_measure = state
                    .jobs
                    .get(&head)
                    .map(|j| j.job_type == "measure")
                    .unwrap_or(false);
                if !head_is_measure && !state.active_measures.is_empty() {
                    debug!(job = %head, "waiting for active measure jobs");
                    state = inner.measure_cv.wait(state).unwrap();
                    continue;
                }

                state.queue.pop_front();
                if let Some(job) = state.jobs.get_mut(&head) {
                    job.status = JobStatus::Running;
                    job.started_at_ms = Some(chrono::Utc::now().timestamp_millis());
                }
                break head;
            }
        };

        info!(job = %job_id, "starting job");
        execute_job(inner, &job_id);
    }
}

fn execute_job(inner: &Arc<JobManagerInner>, job_id: &str) {
    let Some(info) = inner.lock().jobs.get(job_id).cloned() else {
        return;
    };

    match info.job_type.as_str() {
        "sleep" => run_sleep_job(inner, job_id, &info),
        "measure" => run_measure_job(inner, job_id, &info),
        other => {
            warn!(job = job_id, job_type = other, "unknown job type");
            inner.finish_job(
                job_id,
                JobStatus::Failed,
                None,
                Some(format!("unknown job type: {other}")),
            );
        }
    }
}

/// Sleep in short slices, honoring cooperative cancellation between slices.
fn run_sleep_job(inner: &Arc<JobManagerInner>, job_id: &str, info: &JobInfo) {
    let total_ms = info
        .params
        .get("duration_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or(100);

    let mut slept = Duration::ZERO;
    let total = Duration::from_millis(total_ms);
    while slept < total {
        if matches!(
            inner.job_status(job_id),
            Some(JobStatus::Canceling | JobStatus::Canceled)
        ) {
            inner.finish_job(job_id, JobStatus::Canceled, None, Some("canceled".into()));
            return;
        }
        let slice = SLEEP_SLICE.min(total - slept);
        std::thread::sleep(slice);
        slept += slice;
    }

    inner.finish_job(
        job_id,
        JobStatus::Completed,
        Some(serde_json::json!({ "message": "slept", "duration_ms": total_ms })),
        None,
    );
}

/// Enqueue-first measurement: parse and dispatch on the worker thread, then
/// hand completion to a detached monitor.
fn run_measure_job(inner: &Arc<JobManagerInner>, job_id: &str, info: &JobInfo) {
    let Some(script_path) = info
        .params
        .get("script_path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        inner.finish_job(
            job_id,
            JobStatus::Failed,
            None,
            Some("missing script_path".into()),
        );
        return;
    };

    let runtime = Arc::new(
        ScriptRuntime::new(Arc::clone(&inner.registry), true).with_pool(Arc::clone(&inner.pool)),
    );
    if let Err(e) = runtime::run_script_file(&runtime, &script_path) {
        error!(job = job_id, error = %e, "measurement script failed during enqueue");
        inner.finish_job(job_id, JobStatus::Failed, None, Some(e.to_string()));
        return;
    }

    inner
        .lock()
        .active_measures
        .insert(job_id.to_string());

    let monitor_inner = Arc::clone(inner);
    let monitor_id = job_id.to_string();
    let spawned = std::thread::Builder::new()
        .name(format!("measure-{monitor_id}"))
        .spawn(move || {
            info!(job = %monitor_id, "monitoring enqueued measurement");
            runtime.process_tokens_and_wait();
            let results = runtime.collect_results_json();

            monitor_inner.finish_job(&monitor_id, JobStatus::Completed, Some(results), None);
            monitor_inner.lock().active_measures.remove(&monitor_id);
            monitor_inner.measure_cv.notify_all();
            info!(job = %monitor_id, "measurement completed");
        });

    if let Err(e) = spawned {
        inner.lock().active_measures.remove(job_id);
        inner.measure_cv.notify_all();
        inner.finish_job(
            job_id,
            JobStatus::Failed,
            None,
            Some(format!("monitor spawn failed: {e}")),
        );
    }
}
