//! Job manager scheduling: measurement jobs run enqueue-first and block
//! non-measure jobs until they finish.

mod common;

use common::MockInstrument;
use instrument_server::ipc::pool::DataBufferPool;
use instrument_server::plugin::PluginRegistry;
use instrument_server::server::jobs::{JobManager, JobStatus};
use instrument_server::server::registry::InstrumentRegistry;
use instrument_server::server::sync::SyncCoordinator;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Fixture {
    registry: Arc<InstrumentRegistry>,
    jobs: JobManager,
    _dir: tempfile::TempDir,
    script: std::path::PathBuf,
}

/// Registry with one slow mock instrument plus a measurement script that
/// drives it.
fn fixture(response_delay: Duration) -> Fixture {
    let coordinator = Arc::new(SyncCoordinator::new());
    let registry = Arc::new(InstrumentRegistry::new(
        Arc::new(PluginRegistry::new()),
        Arc::clone(&coordinator),
    ));
    registry
        .insert(MockInstrument::with_delay(
            "DMM1",
            Arc::clone(&coordinator),
            response_delay,
        ))
        .unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let script = dir.path().join("scan.rhai");
    let mut file = std::fs::File::create(&script).unwrap();
    writeln!(
        file,
        r#"
            parallel(|| {{
                call("DMM1.MeasureVoltage");
            }});
        "#
    )
    .unwrap();

    let jobs = JobManager::new(Arc::clone(&registry), Arc::new(DataBufferPool::new())).unwrap();
    Fixture {
        registry,
        jobs,
        _dir: dir,
        script,
    }
}

fn wait_status(jobs: &JobManager, id: &str, status: JobStatus, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if jobs.get_job_info(id).map(|j| j.status) == Some(status) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn measure_job_completes_with_results() {
    let f = fixture(Duration::ZERO);
    let id = f
        .jobs
        .submit_measure(f.script.to_str().unwrap(), serde_json::json!({}));

    assert!(wait_status(&f.jobs, &id, JobStatus::Completed, Duration::from_secs(5)));
    let result = f.jobs.get_job_result(&id).unwrap();
    let results = result["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["instrument"], "DMM1");
    assert_eq!(results[0]["success"], true);
    f.jobs.stop();
}

#[test]
fn sleep_waits_for_active_measure_jobs() {
    // The mock answers after 400 ms, so the measure job stays active while
    // the sleep job sits at the head of the queue.
    let f = fixture(Duration::from_millis(400));
    let measure = f
        .jobs
        .submit_measure(f.script.to_str().unwrap(), serde_json::json!({}));
    let sleep = f
        .jobs
        .submit_job("sleep", serde_json::json!({ "duration_ms": 20 }));

    assert!(wait_status(&f.jobs, &sleep, JobStatus::Completed, Duration::from_secs(5)));
    assert!(wait_status(&f.jobs, &measure, JobStatus::Completed, Duration::from_secs(5)));

    let measure_info = f.jobs.get_job_info(&measure).unwrap();
    let sleep_info = f.jobs.get_job_info(&sleep).unwrap();
    assert!(
        sleep_info.started_at_ms.unwrap() >= measure_info.finished_at_ms.unwrap(),
        "sleep started at {:?} before measure finished at {:?}",
        sleep_info.started_at_ms,
        measure_info.finished_at_ms
    );
    f.jobs.stop();
}

#[test]
fn measure_jobs_may_overlap() {
    let f = fixture(Duration::from_millis(200));
    let first = f
        .jobs
        .submit_measure(f.script.to_str().unwrap(), serde_json::json!({}));
    let second = f
        .jobs
        .submit_measure(f.script.to_str().unwrap(), serde_json::json!({}));

    assert!(wait_status(&f.jobs, &first, JobStatus::Completed, Duration::from_secs(5)));
    assert!(wait_status(&f.jobs, &second, JobStatus::Completed, Duration::from_secs(5)));

    // The second must not have waited for the first monitor to finish: its
    // enqueue phase starts while the first is still collecting responses.
    let a = f.jobs.get_job_info(&first).unwrap();
    let b = f.jobs.get_job_info(&second).unwrap();
    assert!(b.started_at_ms.unwrap() < a.finished_at_ms.unwrap());
    f.jobs.stop();
}

#[test]
fn measure_with_missing_script_fails() {
    let f = fixture(Duration::ZERO);
    let id = f
        .jobs
        .submit_measure("/nonexistent/script.rhai", serde_json::json!({}));
    assert!(wait_status(&f.jobs, &id, JobStatus::Failed, Duration::from_secs(5)));
    assert!(f.jobs.get_job_result(&id).is_none());
    f.jobs.stop();
}

#[test]
fn registry_survives_job_manager_teardown() {
    let f = fixture(Duration::ZERO);
    f.jobs.stop();
    assert_eq!(f.registry.list_instruments(), vec!["DMM1".to_string()]);
}
