//! End-to-end lifecycle tests with real `/bin/sh` workers.
//!
//! The clock is pinned (ManualClock) so the time-driven transitions of
//! the status machine are deterministic even though the processes are
//! real.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use outrider::{
    Clock, LogLevel, ManualClock, SupervisorConfig, WorkerStatus, WorkerSupervisor,
};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn sh_config(bootstrap: PathBuf) -> SupervisorConfig {
    SupervisorConfig {
        interpreter: PathBuf::from("/bin/sh"),
        bootstrap,
        probe_args: vec!["-c".to_string(), "true".to_string()],
        ..Default::default()
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn test_log_pipeline_and_status_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let bootstrap = write_script(
        dir.path(),
        "bootstrap.sh",
        "echo 'BOOTSTRAP_STATUS: {\"status\":\"initialized\",\"pid\":12345}'\n\
         echo '2024-01-01 12:00:00,123 - TestLogger - WARNING - low disk'\n\
         echo 'plain output'\n\
         sleep 30\n",
    );
    let script = write_script(dir.path(), "job.sh", "exit 0\n");

    let clock = Arc::new(ManualClock::new());
    let supervisor =
        WorkerSupervisor::with_clock(sh_config(bootstrap), Arc::clone(&clock) as Arc<dyn Clock>);

    let id = supervisor.create(&script, &[]).unwrap();

    // Fresh spawn, no time elapsed on the pinned clock.
    assert_eq!(supervisor.status(id), Some(WorkerStatus::Starting));
    assert!(supervisor.is_alive(id));

    // The three lines land in the log queue.
    assert!(
        wait_until(Duration::from_secs(10), || supervisor.logs(id).len() >= 3),
        "worker output never arrived"
    );
    let records = supervisor.logs(id);

    let bootstrap_record = &records[0];
    assert_eq!(bootstrap_record.level, LogLevel::Info);
    assert!(bootstrap_record.message.starts_with("Bootstrap status:"));
    assert_eq!(
        bootstrap_record.metadata.get("bootstrap_status").unwrap(),
        r#"{"status":"initialized","pid":12345}"#
    );

    let structured = &records[1];
    assert_eq!(structured.level, LogLevel::Warn);
    assert_eq!(structured.message, "low disk");
    assert_eq!(structured.metadata.get("logger").unwrap(), "TestLogger");

    let plain = &records[2];
    assert_eq!(plain.level, LogLevel::Info);
    assert_eq!(plain.message, "plain output");

    // Past the startup window: RUNNING.
    clock.advance(Duration::from_secs(6));
    assert_eq!(supervisor.status(id), Some(WorkerStatus::Running));

    // Heartbeats go stale while the process stays alive: UNRESPONSIVE.
    clock.advance(Duration::from_secs(70));
    assert_eq!(supervisor.status(id), Some(WorkerStatus::Unresponsive));

    // A heartbeat revives it.
    supervisor.update_heartbeat(id);
    assert_eq!(supervisor.status(id), Some(WorkerStatus::Running));

    // Metrics snapshot holds its invariants.
    let metrics = supervisor.metrics(id).unwrap();
    assert!(metrics.peak_memory_bytes >= metrics.current_memory_bytes);
    assert_eq!(metrics.execution_time, Duration::from_secs(76));

    supervisor.terminate(id, Duration::from_secs(2)).unwrap();
    assert_eq!(supervisor.status(id), Some(WorkerStatus::Terminated));
    assert!(!supervisor.is_alive(id));
    assert!(supervisor.metrics(id).is_none(), "sampler entry must be gone");
    assert!(supervisor.channel_stats(id).is_none(), "channel must be gone");

    // Terminal status is absorbing.
    clock.advance(Duration::from_secs(120));
    assert_eq!(supervisor.status(id), Some(WorkerStatus::Terminated));

    supervisor.shutdown();
}

#[test]
fn test_completion_and_failure_are_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let ok_bootstrap = write_script(dir.path(), "ok.sh", "exit 0\n");
    let bad_bootstrap = write_script(dir.path(), "bad.sh", "exit 7\n");
    let script = write_script(dir.path(), "job.sh", "exit 0\n");

    let clock = Arc::new(ManualClock::new());

    let supervisor = WorkerSupervisor::with_clock(
        sh_config(ok_bootstrap),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    let id = supervisor.create(&script, &[]).unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            supervisor.status(id) == Some(WorkerStatus::Completed)
        }),
        "worker never completed"
    );
    // Absorbing: stale heartbeats cannot un-complete it.
    clock.advance(Duration::from_secs(600));
    assert_eq!(supervisor.status(id), Some(WorkerStatus::Completed));
    supervisor.shutdown();

    let supervisor = WorkerSupervisor::with_clock(
        sh_config(bad_bootstrap),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    let id = supervisor.create(&script, &[]).unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            supervisor.status(id) == Some(WorkerStatus::Failed)
        }),
        "worker never failed"
    );
    supervisor.shutdown();
}

#[test]
fn test_terminate_escalates_to_kill() {
    let dir = tempfile::tempdir().unwrap();
    let bootstrap = write_script(
        dir.path(),
        "stubborn.sh",
        "trap \"\" TERM\nsleep 30\n",
    );
    let script = write_script(dir.path(), "job.sh", "exit 0\n");

    let supervisor = WorkerSupervisor::new(sh_config(bootstrap));
    let id = supervisor.create(&script, &[]).unwrap();
    assert!(supervisor.is_alive(id));

    let started = Instant::now();
    supervisor.terminate(id, Duration::from_millis(500)).unwrap();
    let elapsed = started.elapsed();

    // Caller timeout plus the fixed force grace, with scheduling slack.
    assert!(
        elapsed < Duration::from_millis(500) + Duration::from_secs(5) + Duration::from_secs(2),
        "terminate took {:?}",
        elapsed
    );
    assert!(!supervisor.is_alive(id));
    assert_eq!(supervisor.status(id), Some(WorkerStatus::Terminated));

    supervisor.shutdown();
}

#[test]
fn test_cleanup_finished_removes_dead_workers() {
    let dir = tempfile::tempdir().unwrap();
    let bootstrap = write_script(dir.path(), "quick.sh", "exit 0\n");
    let script = write_script(dir.path(), "job.sh", "exit 0\n");

    let supervisor = WorkerSupervisor::new(sh_config(bootstrap));
    let id = supervisor.create(&script, &[]).unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            supervisor.status(id) == Some(WorkerStatus::Completed)
        }),
        "worker never completed"
    );

    let removed = supervisor.cleanup_finished();
    assert_eq!(removed, vec![id]);
    assert_eq!(supervisor.worker_count(), 0);
    assert!(supervisor.status(id).is_none());
    assert!(supervisor.metrics(id).is_none());

    // Nothing left to clean.
    assert!(supervisor.cleanup_finished().is_empty());

    supervisor.shutdown();
}

#[test]
fn test_shutdown_terminates_everything_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let bootstrap = write_script(dir.path(), "long.sh", "sleep 30\n");
    let script = write_script(dir.path(), "job.sh", "exit 0\n");

    let supervisor = WorkerSupervisor::new(sh_config(bootstrap));
    let first = supervisor.create(&script, &[]).unwrap();
    let second = supervisor.create(&script, &[]).unwrap();
    assert_eq!(supervisor.worker_count(), 2);

    supervisor.shutdown();

    assert_eq!(supervisor.worker_count(), 0);
    assert!(!supervisor.is_alive(first));
    assert!(!supervisor.is_alive(second));

    // Repeated shutdown is a no-op.
    supervisor.shutdown();
}

#[test]
fn test_worker_argv_contract() {
    let dir = tempfile::tempdir().unwrap();
    // $1 is `--script`, $2 is the target path; record the full argv next
    // to the target so the test can inspect it.
    let bootstrap = write_script(
        dir.path(),
        "record-argv.sh",
        "printf '%s\\n' \"$@\" > \"$2.argv\"\nexit 0\n",
    );
    let script = write_script(dir.path(), "job.sh", "exit 0\n");

    let supervisor = WorkerSupervisor::new(sh_config(bootstrap));
    let id = supervisor
        .create(&script, &["alpha".to_string(), "with \"quote\"".to_string()])
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            supervisor
                .status(id)
                .map(|s| s.is_terminal())
                .unwrap_or(false)
        }),
        "argv recorder never finished"
    );

    let argv_path = format!("{}.argv", script.display());
    let recorded = std::fs::read_to_string(argv_path).unwrap();
    let argv: Vec<&str> = recorded.lines().collect();

    assert_eq!(argv[0], "--script");
    assert_eq!(argv[1], script.display().to_string());
    assert_eq!(argv[2], "--args");
    assert_eq!(argv[3], r#"["alpha","with \"quote\""]"#);
    assert_eq!(argv[4], "--memory-limit-mb");
    assert_eq!(argv[5], "512");
    assert_eq!(argv[6], "--cpu-limit-percent");
    assert_eq!(argv[7], "80.0");
    assert_eq!(argv[8], "--log-level");
    assert_eq!(argv[9], "INFO");
    assert_eq!(argv[10], "--communication-port");
    let port: u16 = argv[11].parse().unwrap();
    assert!(port > 0);

    supervisor.shutdown();
}

#[test]
fn test_set_log_level_filters_worker_output() {
    let dir = tempfile::tempdir().unwrap();
    let bootstrap = write_script(
        dir.path(),
        "leveled.sh",
        "sleep 1\n\
         echo '2024-01-01 12:00:00,000 - app - DEBUG - quiet'\n\
         echo '2024-01-01 12:00:00,001 - app - ERROR - loud'\n\
         exit 0\n",
    );
    let script = write_script(dir.path(), "job.sh", "exit 0\n");

    let supervisor = WorkerSupervisor::new(sh_config(bootstrap));
    let id = supervisor.create(&script, &[]).unwrap();
    // Raise the bar before the worker emits (it sleeps first).
    supervisor.set_log_level(id, LogLevel::Warn);

    assert!(
        wait_until(Duration::from_secs(10), || !supervisor.logs(id).is_empty()),
        "no output arrived"
    );
    std::thread::sleep(Duration::from_millis(200));

    let messages: Vec<String> = supervisor
        .logs(id)
        .into_iter()
        .map(|r| r.message)
        .collect();
    assert_eq!(messages, vec!["loud".to_string()]);

    supervisor.shutdown();
}
