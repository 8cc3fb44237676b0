//! Worker supervisor: the operations callers invoke.
//!
//! `create` validates the interpreter, bootstrap and target script, binds
//! the side-band listener, spawns the worker with captured stdio, and
//! wires up log pumps, metrics sampling and the message broker. Status is
//! derived on demand from process liveness, exit code and heartbeat age;
//! no background driver advances the state machine.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use outrider_protocol::{LogLevel, WorkerId, WorkerStatus};

use crate::broker::{BrokerStats, MessageBroker};
use crate::clock::{Clock, HeartbeatCell, SystemClock};
use crate::config::SupervisorConfig;
use crate::counters::COUNTERS;
use crate::error::{CommunicationError, CreationError, TerminationError};
use crate::logs::{LogManager, LogRecord, LogSink, LogStream, TracingSink};
use crate::registry::{WorkerRecord, WorkerRegistry};
use crate::sampler::{MetricsSampler, MetricsSnapshot, SystemStats};
use crate::scheduler::Scheduler;

/// Poll interval while waiting for a signalled process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    registry: WorkerRegistry,
    scheduler: Scheduler,
    sampler: Arc<MetricsSampler>,
    broker: MessageBroker,
    logs: LogManager,
    shut_down: AtomicBool,
    /// Serializes status derivation per call so concurrent observers do
    /// not interleave the read-liveness / store-status steps.
    status_gate: Mutex<()>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_clock_and_sink(config, Arc::new(SystemClock), Arc::new(TracingSink))
    }

    pub fn with_clock(config: SupervisorConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock_and_sink(config, clock, Arc::new(TracingSink))
    }

    pub fn with_clock_and_sink(
        config: SupervisorConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let scheduler = Scheduler::new("outrider");
        let sampler = MetricsSampler::new(Arc::clone(&clock));
        sampler.start(&scheduler, config.sample_initial_delay, config.sample_period);

        let broker = MessageBroker::new(Arc::clone(&clock), &config);
        let logs = LogManager::new(sink, config.log_queue_capacity, config.worker_log_level);

        Self {
            config,
            clock,
            registry: WorkerRegistry::new(),
            scheduler,
            sampler,
            broker,
            logs,
            shut_down: AtomicBool::new(false),
            status_gate: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Spawn
    // ------------------------------------------------------------------

    /// Launch a worker running `script` and wire up its observation
    /// pipeline. On any validation or spawn failure, nothing of the
    /// worker remains behind.
    pub fn create(&self, script: &Path, args: &[String]) -> Result<WorkerId, CreationError> {
        let interpreter = self.resolve_interpreter()?;
        self.probe_interpreter(&interpreter)?;

        if !is_readable_file(&self.config.bootstrap) {
            return Err(CreationError::BootstrapUnreadable(
                self.config.bootstrap.clone(),
            ));
        }
        if !is_readable_file(script) {
            return Err(CreationError::ScriptUnreadable(script.to_path_buf()));
        }

        let listener = self.broker.bind_channel().map_err(CreationError::Listener)?;
        let port = listener.port();

        let mut command = Command::new(&interpreter);
        command.arg(&self.config.bootstrap);
        command.arg("--script").arg(script);
        if !args.is_empty() {
            command.arg("--args").arg(encode_args_json(args));
        }
        command
            .arg("--memory-limit-mb")
            .arg(self.config.memory_limit_mb.to_string())
            .arg("--cpu-limit-percent")
            .arg(format!("{:?}", self.config.cpu_limit_percent))
            .arg("--log-level")
            .arg(self.config.worker_log_level.as_str())
            .arg("--communication-port")
            .arg(port.to_string());
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(CreationError::Spawn)?;
        let id = WorkerId::new(child.id());

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CreationError::Spawn(io::Error::new(
                    io::ErrorKind::Other,
                    "worker stdio was not captured",
                )));
            }
        };

        let heartbeat = Arc::new(HeartbeatCell::new(self.clock.as_ref()));
        let active = Arc::new(AtomicBool::new(true));

        let record = Arc::new(WorkerRecord {
            id,
            process: Mutex::new(child),
            status: Mutex::new(WorkerStatus::Starting),
            exit_status: Mutex::new(None),
            spawned_at: self.clock.now(),
            heartbeat: Arc::clone(&heartbeat),
            active: Arc::clone(&active),
            channel_port: port,
        });

        self.sampler.start_monitoring(id, Arc::clone(&heartbeat));
        self.logs
            .start_log_collection(id, Arc::clone(&active), stdout, stderr);
        self.broker.establish_channel(id, listener, active, heartbeat);
        self.registry.insert(Arc::clone(&record));
        COUNTERS.inc_workers_spawned();

        // The process may already have exited; fold that in immediately
        // so a stillborn worker is never reported as STARTING.
        let status = self.derive_status(&record);
        info!(%id, %status, port, "worker spawned: {}", script.display());

        Ok(id)
    }

    fn resolve_interpreter(&self) -> Result<PathBuf, CreationError> {
        let configured = &self.config.interpreter;
        if configured.components().count() > 1 || configured.is_absolute() {
            if configured.is_file() {
                return Ok(configured.clone());
            }
            return Err(CreationError::InterpreterNotFound(
                configured.display().to_string(),
            ));
        }
        which::which(configured)
            .map_err(|_| CreationError::InterpreterNotFound(configured.display().to_string()))
    }

    /// Quick liveness probe of the interpreter; fails fast on nonzero
    /// exit. Configuring an empty probe argv skips the probe.
    fn probe_interpreter(&self, interpreter: &Path) -> Result<(), CreationError> {
        if self.config.probe_args.is_empty() {
            return Ok(());
        }
        let command = format!(
            "{} {}",
            interpreter.display(),
            self.config.probe_args.join(" ")
        );
        let output = Command::new(interpreter)
            .args(&self.config.probe_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| CreationError::VersionProbeFailed {
                command: command.clone(),
                detail: e.to_string(),
            })?;
        if !output.success() {
            return Err(CreationError::VersionProbeFailed {
                command,
                detail: format!("exited with {}", output),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Current lifecycle status, derived on demand. `None` for unknown
    /// workers.
    pub fn status(&self, id: WorkerId) -> Option<WorkerStatus> {
        let record = self.registry.get(id)?;
        Some(self.derive_status(&record))
    }

    fn derive_status(&self, record: &WorkerRecord) -> WorkerStatus {
        let _gate = self.status_gate.lock().unwrap();

        let mut status = record.status.lock().unwrap();
        if status.is_terminal() {
            return *status;
        }

        let next = match record.process.lock().unwrap().try_wait() {
            Ok(Some(exit)) => {
                *record.exit_status.lock().unwrap() = Some(exit);
                if exit.success() {
                    WorkerStatus::Completed
                } else {
                    WorkerStatus::Failed
                }
            }
            Ok(None) => {
                let now = self.clock.now();
                if record.heartbeat.age(now) > self.config.heartbeat_stale_after {
                    WorkerStatus::Unresponsive
                } else if *status == WorkerStatus::Unresponsive {
                    // A fresh heartbeat revives an unresponsive worker.
                    WorkerStatus::Running
                } else if now.saturating_duration_since(record.spawned_at)
                    >= self.config.running_threshold
                {
                    WorkerStatus::Running
                } else {
                    *status
                }
            }
            // Alive-or-not cannot be read right now.
            Err(_) => WorkerStatus::Unresponsive,
        };

        *status = next;
        next
    }

    pub fn is_alive(&self, id: WorkerId) -> bool {
        let Some(record) = self.registry.get(id) else {
            return false;
        };
        let result = record.process.lock().unwrap().try_wait();
        match result {
            Ok(Some(exit)) => {
                *record.exit_status.lock().unwrap() = Some(exit);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Fresh metrics snapshot. `None` once monitoring has stopped.
    pub fn metrics(&self, id: WorkerId) -> Option<MetricsSnapshot> {
        self.sampler.metrics(id)
    }

    /// Record a heartbeat observed out of band.
    pub fn update_heartbeat(&self, id: WorkerId) {
        if let Some(record) = self.registry.get(id) {
            record.heartbeat.touch(self.clock.as_ref());
        }
    }

    /// Best-effort system-wide resource read-outs.
    pub fn system_stats(&self) -> SystemStats {
        self.sampler.system_stats()
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Queue a payload for delivery to the worker. Returns the assigned
    /// message id.
    pub fn send(&self, id: WorkerId, payload: Value) -> Result<String, CommunicationError> {
        if !self.registry.contains(id) {
            return Err(CommunicationError::UnknownWorker(id));
        }
        self.broker.send_message(id, payload)
    }

    /// Wait for the next message from the worker and coerce its payload
    /// to the requested shape.
    pub fn receive<T: DeserializeOwned>(&self, id: WorkerId) -> Result<T, CommunicationError> {
        self.receive_with_timeout(id, None)
    }

    pub fn receive_with_timeout<T: DeserializeOwned>(
        &self,
        id: WorkerId,
        timeout: Option<Duration>,
    ) -> Result<T, CommunicationError> {
        if !self.registry.contains(id) {
            return Err(CommunicationError::UnknownWorker(id));
        }
        let message = self.broker.receive_message(id, timeout)?;
        Ok(serde_json::from_value(message.payload)?)
    }

    /// Broker-side queue and heartbeat snapshot for a worker.
    pub fn channel_stats(&self, id: WorkerId) -> Option<BrokerStats> {
        self.broker.get_stats(id)
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    /// Copy of the currently queued log records, oldest first.
    pub fn logs(&self, id: WorkerId) -> Vec<LogRecord> {
        self.logs.logs(id)
    }

    /// Consuming stream over a worker's log records.
    pub fn log_stream(&self, id: WorkerId) -> Option<LogStream> {
        self.logs.log_stream(id)
    }

    pub fn set_log_level(&self, id: WorkerId, level: LogLevel) {
        self.logs.set_log_level(id, level);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Terminate a worker: graceful signal, wait up to `timeout`,
    /// escalate to a forceful kill, wait the fixed grace period. Unknown
    /// workers are a no-op. On success the sampler entry is gone, the
    /// channel is closed and the status is `TERMINATED`.
    pub fn terminate(&self, id: WorkerId, timeout: Duration) -> Result<(), TerminationError> {
        let Some(record) = self.registry.get(id) else {
            return Ok(());
        };

        // A worker that already finished keeps its natural terminal
        // status; only the resources are reclaimed.
        let prior = self.derive_status(&record);

        if !prior.is_terminal() && self.is_alive(id) {
            self.signal_graceful(&record)?;
            if !wait_for_exit(&record, timeout) {
                warn!(%id, "graceful termination timed out, killing");
                record
                    .process
                    .lock()
                    .unwrap()
                    .kill()
                    .map_err(|e| TerminationError::Signal {
                        id,
                        detail: e.to_string(),
                    })?;
                if !wait_for_exit(&record, self.config.force_kill_grace) {
                    return Err(TerminationError::StillAlive { id });
                }
            }
        }

        record.active.store(false, Ordering::SeqCst);
        self.sampler.stop_monitoring(id);
        self.logs.stop(id);
        self.broker.close_channel(id);

        if !prior.is_terminal() {
            *record.status.lock().unwrap() = WorkerStatus::Terminated;
        }
        COUNTERS.inc_workers_terminated();
        info!(%id, "worker terminated");
        Ok(())
    }

    #[cfg(unix)]
    fn signal_graceful(&self, record: &WorkerRecord) -> Result<(), TerminationError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(record.id.pid() as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(TerminationError::Signal {
                id: record.id,
                detail: e.to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    fn signal_graceful(&self, record: &WorkerRecord) -> Result<(), TerminationError> {
        // No SIGTERM equivalent; go straight to kill.
        record
            .process
            .lock()
            .unwrap()
            .kill()
            .map_err(|e| TerminationError::Signal {
                id: record.id,
                detail: e.to_string(),
            })
    }

    /// Drop records of workers that are dead and in a terminal status,
    /// releasing their sampler entries and channels. Returns the removed
    /// handles.
    pub fn cleanup_finished(&self) -> Vec<WorkerId> {
        let mut removed = Vec::new();
        for id in self.registry.ids() {
            let Some(record) = self.registry.get(id) else {
                continue;
            };
            let status = self.derive_status(&record);
            if status.is_terminal() && !self.is_alive(id) {
                record.active.store(false, Ordering::SeqCst);
                self.sampler.stop_monitoring(id);
                self.logs.stop(id);
                self.broker.close_channel(id);
                self.registry.remove(id);
                debug!(%id, %status, "cleaned up finished worker");
                removed.push(id);
            }
        }
        removed
    }

    /// Terminate every live worker, then stop all subsystems. Repeated
    /// calls are no-ops.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("supervisor shutting down");

        for id in self.registry.ids() {
            if let Err(e) = self.terminate(id, Duration::from_secs(5)) {
                warn!(%id, "failed to terminate worker during shutdown: {}", e);
            }
            self.registry.remove(id);
        }

        self.broker.shutdown();
        self.sampler.shutdown();
        self.logs.shutdown();
        self.scheduler.shutdown();
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.registry.ids()
    }

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        // Hosts are expected to call shutdown explicitly; this is the
        // last line of defense against leaked worker processes.
        self.shutdown();
    }
}

/// Poll for process exit until the deadline. Records the exit status on
/// success.
fn wait_for_exit(record: &WorkerRecord, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(Some(exit)) = record.process.lock().unwrap().try_wait() {
            *record.exit_status.lock().unwrap() = Some(exit);
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn is_readable_file(path: &Path) -> bool {
    path.is_file() && std::fs::File::open(path).is_ok()
}

/// Encode worker arguments as a JSON array with explicit escaping of
/// backslash, double quote, newline, carriage return and tab.
fn encode_args_json(args: &[String]) -> String {
    let mut out = String::from("[");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('"');
        out.push_str(&escape_json_string(arg));
        out.push('"');
    }
    out.push(']');
    out
}

fn escape_json_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_json_string() {
        assert_eq!(escape_json_string(r#"a"b"#), r#"a\"b"#);
        assert_eq!(escape_json_string(r"back\slash"), r"back\\slash");
        assert_eq!(escape_json_string("line\nbreak"), r"line\nbreak");
        assert_eq!(escape_json_string("tab\there"), r"tab\there");
        assert_eq!(escape_json_string("cr\rhere"), r"cr\rhere");
        assert_eq!(escape_json_string("plain"), "plain");
    }

    #[test]
    fn test_encode_args_json() {
        assert_eq!(encode_args_json(&[]), "[]");
        assert_eq!(
            encode_args_json(&["one".to_string(), "t\"wo".to_string()]),
            r#"["one","t\"wo"]"#
        );

        // The encoded form must parse back to the original values.
        let args = vec!["plain".to_string(), "with \"quotes\"\n\t".to_string()];
        let parsed: Vec<String> = serde_json::from_str(&encode_args_json(&args)).unwrap();
        assert_eq!(parsed, args);
    }

    #[test]
    fn test_unknown_worker_operations() {
        let supervisor = WorkerSupervisor::new(SupervisorConfig::default());
        let ghost = WorkerId::new(999_999);

        assert!(supervisor.status(ghost).is_none());
        assert!(!supervisor.is_alive(ghost));
        assert!(supervisor.metrics(ghost).is_none());
        assert!(supervisor.logs(ghost).is_empty());
        assert!(supervisor.channel_stats(ghost).is_none());
        assert!(matches!(
            supervisor.send(ghost, serde_json::json!("hi")),
            Err(CommunicationError::UnknownWorker(_))
        ));
        // Terminating an unknown worker is a no-op.
        assert!(supervisor.terminate(ghost, Duration::from_millis(10)).is_ok());

        supervisor.shutdown();
    }

    #[test]
    fn test_create_rejects_missing_interpreter() {
        let config = SupervisorConfig {
            interpreter: PathBuf::from("/nonexistent/interpreter-xyz"),
            ..Default::default()
        };
        let supervisor = WorkerSupervisor::new(config);
        let err = supervisor
            .create(Path::new("script.py"), &[])
            .unwrap_err();
        assert!(matches!(err, CreationError::InterpreterNotFound(_)));
        supervisor.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_create_rejects_missing_bootstrap_and_script() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "exit 0\n").unwrap();

        let config = SupervisorConfig {
            interpreter: PathBuf::from("/bin/sh"),
            bootstrap: dir.path().join("missing-bootstrap.sh"),
            probe_args: vec!["-c".to_string(), "true".to_string()],
            ..Default::default()
        };
        let supervisor = WorkerSupervisor::new(config);

        let err = supervisor.create(&script, &[]).unwrap_err();
        assert!(matches!(err, CreationError::BootstrapUnreadable(_)));

        supervisor.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_probe_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bootstrap = dir.path().join("bootstrap.sh");
        std::fs::write(&bootstrap, "exit 0\n").unwrap();
        let script = dir.path().join("job.sh");
        std::fs::write(&script, "exit 0\n").unwrap();

        let config = SupervisorConfig {
            interpreter: PathBuf::from("/bin/sh"),
            bootstrap,
            probe_args: vec!["-c".to_string(), "exit 3".to_string()],
            ..Default::default()
        };
        let supervisor = WorkerSupervisor::new(config);

        let err = supervisor.create(&script, &[]).unwrap_err();
        assert!(matches!(err, CreationError::VersionProbeFailed { .. }));
        assert_eq!(supervisor.worker_count(), 0);

        supervisor.shutdown();
    }
}
