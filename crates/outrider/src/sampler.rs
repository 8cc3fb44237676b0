//! Periodic resource sampling for supervised workers.
//!
//! One shared timer task walks every registered worker at a fixed period
//! and refreshes CPU time, resident memory and peak memory. `metrics`
//! additionally takes a fresh sample on demand so callers never see a
//! stale snapshot. Sampling a dead process is a no-op and sampling
//! failures leave prior values intact.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

use outrider_protocol::WorkerId;

use crate::clock::{Clock, HeartbeatCell};
use crate::scheduler::{Scheduler, TaskHandle};

/// Point-in-time resource usage of one worker.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Cumulative CPU time in milliseconds.
    pub cpu_time_ms: u64,
    /// Current resident set size in bytes.
    pub current_memory_bytes: u64,
    /// Largest resident set observed since monitoring started.
    pub peak_memory_bytes: u64,
    /// Wall-clock time since spawn.
    pub execution_time: Duration,
    /// When the last heartbeat arrived from this worker.
    pub last_heartbeat: DateTime<Utc>,
}

/// Best-effort system-wide read-outs. Zeros and `-1.0` mean unavailable.
#[derive(Debug, Clone)]
pub struct SystemStats {
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub total_swap_bytes: u64,
    pub free_swap_bytes: u64,
    pub cpu_load_percent: f64,
}

struct WorkerSample {
    started_at: Instant,
    heartbeat: Arc<HeartbeatCell>,
    cpu_time_ms: u64,
    current_memory_bytes: u64,
    peak_memory_bytes: u64,
    last_sample_at: Instant,
}

pub struct MetricsSampler {
    workers: Mutex<HashMap<WorkerId, WorkerSample>>,
    system: Mutex<System>,
    clock: Arc<dyn Clock>,
    task: Mutex<Option<TaskHandle>>,
}

impl MetricsSampler {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
            clock,
            task: Mutex::new(None),
        })
    }

    /// Begin periodic sampling on the shared scheduler.
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler, initial_delay: Duration, period: Duration) {
        let sampler = Arc::clone(self);
        let handle = scheduler.schedule_at_fixed_rate(initial_delay, period, move || {
            sampler.sample_all();
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Track a worker. The heartbeat cell is shared with the broker so
    /// heartbeats observed on the wire show up here without a second hop.
    pub fn start_monitoring(&self, id: WorkerId, heartbeat: Arc<HeartbeatCell>) {
        let now = self.clock.now();
        self.workers.lock().unwrap().insert(
            id,
            WorkerSample {
                started_at: now,
                heartbeat,
                cpu_time_ms: 0,
                current_memory_bytes: 0,
                peak_memory_bytes: 0,
                last_sample_at: now,
            },
        );
    }

    /// Stop tracking a worker and discard its state.
    pub fn stop_monitoring(&self, id: WorkerId) {
        self.workers.lock().unwrap().remove(&id);
    }

    pub fn is_monitoring(&self, id: WorkerId) -> bool {
        self.workers.lock().unwrap().contains_key(&id)
    }

    /// Record a heartbeat for a worker, now.
    pub fn update_heartbeat(&self, id: WorkerId) {
        if let Some(sample) = self.workers.lock().unwrap().get(&id) {
            sample.heartbeat.touch(self.clock.as_ref());
        }
    }

    /// Take a fresh sample and return the snapshot. `None` for workers
    /// that are not (or no longer) monitored.
    pub fn metrics(&self, id: WorkerId) -> Option<MetricsSnapshot> {
        let mut workers = self.workers.lock().unwrap();
        let sample = workers.get_mut(&id)?;
        Self::sample_one(&self.system, self.clock.as_ref(), id, sample);

        Some(MetricsSnapshot {
            cpu_time_ms: sample.cpu_time_ms,
            current_memory_bytes: sample.current_memory_bytes,
            peak_memory_bytes: sample.peak_memory_bytes,
            execution_time: self.clock.now().saturating_duration_since(sample.started_at),
            last_heartbeat: sample.heartbeat.at(),
        })
    }

    /// One periodic sweep over every tracked worker.
    pub fn sample_all(&self) {
        let ids: Vec<WorkerId> = self.workers.lock().unwrap().keys().copied().collect();
        for id in ids {
            let mut workers = self.workers.lock().unwrap();
            if let Some(sample) = workers.get_mut(&id) {
                Self::sample_one(&self.system, self.clock.as_ref(), id, sample);
            }
        }
    }

    fn sample_one(
        system: &Mutex<System>,
        clock: &dyn Clock,
        id: WorkerId,
        sample: &mut WorkerSample,
    ) {
        let pid = Pid::from_u32(id.pid());
        let mut sys = system.lock().unwrap();
        let refreshed = sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if refreshed == 0 {
            // Dead or unreadable process: keep prior values.
            debug!(
                %id,
                "process not sampleable, last sample {:?} ago",
                clock.now().saturating_duration_since(sample.last_sample_at)
            );
            return;
        }

        if let Some(process) = sys.process(pid) {
            let cpu_ms = process.accumulated_cpu_time();
            // CPU time is cumulative; never step backwards.
            sample.cpu_time_ms = sample.cpu_time_ms.max(cpu_ms);
        }
        drop(sys);

        match sample_rss_bytes(id.pid()) {
            Some(bytes) => {
                sample.current_memory_bytes = bytes;
                sample.peak_memory_bytes = sample.peak_memory_bytes.max(bytes);
            }
            None => {
                debug!(%id, "resident memory sample unavailable, keeping prior value");
            }
        }
        sample.last_sample_at = clock.now();
    }

    /// System-wide read-outs, best effort.
    pub fn system_stats(&self) -> SystemStats {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return SystemStats {
                total_memory_bytes: 0,
                free_memory_bytes: 0,
                total_swap_bytes: 0,
                free_swap_bytes: 0,
                cpu_load_percent: -1.0,
            };
        }

        let mut sys = self.system.lock().unwrap();
        sys.refresh_memory();
        sys.refresh_cpu_usage();
        SystemStats {
            total_memory_bytes: sys.total_memory(),
            free_memory_bytes: sys.free_memory(),
            total_swap_bytes: sys.total_swap(),
            free_swap_bytes: sys.free_swap(),
            cpu_load_percent: sys.global_cpu_usage() as f64,
        }
    }

    /// Cancel the periodic task and forget every worker.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.cancel();
        }
        self.workers.lock().unwrap().clear();
    }
}

/// Resident set size of a process in bytes, via the platform helper.
///
/// POSIX: `ps -o rss= -p <pid>` prints KiB. Windows: `tasklist` CSV
/// output carries the working set as its fifth field, also KiB.
fn sample_rss_bytes(pid: u32) -> Option<u64> {
    #[cfg(unix)]
    {
        let output = Command::new("ps")
            .args(["-o", "rss=", "-p", &pid.to_string()])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let kib: u64 = text.trim().parse().ok()?;
        Some(kib * 1024)
    }

    #[cfg(windows)]
    {
        let output = Command::new("tasklist")
            .args(["/fi", &format!("PID eq {}", pid), "/fo", "csv"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().nth(1)?;
        let field = line.split("\",\"").nth(4)?;
        let digits: String = field.chars().filter(|c| c.is_ascii_digit()).collect();
        let kib: u64 = digits.parse().ok()?;
        Some(kib * 1024)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        None
    }
}
