//! Process-wide worker registry.
//!
//! Maps worker handles to supervisor records. The registry is the sole
//! strong owner of records; background tasks observe workers only through
//! the shared active flag, queues and heartbeat cell, so a deregistered
//! record cannot be reanimated.

use std::collections::HashMap;
use std::process::{Child, ExitStatus};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use outrider_protocol::{WorkerId, WorkerStatus};

use crate::clock::HeartbeatCell;

/// Per-worker state bundle. Owns the OS process; everything shared with
/// background tasks is individually reference-counted.
pub struct WorkerRecord {
    pub id: WorkerId,
    pub process: Mutex<Child>,
    pub status: Mutex<WorkerStatus>,
    pub exit_status: Mutex<Option<ExitStatus>>,
    pub spawned_at: Instant,
    pub heartbeat: Arc<HeartbeatCell>,
    /// Cancellation signal for this worker's background tasks.
    /// Cleared exactly once, on terminate or shutdown.
    pub active: Arc<AtomicBool>,
    /// Loopback port the worker was told to connect back to.
    pub channel_port: u16,
}

#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<WorkerId, Arc<WorkerRecord>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: Arc<WorkerRecord>) {
        self.workers.lock().unwrap().insert(record.id, record);
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<WorkerRecord>> {
        self.workers.lock().unwrap().get(&id).cloned()
    }

    pub fn remove(&self, id: WorkerId) -> Option<Arc<WorkerRecord>> {
        self.workers.lock().unwrap().remove(&id)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.lock().unwrap().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.lock().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().unwrap().is_empty()
    }
}
