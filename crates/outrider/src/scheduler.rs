//! Minimal scheduled executor: one timer thread and a min-heap of due
//! tasks. Fixed-rate periodic tasks re-arm themselves relative to their
//! previous due time; handles cancel individual tasks; `shutdown` stops
//! the timer thread and drops everything pending.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

type Job = Box<dyn FnMut() + Send>;

struct ScheduledTask {
    due: Instant,
    period: Option<Duration>,
    id: u64,
    job: Job,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.id.cmp(&other.id))
    }
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Reverse<ScheduledTask>>,
    cancelled: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

/// Handle for one scheduled task. Cancelling is idempotent; the task
/// never runs again after `cancel` returns (a run already in progress
/// finishes).
pub struct TaskHandle {
    id: u64,
    inner: Arc<SchedulerInner>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.cancelled.insert(self.id);
        drop(state);
        self.inner.wakeup.notify_all();
    }
}

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(name: &str) -> Self {
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(SchedulerState::default()),
            wakeup: Condvar::new(),
        });

        let timer_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || timer_loop(timer_inner))
            .expect("failed to spawn timer thread");

        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Run `job` after `initial_delay`, then every `period`.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) -> TaskHandle
    where
        F: FnMut() + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.heap.push(Reverse(ScheduledTask {
            due: Instant::now() + initial_delay,
            period: Some(period.max(Duration::from_millis(1))),
            id,
            job: Box::new(job),
        }));
        drop(state);
        self.inner.wakeup.notify_all();

        TaskHandle {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Stop the timer thread. Pending tasks are dropped; repeated calls
    /// are no-ops.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.inner.wakeup.notify_all();

        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        debug!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(inner: Arc<SchedulerInner>) {
    let mut state = inner.state.lock().unwrap();

    loop {
        if state.shutdown {
            return;
        }

        // Discard cancelled tasks sitting at the head.
        while let Some(Reverse(task)) = state.heap.peek() {
            if state.cancelled.contains(&task.id) {
                let id = task.id;
                state.heap.pop();
                state.cancelled.remove(&id);
            } else {
                break;
            }
        }

        let now = Instant::now();
        let next_due = match state.heap.peek() {
            Some(Reverse(task)) => task.due,
            None => {
                state = inner.wakeup.wait(state).unwrap();
                continue;
            }
        };

        if next_due > now {
            let (guard, _) = inner
                .wakeup
                .wait_timeout(state, next_due - now)
                .unwrap();
            state = guard;
            continue;
        }

        let Some(Reverse(mut task)) = state.heap.pop() else {
            continue;
        };

        // Run outside the lock so jobs can schedule or cancel.
        drop(state);
        (task.job)();
        state = inner.state.lock().unwrap();

        if state.shutdown {
            return;
        }
        if let Some(period) = task.period {
            if state.cancelled.remove(&task.id) {
                continue;
            }
            task.due += period;
            // If the job overran its period, skip ahead rather than
            // firing a burst of catch-up runs.
            let now = Instant::now();
            while task.due < now {
                task.due += period;
            }
            state.heap.push(Reverse(task));
        }
    }
}
