//! Injectable time source.
//!
//! Worker status is derived on demand from elapsed time, so the supervisor
//! reads the clock through this trait and tests can pin it.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic instant for elapsed-time math.
    fn now(&self) -> Instant;
    /// Wall-clock time for timestamps exposed to callers.
    fn wall(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap()
    }

    fn wall(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock().unwrap();
        self.wall_origin + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::MAX)
    }
}

/// Shared last-heartbeat cell.
///
/// One cell per worker, shared between the supervisor record, the broker's
/// reader task and the metrics sampler. Stores both the monotonic instant
/// (for staleness math) and the wall-clock time (for snapshots).
#[derive(Debug)]
pub struct HeartbeatCell {
    last: Mutex<(Instant, DateTime<Utc>)>,
}

impl HeartbeatCell {
    pub fn new(clock: &dyn Clock) -> Self {
        Self {
            last: Mutex::new((clock.now(), clock.wall())),
        }
    }

    /// Record a heartbeat at the clock's current time.
    pub fn touch(&self, clock: &dyn Clock) {
        *self.last.lock().unwrap() = (clock.now(), clock.wall());
    }

    /// Time elapsed since the last heartbeat, as seen at `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last.lock().unwrap().0)
    }

    /// Wall-clock time of the last heartbeat.
    pub fn at(&self) -> DateTime<Utc> {
        self.last.lock().unwrap().1
    }
}
