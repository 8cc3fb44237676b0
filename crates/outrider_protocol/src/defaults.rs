//! Canonical default values shared across the supervisor crates.

/// Socket accept timeout while waiting for a worker to connect.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
/// Caller-facing receive timeout on the inbound queue.
pub const DEFAULT_RECEIVE_TIMEOUT_SECS: u64 = 30;
/// Interval between outbound heartbeat messages.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
/// A worker whose last heartbeat is older than this is unresponsive.
pub const DEFAULT_HEARTBEAT_STALE_SECS: u64 = 60;
/// A worker alive this long after spawn has left the startup window.
pub const DEFAULT_RUNNING_THRESHOLD_SECS: u64 = 5;
/// Wait after a forceful kill before giving up on the process.
pub const DEFAULT_FORCE_KILL_GRACE_SECS: u64 = 5;

/// Metrics sampling period.
pub const DEFAULT_SAMPLE_PERIOD_SECS: u64 = 5;
/// Delay before the first metrics sample.
pub const DEFAULT_SAMPLE_INITIAL_DELAY_SECS: u64 = 1;

/// Per-worker capacity of the log, outbound and inbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// First retry delay for failed outbound writes.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
/// Backoff multiplier applied between write attempts.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
/// Total write attempts before an outbound message is dropped.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Worker resource limits passed on the bootstrap command line.
pub const DEFAULT_MEMORY_LIMIT_MB: u32 = 512;
pub const DEFAULT_CPU_LIMIT_PERCENT: f64 = 80.0;
