//! Supervisor configuration (plain data, no behavior).

use outrider_protocol::{defaults, LogLevel};
use std::path::PathBuf;
use std::time::Duration;

/// Retry policy for transient outbound write failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Backoff delay before retrying after the given failed attempt
    /// (1-based). Attempt 1 waits `base_delay`, attempt 2 waits
    /// `base_delay * multiplier`, and so on.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(defaults::DEFAULT_RETRY_BASE_DELAY_MS),
            multiplier: defaults::DEFAULT_RETRY_MULTIPLIER,
            max_attempts: defaults::DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

/// Everything the supervisor needs to launch and observe workers.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interpreter executable; bare names are resolved through PATH.
    pub interpreter: PathBuf,
    /// Bootstrap program handed to the interpreter as its first argument.
    pub bootstrap: PathBuf,
    /// Arguments for the quick interpreter probe run at spawn time.
    pub probe_args: Vec<String>,

    /// Resource limits forwarded to the bootstrap command line.
    pub memory_limit_mb: u32,
    pub cpu_limit_percent: f64,
    /// Log level forwarded to the bootstrap command line.
    pub worker_log_level: LogLevel,

    pub log_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub inbound_queue_capacity: usize,

    /// How long to wait for the worker to connect to the side-band port.
    pub connect_timeout: Duration,
    /// Default timeout for `receive`.
    pub receive_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// A worker whose last heartbeat is older than this is unresponsive.
    pub heartbeat_stale_after: Duration,
    /// A worker alive this long after spawn counts as running.
    pub running_threshold: Duration,
    /// Wait after SIGKILL before reporting a termination failure.
    pub force_kill_grace: Duration,

    pub sample_period: Duration,
    pub sample_initial_delay: Duration,

    pub retry: RetryPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            bootstrap: PathBuf::from("bootstrap.py"),
            probe_args: vec!["--version".to_string()],
            memory_limit_mb: defaults::DEFAULT_MEMORY_LIMIT_MB,
            cpu_limit_percent: defaults::DEFAULT_CPU_LIMIT_PERCENT,
            worker_log_level: LogLevel::Info,
            log_queue_capacity: defaults::DEFAULT_QUEUE_CAPACITY,
            outbound_queue_capacity: defaults::DEFAULT_QUEUE_CAPACITY,
            inbound_queue_capacity: defaults::DEFAULT_QUEUE_CAPACITY,
            connect_timeout: Duration::from_secs(defaults::DEFAULT_CONNECT_TIMEOUT_SECS),
            receive_timeout: Duration::from_secs(defaults::DEFAULT_RECEIVE_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            heartbeat_stale_after: Duration::from_secs(defaults::DEFAULT_HEARTBEAT_STALE_SECS),
            running_threshold: Duration::from_secs(defaults::DEFAULT_RUNNING_THRESHOLD_SECS),
            force_kill_grace: Duration::from_secs(defaults::DEFAULT_FORCE_KILL_GRACE_SECS),
            sample_period: Duration::from_secs(defaults::DEFAULT_SAMPLE_PERIOD_SECS),
            sample_initial_delay: Duration::from_secs(defaults::DEFAULT_SAMPLE_INITIAL_DELAY_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_progression() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_defaults_match_contract() {
        let config = SupervisorConfig::default();
        assert_eq!(config.memory_limit_mb, 512);
        assert_eq!(config.cpu_limit_percent, 80.0);
        assert_eq!(config.worker_log_level, LogLevel::Info);
        assert_eq!(config.log_queue_capacity, 1000);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.receive_timeout, Duration::from_secs(30));
        assert_eq!(config.heartbeat_stale_after, Duration::from_secs(60));
    }
}
