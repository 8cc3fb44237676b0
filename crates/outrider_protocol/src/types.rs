//! Canonical identifiers and enums shared across the supervisor crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque handle for one supervised worker.
///
/// Stable for the life of the supervisor record and used as the registry
/// key. Exposes the OS process id it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    /// OS process id of the worker.
    pub const fn pid(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

/// Worker lifecycle status.
/// This is the CANONICAL definition - use this everywhere.
///
/// `Completed`, `Failed` and `Terminated` are terminal: once observed they
/// never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Spawned, still inside the startup window
    Starting,
    /// Alive and past the startup window
    Running,
    /// Exited with code 0
    Completed,
    /// Exited with a nonzero code
    Failed,
    /// Killed by an explicit terminate request
    Terminated,
    /// Alive but heartbeats have gone stale, or liveness cannot be read
    Unresponsive,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "STARTING",
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::Completed => "COMPLETED",
            WorkerStatus::Failed => "FAILED",
            WorkerStatus::Terminated => "TERMINATED",
            WorkerStatus::Unresponsive => "UNRESPONSIVE",
        }
    }

    /// True for statuses that can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Completed | WorkerStatus::Failed | WorkerStatus::Terminated
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "STARTING" => Ok(WorkerStatus::Starting),
            "RUNNING" => Ok(WorkerStatus::Running),
            "COMPLETED" => Ok(WorkerStatus::Completed),
            "FAILED" => Ok(WorkerStatus::Failed),
            "TERMINATED" => Ok(WorkerStatus::Terminated),
            "UNRESPONSIVE" => Ok(WorkerStatus::Unresponsive),
            _ => Err(format!("Invalid worker status: '{}'", s)),
        }
    }
}

/// Severity of one worker log record.
///
/// Ordered: `Trace < Debug < Info < Warn < Error`, so level filters are a
/// plain comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Map a level token from worker output.
    ///
    /// `WARNING` and `CRITICAL` are folded into `Warn` and `Error`;
    /// anything unrecognized becomes `Info`.
    pub fn from_worker_token(token: &str) -> Self {
        Self::from_str(token).unwrap_or(LogLevel::Info)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "CRITICAL" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: '{}'", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_exposes_pid() {
        let id = WorkerId::new(4242);
        assert_eq!(id.pid(), 4242);
        assert_eq!(id.to_string(), "4242");
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            WorkerStatus::Starting,
            WorkerStatus::Running,
            WorkerStatus::Completed,
            WorkerStatus::Failed,
            WorkerStatus::Terminated,
            WorkerStatus::Unresponsive,
        ] {
            assert_eq!(status.as_str().parse::<WorkerStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkerStatus::Completed.is_terminal());
        assert!(WorkerStatus::Failed.is_terminal());
        assert!(WorkerStatus::Terminated.is_terminal());
        assert!(!WorkerStatus::Starting.is_terminal());
        assert!(!WorkerStatus::Running.is_terminal());
        assert!(!WorkerStatus::Unresponsive.is_terminal());
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_level_worker_token_mapping() {
        assert_eq!(LogLevel::from_worker_token("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from_worker_token("CRITICAL"), LogLevel::Error);
        assert_eq!(LogLevel::from_worker_token("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::from_worker_token("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from_worker_token("NOTICE"), LogLevel::Info);
        assert_eq!(LogLevel::from_worker_token(""), LogLevel::Info);
    }
}
