//! Caller-facing error categories.
//!
//! Creation, Termination and Communication errors surface to callers.
//! Background-task failures are logged and folded into status transitions;
//! sampling errors in particular never leave the sampler.

use outrider_protocol::{ProtocolError, WorkerId};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures while validating inputs or spawning a worker process.
/// Fatal to the request; nothing is retried and no partial record remains.
#[derive(Debug, Error)]
pub enum CreationError {
    #[error("interpreter not found: {0}")]
    InterpreterNotFound(String),

    #[error("interpreter version probe failed ({command}): {detail}")]
    VersionProbeFailed { command: String, detail: String },

    #[error("bootstrap program missing or unreadable: {0}")]
    BootstrapUnreadable(PathBuf),

    #[error("worker script missing or unreadable: {0}")]
    ScriptUnreadable(PathBuf),

    #[error("failed to open side-band listener: {0}")]
    Listener(#[source] std::io::Error),

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failures while tearing a worker down.
#[derive(Debug, Error)]
pub enum TerminationError {
    #[error("failed to signal worker {id}: {detail}")]
    Signal { id: WorkerId, detail: String },

    #[error("worker {id} still alive after forceful termination")]
    StillAlive { id: WorkerId },

    #[error("wait for worker {id} was interrupted")]
    Interrupted { id: WorkerId },
}

/// Failures on the side-band message path.
#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("outbound queue full for worker {0}")]
    QueueFull(WorkerId),

    #[error("channel not open")]
    ChannelNotOpen,

    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out after {timeout:?} waiting for a message from worker {id}")]
    ReceiveTimeout { id: WorkerId, timeout: Duration },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("blocking call interrupted")]
    Interrupted,
}

/// Reserved for host sink failures. Parse failures never surface.
#[derive(Debug, Error)]
pub enum LogCollectionError {
    #[error("log sink rejected a record for worker {id}: {detail}")]
    Sink { id: WorkerId, detail: String },
}

/// Internal sampler failures. Logged, never surfaced to callers.
#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("failed to sample worker {id}: {detail}")]
    Sample { id: WorkerId, detail: String },
}
