//! Outrider: a supervisor runtime for interpreter worker subprocesses.
//!
//! The supervisor launches workers, pumps their stdout/stderr into a
//! structured log pipeline, samples CPU and memory, and exchanges
//! length-framed JSON messages with them over a loopback channel. A
//! misbehaving worker cannot destabilize the host: every worker is
//! observable, interruptible and terminable on demand.
//!
//! The host owns one [`WorkerSupervisor`] and must call
//! [`WorkerSupervisor::shutdown`] before exiting.

pub mod broker;
pub mod channel;
pub mod clock;
pub mod config;
pub mod counters;
pub mod error;
pub mod logs;
pub mod queue;
pub mod registry;
pub mod sampler;
pub mod scheduler;
pub mod supervisor;

pub use broker::{BrokerStats, MessageBroker};
pub use channel::{ByteChannel, ChannelListener, LoopbackChannel};
#[cfg(unix)]
pub use channel::NamedPipeChannel;
pub use clock::{Clock, HeartbeatCell, ManualClock, SystemClock};
pub use config::{RetryPolicy, SupervisorConfig};
pub use counters::{Counters, CountersSnapshot, COUNTERS};
pub use error::{
    CommunicationError, CreationError, LogCollectionError, SamplingError, TerminationError,
};
pub use logs::{LogManager, LogRecord, LogSink, LogSource, LogStream, TracingSink};
pub use sampler::{MetricsSampler, MetricsSnapshot, SystemStats};
pub use supervisor::WorkerSupervisor;

pub use outrider_protocol::{LogLevel, Message, WorkerId, WorkerStatus};
