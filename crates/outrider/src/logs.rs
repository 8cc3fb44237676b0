//! Worker output collection.
//!
//! Two pump threads per worker read stdout and stderr line by line,
//! classify each line (bootstrap marker, structured log line, plain
//! text), filter by the worker's current level, queue the record
//! (drop-oldest on overflow) and forward a copy to the host sink.
//!
//! Pumps keep reading after the worker dies so trailing output is not
//! lost; they stop promptly when the worker record's active flag clears.
//! Parse failures never propagate: the offending line falls back to
//! plain text, or is discarded with a DEBUG log.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

use outrider_protocol::{LogLevel, WorkerId};

use crate::counters::COUNTERS;
use crate::queue::BoundedQueue;

/// Prefix of protocol-marker lines emitted by the worker bootstrap.
const BOOTSTRAP_PREFIX: &str = "BOOTSTRAP_STATUS:";

/// Metadata key carrying the bootstrap payload.
pub const BOOTSTRAP_STATUS_KEY: &str = "bootstrap_status";

/// Metadata key carrying the originating logger name.
pub const LOGGER_KEY: &str = "logger";

/// `YYYY-MM-DD HH:MM:SS,mmm - <logger> - <LEVEL> - <message>`
fn structured_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3}) - (.+?) - ([A-Za-z]+) - (.*)$",
        )
        .expect("invalid structured-line pattern")
    })
}

/// Which worker stream a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
        }
    }
}

/// One immutable record of worker output.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source: LogSource,
    pub metadata: HashMap<String, String>,
}

impl LogRecord {
    fn plain(line: &str, source: LogSource, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            level: LogLevel::Info,
            message: line.to_string(),
            source,
            metadata: HashMap::new(),
        }
    }
}

/// Classify one line of worker output into a record.
pub fn parse_line(line: &str, source: LogSource, now: DateTime<Utc>) -> LogRecord {
    if let Some(status) = line.strip_prefix(BOOTSTRAP_PREFIX) {
        let status = status.trim();
        let mut metadata = HashMap::new();
        metadata.insert(BOOTSTRAP_STATUS_KEY.to_string(), status.to_string());
        return LogRecord {
            timestamp: now,
            level: LogLevel::Info,
            message: format!("Bootstrap status: {}", status),
            source,
            metadata,
        };
    }

    if let Some(captures) = structured_line_pattern().captures(line) {
        let stamp = &captures[1];
        match NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S,%3f") {
            Ok(naive) => {
                let mut metadata = HashMap::new();
                metadata.insert(LOGGER_KEY.to_string(), captures[2].trim().to_string());
                return LogRecord {
                    timestamp: naive.and_utc(),
                    level: LogLevel::from_worker_token(&captures[3]),
                    message: captures[4].to_string(),
                    source,
                    metadata,
                };
            }
            Err(e) => {
                // Prefix matched but the timestamp would not parse.
                debug!("structured log line fell back to plain text: {}", e);
            }
        }
    }

    LogRecord::plain(line, source, now)
}

/// Destination for accepted records, outside the per-worker queue.
///
/// The host decides what a sink is; the default forwards into `tracing`
/// with a logger name derived from the source tag and record level.
pub trait LogSink: Send + Sync {
    fn forward(&self, worker: WorkerId, record: &LogRecord);
}

/// Default sink: re-emit worker output as tracing events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn forward(&self, worker: WorkerId, record: &LogRecord) {
        let source = record.source.as_str();
        match record.level {
            LogLevel::Trace => {
                tracing::trace!(target: "outrider::worker", %worker, source, "{}", record.message)
            }
            LogLevel::Debug => {
                tracing::debug!(target: "outrider::worker", %worker, source, "{}", record.message)
            }
            LogLevel::Info => {
                tracing::info!(target: "outrider::worker", %worker, source, "{}", record.message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "outrider::worker", %worker, source, "{}", record.message)
            }
            LogLevel::Error => {
                tracing::error!(target: "outrider::worker", %worker, source, "{}", record.message)
            }
        }
    }
}

/// Per-worker collection state shared with the pump threads.
struct LogCollector {
    queue: BoundedQueue<LogRecord>,
    filter: Mutex<LogLevel>,
}

/// Consuming view of one worker's log queue.
pub struct LogStream {
    collector: Arc<LogCollector>,
}

impl LogStream {
    /// Wait up to `timeout` for the next record.
    pub fn next_record(&self, timeout: Duration) -> Option<LogRecord> {
        self.collector.queue.poll(timeout)
    }
}

/// Owns log collection for every worker.
pub struct LogManager {
    collectors: Mutex<HashMap<WorkerId, Arc<LogCollector>>>,
    sink: Arc<dyn LogSink>,
    queue_capacity: usize,
    default_level: LogLevel,
}

impl LogManager {
    pub fn new(sink: Arc<dyn LogSink>, queue_capacity: usize, default_level: LogLevel) -> Self {
        Self {
            collectors: Mutex::new(HashMap::new()),
            sink,
            queue_capacity,
            default_level,
        }
    }

    /// Attach pump threads to a worker's output streams.
    ///
    /// `active` is the worker record's active flag: clearing it stops the
    /// pumps at their next read. The pumps otherwise run to end-of-stream,
    /// surviving worker exit so trailing output is kept.
    pub fn start_log_collection<O, E>(
        &self,
        id: WorkerId,
        active: Arc<AtomicBool>,
        stdout: O,
        stderr: E,
    ) where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let collector = Arc::new(LogCollector {
            queue: BoundedQueue::new(self.queue_capacity),
            filter: Mutex::new(self.default_level),
        });
        self.collectors.lock().unwrap().insert(id, Arc::clone(&collector));

        spawn_pump(id, LogSource::Stdout, stdout, Arc::clone(&collector), Arc::clone(&active), Arc::clone(&self.sink));
        spawn_pump(id, LogSource::Stderr, stderr, collector, active, Arc::clone(&self.sink));
    }

    /// Copy of the currently queued records, oldest first.
    pub fn logs(&self, id: WorkerId) -> Vec<LogRecord> {
        match self.collector(id) {
            Some(collector) => collector.queue.snapshot(),
            None => Vec::new(),
        }
    }

    /// Consuming stream over a worker's records.
    pub fn log_stream(&self, id: WorkerId) -> Option<LogStream> {
        self.collector(id).map(|collector| LogStream { collector })
    }

    pub fn set_log_level(&self, id: WorkerId, level: LogLevel) {
        if let Some(collector) = self.collector(id) {
            *collector.filter.lock().unwrap() = level;
        }
    }

    /// Drop a worker's collection state. Running pumps hold their own
    /// references and drain to end-of-stream on their own.
    pub fn stop(&self, id: WorkerId) {
        self.collectors.lock().unwrap().remove(&id);
    }

    pub fn shutdown(&self) {
        self.collectors.lock().unwrap().clear();
    }

    fn collector(&self, id: WorkerId) -> Option<Arc<LogCollector>> {
        self.collectors.lock().unwrap().get(&id).cloned()
    }
}

fn spawn_pump<R>(
    id: WorkerId,
    source: LogSource,
    stream: R,
    collector: Arc<LogCollector>,
    active: Arc<AtomicBool>,
    sink: Arc<dyn LogSink>,
) where
    R: Read + Send + 'static,
{
    let name = format!("log-{}-{}", source.as_str(), id);
    let _ = std::thread::Builder::new().name(name).spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            if !active.load(Ordering::SeqCst) {
                break;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!(%id, source = source.as_str(), "log stream read failed: {}", e);
                    break;
                }
            };

            let record = parse_line(&line, source, Utc::now());
            if record.level < *collector.filter.lock().unwrap() {
                continue;
            }

            if collector.queue.offer_evict(record.clone()).is_some() {
                COUNTERS.inc_log_records_dropped();
                warn!(%id, source = source.as_str(), "log queue full, dropped oldest record");
            }
            sink.forward(id, &record);
        }
        debug!(%id, source = source.as_str(), "log pump finished");
    });
}
