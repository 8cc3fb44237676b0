//! Side-band message broker.
//!
//! One record per worker: bounded outbound and inbound queues, a message
//! id counter, and the channel. Three threads run per connected worker:
//!
//! - writer: drains outbound, frames and sends, retries transient
//!   failures with exponential backoff, drops after the last attempt;
//! - reader: receives framed messages, siphons heartbeats into the
//!   shared heartbeat cell, queues everything else drop-oldest;
//! - heartbeat: enqueues a `heartbeat` message at a fixed interval
//!   (through the outbound queue, preserving single-writer ordering).
//!
//! The channel is bound before the worker spawns (the port rides on the
//! worker command line) and accepted on a background thread, so channel
//! establishment never blocks the caller. Until the worker actually
//! connects, `send`/`receive` fail fast with `ChannelNotOpen`.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use outrider_protocol::{Message, WorkerId, DATA_TYPE};

use crate::channel::{ByteChannel, ChannelListener, LoopbackChannel};
use crate::clock::{Clock, HeartbeatCell};
use crate::config::{RetryPolicy, SupervisorConfig};
use crate::counters::COUNTERS;
use crate::error::CommunicationError;
use crate::queue::BoundedQueue;

/// How often blocking loops re-check their cancellation flags.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Snapshot of one worker's broker state.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    pub outbound_size: usize,
    pub inbound_size: usize,
    pub last_heartbeat: chrono::DateTime<Utc>,
    pub active: bool,
}

struct BrokerRecord {
    outbound: Arc<BoundedQueue<Message>>,
    inbound: Arc<BoundedQueue<Message>>,
    next_seq: AtomicU64,
    channel: Mutex<Option<Arc<LoopbackChannel>>>,
    /// Set only after the worker's connection is accepted.
    channel_open: Arc<AtomicBool>,
    /// Worker record's active flag; clearing it stops the tasks.
    active: Arc<AtomicBool>,
    /// Local teardown signal, distinct from `active` so a pending accept
    /// can be abandoned without touching the worker record.
    closing: Arc<AtomicBool>,
    heartbeat: Arc<HeartbeatCell>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerRecord {
    fn next_message_id(&self, id: WorkerId) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", id, seq)
    }
}

pub struct MessageBroker {
    records: Mutex<HashMap<WorkerId, Arc<BrokerRecord>>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
    receive_timeout: Duration,
    connect_timeout: Duration,
    outbound_capacity: usize,
    inbound_capacity: usize,
}

impl MessageBroker {
    pub fn new(clock: Arc<dyn Clock>, config: &SupervisorConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            retry: config.retry.clone(),
            heartbeat_interval: config.heartbeat_interval,
            receive_timeout: config.receive_timeout,
            connect_timeout: config.connect_timeout,
            outbound_capacity: config.outbound_queue_capacity,
            inbound_capacity: config.inbound_queue_capacity,
        }
    }

    /// Bind the loopback listener whose port is handed to the worker.
    pub fn bind_channel(&self) -> std::io::Result<ChannelListener> {
        ChannelListener::bind()
    }

    /// Register a worker and start waiting for its connection in the
    /// background. Returns immediately.
    pub fn establish_channel(
        &self,
        id: WorkerId,
        listener: ChannelListener,
        active: Arc<AtomicBool>,
        heartbeat: Arc<HeartbeatCell>,
    ) {
        let record = Arc::new(BrokerRecord {
            outbound: Arc::new(BoundedQueue::new(self.outbound_capacity)),
            inbound: Arc::new(BoundedQueue::new(self.inbound_capacity)),
            next_seq: AtomicU64::new(0),
            channel: Mutex::new(None),
            channel_open: Arc::new(AtomicBool::new(false)),
            active,
            closing: Arc::new(AtomicBool::new(false)),
            heartbeat,
            threads: Mutex::new(Vec::new()),
        });
        self.records.lock().unwrap().insert(id, Arc::clone(&record));

        let connect_timeout = self.connect_timeout;
        let retry = self.retry.clone();
        let heartbeat_interval = self.heartbeat_interval;
        let clock = Arc::clone(&self.clock);

        let establish_record = Arc::clone(&record);
        let establisher = std::thread::Builder::new()
            .name(format!("chan-establish-{}", id))
            .spawn(move || {
                let closing = Arc::clone(&establish_record.closing);
                match listener.accept(connect_timeout, &closing) {
                    Ok(channel) => {
                        let channel = Arc::new(channel);
                        *establish_record.channel.lock().unwrap() = Some(Arc::clone(&channel));
                        if establish_record.closing.load(Ordering::SeqCst) {
                            // Torn down while the accept was completing.
                            channel.close();
                            return;
                        }
                        establish_record.channel_open.store(true, Ordering::SeqCst);
                        info!(%id, "worker connected to side-band channel");
                        start_tasks(
                            id,
                            &establish_record,
                            channel,
                            clock,
                            retry,
                            heartbeat_interval,
                        );
                    }
                    Err(e) => {
                        // The worker may legitimately run without a
                        // side-band channel; sends will fail fast.
                        warn!(%id, "side-band channel was never established: {}", e);
                    }
                }
            });

        if let Ok(handle) = establisher {
            record.threads.lock().unwrap().push(handle);
        }
    }

    /// Queue a caller payload for delivery. Fails fast when the worker is
    /// unknown, the channel never opened, or the outbound queue is full.
    /// Returns the assigned message id.
    pub fn send_message(&self, id: WorkerId, payload: Value) -> Result<String, CommunicationError> {
        let record = self.record(id).ok_or(CommunicationError::UnknownWorker(id))?;
        if !record.channel_open.load(Ordering::SeqCst) {
            return Err(CommunicationError::ChannelNotOpen);
        }

        let message_id = record.next_message_id(id);
        let message = Message::new(message_id.clone(), DATA_TYPE, payload);
        record
            .outbound
            .offer(message)
            .map_err(|_| CommunicationError::QueueFull(id))?;
        Ok(message_id)
    }

    /// Wait for the next non-heartbeat message from a worker.
    pub fn receive_message(
        &self,
        id: WorkerId,
        timeout: Option<Duration>,
    ) -> Result<Message, CommunicationError> {
        let record = self.record(id).ok_or(CommunicationError::UnknownWorker(id))?;
        if !record.channel_open.load(Ordering::SeqCst) {
            return Err(CommunicationError::ChannelNotOpen);
        }

        let timeout = timeout.unwrap_or(self.receive_timeout);
        record
            .inbound
            .poll(timeout)
            .ok_or(CommunicationError::ReceiveTimeout { id, timeout })
    }

    /// Tear down a worker's channel and broker record. Idempotent.
    pub fn close_channel(&self, id: WorkerId) {
        let Some(record) = self.records.lock().unwrap().remove(&id) else {
            return;
        };

        record.closing.store(true, Ordering::SeqCst);
        record.channel_open.store(false, Ordering::SeqCst);
        if let Some(channel) = record.channel.lock().unwrap().take() {
            channel.close();
        }

        let handles: Vec<JoinHandle<()>> = record.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!(%id, "side-band channel closed");
    }

    pub fn get_stats(&self, id: WorkerId) -> Option<BrokerStats> {
        let record = self.record(id)?;
        Some(BrokerStats {
            outbound_size: record.outbound.len(),
            inbound_size: record.inbound.len(),
            last_heartbeat: record.heartbeat.at(),
            active: record.channel_open.load(Ordering::SeqCst),
        })
    }

    pub fn shutdown(&self) {
        let ids: Vec<WorkerId> = self.records.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.close_channel(id);
        }
    }

    fn record(&self, id: WorkerId) -> Option<Arc<BrokerRecord>> {
        self.records.lock().unwrap().get(&id).cloned()
    }
}

/// Launch the writer, reader and heartbeat threads for a connected
/// worker. The threads hold only the queues, flags, cell and channel,
/// never the broker record itself.
fn start_tasks(
    id: WorkerId,
    record: &BrokerRecord,
    channel: Arc<LoopbackChannel>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
) {
    let mut threads = record.threads.lock().unwrap();

    {
        let outbound = Arc::clone(&record.outbound);
        let active = Arc::clone(&record.active);
        let closing = Arc::clone(&record.closing);
        let channel = Arc::clone(&channel);
        if let Ok(handle) = std::thread::Builder::new()
            .name(format!("msg-writer-{}", id))
            .spawn(move || writer_loop(id, outbound, channel, active, closing, retry))
        {
            threads.push(handle);
        }
    }

    {
        let inbound = Arc::clone(&record.inbound);
        let active = Arc::clone(&record.active);
        let closing = Arc::clone(&record.closing);
        let heartbeat = Arc::clone(&record.heartbeat);
        let channel_open = Arc::clone(&record.channel_open);
        let channel = Arc::clone(&channel);
        if let Ok(handle) = std::thread::Builder::new()
            .name(format!("msg-reader-{}", id))
            .spawn(move || {
                reader_loop(id, inbound, channel, active, closing, channel_open, heartbeat, clock)
            })
        {
            threads.push(handle);
        }
    }

    {
        let outbound = Arc::clone(&record.outbound);
        let active = Arc::clone(&record.active);
        let closing = Arc::clone(&record.closing);
        let seq = Arc::new(AtomicU64::new(0));
        if let Ok(handle) = std::thread::Builder::new()
            .name(format!("msg-heartbeat-{}", id))
            .spawn(move || heartbeat_loop(id, outbound, active, closing, heartbeat_interval, seq))
        {
            threads.push(handle);
        }
    }
}

fn writer_loop(
    id: WorkerId,
    outbound: Arc<BoundedQueue<Message>>,
    channel: Arc<LoopbackChannel>,
    active: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    retry: RetryPolicy,
) {
    let stopped = || !active.load(Ordering::SeqCst) || closing.load(Ordering::SeqCst);

    while !stopped() {
        let Some(message) = outbound.poll(POLL_INTERVAL) else {
            continue;
        };

        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(%id, "dropping unserializable message {}: {}", message.message_id, e);
                COUNTERS.inc_messages_dropped();
                continue;
            }
        };

        let mut attempt = 1u32;
        loop {
            match channel.send_message(&text) {
                Ok(()) => {
                    COUNTERS.inc_messages_sent();
                    break;
                }
                Err(e) if attempt < retry.max_attempts && !stopped() => {
                    let delay = retry.delay_after(attempt);
                    debug!(
                        %id,
                        "send attempt {}/{} failed ({}), retrying in {:?}",
                        attempt, retry.max_attempts, e, delay
                    );
                    sleep_unless(delay, &stopped);
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        %id,
                        "dropping message {} after {} attempts: {}",
                        message.message_id, attempt, e
                    );
                    COUNTERS.inc_messages_dropped();
                    break;
                }
            }
        }
    }
    debug!(%id, "writer task finished");
}

#[allow(clippy::too_many_arguments)]
fn reader_loop(
    id: WorkerId,
    inbound: Arc<BoundedQueue<Message>>,
    channel: Arc<LoopbackChannel>,
    active: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    channel_open: Arc<AtomicBool>,
    heartbeat: Arc<HeartbeatCell>,
    clock: Arc<dyn Clock>,
) {
    loop {
        if !active.load(Ordering::SeqCst) || closing.load(Ordering::SeqCst) {
            break;
        }

        match channel.receive_message() {
            Ok(text) => match Message::decode(&text) {
                Ok(message) => {
                    COUNTERS.inc_messages_received();
                    if message.is_heartbeat() {
                        heartbeat.touch(clock.as_ref());
                        continue;
                    }
                    if inbound.offer_evict(message).is_some() {
                        warn!(%id, "inbound queue full, dropped oldest message");
                    }
                }
                Err(e) => {
                    COUNTERS.inc_protocol_errors();
                    warn!(%id, "discarding undecodable message: {}", e);
                }
            },
            Err(CommunicationError::Protocol(e)) => {
                COUNTERS.inc_protocol_errors();
                warn!(%id, "protocol violation, closing channel: {}", e);
                channel_open.store(false, Ordering::SeqCst);
                channel.close();
                break;
            }
            Err(e) => {
                if active.load(Ordering::SeqCst) && !closing.load(Ordering::SeqCst) {
                    // Involuntary disconnect: the next status poll will
                    // see the missed heartbeats.
                    warn!(%id, "channel lost while worker active: {}", e);
                    channel_open.store(false, Ordering::SeqCst);
                    channel.close();
                }
                break;
            }
        }
    }
    debug!(%id, "reader task finished");
}

fn heartbeat_loop(
    id: WorkerId,
    outbound: Arc<BoundedQueue<Message>>,
    active: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    interval: Duration,
    seq: Arc<AtomicU64>,
) {
    let stopped = || !active.load(Ordering::SeqCst) || closing.load(Ordering::SeqCst);

    while !stopped() {
        if sleep_unless(interval, &stopped) {
            break;
        }
        let n = seq.fetch_add(1, Ordering::Relaxed);
        let message = Message::heartbeat(format!("{}-hb-{}", id, n));
        if outbound.offer(message).is_err() {
            debug!(%id, "outbound queue full, heartbeat skipped");
        }
    }
    debug!(%id, "heartbeat task finished");
}

/// Sleep `duration` in short slices, aborting early when `stopped`
/// reports true. Returns whether the sleep was aborted.
fn sleep_unless(duration: Duration, stopped: &dyn Fn() -> bool) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if stopped() {
            return true;
        }
        let slice = remaining.min(Duration::from_millis(50));
        std::thread::sleep(slice);
        remaining -= slice;
    }
    stopped()
}
