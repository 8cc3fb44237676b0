//! Wire protocol for supervisor <-> worker communication.
//!
//! Every message on the side-band channel is a single frame:
//!
//! ```text
//! [LEN:4][PAYLOAD:LEN]
//! ```
//!
//! - LEN (u32, Network Byte Order / Big Endian): payload length in bytes,
//!   interpreted as a non-negative int32. A set sign bit is a protocol error.
//! - PAYLOAD: UTF-8 encoded JSON object with fields `messageId`,
//!   `messageType`, `payload`, `timestamp` (ISO-8601).
//!
//! The reserved message type `heartbeat` is protocol-level: heartbeats are
//! consumed by the supervisor and never reach application queues.

pub mod defaults;
pub mod error;
pub mod framing;
pub mod message;
pub mod types;

pub use error::{ProtocolError, Result};
pub use framing::{frame, is_valid_frame, parse_length, unframe, LENGTH_PREFIX_SIZE, MAX_FRAME_LEN};
pub use message::{Message, DATA_TYPE, HEARTBEAT_TYPE};
pub use types::{LogLevel, WorkerId, WorkerStatus};
