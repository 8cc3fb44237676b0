//! Channel message model.
//!
//! The on-wire shape is a JSON object with camelCase fields. Missing
//! `messageId` or `timestamp` on receipt are synthesized locally so the
//! rest of the system always sees complete messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Reserved protocol-level message type. Heartbeats update liveness
/// bookkeeping and never enter application queues.
pub const HEARTBEAT_TYPE: &str = "heartbeat";

/// Message type assigned to caller-submitted payloads.
pub const DATA_TYPE: &str = "data";

/// A single side-band message exchanged with a worker.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub message_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Raw wire shape: id and timestamp may be absent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    message_id: Option<String>,
    message_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(message_id: String, message_type: &str, payload: Value) -> Self {
        Self {
            message_id,
            message_type: message_type.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Build a heartbeat message with the conventional "ping" payload.
    pub fn heartbeat(message_id: String) -> Self {
        Self::new(message_id, HEARTBEAT_TYPE, Value::String("ping".to_string()))
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_type == HEARTBEAT_TYPE
    }

    /// Serialize to the UTF-8 JSON wire form (unframed).
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a message from its UTF-8 JSON wire form, synthesizing a
    /// message id and timestamp when the peer omitted them.
    pub fn decode(text: &str) -> Result<Self> {
        let wire: WireMessage = serde_json::from_str(text)?;
        Ok(Self {
            message_id: wire
                .message_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            message_type: wire.message_type,
            payload: wire.payload,
            timestamp: wire.timestamp.unwrap_or_else(Utc::now),
        })
    }
}
