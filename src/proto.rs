//! Wire protocol: newline-delimited JSON frames.
//!
//! Every frame is one JSON object per line with a `type` tag. Operations
//! travel as untyped JSON values so the relay can fan them out after a
//! shallow well-formedness check; the replica decodes them into
//! `cowrite_core::Operation` at its own boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unparsable frame: {reason}")]
    Malformed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// An operation in either direction. `is_sync`/`operation_id` are only
    /// set by a participant replaying its queue; the relay strips them when
    /// fanning out.
    Operation {
        operation: Value,
        #[serde(
            rename = "isSync",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        is_sync: Option<bool>,
        #[serde(
            rename = "operationId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        operation_id: Option<String>,
    },
    /// Relay occupancy broadcast.
    UsersUpdate { count: u64 },
    /// Relay acknowledgement for a sync frame.
    OperationAck {
        #[serde(rename = "operationId")]
        operation_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WireMessage {
    pub fn operation(op: Value) -> Self {
        WireMessage::Operation {
            operation: op,
            is_sync: None,
            operation_id: None,
        }
    }

    pub fn sync_operation(op: Value, queue_id: u64) -> Self {
        WireMessage::Operation {
            operation: op,
            is_sync: Some(true),
            operation_id: Some(queue_id.to_string()),
        }
    }
}

/// Encode a frame as one wire line, newline included.
pub fn encode_line(message: &WireMessage) -> String {
    let mut line = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    line
}

pub fn decode_line(line: &str) -> Result<WireMessage, ProtoError> {
    serde_json::from_str(line.trim_end()).map_err(|err| ProtoError::Malformed {
        reason: err.to_string(),
    })
}

/// Shallow well-formedness check the relay applies before fanning out: the
/// payload must be an object carrying a `type` field. Nothing deeper is
/// inspected; the relay is not a validator.
pub fn operation_is_well_formed(operation: &Value) -> bool {
    operation
        .as_object()
        .is_some_and(|obj| obj.get("type").is_some_and(Value::is_string))
}
