//! SignalR JSON hub protocol framing.
//!
//! Every message is a JSON object terminated by the ASCII record separator
//! (`0x1E`). One WebSocket text frame may carry several records. The first
//! record each side sends is the handshake; after that every record has an
//! integer `type`:
//!
//! | type | message           | direction        |
//! |------|-------------------|------------------|
//! | 1    | Invocation        | both             |
//! | 2    | StreamItem        | server -> client |
//! | 3    | Completion        | server -> client |
//! | 4    | StreamInvocation  | client -> server |
//! | 5    | CancelInvocation  | client -> server |
//! | 6    | Ping              | both             |
//! | 7    | Close             | both             |

use serde_json::{json, Value};

use crate::error::TransportError;

/// Record terminator.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u64 = 1;
const STREAM_ITEM: u64 = 2;
const COMPLETION: u64 = 3;
const STREAM_INVOCATION: u64 = 4;
const CANCEL_INVOCATION: u64 = 5;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// A decoded server-to-client record.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    StreamItem {
        invocation_id: String,
        item: Value,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// A known-but-unhandled or unknown message type.
    Other(u64),
}

/// The client's handshake record.
pub fn handshake_request() -> String {
    frame(&json!({ "protocol": "json", "version": 1 }))
}

/// Validate the server's handshake reply (`{}` or `{"error": "..."}`).
pub fn parse_handshake_response(record: &str) -> Result<(), TransportError> {
    let value: Value = serde_json::from_str(record)
        .map_err(|e| TransportError::Handshake(format!("invalid handshake response: {e}")))?;
    match value["error"].as_str() {
        Some(error) => Err(TransportError::Handshake(error.to_string())),
        None => Ok(()),
    }
}

/// Split a text frame into its records, dropping the empty tail after the
/// final separator.
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty())
}

/// Decode one record.
pub fn parse_message(record: &str) -> Result<HubMessage, TransportError> {
    let msg: Value = serde_json::from_str(record)
        .map_err(|e| TransportError::Protocol(format!("invalid JSON record: {e}")))?;
    let msg_type = msg["type"]
        .as_u64()
        .ok_or_else(|| TransportError::Protocol("record has no integer type".to_string()))?;

    let message = match msg_type {
        INVOCATION => HubMessage::Invocation {
            invocation_id: msg["invocationId"].as_str().map(ToString::to_string),
            target: msg["target"]
                .as_str()
                .ok_or_else(|| TransportError::Protocol("invocation without target".to_string()))?
                .to_string(),
            arguments: msg["arguments"].as_array().cloned().unwrap_or_default(),
        },
        STREAM_ITEM => HubMessage::StreamItem {
            invocation_id: required_id(&msg)?,
            item: msg["item"].clone(),
        },
        COMPLETION => HubMessage::Completion {
            invocation_id: required_id(&msg)?,
            result: msg.get("result").cloned(),
            error: msg["error"].as_str().map(ToString::to_string),
        },
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close {
            error: msg["error"].as_str().map(ToString::to_string),
            allow_reconnect: msg["allowReconnect"].as_bool().unwrap_or(false),
        },
        other => HubMessage::Other(other),
    };
    Ok(message)
}

fn required_id(msg: &Value) -> Result<String, TransportError> {
    msg["invocationId"]
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| TransportError::Protocol("record without invocationId".to_string()))
}

/// Invocation record. `invocation_id = None` means no reply is expected.
pub fn encode_invocation(invocation_id: Option<&str>, target: &str, arguments: &[Value]) -> String {
    let mut msg = json!({
        "type": INVOCATION,
        "target": target,
        "arguments": arguments,
    });
    if let Some(id) = invocation_id {
        msg["invocationId"] = json!(id);
    }
    frame(&msg)
}

pub fn encode_stream_invocation(invocation_id: &str, target: &str, arguments: &[Value]) -> String {
    frame(&json!({
        "type": STREAM_INVOCATION,
        "invocationId": invocation_id,
        "target": target,
        "arguments": arguments,
    }))
}

pub fn encode_cancel_invocation(invocation_id: &str) -> String {
    frame(&json!({
        "type": CANCEL_INVOCATION,
        "invocationId": invocation_id,
    }))
}

pub fn encode_ping() -> String {
    frame(&json!({ "type": PING }))
}

pub fn encode_close() -> String {
    frame(&json!({ "type": CLOSE }))
}

fn frame(msg: &Value) -> String {
    format!("{msg}{RECORD_SEPARATOR}")
}
