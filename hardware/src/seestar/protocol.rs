//! Wire format for the smart-telescope control service.
//!
//! Messages are single-line JSON objects terminated with LF (0x0A).
//!
//! ## Requests
//!
//! ```text
//! {"method":"goto","id":7,"protocolVersion":"2.0","params":{"ra":5.58,"dec":-5.39}}
//! ```
//!
//! ## Responses
//!
//! Carry the request's `id` and a result `code` (0 = success):
//!
//! ```text
//! {"id":7,"code":0,"result":"ok"}
//! ```
//!
//! ## Telemetry
//!
//! Unsolicited frames either omit `id` or carry the reserved `Event` marker:
//!
//! ```text
//! {"Event":"PiStatus","state":"tracking","temperature":21.5}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version sent with every request.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Key that marks a frame as telemetry even if it carries an `id`.
pub const EVENT_MARKER: &str = "Event";

/// Result code used when a frame cannot be decoded.
pub const MALFORMED_FRAME_CODE: i64 = -32700;

/// Result code for a method the peer does not know.
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;

/// Result code for parameters rejected before anything is sent.
pub const INVALID_PARAMS_CODE: i64 = -32602;

/// An outbound command frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub id: u64,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: &str, id: u64, params: Option<Value>) -> Self {
        Self {
            method: method.to_string(),
            id,
            protocol_version: PROTOCOL_VERSION.to_string(),
            params,
        }
    }

    /// Encode as one LF-terminated line.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// A decoded response to a correlated command.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub code: i64,
    pub result: Value,
    pub error: Option<String>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Human-readable failure description for a non-zero code.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("device returned code {}", self.code))
    }
}

/// Classification of one inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(Response),
    Telemetry(Map<String, Value>),
    /// Undecodable frame; `id` is set when the frame could still be correlated.
    Malformed { id: Option<u64>, reason: String },
}

/// Decode one line received from the device.
pub fn decode_line(line: &str) -> InboundFrame {
    let value: Value = match serde_json::from_str(line.trim()) {
        Ok(v) => v,
        Err(e) => {
            return InboundFrame::Malformed {
                id: None,
                reason: format!("invalid JSON: {e}"),
            }
        }
    };

    let Value::Object(obj) = value else {
        return InboundFrame::Malformed {
            id: None,
            reason: "frame is not a JSON object".to_string(),
        };
    };

    if obj.contains_key(EVENT_MARKER) {
        return InboundFrame::Telemetry(obj);
    }

    let id = match obj.get("id") {
        None | Some(Value::Null) => return InboundFrame::Telemetry(obj),
        Some(raw) => match id_from_value(raw) {
            Some(id) => id,
            None => {
                return InboundFrame::Malformed {
                    id: None,
                    reason: format!("unusable id {raw}"),
                }
            }
        },
    };

    let Some(code) = obj.get("code").and_then(Value::as_i64) else {
        return InboundFrame::Malformed {
            id: Some(id),
            reason: "response has no integer code".to_string(),
        };
    };

    let error = match obj.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };

    InboundFrame::Response(Response {
        id,
        code,
        result: obj.get("result").cloned().unwrap_or(Value::Null),
        error,
    })
}

/// Correlation ids are numeric; some firmware quotes them.
fn id_from_value(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Method name of a request frame, if any.
pub fn frame_method(frame: &Value) -> Option<&str> {
    frame.get("method").and_then(Value::as_str)
}

/// Correlation id of any frame, if it has a usable one.
pub fn frame_id(frame: &Value) -> Option<u64> {
    frame.get("id").and_then(id_from_value)
}
