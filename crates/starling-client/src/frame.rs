//! Wire format for the Helios-Starling protocol: JSON frames exchanged over
//! the WebSocket transport.
//!
//! Every frame carries a common envelope (`protocol`, `version`, `timestamp`)
//! plus a `type`-tagged body. [`MessageCodec`] is the only place that knows
//! how to turn a raw [`tokio_tungstenite::tungstenite::Message`] into a
//! [`ProtocolFrame`], and back.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

pub const PROTOCOL_NAME: &str = "helios-starling";
pub const PROTOCOL_VERSION: &str = "1.0.0";

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An application-level error, carried in both error responses and
/// standalone error frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// The `notification` payload of a notification frame. Carries either a
/// topic broadcast (`topic` set) or a request-scoped progress update
/// (`request_id` set); exactly one is expected to be present, but both
/// fields are optional so malformed input is caught by validation rather
/// than by a serde error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The semantic body of a frame, dispatched on the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolFrame {
    Request {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Value>,
    },
    Response {
        #[serde(rename = "requestId")]
        request_id: Uuid,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorObject>,
    },
    Notification {
        notification: NotificationBody,
    },
    Error {
        error: ErrorObject,
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
    },
}

impl ProtocolFrame {
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            ProtocolFrame::Request { request_id, .. } => Some(*request_id),
            ProtocolFrame::Response { request_id, .. } => Some(*request_id),
            ProtocolFrame::Notification { notification } => notification.request_id,
            ProtocolFrame::Error { request_id, .. } => *request_id,
        }
    }
}

/// The complete wire envelope: common header fields plus a tagged body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub protocol: String,
    pub version: String,
    pub timestamp: u64,

    #[serde(flatten)]
    pub body: ProtocolFrame,
}

impl Frame {
    pub fn new(body: ProtocolFrame) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            timestamp: now_ms(),
            body,
        }
    }
}

/// What a raw inbound message decoded to. Every variant corresponds to one
/// of the dispatch paths `ConnectionCore` exposes to application code.
#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    /// A well-formed, schema-valid frame.
    Valid(Frame),
    /// Valid JSON, but not a recognizable frame (unknown `type`, missing
    /// required field, or a field that failed validation).
    JsonInvalid(Value),
    /// A text frame that was not valid JSON at all.
    Text(String),
    /// A binary frame. The protocol has no binary framing, so these are
    /// handed to the application untouched.
    Binary(Vec<u8>),
}

/// Validates a method name as it appears in the wire `method` field of a
/// request frame. Looser than [`validate_registered_method_name`]: servers
/// may dispatch dotted method names that a client only ever calls, never
/// registers.
pub fn validate_wire_method_name(name: &str) -> bool {
    if name.len() < 3 {
        return false;
    }
    let mut chars = name.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == ':')
}

/// Stateless encode/decode between [`Frame`]/[`ProtocolFrame`] and the raw
/// WebSocket [`Message`] wire representation.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode(&self, body: ProtocolFrame) -> String {
        let frame = Frame::new(body);
        serde_json::to_string(&frame).expect("ProtocolFrame always serializes")
    }

    pub fn decode(&self, message: &Message) -> DecodeOutcome {
        match message {
            Message::Text(text) => self.decode_text(text),
            Message::Binary(bytes) => DecodeOutcome::Binary(bytes.clone()),
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => {
                DecodeOutcome::Text(String::new())
            }
        }
    }

    fn decode_text(&self, text: &str) -> DecodeOutcome {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return DecodeOutcome::Text(text.to_string()),
        };

        let frame: Frame = match serde_json::from_value(value.clone()) {
            Ok(f) => f,
            Err(_) => return DecodeOutcome::JsonInvalid(value),
        };

        if let ProtocolFrame::Request { ref method, .. } = frame.body {
            if !validate_wire_method_name(method) {
                return DecodeOutcome::JsonInvalid(value);
            }
        }

        DecodeOutcome::Valid(frame)
    }
}
