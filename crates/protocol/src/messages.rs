//! Data channel message definitions.
//!
//! Every text frame on the data channel is a JSON object
//! `{"type": ..., "topic": ..., "data": ...}`. The `data` payload is opaque
//! for pass-through topics; only validation, heartbeat and request payloads
//! have declared shapes here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;

/// Literal the device sends once the validation response is accepted.
pub const VALIDATION_OK: &str = "Validation Ok.";

/// `req_type` of the device's round-trip-time probe.
pub const RTT_PROBE_REQ_TYPE: &str = "rtt_probe_send_from_mechine";

/// `req_type` that toggles the device's traffic saving mode.
pub const DISABLE_TRAFFIC_SAVING_REQ_TYPE: &str = "disable_traffic_saving";

/// The `type` field of a data channel message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Validation challenge or response.
    Validation,
    /// Subscribe to a topic.
    Subscribe,
    /// Unsubscribe from a topic.
    Unsubscribe,
    /// Generic topic message.
    Msg,
    /// Request carrying a `header.identity.id`.
    Request,
    /// Response to a request.
    Response,
    /// Video stream switch.
    Vid,
    /// Audio stream switch.
    Aud,
    /// Error report.
    Err,
    /// Keepalive.
    Heartbeat,
    /// Transport-internal request (RTT probes, traffic saving).
    RtcInnerReq,
    /// Transport statistics report.
    RtcReport,
    /// Device error raised.
    AddError,
    /// Device error cleared.
    RmError,
    /// Device error list.
    Errors,
    /// Any type this client does not know about.
    Other(String),
}

impl MessageType {
    /// Returns the wire string for this type.
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Validation => "validation",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Msg => "msg",
            MessageType::Request => "req",
            MessageType::Response => "res",
            MessageType::Vid => "vid",
            MessageType::Aud => "aud",
            MessageType::Err => "err",
            MessageType::Heartbeat => "heartbeat",
            MessageType::RtcInnerReq => "rtc_inner_req",
            MessageType::RtcReport => "rtc_report",
            MessageType::AddError => "add_error",
            MessageType::RmError => "rm_error",
            MessageType::Errors => "errors",
            MessageType::Other(other) => other,
        }
    }

    /// Returns the type used when correlating replies.
    ///
    /// A `res` answers a `req`, so both share the request class; every other
    /// type correlates with itself.
    pub fn correlation_class(&self) -> MessageType {
        match self {
            MessageType::Request | MessageType::Response => MessageType::Request,
            other => other.clone(),
        }
    }

    /// Whether this type reports a device-side error.
    pub fn is_error_report(&self) -> bool {
        matches!(
            self,
            MessageType::Err | MessageType::AddError | MessageType::RmError | MessageType::Errors
        )
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Msg
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "validation" => MessageType::Validation,
            "subscribe" => MessageType::Subscribe,
            "unsubscribe" => MessageType::Unsubscribe,
            "msg" => MessageType::Msg,
            "req" => MessageType::Request,
            "res" => MessageType::Response,
            "vid" => MessageType::Vid,
            "aud" => MessageType::Aud,
            "err" => MessageType::Err,
            "heartbeat" => MessageType::Heartbeat,
            "rtc_inner_req" => MessageType::RtcInnerReq,
            "rtc_report" => MessageType::RtcReport,
            "add_error" => MessageType::AddError,
            "rm_error" => MessageType::RmError,
            "errors" => MessageType::Errors,
            _ => MessageType::Other(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single text frame on the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Topic the message belongs to (empty for control messages).
    #[serde(default)]
    pub topic: String,
    /// Opaque payload, omitted on the wire when null.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ChannelMessage {
    /// Creates a new message.
    pub fn new(message_type: MessageType, topic: impl Into<String>, data: Value) -> Self {
        Self {
            message_type,
            topic: topic.into(),
            data,
        }
    }

    /// Creates a validation response carrying `answer`.
    pub fn validation(answer: String) -> Self {
        Self::new(MessageType::Validation, "", Value::String(answer))
    }

    /// Creates a heartbeat message.
    pub fn heartbeat(data: HeartbeatData) -> Self {
        Self::new(
            MessageType::Heartbeat,
            "",
            serde_json::to_value(data).unwrap_or(Value::Null),
        )
    }

    /// Serializes to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String, ChannelError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses an inbound JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, ChannelError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns the correlation id carried by the payload, if any.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        correlation_id(&self.data)
    }

    /// Returns the key this message resolves or registers under.
    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.message_type, &self.topic, self.correlation_id())
    }

    /// Returns the `data` field as text when it is a string.
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_str()
    }
}

/// Identifier that pairs a reply with its request.
///
/// Numeric and string ids are normalized to their text form, so `42` and
/// `"42"` correlate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Returns the normalized id text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extracts the correlation id from a message payload.
///
/// Precedence: `payload.uuid`, then `payload.header.identity.id`, else none.
pub fn correlation_id(payload: &Value) -> Option<CorrelationId> {
    payload
        .get("uuid")
        .and_then(CorrelationId::from_value)
        .or_else(|| {
            payload
                .pointer("/header/identity/id")
                .and_then(CorrelationId::from_value)
        })
}

/// Key of a pending request: `(type class, topic, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Correlation class of the message type.
    pub class: MessageType,
    /// Topic.
    pub topic: String,
    /// Correlation id, absent for fire-and-forget messages.
    pub id: Option<CorrelationId>,
}

impl CorrelationKey {
    /// Builds a key from a message type, topic and optional id.
    pub fn new(message_type: &MessageType, topic: &str, id: Option<CorrelationId>) -> Self {
        Self {
            class: message_type.correlation_class(),
            topic: topic.to_string(),
            id,
        }
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{} $ {} $ {}", self.class, self.topic, id),
            None => write!(f, "{} $ {}", self.class, self.topic),
        }
    }
}

/// Payload of a heartbeat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatData {
    /// Local time formatted as `YYYY-MM-DD HH:MM:SS`.
    #[serde(rename = "timeInStr")]
    pub time_in_str: String,
    /// Unix epoch seconds.
    #[serde(rename = "timeInNum")]
    pub time_in_num: i64,
}

/// Identity block of a request header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdentity {
    /// Per-request id, unique within the channel's lifetime.
    pub id: i64,
    /// Command identifier from the device's API catalog.
    pub api_id: u32,
}

/// Optional scheduling policy of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPolicy {
    /// Device-side priority.
    pub priority: i32,
}

/// Header of a request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Request identity.
    pub identity: RequestIdentity,
    /// Optional policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<RequestPolicy>,
}

/// Payload of a `req` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Request header.
    pub header: RequestHeader,
    /// Command parameter as JSON text (empty when there is none).
    pub parameter: String,
}

impl RequestPayload {
    /// Builds a request payload; `parameter` is embedded as JSON text.
    pub fn new(id: i64, api_id: u32, parameter: Option<&Value>) -> Self {
        Self {
            header: RequestHeader {
                identity: RequestIdentity { id, api_id },
                policy: None,
            },
            parameter: parameter
                .filter(|p| !p.is_null())
                .map(|p| p.to_string())
                .unwrap_or_default(),
        }
    }

    /// Sets the request priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.header.policy = Some(RequestPolicy { priority });
        self
    }
}
