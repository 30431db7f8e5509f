//! Typed message envelope and its JSON wire form
//!
//! Every message is one flat JSON object:
//! `{"kind", "name", "node", "timestamp", "protocolVersion", "body"}`.
//! Older components that only know the plain-text sentinel (`HEARTBEAT`) are
//! accepted as a heartbeat request without an envelope.

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use time::OffsetDateTime;

pub const PROTOCOL_VERSION: &str = "1.0";
/// Protocol version stamped on messages decoded from the plain-text sentinel
pub const LEGACY_PROTOCOL_VERSION: &str = "legacy";
pub const DEFAULT_SENTINEL: &str = "HEARTBEAT";

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("missing message kind")]
    MissingKind,
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
    #[error("missing envelope field: {0}")]
    MissingField(&'static str),
    #[error("invalid {kind} body: {source}")]
    InvalidBody {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Register,
    Unregister,
    Heartbeat,
    Alert,
    /// Reserved, carried but not handled
    Status,
    /// Reserved, carried but not handled
    Control,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Register,
        MessageKind::Unregister,
        MessageKind::Heartbeat,
        MessageKind::Alert,
        MessageKind::Status,
        MessageKind::Control,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Register => "register",
            MessageKind::Unregister => "unregister",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Alert => "alert",
            MessageKind::Status => "status",
            MessageKind::Control => "control",
        }
    }

    /// Case-insensitive lookup.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// lowercase, separators dropped: "Integration_Consumer" == "integration-consumer"
fn normalized(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Descriptive tag of a monitored component. No behavioral effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Category {
    Integration,
    IntegrationConsumer,
    IntegrationConsumerArchiver,
    IntegrationProducer,
    IntegrationBridge,
    Standalone,
    #[default]
    Unknown,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Integration,
        Category::IntegrationConsumer,
        Category::IntegrationConsumerArchiver,
        Category::IntegrationProducer,
        Category::IntegrationBridge,
        Category::Standalone,
        Category::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Integration => "integration",
            Category::IntegrationConsumer => "integration_consumer",
            Category::IntegrationConsumerArchiver => "integration_consumer_archiver",
            Category::IntegrationProducer => "integration_producer",
            Category::IntegrationBridge => "integration_bridge",
            Category::Standalone => "standalone",
            Category::Unknown => "unknown",
        }
    }

    /// Lenient lookup, anything unrecognized is `Unknown`.
    pub fn from_name(name: &str) -> Self {
        let wanted = normalized(name);
        Self::ALL
            .into_iter()
            .find(|category| normalized(category.as_str()) == wanted)
            .unwrap_or_default()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|name| Category::from_name(&name)).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AlertType {
    NoDataThresholdExceeded,
    NoHeartbeatExceeded,
    #[default]
    Undefined,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::NoDataThresholdExceeded => "NO_DATA_THRESHOLD_EXCEEDED",
            AlertType::NoHeartbeatExceeded => "NO_HEARTBEAT_EXCEEDED",
            AlertType::Undefined => "UNDEFINED",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match normalized(name).as_str() {
            "nodatathresholdexceeded" => AlertType::NoDataThresholdExceeded,
            "noheartbeatexceeded" => AlertType::NoHeartbeatExceeded,
            _ => AlertType::Undefined,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AlertType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AlertType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|name| AlertType::from_name(&name)).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatSubtype {
    Request,
    Response,
}

impl HeartbeatSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatSubtype::Request => "request",
            HeartbeatSubtype::Response => "response",
        }
    }
}

impl Serialize for HeartbeatSubtype {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HeartbeatSubtype {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "request" => Ok(HeartbeatSubtype::Request),
            "response" => Ok(HeartbeatSubtype::Response),
            other => Err(de::Error::unknown_variant(other, &["request", "response"])),
        }
    }
}

// Older senders write flags as strings or null
fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(flag),
        Some(Value::String(text)) => Ok(text.trim().eq_ignore_ascii_case("true")),
        Some(other) => Err(de::Error::custom(format!("invalid flag: {other}"))),
    }
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| de::Error::custom("timestamp out of range")),
        Some(Value::String(text)) => text.trim().parse::<i64>().map(Some).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!("invalid timestamp: {other}"))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub topic: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub category: Category,
    pub metadata: Option<String>,
    pub app_manager_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub jmx_enabled: bool,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub is_managed_app: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterBody {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBody {
    pub subtype: HeartbeatSubtype,
    pub message: Option<String>,
    pub target_component_id: Option<String>,
}

impl HeartbeatBody {
    pub fn request(target_component_id: impl Into<String>) -> Self {
        Self {
            subtype: HeartbeatSubtype::Request,
            message: None,
            target_component_id: Some(target_component_id.into()),
        }
    }

    pub fn response() -> Self {
        Self {
            subtype: HeartbeatSubtype::Response,
            message: None,
            target_component_id: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_target(mut self, target_component_id: impl Into<String>) -> Self {
        self.target_component_id = Some(target_component_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertBody {
    pub message: Option<String>,
    #[serde(default)]
    pub alert_type: AlertType,
}

/// Fields common to every message kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub name: String,
    pub node: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub protocol_version: String,
}

impl Envelope {
    /// Envelope stamped with the current time and protocol version.
    pub fn new(name: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            timestamp: now_millis(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Compound id of the sender (`node-name`).
    pub fn sender_id(&self) -> String {
        format!("{}-{}", self.node, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Register(RegisterBody),
    Unregister(UnregisterBody),
    Heartbeat(HeartbeatBody),
    Alert(AlertBody),
    Status(Value),
    Control(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub envelope: Envelope,
    pub body: MessageBody,
    /// Set only when decoded from the plain-text sentinel
    legacy: bool,
}

impl Message {
    pub fn heartbeat(envelope: Envelope, body: HeartbeatBody) -> Self {
        Self { envelope, body: MessageBody::Heartbeat(body), legacy: false }
    }

    pub fn register(envelope: Envelope, body: RegisterBody) -> Self {
        Self { envelope, body: MessageBody::Register(body), legacy: false }
    }

    pub fn unregister(envelope: Envelope, reason: impl Into<String>) -> Self {
        Self {
            envelope,
            body: MessageBody::Unregister(UnregisterBody { reason: Some(reason.into()) }),
            legacy: false,
        }
    }

    pub fn alert(envelope: Envelope, alert_type: AlertType, message: impl Into<String>) -> Self {
        Self {
            envelope,
            body: MessageBody::Alert(AlertBody { message: Some(message.into()), alert_type }),
            legacy: false,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match &self.body {
            MessageBody::Register(_) => MessageKind::Register,
            MessageBody::Unregister(_) => MessageKind::Unregister,
            MessageBody::Heartbeat(_) => MessageKind::Heartbeat,
            MessageBody::Alert(_) => MessageKind::Alert,
            MessageBody::Status(_) => MessageKind::Status,
            MessageBody::Control(_) => MessageKind::Control,
        }
    }

    /// True for a heartbeat decoded from the plain-text sentinel. The
    /// `protocolVersion` a sender writes has no bearing on this.
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn as_heartbeat(&self) -> Option<&HeartbeatBody> {
        match &self.body {
            MessageBody::Heartbeat(body) => Some(body),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    node: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<i64>,
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    body: Value,
}

fn decode_body<T: DeserializeOwned>(kind: MessageKind, body: Value) -> Result<T, MessageError> {
    let body = if body.is_null() { Value::Object(Default::default()) } else { body };
    serde_json::from_value(body).map_err(|source| MessageError::InvalidBody { kind, source })
}

fn required(field: Option<String>, name: &'static str) -> Result<String, MessageError> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(MessageError::MissingField(name)),
    }
}

/// Encoder/decoder for the wire format, configured with the legacy sentinel.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    sentinel: String,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SENTINEL)
    }
}

impl MessageCodec {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self { sentinel: sentinel.into() }
    }

    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    pub fn is_sentinel(&self, text: &str) -> bool {
        !self.sentinel.is_empty() && text.trim() == self.sentinel
    }

    /// Decodes `text`, `None` on anything that is not a valid message.
    pub fn parse(&self, text: &str) -> Option<Message> {
        self.decode(text).ok()
    }

    /// Decodes `text`, reporting why it was rejected.
    pub fn decode(&self, text: &str) -> Result<Message, MessageError> {
        let wire: WireMessage = match serde_json::from_str(text) {
            Ok(wire) => wire,
            Err(_) if self.is_sentinel(text) => return Ok(self.legacy_heartbeat()),
            Err(e) => return Err(MessageError::Malformed(e)),
        };

        let raw_kind = wire.kind.ok_or(MessageError::MissingKind)?;
        let kind = MessageKind::from_name(&raw_kind).ok_or(MessageError::UnknownKind(raw_kind))?;

        let envelope = Envelope {
            name: required(wire.name, "name")?,
            node: required(wire.node, "node")?,
            timestamp: wire.timestamp.unwrap_or(0),
            protocol_version: wire
                .protocol_version
                .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
        };

        let body = match kind {
            MessageKind::Register => MessageBody::Register(decode_body(kind, wire.body)?),
            MessageKind::Unregister => MessageBody::Unregister(decode_body(kind, wire.body)?),
            MessageKind::Heartbeat => MessageBody::Heartbeat(decode_body(kind, wire.body)?),
            MessageKind::Alert => MessageBody::Alert(decode_body(kind, wire.body)?),
            MessageKind::Status => MessageBody::Status(wire.body),
            MessageKind::Control => MessageBody::Control(wire.body),
        };

        Ok(Message { envelope, body, legacy: false })
    }

    pub fn serialize(&self, message: &Message) -> Result<String, MessageError> {
        let body = match &message.body {
            MessageBody::Register(body) => serde_json::to_value(body),
            MessageBody::Unregister(body) => serde_json::to_value(body),
            MessageBody::Heartbeat(body) => serde_json::to_value(body),
            MessageBody::Alert(body) => serde_json::to_value(body),
            MessageBody::Status(value) | MessageBody::Control(value) => Ok(value.clone()),
        }
        .map_err(MessageError::Encode)?;

        let wire = WireMessage {
            kind: Some(message.kind().as_str().to_string()),
            name: Some(message.envelope.name.clone()),
            node: Some(message.envelope.node.clone()),
            timestamp: Some(message.envelope.timestamp),
            protocol_version: Some(message.envelope.protocol_version.clone()),
            body,
        };
        serde_json::to_string(&wire).map_err(MessageError::Encode)
    }

    fn legacy_heartbeat(&self) -> Message {
        Message {
            envelope: Envelope {
                name: String::new(),
                node: String::new(),
                timestamp: now_millis(),
                protocol_version: LEGACY_PROTOCOL_VERSION.to_string(),
            },
            body: MessageBody::Heartbeat(HeartbeatBody {
                subtype: HeartbeatSubtype::Request,
                message: Some(self.sentinel.clone()),
                target_component_id: None,
            }),
            legacy: true,
        }
    }
}
