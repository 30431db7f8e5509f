//! Warden messages - wire protocol shared by the kernel and component agents
//!
//! - Typed envelope for register / unregister / heartbeat / alert messages
//! - Legacy plain-text heartbeat sentinel for older components
//! - Publish/subscribe transport abstraction with an MQTT implementation

pub mod message;
pub mod mqtt;
pub mod topics;
pub mod transport;

pub use message::{
    now_millis, AlertBody, AlertType, Category, Envelope, HeartbeatBody, HeartbeatSubtype, Message,
    MessageBody, MessageCodec, MessageError, MessageKind, RegisterBody, UnregisterBody,
    DEFAULT_SENTINEL, LEGACY_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use mqtt::{LinkStats, MqttSettings, MqttTransport};
pub use transport::{InboundMessage, SharedTransport, Transport, TransportError};
