//! Publish/subscribe transport seen by the kernel and the agents.
//!
//! Publishing is non-blocking: a transport queues the payload and reports
//! failure only when it cannot even enqueue it.

use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not connected")]
    Disconnected,
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// One message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { topic: topic.into(), payload: payload.into() }
    }

    /// Last non-empty topic segment, which plain-text senders use to name themselves
    /// (`warden/heartbeat/node7-ingest` -> `node7-ingest`).
    pub fn sender_hint(&self) -> Option<&str> {
        self.topic.rsplit('/').find(|segment| !segment.is_empty())
    }
}

pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError>;

    fn subscribe(&self, topics: &[String]) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool {
        true
    }
}

pub type SharedTransport = Arc<dyn Transport>;
