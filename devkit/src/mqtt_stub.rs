/*!
Mock transport for tests without a broker

Records every published payload and lets a test push inbound messages into
the same channel a real `MqttTransport` would feed.
*/

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use warden_messages::{
    AlertType, Envelope, HeartbeatBody, InboundMessage, Message, MessageCodec, RegisterBody,
    Transport, TransportError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
}

/// In-memory `Transport` recording publishes and subscriptions.
#[derive(Clone, Default)]
pub struct MockTransport {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>>,
    fail_publishes: Arc<AtomicBool>,
    disconnected: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel receiving simulated inbound messages
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        rx
    }

    pub fn simulate_incoming(&self, topic: impl Into<String>, payload: impl Into<String>) -> Result<()> {
        let message = InboundMessage::new(topic, payload);
        debug!("[mock] simulated inbound on {}", message.topic);
        match self.inbound.lock().as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|e| anyhow::anyhow!("inbound channel closed: {}", e)),
            None => anyhow::bail!("setup_receiver() was not called"),
        }
    }

    /// Makes every following publish fail (or succeed again).
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::Relaxed);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Decodes every payload published on `topic`, skipping non-protocol payloads.
    pub fn decoded_on(&self, topic: &str) -> Vec<Message> {
        let codec = MessageCodec::default();
        self.find_messages_by_topic(topic)
            .iter()
            .filter_map(|msg| codec.parse(&msg.payload))
            .collect()
    }

    pub fn last_json_on(&self, topic: &str) -> Result<Option<serde_json::Value>> {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_str(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published.lock().clear();
        self.subscriptions.lock().clear();
    }
}

impl Transport for MockTransport {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        if self.fail_publishes.load(Ordering::Relaxed) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "mock failure".into(),
            });
        }
        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        debug!("[mock] published {} bytes to {}", payload.len(), topic);
        Ok(())
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        self.subscriptions.lock().extend(topics.iter().cloned());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::Relaxed)
    }
}

/// Wire payloads as components put them on the bus.
pub struct MessageBuilder;

impl MessageBuilder {
    fn encode(message: &Message) -> String {
        // builders only produce encodable bodies
        MessageCodec::default().serialize(message).unwrap_or_default()
    }

    pub fn heartbeat_response(name: &str, node: &str) -> String {
        Self::encode(&Message::heartbeat(
            Envelope::new(name, node),
            HeartbeatBody::response().with_message("OK"),
        ))
    }

    pub fn heartbeat_request(name: &str, node: &str, target: &str) -> String {
        Self::encode(&Message::heartbeat(Envelope::new(name, node), HeartbeatBody::request(target)))
    }

    pub fn register(name: &str, node: &str, topic: &str) -> String {
        Self::encode(&Message::register(
            Envelope::new(name, node),
            RegisterBody { topic: Some(topic.to_string()), ..Default::default() },
        ))
    }

    pub fn unregister(name: &str, node: &str, reason: &str) -> String {
        Self::encode(&Message::unregister(Envelope::new(name, node), reason))
    }

    pub fn alert(name: &str, node: &str, alert_type: AlertType, text: &str) -> String {
        Self::encode(&Message::alert(Envelope::new(name, node), alert_type, text))
    }

    pub fn legacy_sentinel() -> String {
        warden_messages::DEFAULT_SENTINEL.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_messages::{HeartbeatSubtype, MessageKind};

    #[test]
    fn records_publishes_and_subscriptions() {
        let transport = MockTransport::new();
        transport.subscribe(&["a/b".to_string()]).unwrap();
        transport.publish("a/b", "payload").unwrap();

        assert_eq!(transport.subscriptions(), vec!["a/b"]);
        assert_eq!(transport.find_messages_by_topic("a/b").len(), 1);
        assert!(transport.find_messages_by_topic("c").is_empty());
    }

    #[test]
    fn failing_mode_rejects_publish() {
        let transport = MockTransport::new();
        transport.fail_publishes(true);
        assert!(transport.publish("a", "x").is_err());
        assert!(transport.published().is_empty());

        transport.fail_publishes(false);
        assert!(transport.publish("a", "x").is_ok());
    }

    #[tokio::test]
    async fn simulated_inbound_reaches_receiver() {
        let transport = MockTransport::new();
        let mut rx = transport.setup_receiver();

        transport.simulate_incoming("warden/heartbeat", "HEARTBEAT").unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, "HEARTBEAT");
    }

    #[test]
    fn builders_produce_decodable_messages() {
        let codec = MessageCodec::default();

        let response = codec.parse(&MessageBuilder::heartbeat_response("ingest", "node7")).unwrap();
        assert_eq!(response.as_heartbeat().unwrap().subtype, HeartbeatSubtype::Response);

        let register = codec.parse(&MessageBuilder::register("ingest", "node7", "t")).unwrap();
        assert_eq!(register.kind(), MessageKind::Register);
    }
}
