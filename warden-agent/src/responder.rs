//! Heartbeat answers and lifecycle messages of the agent
//!
//! Pure message handling: every function returns what to publish, the
//! caller owns the transport.

use crate::config::AgentConfig;
use tracing::{debug, warn};
use warden_messages::{
    AlertType, Envelope, HeartbeatBody, HeartbeatSubtype, InboundMessage, Message, MessageBody,
    MessageCodec, MessageError, RegisterBody,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: String,
}

pub struct Responder {
    name: String,
    node: String,
    id: String,
    reply_topic: String,
    registration_topic: String,
    alert_topic: String,
    codec: MessageCodec,
    registration: RegisterBody,
}

impl Responder {
    pub fn new(config: &AgentConfig) -> Self {
        let component = &config.component;
        Self {
            name: component.name.clone(),
            node: component.node.clone(),
            id: config.component_id(),
            reply_topic: config.topics.reply.clone(),
            registration_topic: config.topics.registration.clone(),
            alert_topic: config.topics.alerts.clone(),
            codec: MessageCodec::new(config.sentinel.clone()),
            registration: RegisterBody {
                topic: Some(config.probe_topic()),
                path: component.path.clone(),
                category: component.category,
                metadata: component.metadata.clone(),
                app_manager_name: component.app_manager_name.clone(),
                ..Default::default()
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn envelope(&self) -> Envelope {
        Envelope::new(self.name.as_str(), self.node.as_str())
    }

    fn encode(&self, topic: &str, message: &Message) -> Result<Outbound, MessageError> {
        Ok(Outbound { topic: topic.to_string(), payload: self.codec.serialize(message)? })
    }

    pub fn registration(&self) -> Result<Outbound, MessageError> {
        let message = Message::register(self.envelope(), self.registration.clone());
        self.encode(&self.registration_topic, &message)
    }

    pub fn unregistration(&self, reason: &str) -> Result<Outbound, MessageError> {
        self.encode(&self.registration_topic, &Message::unregister(self.envelope(), reason))
    }

    pub fn no_data_alert(&self, text: &str) -> Result<Outbound, MessageError> {
        let message = Message::alert(self.envelope(), AlertType::NoDataThresholdExceeded, text);
        self.encode(&self.alert_topic, &message)
    }

    /// Reply to a probe, if `inbound` is one addressed to this component.
    pub fn answer(&self, inbound: &InboundMessage) -> Option<Outbound> {
        let payload = inbound.payload.trim();
        if self.codec.is_sentinel(payload) {
            debug!("[responder] sentinel on {}, answering with plain id", inbound.topic);
            return Some(Outbound {
                topic: format!("{}/{}", self.reply_topic, self.id),
                payload: self.id.clone(),
            });
        }

        let message = match self.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("[responder] ignoring payload on {}: {}", inbound.topic, e);
                return None;
            }
        };
        let MessageBody::Heartbeat(heartbeat) = &message.body else {
            return None;
        };
        if heartbeat.subtype != HeartbeatSubtype::Request {
            return None;
        }
        if let Some(target) = heartbeat.target_component_id.as_deref() {
            if target != self.id && target != self.name {
                debug!("[responder] request for {} ignored", target);
                return None;
            }
        }

        let response = Message::heartbeat(
            self.envelope(),
            HeartbeatBody::response().with_message("OK").with_target(self.id.as_str()),
        );
        match self.encode(&self.reply_topic, &response) {
            Ok(outbound) => Some(outbound),
            Err(e) => {
                warn!("[responder] cannot encode response: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_devkit::MessageBuilder;

    fn responder() -> Responder {
        let mut config = AgentConfig::default();
        config.component.name = "ingest".into();
        config.component.node = "node7".into();
        config.component.path = Some("/opt/ingest/bin/ingest".into());
        Responder::new(&config)
    }

    #[test]
    fn request_for_this_component_gets_a_response() {
        let responder = responder();
        let probe = InboundMessage::new(
            "warden/components/node7-ingest",
            MessageBuilder::heartbeat_request("warden", "localhost", "node7-ingest"),
        );

        let reply = responder.answer(&probe).unwrap();
        assert_eq!(reply.topic, "warden/heartbeat");
        let message = MessageCodec::default().decode(&reply.payload).unwrap();
        assert_eq!(message.envelope.sender_id(), "node7-ingest");
        let body = message.as_heartbeat().unwrap();
        assert_eq!(body.subtype, HeartbeatSubtype::Response);
        assert_eq!(body.target_component_id.as_deref(), Some("node7-ingest"));
    }

    #[test]
    fn request_for_another_component_is_ignored() {
        let probe = InboundMessage::new("t", MessageBuilder::heartbeat_request("warden", "localhost", "node7-other"));
        assert!(responder().answer(&probe).is_none());

        let response = InboundMessage::new("t", MessageBuilder::heartbeat_response("warden", "localhost"));
        assert!(responder().answer(&response).is_none());
    }

    #[test]
    fn sentinel_is_answered_with_plain_id() {
        let probe = InboundMessage::new("warden/components/node7-ingest", "HEARTBEAT\n");
        let reply = responder().answer(&probe).unwrap();
        assert_eq!(reply.topic, "warden/heartbeat/node7-ingest");
        assert_eq!(reply.payload, "node7-ingest");
    }

    #[test]
    fn registration_describes_the_component() {
        let outbound = responder().registration().unwrap();
        assert_eq!(outbound.topic, "warden/register");

        let message = MessageCodec::default().decode(&outbound.payload).unwrap();
        let MessageBody::Register(body) = message.body else {
            panic!("expected a register body");
        };
        assert_eq!(body.topic.as_deref(), Some("warden/components/node7-ingest"));
        assert_eq!(body.path.as_deref(), Some("/opt/ingest/bin/ingest"));
    }

    #[test]
    fn no_data_alert_is_typed() {
        let outbound = responder().no_data_alert("no data for 10m").unwrap();
        let message = MessageCodec::default().decode(&outbound.payload).unwrap();
        let MessageBody::Alert(alert) = message.body else {
            panic!("expected an alert body");
        };
        assert_eq!(alert.alert_type, AlertType::NoDataThresholdExceeded);
        assert_eq!(outbound.topic, "warden/alerts");
    }
}
