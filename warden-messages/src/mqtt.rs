//! MQTT transport on top of rumqttc
//!
//! - One spawned task drives the event loop for the whole process
//! - Subscriptions are remembered and replayed on every ConnAck
//! - Inbound UTF-8 publishes are forwarded on an unbounded channel

use crate::transport::{InboundMessage, Transport, TransportError};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Request channel capacity of the rumqttc client
    pub capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "warden-kernel".into(),
            keep_alive_secs: 15,
            capacity: 64,
        }
    }
}

/// Connection state of the bus link, read by health reporting.
#[derive(Debug, Default)]
pub struct LinkStats {
    connected: AtomicBool,
    reconnects: AtomicU32,
}

impl LinkStats {
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    pub fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> &'static str {
        if self.is_connected() {
            "connected"
        } else if self.reconnects() > 0 {
            "reconnecting"
        } else {
            "connecting"
        }
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    topics: Arc<Mutex<Vec<String>>>,
    link: Arc<LinkStats>,
}

impl MqttTransport {
    /// Creates the client and spawns its event loop. Must be called inside a tokio runtime.
    pub fn connect(settings: &MqttSettings) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        opts.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));

        let (client, eventloop) = AsyncClient::new(opts, settings.capacity.max(1));
        let (tx, rx) = mpsc::unbounded_channel();
        let topics = Arc::new(Mutex::new(Vec::new()));
        let link = Arc::new(LinkStats::default());

        info!(
            "connecting to mqtt://{}:{} as {}",
            settings.host, settings.port, settings.client_id
        );
        tokio::spawn(drive_eventloop(
            eventloop,
            client.clone(),
            topics.clone(),
            link.clone(),
            tx,
        ));

        (Self { client, topics, link }, rx)
    }

    pub fn link(&self) -> Arc<LinkStats> {
        self.link.clone()
    }
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .map_err(|e| TransportError::Publish { topic: topic.to_string(), reason: e.to_string() })
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), TransportError> {
        {
            let mut known = self.topics.lock();
            for topic in topics {
                if !known.contains(topic) {
                    known.push(topic.clone());
                }
            }
        }
        for topic in topics {
            self.client
                .try_subscribe(topic.as_str(), QoS::AtLeastOnce)
                .map_err(|e| TransportError::Subscribe { topic: topic.clone(), reason: e.to_string() })?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

async fn drive_eventloop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Arc<Mutex<Vec<String>>>,
    link: Arc<LinkStats>,
    tx: mpsc::UnboundedSender<InboundMessage>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                link.mark_connected();
                let known = topics.lock().clone();
                info!("mqtt connected, subscribing {} topic(s)", known.len());
                for topic in known {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!("resubscribe to {} failed: {}", topic, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match String::from_utf8(publish.payload.to_vec()) {
                    Ok(payload) => {
                        let inbound = InboundMessage { topic: publish.topic.clone(), payload };
                        if tx.send(inbound).is_err() {
                            debug!("inbound receiver dropped, stopping mqtt loop");
                            break;
                        }
                    }
                    Err(_) => warn!("non UTF-8 payload on {}, dropped", publish.topic),
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt connection error: {}", e);
                link.mark_disconnected();
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_status_follows_connection() {
        let link = LinkStats::default();
        assert_eq!(link.status(), "connecting");

        link.mark_connected();
        assert_eq!(link.status(), "connected");

        link.mark_disconnected();
        link.mark_disconnected();
        assert_eq!(link.status(), "reconnecting");
        assert_eq!(link.reconnects(), 1);
    }

    #[test]
    fn settings_default_to_local_broker() {
        let settings: MqttSettings = serde_json::from_str(r#"{"host":"bus.lan"}"#).unwrap();
        assert_eq!(settings.host, "bus.lan");
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.keep_alive_secs, 15);
    }
}
