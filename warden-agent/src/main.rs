//! Warden Agent - component-side sidecar
//!
//! Runs next to a supervised component and speaks the warden protocol for it:
//! - Registers the component and keeps the registration fresh
//! - Answers heartbeat probes (structured and plain-text sentinel)
//! - Raises a no-data alert when watched data topics go quiet

mod config;
mod responder;
mod watchdog;

use anyhow::{Context, Result};
use config::AgentConfig;
use responder::{Outbound, Responder};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use warden_messages::{now_millis, topics, InboundMessage, MqttSettings, MqttTransport, Transport};
use watchdog::DataWatchdog;

fn publish(transport: &dyn Transport, outbound: Result<Outbound, warden_messages::MessageError>) {
    match outbound {
        Ok(outbound) => {
            if let Err(e) = transport.publish(&outbound.topic, &outbound.payload) {
                warn!("[agent] publish to {} failed: {}", outbound.topic, e);
            }
        }
        Err(e) => warn!("[agent] cannot encode message: {}", e),
    }
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

struct Agent {
    config: AgentConfig,
    responder: Responder,
    watchdog: Option<DataWatchdog>,
}

impl Agent {
    fn new(config: AgentConfig) -> Self {
        let responder = Responder::new(&config);
        let watchdog = (!config.watch.data_topics.is_empty())
            .then(|| DataWatchdog::new(config.no_data_threshold(), now_millis()));
        Self { config, responder, watchdog }
    }

    fn handle(&mut self, transport: &dyn Transport, inbound: &InboundMessage) {
        let watched = &self.config.watch.data_topics;
        if watched.iter().any(|filter| topics::filter_matches(filter, &inbound.topic)) {
            if let Some(watchdog) = self.watchdog.as_mut() {
                watchdog.record_data(now_millis());
            }
            return;
        }
        if let Some(reply) = self.responder.answer(inbound) {
            debug!("[agent] answering probe on {}", reply.topic);
            publish(transport, Ok(reply));
        }
    }

    fn check_data(&mut self, transport: &dyn Transport) {
        let Some(silence) = self.watchdog.as_mut().and_then(|w| w.check_at(now_millis())) else {
            return;
        };
        let text = format!(
            "No data on {} for {}s (last data at {})",
            self.config.watch.data_topics.join(", "),
            silence.silent_for_ms / 1000,
            format_millis(silence.last_data)
        );
        warn!("[agent] {}", text);
        publish(transport, self.responder.no_data_alert(&text));
    }

    async fn run(mut self) -> Result<()> {
        let settings = MqttSettings { client_id: self.config.client_id(), ..self.config.mqtt.clone() };
        let (transport, mut inbound_rx) = MqttTransport::connect(&settings);

        let mut subscriptions = vec![self.config.probe_topic()];
        subscriptions.extend(self.config.watch.data_topics.iter().cloned());
        transport.subscribe(&subscriptions).context("subscribe failed")?;

        info!("[agent] {} registering", self.responder.id());
        publish(&transport, self.responder.registration());

        let mut reregister = interval(self.config.reregister_interval());
        reregister.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reregister.tick().await;
        let mut data_check = interval(self.config.check_interval());
        data_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = inbound_rx.recv() => match maybe {
                    Some(inbound) => self.handle(&transport, &inbound),
                    None => {
                        warn!("[agent] transport closed");
                        break;
                    }
                },
                _ = reregister.tick() => publish(&transport, self.responder.registration()),
                _ = data_check.tick() => self.check_data(&transport),
                _ = tokio::signal::ctrl_c() => {
                    info!("[agent] shutdown requested");
                    break;
                }
            }
        }

        if self.config.unregister_on_exit {
            publish(&transport, self.responder.unregistration("agent shutdown"));
            // the event loop needs a moment to flush the queued publish
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warden_agent=info,warden_messages=info")),
        )
        .init();

    let (config, path) = AgentConfig::load().context("failed to load agent configuration")?;
    info!("[agent] warden agent starting ({})", path.display());

    Agent::new(config).run().await.context("agent execution failed")
}
