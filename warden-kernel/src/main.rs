/**
 * WARDEN KERNEL - Point d'entrée du superviseur de heartbeats
 *
 * RÔLE : Assemble configuration, registry, persistance, MQTT, notifications
 * et actuator de remédiation, lance la découverte puis les boucles de
 * supervision jusqu'à ctrl-c.
 *
 * ORDRE DE DÉMARRAGE : baseline persistée -> liste d'enregistrement -> bus
 * -> découverte -> sondes et évaluations périodiques.
 */

mod actuator;
mod component;
mod config;
mod health;
mod heartbeat;
mod notify;
mod registry;
mod store;
mod tasks;

use crate::actuator::ScriptActuator;
use crate::config::{load_config, WardenConfig};
use crate::health::{spawn_health_publisher, HealthStats};
use crate::heartbeat::{Collaborators, HeartbeatManager, LastHeardTable};
use crate::notify::{BusEmailSink, LogSink, NotificationDispatcher};
use crate::registry::ComponentRegistry;
use crate::store::{ComponentStore, JsonFileStore, StoreListener};
use crate::tasks::Supervisor;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use warden_messages::{MessageCodec, MqttTransport, SharedTransport, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warden_kernel=info,warden_messages=info")),
        )
        .init();

    info!("[kernel] warden kernel starting");
    let config = load_config().context("failed to load configuration")?;
    run(config).await
}

async fn run(config: WardenConfig) -> Result<()> {
    let codec = MessageCodec::new(config.heartbeat.sentinel.clone());

    // registry, seeded from the persisted baseline
    let store: Arc<dyn ComponentStore> = Arc::new(JsonFileStore::new(&config.store.path));
    let baseline = store
        .load_all()
        .with_context(|| format!("failed to load component store {}", config.store.path.display()))?;
    let registry = Arc::new(ComponentRegistry::new(codec.clone()));
    let seeded = registry.seed(baseline);
    info!("[kernel] {} component(s) from the store", seeded);

    let last_heard = Arc::new(LastHeardTable::new());
    registry.subscribe(Arc::new(StoreListener::new(store)));
    registry.subscribe(last_heard.clone());

    if let Some(reglist) = &config.registration.reglist {
        if reglist.exists() {
            match registry.register_from_file(reglist) {
                Ok(added) => info!("[kernel] {} component(s) added from {}", added, reglist.display()),
                Err(e) => error!("[kernel] registration list import failed: {}", e),
            }
        } else {
            info!("[kernel] no registration list at {}", reglist.display());
        }
    }

    // bus
    let (mqtt, inbound_rx) = MqttTransport::connect(&config.mqtt);
    let link = mqtt.link();
    let transport: SharedTransport = Arc::new(mqtt);
    if let Err(e) = transport.subscribe(&config.heartbeat.inbound_topics) {
        warn!("[kernel] initial subscribe failed, retried on connect: {}", e);
    }

    // notifications
    let mut dispatcher = NotificationDispatcher::new(Duration::from_secs(config.notify.throttle_secs))
        .with_sink(Arc::new(LogSink));
    if let Some(topic) = &config.notify.topic {
        if config.notify.recipients.trim().is_empty() {
            warn!("[kernel] notify.recipients is empty, email relay disabled");
        } else {
            dispatcher = dispatcher.with_sink(Arc::new(BusEmailSink::new(
                transport.clone(),
                topic.clone(),
                config.notify.from.clone(),
            )));
        }
    }

    let actuator = ScriptActuator::new(config.lifecycle.clone()).context("invalid lifecycle configuration")?;
    let stats = Arc::new(HealthStats::new(Some(link)));

    let manager = Arc::new(HeartbeatManager::new(
        config.heartbeat_settings(),
        codec,
        Collaborators {
            registry: registry.clone(),
            last_heard: last_heard.clone(),
            transport: transport.clone(),
            notifier: Arc::new(dispatcher),
            actuator: Arc::new(actuator),
            stats: stats.clone(),
        },
    ));

    let mut supervisor = Supervisor::new(manager.clone());
    supervisor.spawn_inbound(inbound_rx);

    // discovery can take the whole grace period; ctrl-c still works meanwhile
    tokio::select! {
        report = manager.discover() => {
            info!("[kernel] supervising {} component(s) ({} answered discovery)",
                report.responded + report.seeded, report.responded);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("[kernel] interrupted during discovery");
            supervisor.shutdown(config.shutdown_grace()).await;
            return Ok(());
        }
    }

    supervisor.spawn_periodic();
    if let Some(topic) = &config.health.topic {
        let handle = spawn_health_publisher(
            stats,
            registry,
            last_heard,
            transport,
            topic.clone(),
            Duration::from_secs(config.health.interval_secs),
            supervisor.shutdown_signal(),
        );
        supervisor.track(handle);
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("[kernel] shutdown requested");
    if !supervisor.shutdown(config.shutdown_grace()).await {
        warn!("[kernel] some tasks were aborted at shutdown");
    }
    Ok(())
}
