/**
 * HEALTH - Compteurs du kernel et publication périodique de son état
 *
 * RÔLE : Compteurs atomiques alimentés par le heartbeat manager, snapshot
 * `KernelHealth` publié en JSON sur le bus.
 */

use crate::heartbeat::LastHeardTable;
use crate::registry::ComponentRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use warden_messages::{LinkStats, SharedTransport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub components_registered: usize,
    pub components_tracked: usize,
    pub components_on_alert: usize,
    pub probes_sent: u64,
    pub probe_failures: u64,
    pub alerts: u64,
    pub reminders: u64,
    pub recoveries: u64,
    pub remediations: u64,
    pub component_alerts: u64,
    pub inbound_dropped: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

/// Counters shared by the manager and the loops.
#[derive(Debug)]
pub struct HealthStats {
    start_time: Instant,
    probes_sent: AtomicU64,
    probe_failures: AtomicU64,
    alerts: AtomicU64,
    reminders: AtomicU64,
    recoveries: AtomicU64,
    remediations: AtomicU64,
    component_alerts: AtomicU64,
    inbound_dropped: AtomicU64,
    link: Option<Arc<LinkStats>>,
}

impl Default for HealthStats {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HealthStats {
    pub fn new(link: Option<Arc<LinkStats>>) -> Self {
        Self {
            start_time: Instant::now(),
            probes_sent: AtomicU64::new(0),
            probe_failures: AtomicU64::new(0),
            alerts: AtomicU64::new(0),
            reminders: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            remediations: AtomicU64::new(0),
            component_alerts: AtomicU64::new(0),
            inbound_dropped: AtomicU64::new(0),
            link,
        }
    }

    pub fn record_probe(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert(&self) {
        self.alerts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reminder(&self) {
        self.reminders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remediation(&self) {
        self.remediations.fetch_add(1, Ordering::Relaxed);
    }

    /// Alert message received from a component
    pub fn record_component_alert(&self) {
        self.component_alerts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probe_failures(&self) -> u64 {
        self.probe_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, registry: &ComponentRegistry, last_heard: &LastHeardTable) -> KernelHealth {
        let (mqtt_status, mqtt_reconnects) = match &self.link {
            Some(link) => (link.status().to_string(), link.reconnects()),
            None => ("n/a".to_string(), 0),
        };
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components_registered: registry.count(),
            components_tracked: last_heard.len(),
            components_on_alert: registry.count_on_alert(),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
            reminders: self.reminders.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            remediations: self.remediations.load(Ordering::Relaxed),
            component_alerts: self.component_alerts.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            mqtt_status,
            mqtt_reconnects,
        }
    }
}

/// Publishes the kernel health snapshot on `topic` until shutdown is signalled.
pub fn spawn_health_publisher(
    stats: Arc<HealthStats>,
    registry: Arc<ComponentRegistry>,
    last_heard: Arc<LastHeardTable>,
    transport: SharedTransport,
    topic: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let health = stats.snapshot(&registry, &last_heard);
                    match serde_json::to_string(&health) {
                        Ok(payload) => match transport.publish(&topic, &payload) {
                            Ok(()) => debug!(
                                "[health] published (uptime: {}s, on alert: {})",
                                health.uptime_seconds, health.components_on_alert
                            ),
                            Err(e) => warn!("[health] failed to publish: {}", e),
                        },
                        Err(e) => warn!("[health] failed to encode: {}", e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::MonitoredComponent;
    use warden_devkit::MockTransport;

    #[test]
    fn snapshot_reflects_counters_and_registry() {
        let stats = HealthStats::default();
        let registry = ComponentRegistry::default();
        let table = LastHeardTable::new();
        registry.register(MonitoredComponent::new("a", "n")).unwrap();
        registry.mark_alert("n-a", 1).unwrap();
        table.record("n-a", 1);

        stats.record_probe();
        stats.record_probe();
        stats.record_probe_failure();
        stats.record_alert();

        let health = stats.snapshot(&registry, &table);
        assert_eq!(health.components_registered, 1);
        assert_eq!(health.components_tracked, 1);
        assert_eq!(health.components_on_alert, 1);
        assert_eq!(health.probes_sent, 2);
        assert_eq!(health.probe_failures, 1);
        assert_eq!(health.alerts, 1);
        assert_eq!(health.mqtt_status, "n/a");
    }

    #[tokio::test]
    async fn publisher_stops_on_shutdown() {
        let transport = MockTransport::new();
        let (tx, rx) = watch::channel(false);
        let handle = spawn_health_publisher(
            Arc::new(HealthStats::default()),
            Arc::new(ComponentRegistry::default()),
            Arc::new(LastHeardTable::new()),
            Arc::new(transport.clone()),
            "warden/kernel/health".into(),
            Duration::from_millis(10),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(35)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let published = transport.find_messages_by_topic("warden/kernel/health");
        assert!(!published.is_empty());
        let health: KernelHealth = serde_json::from_str(&published[0].payload).unwrap();
        assert_eq!(health.components_registered, 0);
    }
}
