/**
 * SUPERVISOR - Boucles de fond du kernel
 *
 * RÔLE : Dispatch des messages entrants, sondes et évaluations périodiques,
 * publication de santé, et arrêt ordonné de l'ensemble.
 *
 * ARRÊT : la remédiation cesse d'accepter du travail, puis les boucles voient
 * le signal et terminent leur passe, puis les remédiations en cours
 * disposent du reste du délai de grâce.
 */

use crate::heartbeat::{HeartbeatManager, InboundOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use warden_messages::InboundMessage;

pub struct Supervisor {
    manager: Arc<HeartbeatManager>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(manager: Arc<HeartbeatManager>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { manager, shutdown_tx, handles: Vec::new() }
    }

    /// Receiver for extra tasks that must stop with the supervisor.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Feeds every inbound message to the manager, one at a time.
    pub fn spawn_inbound(&mut self, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        let manager = self.manager.clone();
        let mut shutdown = self.shutdown_signal();

        self.track(tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(inbound) => {
                            match manager.handle_inbound(&inbound) {
                                InboundOutcome::Dropped(reason) => debug!("[supervisor] dropped message on {}: {}", inbound.topic, reason),
                                outcome => debug!("[supervisor] {} -> {:?}", inbound.topic, outcome),
                            }
                        }
                        None => {
                            warn!("[supervisor] inbound channel closed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("[supervisor] inbound loop stopped");
        }));
    }

    /// Probe and evaluation loops. The first probe goes out one interval
    /// after start, discovery having just probed everything.
    pub fn spawn_periodic(&mut self) {
        let probe_every = self.manager.settings().probe_interval;
        let evaluate_every = self.manager.settings().evaluation_interval;

        let manager = self.manager.clone();
        let mut shutdown = self.shutdown_signal();
        self.track(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + probe_every, probe_every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => { manager.probe(); }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("[supervisor] probe loop stopped");
        }));

        let manager = self.manager.clone();
        let mut shutdown = self.shutdown_signal();
        self.track(tokio::spawn(async move {
            let mut interval = tokio::time::interval(evaluate_every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = manager.evaluate();
                        if !report.is_empty() {
                            debug!("[supervisor] evaluation: {:?}", report);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("[supervisor] evaluation loop stopped");
        }));
    }

    /// Stops every loop within `grace`. Returns true when nothing had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> bool {
        info!("[supervisor] shutting down (grace {:?})", grace);
        let deadline = Instant::now() + grace;

        self.manager.stop_remediation();
        let _ = self.shutdown_tx.send(true);

        let mut clean = true;
        let mut handles = self.handles;
        let joined = tokio::time::timeout_at(
            deadline,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;
        if joined.is_err() {
            for handle in &handles {
                if !handle.is_finished() {
                    handle.abort();
                    clean = false;
                }
            }
            warn!("[supervisor] aborted loops still running after {:?}", grace);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.manager.wait_for_remediations(remaining).await {
            clean = false;
        }
        info!("[supervisor] stopped");
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::tests::ScriptedActuator;
    use crate::component::MonitoredComponent;
    use crate::health::HealthStats;
    use crate::heartbeat::{Collaborators, HeartbeatSettings, LastHeardTable};
    use crate::notify::RecordingNotifier;
    use crate::registry::ComponentRegistry;
    use warden_devkit::{MessageBuilder, MockTransport};
    use warden_messages::MessageCodec;

    fn manager(settings: HeartbeatSettings, transport: &MockTransport) -> (Arc<HeartbeatManager>, Arc<ComponentRegistry>) {
        let registry = Arc::new(ComponentRegistry::default());
        let table = Arc::new(LastHeardTable::new());
        registry.subscribe(table.clone());
        let manager = HeartbeatManager::new(
            settings,
            MessageCodec::default(),
            Collaborators {
                registry: registry.clone(),
                last_heard: table,
                transport: Arc::new(transport.clone()),
                notifier: Arc::new(RecordingNotifier::default()),
                actuator: Arc::new(ScriptedActuator::new(None)),
                stats: Arc::new(HealthStats::default()),
            },
        );
        (Arc::new(manager), registry)
    }

    #[tokio::test]
    async fn inbound_loop_feeds_the_manager() {
        let transport = MockTransport::new();
        let rx = transport.setup_receiver();
        let (manager, registry) = manager(HeartbeatSettings::default(), &transport);

        let mut supervisor = Supervisor::new(manager.clone());
        supervisor.spawn_inbound(rx);

        transport
            .simulate_incoming("warden/register", MessageBuilder::register("ingest", "node7", "t/ingest"))
            .unwrap();
        transport
            .simulate_incoming("warden/heartbeat", MessageBuilder::heartbeat_response("ingest", "node7"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registry.contains("node7-ingest"));
        assert!(manager.last_heard().contains("node7-ingest"));
        assert!(supervisor.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn periodic_loops_probe_and_stop_on_shutdown() {
        let transport = MockTransport::new();
        let settings = HeartbeatSettings {
            probe_interval: Duration::from_millis(20),
            evaluation_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (manager, registry) = manager(settings, &transport);
        registry.register(MonitoredComponent::new("ingest", "node7").with_topic("t/ingest")).unwrap();
        manager.last_heard().record("node7-ingest", warden_messages::now_millis());

        let mut supervisor = Supervisor::new(manager.clone());
        supervisor.spawn_periodic();
        tokio::time::sleep(Duration::from_millis(90)).await;

        assert!(supervisor.shutdown(Duration::from_secs(1)).await);
        let probes = transport.find_messages_by_topic("t/ingest").len();
        assert!(probes >= 2, "expected repeated probes, got {probes}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.find_messages_by_topic("t/ingest").len(), probes);
        assert!(!manager.is_accepting_remediation());
    }
}
