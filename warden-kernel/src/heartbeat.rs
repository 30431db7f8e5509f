/**
 * HEARTBEAT MANAGER - Machine d'état de vivacité des composants supervisés
 *
 * RÔLE : Sonde les composants suivis, reporte les acquittements dans la table
 * last-heard, lève alertes / rappels / rétablissements et planifie la
 * remédiation quand une alerte dépasse la période de redémarrage.
 *
 * ÉTATS : healthy -> on alert (silence) -> remediating (alerte trop longue)
 *         tout état -> healthy sur acquittement.
 *
 * VERROUS : le verrou de la table last-heard est tenu pendant toute une passe
 * d'évaluation et pendant chaque acquittement : une réponse ne s'intercale
 * jamais dans la décision de péremption du même composant. Les verrous du
 * registry ne sont pris qu'à l'intérieur, jamais dans l'autre sens. Les
 * notifications partent après libération du verrou de la table.
 */

use crate::actuator::{remediate, Actuator};
use crate::component::{ComponentId, MonitoredComponent, NEVER};
use crate::health::HealthStats;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::registry::{ComponentRegistry, RegistryEvent, RegistryListener};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warden_messages::{
    now_millis, topics, Envelope, HeartbeatBody, HeartbeatSubtype, InboundMessage, Message,
    MessageBody, MessageCodec, SharedTransport,
};

#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    /// Identity used on outgoing probes and replies
    pub name: String,
    pub node: String,
    pub probe_interval: Duration,
    pub evaluation_interval: Duration,
    /// Silence after which a component goes on alert
    pub stale_threshold: Duration,
    pub reminder_interval: Duration,
    /// Alert duration before remediation, also the minimum gap between two restarts
    pub period_before_restart: Duration,
    pub discovery_grace: Duration,
    /// Topic for replies to requests addressed to the manager itself
    pub status_topic: String,
    pub remediation_enabled: bool,
    pub recipients: String,
    pub subject_prefix: String,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            name: "warden".into(),
            node: "localhost".into(),
            probe_interval: Duration::from_secs(30),
            evaluation_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(60),
            reminder_interval: Duration::from_secs(60 * 60),
            period_before_restart: Duration::from_secs(5 * 60),
            discovery_grace: Duration::from_secs(35),
            status_topic: topics::KERNEL_STATUS.into(),
            remediation_enabled: true,
            recipients: String::new(),
            subject_prefix: "[warden]".into(),
        }
    }
}

impl HeartbeatSettings {
    pub fn identity_id(&self) -> ComponentId {
        format!("{}-{}", self.node, self.name)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Human-readable elapsed time: `2m5s`, `1h2m5s`, `0s`.
pub fn format_elapsed(ms: i64) -> String {
    let total = ms.max(0) / 1000;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn format_instant(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

/// Last acknowledgement time per tracked component.
///
/// Entries appear on acknowledgement, at the end of discovery, and on
/// registration once discovery has enabled tracking. Unregistration removes them.
#[derive(Debug, Default)]
pub struct LastHeardTable {
    entries: Mutex<HashMap<ComponentId, i64>>,
    tracking: AtomicBool,
}

impl LastHeardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<ComponentId, i64>> {
        self.entries.lock()
    }

    pub fn record(&self, id: &str, at: i64) {
        self.entries.lock().insert(id.to_string(), at);
    }

    pub fn get(&self, id: &str) -> Option<i64> {
        self.entries.lock().get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn tracked_ids(&self) -> Vec<ComponentId> {
        let mut ids: Vec<_> = self.entries.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Adds `at` for every id not yet present; returns how many were added.
    pub fn seed_missing(&self, ids: &[ComponentId], at: i64) -> usize {
        let mut entries = self.entries.lock();
        let mut seeded = 0;
        for id in ids {
            if !entries.contains_key(id) {
                entries.insert(id.clone(), at);
                seeded += 1;
            }
        }
        seeded
    }

    pub fn enable_tracking(&self) {
        self.tracking.store(true, Ordering::SeqCst);
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }
}

impl RegistryListener for LastHeardTable {
    fn on_event(&self, event: &RegistryEvent, _component: &MonitoredComponent) {
        match event {
            RegistryEvent::Registered(id) => {
                if self.is_tracking() {
                    self.entries.lock().entry(id.clone()).or_insert_with(now_millis);
                }
            }
            RegistryEvent::Unregistered(id) => {
                self.entries.lock().remove(id);
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvaluationReport {
    pub alerted: Vec<ComponentId>,
    pub reminded: Vec<ComponentId>,
    pub remediating: Vec<ComponentId>,
}

impl EvaluationReport {
    pub fn is_empty(&self) -> bool {
        self.alerted.is_empty() && self.reminded.is_empty() && self.remediating.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub sent: usize,
    pub failed: usize,
    /// Tracked but unknown to the registry, or without a topic
    pub skipped: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub probed: usize,
    pub responded: usize,
    pub seeded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Sent,
    Failed,
    Skipped,
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Ack(ComponentId),
    Recovered { id: ComponentId, downtime_ms: i64 },
    Replied,
    Registered(ComponentId),
    Unregistered(ComponentId),
    AlertForwarded(ComponentId),
    Ignored(&'static str),
    Dropped(String),
}

/// Shared services the manager works with.
pub struct Collaborators {
    pub registry: Arc<ComponentRegistry>,
    pub last_heard: Arc<LastHeardTable>,
    pub transport: SharedTransport,
    pub notifier: Arc<dyn Notifier>,
    pub actuator: Arc<dyn Actuator>,
    pub stats: Arc<HealthStats>,
}

pub struct HeartbeatManager {
    settings: HeartbeatSettings,
    codec: MessageCodec,
    registry: Arc<ComponentRegistry>,
    last_heard: Arc<LastHeardTable>,
    transport: SharedTransport,
    notifier: Arc<dyn Notifier>,
    actuator: Arc<dyn Actuator>,
    stats: Arc<HealthStats>,
    accepting_remediation: AtomicBool,
    remediations: Mutex<Vec<JoinHandle<()>>>,
}

impl HeartbeatManager {
    pub fn new(settings: HeartbeatSettings, codec: MessageCodec, parts: Collaborators) -> Self {
        Self {
            settings,
            codec,
            registry: parts.registry,
            last_heard: parts.last_heard,
            transport: parts.transport,
            notifier: parts.notifier,
            actuator: parts.actuator,
            stats: parts.stats,
            accepting_remediation: AtomicBool::new(true),
            remediations: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &HeartbeatSettings {
        &self.settings
    }

    pub fn last_heard(&self) -> &Arc<LastHeardTable> {
        &self.last_heard
    }

    fn component_notification(&self, kind: NotificationKind, id: &str, info: &str, force: bool) -> Notification {
        Notification::for_component(kind, &self.settings.recipients, &self.settings.subject_prefix, id, info, force)
    }

    // ---------------------------------------------------------------- evaluation

    pub fn evaluate(&self) -> EvaluationReport {
        self.evaluate_at(now_millis())
    }

    /// One pass over the table: alert on silence, remind, schedule remediation.
    pub fn evaluate_at(&self, now: i64) -> EvaluationReport {
        let stale_ms = millis(self.settings.stale_threshold);
        let reminder_ms = millis(self.settings.reminder_interval);
        let restart_ms = millis(self.settings.period_before_restart);

        let mut report = EvaluationReport::default();
        let mut outbox = Vec::new();
        let mut to_remediate = Vec::new();

        {
            let table = self.last_heard.lock();
            for (id, last_heard) in table.iter() {
                let silent_for = now - *last_heard;
                if silent_for <= stale_ms {
                    continue;
                }
                let Some(component) = self.registry.get(id) else {
                    debug!("[heartbeat] {} tracked but not registered", id);
                    continue;
                };

                if !component.on_alert {
                    if let Err(e) = self.registry.mark_alert(id, now) {
                        warn!("[heartbeat] cannot mark {} on alert: {}", id, e);
                        continue;
                    }
                    self.stats.record_alert();
                    warn!("[heartbeat] {} silent for {}, on alert", id, format_elapsed(silent_for));
                    let info = format!(
                        "The component has not acknowledged heartbeats for {}.\n\nTime of alert: {}\nLast acknowledgement: {}",
                        format_elapsed(silent_for),
                        format_instant(now),
                        format_instant(*last_heard),
                    );
                    // first occurrence of an episode is never throttled
                    outbox.push(self.component_notification(NotificationKind::Unresponsive, id, &info, true));
                    report.alerted.push(id.clone());
                    continue;
                }

                if now - component.last_alert_time > reminder_ms {
                    match self.registry.refresh_alert(id, now) {
                        Ok(()) => {
                            self.stats.record_reminder();
                            info!("[heartbeat] {} still on alert, reminder sent", id);
                            let info = format!(
                                "Reminder: the component is still not acknowledging heartbeats.\n\nOn alert since: {}\nLast acknowledgement: {}",
                                format_instant(component.alert_started_at),
                                format_instant(*last_heard),
                            );
                            outbox.push(self.component_notification(NotificationKind::Reminder, id, &info, false));
                            report.reminded.push(id.clone());
                        }
                        Err(e) => warn!("[heartbeat] cannot refresh alert of {}: {}", id, e),
                    }
                }

                let alert_long_enough =
                    component.alert_started_at != NEVER && now - component.alert_started_at > restart_ms;
                let restart_due = now - component.last_restart_time > restart_ms;
                if self.settings.remediation_enabled
                    && self.is_accepting_remediation()
                    && alert_long_enough
                    && restart_due
                {
                    if let Err(e) = self
                        .registry
                        .set_live(id, false)
                        .and_then(|_| self.registry.record_restart(id, now))
                    {
                        warn!("[heartbeat] cannot schedule remediation of {}: {}", id, e);
                        continue;
                    }
                    info!("[heartbeat] {} on alert for {}, scheduling remediation", id,
                        format_elapsed(now - component.alert_started_at));
                    report.remediating.push(id.clone());
                    to_remediate.push(component);
                }
            }
        }

        for notification in outbox {
            self.notifier.notify(notification);
        }
        for component in to_remediate {
            self.spawn_remediation(component);
        }
        report
    }

    pub fn is_accepting_remediation(&self) -> bool {
        self.accepting_remediation.load(Ordering::SeqCst)
    }

    /// No new remediation is scheduled after this call; running ones continue.
    pub fn stop_remediation(&self) {
        self.accepting_remediation.store(false, Ordering::SeqCst);
    }

    fn spawn_remediation(&self, component: MonitoredComponent) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!("[heartbeat] no runtime to remediate {}: {}", component.id(), e);
                return;
            }
        };

        let actuator = self.actuator.clone();
        let registry = self.registry.clone();
        let notifier = self.notifier.clone();
        let stats = self.stats.clone();
        let recipients = self.settings.recipients.clone();
        let prefix = self.settings.subject_prefix.clone();

        let handle = runtime.spawn(async move {
            let id = component.id();
            let report = remediate(actuator.as_ref(), &component).await;
            if let Err(e) = registry.set_live(&id, true) {
                warn!("[heartbeat] {} went away during remediation: {}", id, e);
            }
            stats.record_remediation();
            info!("[heartbeat] remediation of {} finished", id);
            let info = format!(
                "The component stayed unresponsive past the restart period. An automatic restart was attempted.\n\n{}",
                report.summary()
            );
            notifier.notify(Notification::for_component(
                NotificationKind::Remediation,
                &recipients,
                &prefix,
                &id,
                &info,
                true,
            ));
        });

        let mut handles = self.remediations.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Waits for running remediations; false when `grace` ran out first.
    pub async fn wait_for_remediations(&self, grace: Duration) -> bool {
        let handles = std::mem::take(&mut *self.remediations.lock());
        if handles.is_empty() {
            return true;
        }
        info!("[heartbeat] waiting for {} remediation(s)", handles.len());
        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("[heartbeat] remediation task failed: {}", e);
                    }
                }
                true
            }
            Err(_) => {
                warn!("[heartbeat] remediations still running after {:?}", grace);
                false
            }
        }
    }

    // ---------------------------------------------------------------- probing

    pub fn probe(&self) -> ProbeReport {
        self.probe_at(now_millis())
    }

    /// Sends a heartbeat request to every tracked component with a topic.
    pub fn probe_at(&self, now: i64) -> ProbeReport {
        let ids = self.last_heard.tracked_ids();
        if ids.is_empty() {
            debug!("[heartbeat] nothing tracked, no heartbeat sent");
            return ProbeReport::default();
        }

        let mut report = ProbeReport::default();
        for id in &ids {
            match self.probe_component(id, now) {
                ProbeOutcome::Sent => report.sent += 1,
                ProbeOutcome::Failed => report.failed += 1,
                ProbeOutcome::Skipped => report.skipped += 1,
            }
        }
        info!("[heartbeat] sent {} heartbeat(s), {} failure(s)", report.sent, report.failed);
        report
    }

    fn probe_component(&self, id: &str, now: i64) -> ProbeOutcome {
        let Some(component) = self.registry.get(id) else {
            debug!("[heartbeat] {} not registered, not probed", id);
            return ProbeOutcome::Skipped;
        };
        let Some(topic) = component.topic.as_deref() else {
            debug!("[heartbeat] {} has no topic, not probed", id);
            return ProbeOutcome::Skipped;
        };

        let envelope = Envelope {
            timestamp: now,
            ..Envelope::new(self.settings.name.as_str(), self.settings.node.as_str())
        };
        let request = Message::heartbeat(envelope, HeartbeatBody::request(id).with_message(self.codec.sentinel()));
        let payload = match self.codec.serialize(&request) {
            Ok(payload) => payload,
            Err(e) => {
                error!("[heartbeat] cannot encode probe for {}: {}", id, e);
                self.stats.record_probe_failure();
                return ProbeOutcome::Failed;
            }
        };

        match self.transport.publish(topic, &payload) {
            Ok(()) => {
                self.stats.record_probe();
                debug!("[heartbeat] probe sent to {} on {}", id, topic);
                ProbeOutcome::Sent
            }
            Err(e) => {
                self.stats.record_probe_failure();
                warn!("[heartbeat] probe to {} failed: {}", id, e);
                ProbeOutcome::Failed
            }
        }
    }

    /// Probes every registered component, waits the grace period, then seeds
    /// the silent ones with the current time and starts tracking registrations.
    pub async fn discover(&self) -> DiscoveryReport {
        let ids = self.registry.list_ids();
        info!("[heartbeat] discovery: probing {} registered component(s)", ids.len());

        if !ids.is_empty() {
            let now = now_millis();
            for id in &ids {
                self.probe_component(id, now);
            }
            tokio::time::sleep(self.settings.discovery_grace).await;
        }

        let responded = self.last_heard.len();
        let seeded = self.last_heard.seed_missing(&self.registry.list_ids(), now_millis());
        self.last_heard.enable_tracking();
        info!("[heartbeat] discovery complete: {} responded, {} seeded", responded, seeded);

        DiscoveryReport { probed: ids.len(), responded, seeded }
    }

    // ---------------------------------------------------------------- inbound

    pub fn handle_inbound(&self, inbound: &InboundMessage) -> InboundOutcome {
        self.handle_inbound_at(inbound, now_millis())
    }

    pub fn handle_inbound_at(&self, inbound: &InboundMessage, now: i64) -> InboundOutcome {
        let payload = inbound.payload.trim();

        // bare component id, as older components acknowledge
        if !payload.starts_with('{') && self.registry.contains(payload) {
            return self.acknowledge(payload, now);
        }

        let message = match self.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.record_dropped();
                info!("[heartbeat] unprocessable message on {}: {}", inbound.topic, e);
                return InboundOutcome::Dropped(e.to_string());
            }
        };

        if message.is_legacy() {
            return self.handle_legacy(inbound, now);
        }

        match &message.body {
            MessageBody::Heartbeat(heartbeat) => match heartbeat.subtype {
                HeartbeatSubtype::Request => self.answer_request(heartbeat),
                HeartbeatSubtype::Response => {
                    match self.resolve_sender(&message.envelope, heartbeat.target_component_id.as_deref()) {
                        Some(id) => self.acknowledge(&id, now),
                        None => self.drop_unknown(&message.envelope),
                    }
                }
            },
            MessageBody::Register(body) => {
                let component = MonitoredComponent::from_registration(&message.envelope, body);
                let id = component.id();
                match self.registry.register(component) {
                    Ok(()) => InboundOutcome::Registered(id),
                    Err(e) => {
                        self.stats.record_dropped();
                        warn!("[heartbeat] registration of {} rejected: {}", id, e);
                        InboundOutcome::Dropped(e.to_string())
                    }
                }
            }
            MessageBody::Unregister(body) => {
                let id = message.envelope.sender_id();
                if self.registry.unregister(&id) {
                    info!(
                        "[heartbeat] {} unregistered ({})",
                        id,
                        body.reason.as_deref().unwrap_or("no reason given")
                    );
                    InboundOutcome::Unregistered(id)
                } else {
                    self.stats.record_dropped();
                    InboundOutcome::Dropped(format!("{id} was not registered"))
                }
            }
            MessageBody::Alert(alert) => match self.resolve_sender(&message.envelope, None) {
                Some(id) => {
                    self.stats.record_component_alert();
                    warn!("[heartbeat] {} raised {}", id, alert.alert_type.as_str());
                    let info = format!(
                        "The component raised an alert: {}\n\n{}",
                        alert.alert_type.as_str(),
                        alert.message.as_deref().unwrap_or("(no details)")
                    );
                    self.notifier.notify(self.component_notification(NotificationKind::ComponentAlert, &id, &info, false));
                    InboundOutcome::AlertForwarded(id)
                }
                None => self.drop_unknown(&message.envelope),
            },
            MessageBody::Status(_) | MessageBody::Control(_) => {
                debug!("[heartbeat] {} message from {} ignored", message.kind(), message.envelope.sender_id());
                InboundOutcome::Ignored("reserved message kind")
            }
        }
    }

    /// The sentinel carries no identity; the sender comes from the topic.
    fn handle_legacy(&self, inbound: &InboundMessage, now: i64) -> InboundOutcome {
        let sender = inbound.sender_hint().and_then(|hint| {
            if self.registry.contains(hint) {
                Some(hint.to_string())
            } else {
                self.registry.find_by_name(hint)
            }
        });
        match sender {
            Some(id) => self.acknowledge(&id, now),
            None => {
                self.stats.record_dropped();
                info!("[heartbeat] legacy heartbeat on {} from an unregistered sender", inbound.topic);
                InboundOutcome::Dropped(format!("unknown legacy sender on {}", inbound.topic))
            }
        }
    }

    /// Target id, then `node-name`, then a unique name match.
    fn resolve_sender(&self, envelope: &Envelope, target: Option<&str>) -> Option<ComponentId> {
        if let Some(target) = target.filter(|t| self.registry.contains(t)) {
            return Some(target.to_string());
        }
        let id = envelope.sender_id();
        if self.registry.contains(&id) {
            return Some(id);
        }
        self.registry.find_by_name(&envelope.name)
    }

    fn drop_unknown(&self, envelope: &Envelope) -> InboundOutcome {
        self.stats.record_dropped();
        let id = envelope.sender_id();
        info!("[heartbeat] message from unregistered {} dropped", id);
        InboundOutcome::Dropped(format!("{id} is not registered"))
    }

    fn answer_request(&self, heartbeat: &HeartbeatBody) -> InboundOutcome {
        let own_id = self.settings.identity_id();
        let addressed = heartbeat
            .target_component_id
            .as_deref()
            .is_some_and(|t| t == own_id || t == self.settings.name);
        if !addressed {
            return InboundOutcome::Ignored("request for another component");
        }

        let reply = Message::heartbeat(
            Envelope::new(self.settings.name.as_str(), self.settings.node.as_str()),
            HeartbeatBody::response().with_message("OK").with_target(own_id),
        );
        let sent = self
            .codec
            .serialize(&reply)
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                self.transport
                    .publish(&self.settings.status_topic, &payload)
                    .map_err(|e| e.to_string())
            });
        match sent {
            Ok(()) => InboundOutcome::Replied,
            Err(e) => {
                warn!("[heartbeat] cannot answer heartbeat request: {}", e);
                InboundOutcome::Dropped(e)
            }
        }
    }

    fn acknowledge(&self, id: &str, now: i64) -> InboundOutcome {
        let recovered_from = {
            let mut table = self.last_heard.lock();
            table.insert(id.to_string(), now);
            match self.registry.alert_started_at(id) {
                Ok(Some(started)) => match self.registry.clear_alert(id) {
                    Ok(()) => Some(started),
                    Err(e) => {
                        warn!("[heartbeat] cannot clear alert of {}: {}", id, e);
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    debug!("[heartbeat] ack from {}: {}", id, e);
                    None
                }
            }
        };

        let Some(started) = recovered_from else {
            debug!("[heartbeat] ack from {}", id);
            return InboundOutcome::Ack(id.to_string());
        };

        let downtime_ms = now - started;
        self.stats.record_recovery();
        info!("[heartbeat] {} recovered after {}", id, format_elapsed(downtime_ms));
        let info = format!(
            "Received a response from a component that was on alert.\n\nTime of alert: {}\nTime of response: {}\nWas down for {}",
            format_instant(started),
            format_instant(now),
            format_elapsed(downtime_ms),
        );
        self.notifier.notify(self.component_notification(NotificationKind::Recovery, id, &info, true));
        InboundOutcome::Recovered { id: id.to_string(), downtime_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::tests::ScriptedActuator;
    use crate::notify::{NotificationDispatcher, NotificationSink, NotifyError, RecordingNotifier};
    use warden_devkit::{MessageBuilder, MockTransport};
    use warden_messages::AlertType;

    const T0: i64 = 1_700_000_000_000;
    const SECOND: i64 = 1000;
    const MINUTE: i64 = 60 * SECOND;

    struct Fixture {
        manager: HeartbeatManager,
        registry: Arc<ComponentRegistry>,
        table: Arc<LastHeardTable>,
        transport: MockTransport,
        notifier: Arc<RecordingNotifier>,
        actuator: Arc<ScriptedActuator>,
    }

    fn fixture(settings: HeartbeatSettings) -> Fixture {
        let registry = Arc::new(ComponentRegistry::default());
        let table = Arc::new(LastHeardTable::new());
        registry.subscribe(table.clone());
        let transport = MockTransport::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let actuator = Arc::new(ScriptedActuator::new(None));

        let manager = HeartbeatManager::new(
            settings,
            MessageCodec::default(),
            Collaborators {
                registry: registry.clone(),
                last_heard: table.clone(),
                transport: Arc::new(transport.clone()),
                notifier: notifier.clone(),
                actuator: actuator.clone(),
                stats: Arc::new(HealthStats::default()),
            },
        );
        Fixture { manager, registry, table, transport, notifier, actuator }
    }

    fn with_component(f: &Fixture, name: &str, heard_at: i64) -> ComponentId {
        let component = MonitoredComponent::new(name, "node7").with_topic(format!("warden/components/node7-{name}"));
        let id = component.id();
        f.registry.register(component).unwrap();
        f.table.record(&id, heard_at);
        id
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(0), "0s");
        assert_eq!(format_elapsed(59_999), "59s");
        assert_eq!(format_elapsed(125_000), "2m5s");
        assert_eq!(format_elapsed(3_725_000), "1h2m5s");
        assert_eq!(format_elapsed(-5), "0s");
    }

    #[test]
    fn silence_past_threshold_alerts_once() {
        let f = fixture(HeartbeatSettings::default());
        let id = with_component(&f, "ingest", T0);

        assert!(f.manager.evaluate_at(T0 + 60 * SECOND).is_empty());

        let report = f.manager.evaluate_at(T0 + 61 * SECOND);
        assert_eq!(report.alerted, vec![id.clone()]);
        let component = f.registry.get(&id).unwrap();
        assert!(component.on_alert);
        assert_eq!(component.alert_count, 1);

        let sent = f.notifier.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Unresponsive);
        assert!(sent[0].force);
        assert!(sent[0].body.contains("1m1s"));

        assert!(f.manager.evaluate_at(T0 + 65 * SECOND).is_empty());
        assert!(f.notifier.take().is_empty());
        assert_eq!(f.registry.get(&id).unwrap().alert_count, 1);
    }

    #[test]
    fn reminder_after_interval_keeps_episode_start() {
        let f = fixture(HeartbeatSettings { remediation_enabled: false, ..Default::default() });
        let id = with_component(&f, "ingest", T0);
        let alert_at = T0 + 61 * SECOND;
        f.manager.evaluate_at(alert_at);
        f.notifier.take();

        assert!(f.manager.evaluate_at(alert_at + 60 * MINUTE).reminded.is_empty());

        let report = f.manager.evaluate_at(alert_at + 60 * MINUTE + 1);
        assert_eq!(report.reminded, vec![id.clone()]);
        assert_eq!(f.registry.alert_time_of(&id).unwrap(), alert_at + 60 * MINUTE + 1);
        assert_eq!(f.registry.alert_started_at(&id).unwrap(), Some(alert_at));
        assert!(f.notifier.take()[0].body.starts_with("Alert for component: 'node7-ingest'"));
    }

    #[test]
    fn response_after_alert_reports_downtime() {
        let f = fixture(HeartbeatSettings::default());
        let id = with_component(&f, "ingest", T0 - 61 * SECOND);
        f.manager.evaluate_at(T0);
        f.notifier.take();

        let inbound = InboundMessage::new("warden/heartbeat", MessageBuilder::heartbeat_response("ingest", "node7"));
        let outcome = f.manager.handle_inbound_at(&inbound, T0 + 125 * SECOND);

        assert_eq!(outcome, InboundOutcome::Recovered { id: id.clone(), downtime_ms: 125 * SECOND });
        assert!(!f.registry.is_on_alert(&id).unwrap());
        assert_eq!(f.table.get(&id), Some(T0 + 125 * SECOND));

        let sent = f.notifier.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].force);
        assert!(sent[0].body.contains("Was down for 2m5s"));
    }

    #[test]
    fn legacy_acknowledgements_count_like_responses() {
        let f = fixture(HeartbeatSettings::default());
        let a = with_component(&f, "alpha", T0 - 61 * SECOND);
        let b = with_component(&f, "beta", T0 - 61 * SECOND);
        let c = with_component(&f, "gamma", T0 - 61 * SECOND);
        f.manager.evaluate_at(T0);

        let structured = InboundMessage::new("warden/heartbeat", MessageBuilder::heartbeat_response("alpha", "node7"));
        let sentinel = InboundMessage::new("warden/heartbeat/beta", MessageBuilder::legacy_sentinel());
        let bare_id = InboundMessage::new("warden/heartbeat", c.clone());

        for (inbound, id) in [(structured, &a), (sentinel, &b), (bare_id, &c)] {
            let outcome = f.manager.handle_inbound_at(&inbound, T0 + 10 * SECOND);
            assert_eq!(outcome, InboundOutcome::Recovered { id: id.clone(), downtime_ms: 10 * SECOND });
            assert_eq!(f.table.get(id), Some(T0 + 10 * SECOND));
        }
        assert_eq!(f.registry.count_on_alert(), 0);

        let again = InboundMessage::new("warden/heartbeat", c.clone());
        assert_eq!(f.manager.handle_inbound_at(&again, T0 + 11 * SECOND), InboundOutcome::Ack(c));
    }

    #[test]
    fn unknown_senders_are_dropped() {
        let f = fixture(HeartbeatSettings::default());
        with_component(&f, "ingest", T0);

        let stranger = InboundMessage::new("warden/heartbeat", MessageBuilder::heartbeat_response("ghost", "node9"));
        assert!(matches!(f.manager.handle_inbound_at(&stranger, T0), InboundOutcome::Dropped(_)));

        let sentinel = InboundMessage::new("warden/heartbeat/ghost", MessageBuilder::legacy_sentinel());
        assert!(matches!(f.manager.handle_inbound_at(&sentinel, T0), InboundOutcome::Dropped(_)));

        let garbage = InboundMessage::new("warden/heartbeat", "not a message");
        assert!(matches!(f.manager.handle_inbound_at(&garbage, T0), InboundOutcome::Dropped(_)));

        assert_eq!(f.registry.count(), 1);
        assert_eq!(f.table.len(), 1);
    }

    #[test]
    fn requests_to_the_manager_get_a_reply() {
        let f = fixture(HeartbeatSettings::default());

        let to_me = InboundMessage::new("warden/heartbeat", MessageBuilder::heartbeat_request("ops", "node1", "localhost-warden"));
        assert_eq!(f.manager.handle_inbound_at(&to_me, T0), InboundOutcome::Replied);

        let replies = f.transport.decoded_on(topics::KERNEL_STATUS);
        assert_eq!(replies.len(), 1);
        let body = replies[0].as_heartbeat().unwrap();
        assert_eq!(body.subtype, HeartbeatSubtype::Response);
        assert_eq!(body.target_component_id.as_deref(), Some("localhost-warden"));

        let to_other = InboundMessage::new("warden/heartbeat", MessageBuilder::heartbeat_request("ops", "node1", "node7-ingest"));
        assert!(matches!(f.manager.handle_inbound_at(&to_other, T0), InboundOutcome::Ignored(_)));
        assert_eq!(f.transport.decoded_on(topics::KERNEL_STATUS).len(), 1);
    }

    #[test]
    fn registration_messages_update_registry_and_table() {
        let f = fixture(HeartbeatSettings::default());
        f.table.enable_tracking();

        let register = InboundMessage::new("warden/register", MessageBuilder::register("ingest", "node7", "warden/components/node7-ingest"));
        assert_eq!(f.manager.handle_inbound_at(&register, T0), InboundOutcome::Registered("node7-ingest".into()));
        assert!(f.table.contains("node7-ingest"));

        let unregister = InboundMessage::new("warden/register", MessageBuilder::unregister("ingest", "node7", "maintenance"));
        assert_eq!(f.manager.handle_inbound_at(&unregister, T0), InboundOutcome::Unregistered("node7-ingest".into()));
        assert!(!f.registry.contains("node7-ingest"));
        assert!(!f.table.contains("node7-ingest"));

        assert!(matches!(f.manager.handle_inbound_at(&unregister, T0), InboundOutcome::Dropped(_)));
    }

    #[test]
    fn declared_legacy_version_does_not_bypass_registration() {
        let f = fixture(HeartbeatSettings::default());
        let payload = r#"{"kind":"register","name":"ingest","node":"node7","protocolVersion":"legacy","body":{"topic":"t/i"}}"#;

        let register = InboundMessage::new("warden/register", payload);
        assert_eq!(f.manager.handle_inbound_at(&register, T0), InboundOutcome::Registered("node7-ingest".into()));
        assert_eq!(f.registry.get("node7-ingest").unwrap().topic.as_deref(), Some("t/i"));
    }

    #[test]
    fn component_alerts_are_forwarded() {
        let f = fixture(HeartbeatSettings::default());
        let id = with_component(&f, "ingest", T0);

        let alert = InboundMessage::new(
            "warden/alerts",
            MessageBuilder::alert("ingest", "node7", AlertType::NoDataThresholdExceeded, "no data for 600s"),
        );
        assert_eq!(f.manager.handle_inbound_at(&alert, T0), InboundOutcome::AlertForwarded(id));

        let sent = f.notifier.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("NO_DATA_THRESHOLD_EXCEEDED"));
        assert!(sent[0].body.contains("no data for 600s"));
    }

    #[derive(Default)]
    struct BodySink {
        bodies: Mutex<Vec<String>>,
    }

    impl NotificationSink for BodySink {
        fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.bodies.lock().push(notification.body.clone());
            Ok(())
        }
    }

    #[test]
    fn flapping_component_is_notified_for_every_episode() {
        let sink = Arc::new(BodySink::default());
        let dispatcher = NotificationDispatcher::new(Duration::from_secs(120)).with_sink(sink.clone());
        let registry = Arc::new(ComponentRegistry::default());
        let table = Arc::new(LastHeardTable::new());
        registry.subscribe(table.clone());
        let manager = HeartbeatManager::new(
            HeartbeatSettings { remediation_enabled: false, ..Default::default() },
            MessageCodec::default(),
            Collaborators {
                registry: registry.clone(),
                last_heard: table.clone(),
                transport: Arc::new(MockTransport::new()),
                notifier: Arc::new(dispatcher),
                actuator: Arc::new(ScriptedActuator::new(None)),
                stats: Arc::new(HealthStats::default()),
            },
        );
        registry.register(MonitoredComponent::new("ingest", "node7")).unwrap();
        table.record("node7-ingest", T0);

        let response = InboundMessage::new("warden/heartbeat", MessageBuilder::heartbeat_response("ingest", "node7"));
        assert_eq!(manager.evaluate_at(T0 + 61 * SECOND).alerted.len(), 1);
        assert!(matches!(
            manager.handle_inbound_at(&response, T0 + 62 * SECOND),
            InboundOutcome::Recovered { .. }
        ));
        assert_eq!(manager.evaluate_at(T0 + 123 * SECOND).alerted.len(), 1);

        let alert = InboundMessage::new(
            "warden/alerts",
            MessageBuilder::alert("ingest", "node7", AlertType::NoDataThresholdExceeded, "no data"),
        );
        manager.handle_inbound_at(&alert, T0 + 124 * SECOND);

        let bodies = sink.bodies.lock().clone();
        assert_eq!(bodies.len(), 4);
        assert!(bodies[0].contains("not acknowledged heartbeats"));
        assert!(bodies[1].contains("Was down for"));
        assert!(bodies[2].contains("not acknowledged heartbeats"));
        assert!(bodies[3].contains("NO_DATA_THRESHOLD_EXCEEDED"));
    }

    #[test]
    fn probe_skips_components_without_topic() {
        let f = fixture(HeartbeatSettings::default());
        let a = with_component(&f, "alpha", T0);
        f.registry.register(MonitoredComponent::new("beta", "node7")).unwrap();
        f.table.record("node7-beta", T0);

        let report = f.manager.probe_at(T0);
        assert_eq!(report, ProbeReport { sent: 1, failed: 0, skipped: 1 });

        let probes = f.transport.decoded_on("warden/components/node7-alpha");
        assert_eq!(probes.len(), 1);
        let body = probes[0].as_heartbeat().unwrap();
        assert_eq!(body.subtype, HeartbeatSubtype::Request);
        assert_eq!(body.target_component_id.as_deref(), Some(a.as_str()));
        assert_eq!(body.message.as_deref(), Some("HEARTBEAT"));

        f.transport.fail_publishes(true);
        assert_eq!(f.manager.probe_at(T0).failed, 1);
    }

    #[tokio::test]
    async fn discovery_seeds_silent_components_which_then_alert_once() {
        let f = fixture(HeartbeatSettings { discovery_grace: Duration::from_millis(50), ..Default::default() });
        f.registry.register(MonitoredComponent::new("alpha", "node7").with_topic("t/alpha")).unwrap();
        f.registry.register(MonitoredComponent::new("beta", "node7").with_topic("t/beta")).unwrap();
        assert!(f.table.is_empty());

        let reply = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let inbound = InboundMessage::new("warden/heartbeat", MessageBuilder::heartbeat_response("alpha", "node7"));
            f.manager.handle_inbound(&inbound)
        };
        let (report, outcome) = tokio::join!(f.manager.discover(), reply);

        assert_eq!(outcome, InboundOutcome::Ack("node7-alpha".into()));
        assert_eq!(report, DiscoveryReport { probed: 2, responded: 1, seeded: 1 });
        assert!(f.table.is_tracking());
        assert_eq!(f.transport.find_messages_by_topic("t/beta").len(), 1);

        let now = now_millis();
        let first = f.manager.evaluate_at(now + 61 * SECOND);
        let mut alerted = first.alerted.clone();
        alerted.sort();
        assert_eq!(alerted, vec!["node7-alpha".to_string(), "node7-beta".to_string()]);
        assert!(f.manager.evaluate_at(now + 65 * SECOND).is_empty());
    }

    #[tokio::test]
    async fn long_alert_triggers_remediation_in_order() {
        let f = fixture(HeartbeatSettings::default());
        let id = with_component(&f, "ingest", T0 - 61 * SECOND);
        f.manager.evaluate_at(T0);
        f.notifier.take();

        assert!(f.manager.evaluate_at(T0 + 5 * MINUTE).remediating.is_empty());

        let due = T0 + 5 * MINUTE + 1;
        let report = f.manager.evaluate_at(due);
        assert_eq!(report.remediating, vec![id.clone()]);
        let component = f.registry.get(&id).unwrap();
        assert!(!component.live);
        assert_eq!(component.last_restart_time, due);

        assert!(f.manager.wait_for_remediations(Duration::from_secs(1)).await);
        assert_eq!(f.actuator.calls(), vec!["stop", "find_pid", "start", "status"]);
        assert!(f.registry.get(&id).unwrap().live);

        let sent = f.notifier.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].force);
        assert!(sent[0].body.contains("stop: stopped"));

        assert!(f.manager.evaluate_at(due + MINUTE).remediating.is_empty());
        assert_eq!(f.manager.evaluate_at(due + 5 * MINUTE + 1).remediating, vec![id]);
        f.manager.wait_for_remediations(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn no_remediation_after_stop() {
        let f = fixture(HeartbeatSettings::default());
        with_component(&f, "ingest", T0 - 61 * SECOND);
        f.manager.evaluate_at(T0);

        f.manager.stop_remediation();
        assert!(f.manager.evaluate_at(T0 + 6 * MINUTE).remediating.is_empty());
        assert!(f.actuator.calls().is_empty());
    }
}
