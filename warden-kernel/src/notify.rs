/**
 * NOTIFICATIONS - Messages d'alerte, rappel, rétablissement et remédiation
 *
 * RÔLE : Construit les notifications opérateur, limite les répétitions par
 * sujet et par type, puis les diffuse vers les sinks configurés (log, email
 * via le bus). Une notification forcée ignore la limitation.
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, warn};
use uuid::Uuid;
use warden_messages::{now_millis, SharedTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("timestamp format error: {0}")]
    Format(#[from] time::error::Format),
}

/// What a notification is about. Repeats are throttled per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Unresponsive,
    Reminder,
    Recovery,
    Remediation,
    ComponentAlert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipients: String,
    pub subject: String,
    pub body: String,
    /// Skip the repeat throttle
    pub force: bool,
}

impl Notification {
    /// Notification about one component; subject is derived from its address.
    pub fn for_component(
        kind: NotificationKind,
        recipients: &str,
        subject_prefix: &str,
        component_id: &str,
        info: &str,
        force: bool,
    ) -> Self {
        let subject = format!("{} {}", subject_prefix, derive_subject(component_id))
            .trim()
            .to_string();
        let body = format!(
            "Alert for component: '{component_id}'\n\n{info}\n\n- Warden (heartbeat manager)"
        );
        Self { kind, recipients: recipients.to_string(), subject, body, force }
    }
}

/// Host portion of an address: scheme, userinfo, port, path and query are stripped.
pub fn derive_subject(address: &str) -> String {
    let mut rest = address.trim();
    if let Some((_, after_scheme)) = rest.split_once("://") {
        rest = after_scheme;
    }
    let rest = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
    let host = match rest.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => rest,
    };
    host.to_string()
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Suppressed,
}

pub struct NotificationDispatcher {
    throttle_ms: i64,
    last_sent: Mutex<HashMap<(NotificationKind, String), i64>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationDispatcher {
    pub fn new(throttle: std::time::Duration) -> Self {
        Self {
            throttle_ms: i64::try_from(throttle.as_millis()).unwrap_or(i64::MAX),
            last_sent: Mutex::new(HashMap::new()),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn dispatch_at(&self, notification: &Notification, now: i64) -> Delivery {
        {
            let key = (notification.kind, notification.subject.clone());
            let mut last_sent = self.last_sent.lock();
            if !notification.force {
                if let Some(last) = last_sent.get(&key) {
                    if now.saturating_sub(*last) < self.throttle_ms {
                        debug!(
                            "[notify] {:?} '{}' suppressed, last sent {}ms ago",
                            notification.kind,
                            notification.subject,
                            now - last
                        );
                        return Delivery::Suppressed;
                    }
                }
            }
            last_sent.insert(key, now);
        }

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(notification) {
                error!("[notify] delivery of '{}' failed: {}", notification.subject, e);
            }
        }
        Delivery::Sent
    }
}

impl Notifier for NotificationDispatcher {
    fn notify(&self, notification: Notification) {
        self.dispatch_at(&notification, now_millis());
    }
}

/// Writes notifications to the log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        warn!(
            "[notify] to={} subject='{}'\n{}",
            notification.recipients, notification.subject, notification.body
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    id: String,
    to: &'a str,
    from: &'a str,
    subject: &'a str,
    body: &'a str,
    timestamp: String,
}

/// Publishes an email request on the bus for the mail relay to pick up.
pub struct BusEmailSink {
    transport: SharedTransport,
    topic: String,
    from: String,
}

impl BusEmailSink {
    pub fn new(transport: SharedTransport, topic: impl Into<String>, from: impl Into<String>) -> Self {
        Self { transport, topic: topic.into(), from: from.into() }
    }
}

impl NotificationSink for BusEmailSink {
    fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = EmailPayload {
            id: Uuid::new_v4().to_string(),
            to: &notification.recipients,
            from: &self.from,
            subject: &notification.subject,
            body: &notification.body,
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339)?,
        };
        let text = serde_json::to_string(&payload)?;
        self.transport.publish(&self.topic, &text)?;
        Ok(())
    }
}

/// Test notifier keeping every notification it receives.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use warden_devkit::MockTransport;

    #[derive(Default)]
    struct CountingSink {
        delivered: Mutex<Vec<String>>,
    }

    impl NotificationSink for CountingSink {
        fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.delivered.lock().push(notification.subject.clone());
            Ok(())
        }
    }

    fn note(subject: &str, force: bool) -> Notification {
        Notification {
            kind: NotificationKind::Reminder,
            recipients: "ops@example.org".into(),
            subject: subject.into(),
            body: "body".into(),
            force,
        }
    }

    #[test]
    fn subject_is_host_portion_only() {
        assert_eq!(derive_subject("node7-ingest"), "node7-ingest");
        assert_eq!(derive_subject("https://ops.example.org:8443/health?x=1"), "ops.example.org");
        assert_eq!(derive_subject("amqp://user@bus.lan/vhost"), "bus.lan");
        assert_eq!(derive_subject("bus.lan:5672"), "bus.lan");
    }

    #[test]
    fn repeats_are_throttled_unless_forced() {
        let sink = Arc::new(CountingSink::default());
        let dispatcher = NotificationDispatcher::new(Duration::from_secs(120)).with_sink(sink.clone());

        assert_eq!(dispatcher.dispatch_at(&note("a", false), 0), Delivery::Sent);
        assert_eq!(dispatcher.dispatch_at(&note("a", false), 60_000), Delivery::Suppressed);
        assert_eq!(dispatcher.dispatch_at(&note("b", false), 60_000), Delivery::Sent);
        assert_eq!(dispatcher.dispatch_at(&note("a", true), 61_000), Delivery::Sent);
        assert_eq!(dispatcher.dispatch_at(&note("a", false), 181_001), Delivery::Sent);

        assert_eq!(*sink.delivered.lock(), vec!["a", "b", "a", "a"]);
    }

    #[test]
    fn kinds_are_throttled_separately() {
        let sink = Arc::new(CountingSink::default());
        let dispatcher = NotificationDispatcher::new(Duration::from_secs(120)).with_sink(sink.clone());
        let alert = Notification {
            kind: NotificationKind::ComponentAlert,
            ..note("a", false)
        };

        assert_eq!(dispatcher.dispatch_at(&note("a", true), 0), Delivery::Sent);
        assert_eq!(dispatcher.dispatch_at(&alert, 1_000), Delivery::Sent);
        assert_eq!(dispatcher.dispatch_at(&alert, 2_000), Delivery::Suppressed);
        assert_eq!(dispatcher.dispatch_at(&note("a", false), 3_000), Delivery::Suppressed);
    }

    #[test]
    fn huge_throttle_does_not_wrap() {
        let dispatcher = NotificationDispatcher::new(Duration::MAX);
        assert_eq!(dispatcher.dispatch_at(&note("a", false), 0), Delivery::Sent);
        assert_eq!(dispatcher.dispatch_at(&note("a", false), 1_000), Delivery::Suppressed);
    }

    #[test]
    fn component_notification_frames_body() {
        let n = Notification::for_component(
            NotificationKind::Unresponsive,
            "ops",
            "[warden]",
            "node7-ingest",
            "went quiet",
            true,
        );
        assert_eq!(n.subject, "[warden] node7-ingest");
        assert!(n.body.starts_with("Alert for component: 'node7-ingest'"));
        assert!(n.body.contains("went quiet"));
        assert!(n.force);
    }

    #[test]
    fn email_sink_publishes_json() {
        let transport = MockTransport::new();
        let sink = BusEmailSink::new(Arc::new(transport.clone()), "warden/notify/email", "warden@example.org");

        sink.deliver(&note("subject", false)).unwrap();

        let email = transport.last_json_on("warden/notify/email").unwrap().unwrap();
        assert_eq!(email["to"], "ops@example.org");
        assert_eq!(email["from"], "warden@example.org");
        assert_eq!(email["subject"], "subject");
        assert!(email["id"].as_str().is_some());
    }
}
