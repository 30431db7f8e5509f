/**
 * COMPONENT - Description d'un processus supervisé et suivi de ses alertes
 *
 * RÔLE : Une entrée par processus supervisé, clé `node-name`.
 * Les champs descriptifs viennent de l'enregistrement ; les champs mutables
 * ne sont modifiés que par le registry.
 */

use serde::{Deserialize, Serialize};
use warden_messages::{Category, Envelope, RegisterBody};

pub type ComponentId = String;

pub fn compound_id(node: &str, name: &str) -> ComponentId {
    format!("{node}-{name}")
}

/// Sentinel for "never alerted"
pub const NEVER: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredComponent {
    pub name: String,
    pub node: String,
    pub topic: Option<String>,
    pub path: Option<String>,
    pub metadata: Option<String>,
    #[serde(default)]
    pub category: Category,
    pub app_manager_name: Option<String>,
    #[serde(default)]
    pub jmx_enabled: bool,
    #[serde(default)]
    pub is_managed_app: bool,

    #[serde(default = "default_live")]
    pub live: bool,
    #[serde(default)]
    pub on_alert: bool,
    /// Last alert or reminder, unix ms
    #[serde(default = "never")]
    pub last_alert_time: i64,
    /// First alert of the current episode, unix ms
    #[serde(default = "never")]
    pub alert_started_at: i64,
    #[serde(default)]
    pub alert_count: u64,
    /// 0 when no remediation was ever attempted
    #[serde(default)]
    pub last_restart_time: i64,
}

fn default_live() -> bool {
    true
}

fn never() -> i64 {
    NEVER
}

impl MonitoredComponent {
    pub fn new(name: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            topic: None,
            path: None,
            metadata: None,
            category: Category::Unknown,
            app_manager_name: None,
            jmx_enabled: false,
            is_managed_app: false,
            live: true,
            on_alert: false,
            last_alert_time: NEVER,
            alert_started_at: NEVER,
            alert_count: 0,
            last_restart_time: 0,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Builds a component from a register message.
    pub fn from_registration(envelope: &Envelope, body: &RegisterBody) -> Self {
        Self {
            topic: body.topic.clone().filter(|t| !t.trim().is_empty()),
            path: body.path.clone(),
            metadata: body.metadata.clone(),
            category: body.category,
            app_manager_name: body.app_manager_name.clone(),
            jmx_enabled: body.jmx_enabled,
            is_managed_app: body.is_managed_app,
            ..Self::new(envelope.name.clone(), envelope.node.clone())
        }
    }

    pub fn id(&self) -> ComponentId {
        compound_id(&self.node, &self.name)
    }

    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.node.trim().is_empty()
    }

    /// Name the lifecycle script knows this component by.
    pub fn lifecycle_name(&self) -> &str {
        self.app_manager_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.name)
    }

    /// Pattern used to find a residual process in the process table.
    pub fn process_pattern(&self) -> &str {
        self.path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| self.lifecycle_name())
    }

    /// Back to healthy, as after a kernel restart. Counters are kept.
    pub fn reset_liveness(&mut self) {
        self.live = true;
        self.on_alert = false;
        self.last_alert_time = NEVER;
        self.alert_started_at = NEVER;
    }

    /// Copies descriptive fields from `other`, keeping alert and liveness state.
    pub fn refresh_description(&mut self, other: MonitoredComponent) {
        self.topic = other.topic;
        self.path = other.path;
        self.metadata = other.metadata;
        self.category = other.category;
        self.app_manager_name = other.app_manager_name;
        self.jmx_enabled = other.jmx_enabled;
        self.is_managed_app = other.is_managed_app;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_node_dash_name() {
        let component = MonitoredComponent::new("ingest", "node7");
        assert_eq!(component.id(), "node7-ingest");
        assert_eq!(component.last_alert_time, NEVER);
        assert_eq!(component.last_restart_time, 0);
        assert!(component.live);
    }

    #[test]
    fn lifecycle_name_prefers_app_manager_name() {
        let mut component = MonitoredComponent::new("ingest", "node7");
        assert_eq!(component.lifecycle_name(), "ingest");
        assert_eq!(component.process_pattern(), "ingest");

        component.app_manager_name = Some("ingest-svc".into());
        assert_eq!(component.lifecycle_name(), "ingest-svc");

        component.path = Some("/opt/ingest/ingest.jar".into());
        assert_eq!(component.process_pattern(), "/opt/ingest/ingest.jar");
    }

    #[test]
    fn registration_blank_topic_means_unprobeable() {
        let envelope = Envelope::new("ingest", "node7");
        let body = RegisterBody { topic: Some("  ".into()), ..Default::default() };
        assert!(MonitoredComponent::from_registration(&envelope, &body).topic.is_none());
    }

    #[test]
    fn stored_entries_without_state_get_defaults() {
        let json = r#"{"name":"ingest","node":"node7","topic":null,"path":null,"metadata":null,"app_manager_name":null}"#;
        let component: MonitoredComponent = serde_json::from_str(json).unwrap();
        assert!(component.live);
        assert_eq!(component.alert_started_at, NEVER);
        assert_eq!(component.category, Category::Unknown);
    }
}
