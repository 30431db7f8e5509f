//! Agent configuration
//!
//! TOML file in the OS config directory (`warden-agent/config.toml`), or the
//! path in `WARDEN_AGENT_CONFIG`. Every field has a default; the node name
//! defaults to the host name.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_messages::{topics, Category, MqttSettings, DEFAULT_SENTINEL};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub component: ComponentConfig,
    pub mqtt: MqttSettings,
    pub topics: TopicsConfig,
    pub watch: WatchConfig,
    pub reregister_interval_secs: u64,
    pub unregister_on_exit: bool,
    pub sentinel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    pub name: String,
    pub node: String,
    pub category: Category,
    pub path: Option<String>,
    pub app_manager_name: Option<String>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Where the kernel probes this component; `warden/components/<id>` when unset
    pub probe: Option<String>,
    pub reply: String,
    pub registration: String,
    pub alerts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Data topics whose silence raises an alert; no watch when empty
    pub data_topics: Vec<String>,
    pub no_data_threshold_secs: u64,
    pub check_interval_secs: u64,
}

fn host_name() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            name: "component".into(),
            node: host_name(),
            category: Category::default(),
            path: None,
            app_manager_name: None,
            metadata: None,
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            probe: None,
            reply: topics::HEARTBEAT_REPLIES.into(),
            registration: topics::REGISTRATIONS.into(),
            alerts: topics::ALERTS.into(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { data_topics: Vec::new(), no_data_threshold_secs: 600, check_interval_secs: 30 }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            component: ComponentConfig::default(),
            mqtt: MqttSettings { client_id: String::new(), ..MqttSettings::default() },
            topics: TopicsConfig::default(),
            watch: WatchConfig::default(),
            reregister_interval_secs: 60,
            unregister_on_exit: false,
            sentinel: DEFAULT_SENTINEL.into(),
        }
    }
}

impl AgentConfig {
    /// `node-name`, as the kernel knows this component
    pub fn component_id(&self) -> String {
        format!("{}-{}", self.component.node, self.component.name)
    }

    pub fn probe_topic(&self) -> String {
        self.topics
            .probe
            .clone()
            .unwrap_or_else(|| topics::component_probe_topic(&self.component_id()))
    }

    pub fn client_id(&self) -> String {
        if self.mqtt.client_id.trim().is_empty() {
            format!("warden-agent-{}", self.component_id())
        } else {
            self.mqtt.client_id.clone()
        }
    }

    pub fn reregister_interval(&self) -> Duration {
        Duration::from_secs(self.reregister_interval_secs.max(1))
    }

    pub fn no_data_threshold(&self) -> Duration {
        Duration::from_secs(self.watch.no_data_threshold_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.watch.check_interval_secs.max(1))
    }

    /// OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().context("could not find config directory")?;
        path.push("warden-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config = toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// `WARDEN_AGENT_CONFIG`, else the OS config directory.
    pub fn load() -> Result<(Self, PathBuf)> {
        let path = match std::env::var("WARDEN_AGENT_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::config_file_path()?,
        };
        let config = Self::load_from(&path)?;
        Ok((config, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_devkit::TempDataDir;

    #[test]
    fn defaults_derive_topics_from_identity() {
        let mut config = AgentConfig::default();
        config.component.name = "ingest".into();
        config.component.node = "node7".into();

        assert_eq!(config.component_id(), "node7-ingest");
        assert_eq!(config.probe_topic(), "warden/components/node7-ingest");
        assert_eq!(config.client_id(), "warden-agent-node7-ingest");
        assert_eq!(config.watch.no_data_threshold_secs, 600);
        assert!(!config.unregister_on_exit);
    }

    #[test]
    fn partial_file_is_completed_with_defaults() {
        let dir = TempDataDir::new().unwrap();
        let path = dir
            .write(
                "config.toml",
                r#"
reregister_interval_secs = 120

[component]
name = "ingest"
node = "node7"
category = "integration_consumer"

[watch]
data_topics = ["feeds/prices"]
"#,
            )
            .unwrap();

        let config = AgentConfig::load_from(&path).unwrap();
        assert_eq!(config.component.category, Category::IntegrationConsumer);
        assert_eq!(config.watch.data_topics, vec!["feeds/prices"]);
        assert_eq!(config.reregister_interval(), Duration::from_secs(120));
        assert_eq!(config.topics.reply, "warden/heartbeat");
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn config_file_path_is_namespaced() {
        if let Ok(path) = AgentConfig::config_file_path() {
            assert!(path.to_string_lossy().contains("warden-agent"));
            assert!(path.ends_with("config.toml"));
        }
    }
}
