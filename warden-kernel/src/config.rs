/**
 * CONFIGURATION - warden.yaml avec surcharges par variables d'environnement
 *
 * RÔLE : Chaque section a ses valeurs par défaut : un fichier partiel (ou
 * absent) donne un kernel exécutable. Un fichier illisible ou invalide est fatal.
 */

use crate::actuator::LifecycleSettings;
use crate::heartbeat::HeartbeatSettings;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use warden_messages::{topics, MqttSettings, DEFAULT_SENTINEL};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConf {
    pub name: String,
    pub node: String,
}

impl Default for IdentityConf {
    fn default() -> Self {
        Self { name: "warden".into(), node: "localhost".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConf {
    pub probe_interval_secs: u64,
    pub evaluation_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub reminder_interval_mins: u64,
    pub period_before_restart_mins: u64,
    pub discovery_grace_secs: u64,
    /// Legacy plain-text heartbeat
    pub sentinel: String,
    pub status_topic: String,
    pub inbound_topics: Vec<String>,
    pub remediation_enabled: bool,
}

impl Default for HeartbeatConf {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            evaluation_interval_secs: 5,
            stale_threshold_secs: 60,
            reminder_interval_mins: 60,
            period_before_restart_mins: 5,
            discovery_grace_secs: 35,
            sentinel: DEFAULT_SENTINEL.into(),
            status_topic: topics::KERNEL_STATUS.into(),
            inbound_topics: vec![
                topics::HEARTBEAT_REPLIES.into(),
                topics::HEARTBEAT_REPLIES_WILDCARD.into(),
                topics::REGISTRATIONS.into(),
                topics::ALERTS.into(),
            ],
            remediation_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConf {
    pub recipients: String,
    pub from: String,
    /// Email relay topic; no email when unset
    pub topic: Option<String>,
    pub subject_prefix: String,
    pub throttle_secs: u64,
}

impl Default for NotifyConf {
    fn default() -> Self {
        Self {
            recipients: String::new(),
            from: "warden@localhost".into(),
            topic: Some(topics::EMAIL.into()),
            subject_prefix: "[warden]".into(),
            throttle_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConf {
    pub path: PathBuf,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { path: PathBuf::from("./data/components.json") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConf {
    /// Registration list imported at startup, skipped when absent
    pub reglist: Option<PathBuf>,
}

impl Default for RegistrationConf {
    fn default() -> Self {
        Self { reglist: Some(PathBuf::from("config/warden.reglist")) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConf {
    pub topic: Option<String>,
    pub interval_secs: u64,
}

impl Default for HealthConf {
    fn default() -> Self {
        Self { topic: Some(topics::HEALTH.into()), interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub identity: IdentityConf,
    pub mqtt: MqttSettings,
    pub heartbeat: HeartbeatConf,
    pub lifecycle: LifecycleSettings,
    pub notify: NotifyConf,
    pub store: StoreConf,
    pub registration: RegistrationConf,
    pub health: HealthConf,
    pub shutdown_grace_secs: u64,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConf::default(),
            mqtt: MqttSettings::default(),
            heartbeat: HeartbeatConf::default(),
            lifecycle: LifecycleSettings::default(),
            notify: NotifyConf::default(),
            store: StoreConf::default(),
            registration: RegistrationConf::default(),
            health: HealthConf::default(),
            shutdown_grace_secs: 10,
        }
    }
}

impl WardenConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text).context("invalid configuration")?;
        Ok(config)
    }

    /// `WARDEN_MQTT_HOST` / `WARDEN_MQTT_PORT`
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("WARDEN_MQTT_HOST").filter(|h| !h.trim().is_empty()) {
            self.mqtt.host = host.trim().to_string();
        }
        if let Some(port) = lookup("WARDEN_MQTT_PORT") {
            self.mqtt.port = port
                .trim()
                .parse()
                .with_context(|| format!("WARDEN_MQTT_PORT is not a port: {port}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let hb = &self.heartbeat;
        let intervals = [
            ("heartbeat.probe_interval_secs", hb.probe_interval_secs),
            ("heartbeat.evaluation_interval_secs", hb.evaluation_interval_secs),
            ("heartbeat.stale_threshold_secs", hb.stale_threshold_secs),
            ("heartbeat.reminder_interval_mins", hb.reminder_interval_mins),
            ("heartbeat.period_before_restart_mins", hb.period_before_restart_mins),
            ("health.interval_secs", self.health.interval_secs),
            ("lifecycle.timeout_secs", self.lifecycle.timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.identity.name.trim().is_empty() || self.identity.node.trim().is_empty() {
            bail!("identity.name and identity.node must not be empty");
        }
        if hb.inbound_topics.is_empty() {
            bail!("heartbeat.inbound_topics must list at least one topic");
        }
        Ok(())
    }

    pub fn heartbeat_settings(&self) -> HeartbeatSettings {
        let hb = &self.heartbeat;
        HeartbeatSettings {
            name: self.identity.name.clone(),
            node: self.identity.node.clone(),
            probe_interval: Duration::from_secs(hb.probe_interval_secs),
            evaluation_interval: Duration::from_secs(hb.evaluation_interval_secs),
            stale_threshold: Duration::from_secs(hb.stale_threshold_secs),
            reminder_interval: Duration::from_secs(hb.reminder_interval_mins * 60),
            period_before_restart: Duration::from_secs(hb.period_before_restart_mins * 60),
            discovery_grace: Duration::from_secs(hb.discovery_grace_secs),
            status_topic: hb.status_topic.clone(),
            remediation_enabled: hb.remediation_enabled,
            recipients: self.notify.recipients.clone(),
            subject_prefix: self.notify.subject_prefix.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

pub fn load_config_from(path: &Path) -> Result<WardenConfig> {
    if !path.exists() {
        warn!("[config] no {}, using defaults", path.display());
        return Ok(WardenConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    if text.trim().is_empty() {
        warn!("[config] {} is empty, using defaults", path.display());
    }
    WardenConfig::from_yaml(&text).with_context(|| format!("in {}", path.display()))
}

/// `WARDEN_CONFIG` or `warden.yaml`, then environment overrides, then validation.
pub fn load_config() -> Result<WardenConfig> {
    let path = std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| "warden.yaml".into());
    let mut config = load_config_from(Path::new(&path))?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    info!(
        "[config] loaded {} (mqtt {}:{}, identity {}-{})",
        path, config.mqtt.host, config.mqtt.port, config.identity.node, config.identity.name
    );
    Ok(config)
}
