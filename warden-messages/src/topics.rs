//! Default topic layout shared by the kernel and the agents.

/// Heartbeat responses and legacy acks (`warden/heartbeat/<id>` for plain-text senders)
pub const HEARTBEAT_REPLIES: &str = "warden/heartbeat";
pub const HEARTBEAT_REPLIES_WILDCARD: &str = "warden/heartbeat/+";
pub const REGISTRATIONS: &str = "warden/register";
pub const ALERTS: &str = "warden/alerts";
/// Replies to probes addressed to the kernel itself
pub const KERNEL_STATUS: &str = "warden/status";
pub const EMAIL: &str = "warden/notify/email";
pub const HEALTH: &str = "warden/kernel/health";

/// Probe topic of a component when it does not configure one.
pub fn component_probe_topic(component_id: &str) -> String {
    format!("warden/components/{component_id}")
}

/// True when `topic` falls under the subscription `filter` (`+` and `#` wildcards).
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    rumqttc::matches(topic, filter)
}
