/**
 * COMPONENT REGISTRY - Liste de référence des composants supervisés
 *
 * RÔLE : Enregistrement, import en masse depuis une liste d'enregistrement,
 * et toute mutation de l'état d'alerte ou de vivacité.
 *
 * ÉVÉNEMENTS : `Registered` / `Unregistered` sont livrés de façon synchrone
 * aux listeners, dans l'ordre d'abonnement, après libération du verrou de la
 * map et avant le retour de `register` / `unregister`.
 */

use crate::component::{ComponentId, MonitoredComponent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use warden_messages::{Category, MessageBody, MessageCodec};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown component: {0}")]
    UnknownComponent(ComponentId),
    #[error("invalid component: {0}")]
    InvalidComponent(String),
    #[error("registration list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(ComponentId),
    Unregistered(ComponentId),
}

impl RegistryEvent {
    pub fn component_id(&self) -> &str {
        match self {
            RegistryEvent::Registered(id) | RegistryEvent::Unregistered(id) => id,
        }
    }
}

pub trait RegistryListener: Send + Sync {
    /// `component` is the registered entry, or the removed one on `Unregistered`.
    fn on_event(&self, event: &RegistryEvent, component: &MonitoredComponent);
}

pub struct ComponentRegistry {
    components: RwLock<HashMap<ComponentId, MonitoredComponent>>,
    listeners: RwLock<Vec<Arc<dyn RegistryListener>>>,
    codec: MessageCodec,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new(MessageCodec::default())
    }
}

impl ComponentRegistry {
    pub fn new(codec: MessageCodec) -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            codec,
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.write().push(listener);
    }

    fn emit(&self, event: RegistryEvent, component: &MonitoredComponent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(&event, component);
        }
    }

    /// Installs components loaded from the store, without emitting events.
    /// Stored alert episodes are not resumed: liveness starts over.
    pub fn seed(&self, components: Vec<MonitoredComponent>) -> usize {
        let mut map = self.components.write();
        let mut seeded = 0;
        for mut component in components {
            component.reset_liveness();
            if !component.is_valid() {
                warn!("[registry] skipping invalid stored component {:?}", component.name);
                continue;
            }
            map.insert(component.id(), component);
            seeded += 1;
        }
        info!("[registry] seeded {} component(s) from store", seeded);
        seeded
    }

    /// Inserts or refreshes a component. Alert state of an existing entry is kept.
    pub fn register(&self, component: MonitoredComponent) -> Result<(), RegistryError> {
        if !component.is_valid() {
            return Err(RegistryError::InvalidComponent(format!(
                "name={:?} node={:?}",
                component.name, component.node
            )));
        }

        let id = component.id();
        let registered = {
            let mut map = self.components.write();
            match map.get_mut(&id) {
                Some(existing) => {
                    existing.refresh_description(component);
                    existing.clone()
                }
                None => {
                    map.insert(id.clone(), component.clone());
                    component
                }
            }
        };

        info!("[registry] registered {}", id);
        self.emit(RegistryEvent::Registered(id), &registered);
        Ok(())
    }

    /// Bulk import. Records whose id is already present are left untouched.
    pub fn register_from_file(&self, path: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut added = 0;
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(component) = self.parse_record(line) else {
                warn!("[registry] {}:{} unreadable record, skipped", path.display(), index + 1);
                continue;
            };
            if self.contains(&component.id()) {
                debug!("[registry] {} already registered, skipped", component.id());
                continue;
            }
            match self.register(component) {
                Ok(()) => added += 1,
                Err(e) => warn!("[registry] {}:{} {}", path.display(), index + 1, e),
            }
        }

        info!("[registry] imported {} new component(s) from {}", added, path.display());
        Ok(added)
    }

    // JSON register envelope, or `name,node,topic[,category[,path]]`
    fn parse_record(&self, line: &str) -> Option<MonitoredComponent> {
        if line.starts_with('{') {
            let message = self.codec.parse(line)?;
            return match &message.body {
                MessageBody::Register(body) => {
                    Some(MonitoredComponent::from_registration(&message.envelope, body))
                }
                _ => None,
            };
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 || fields[..3].iter().any(|field| field.is_empty()) {
            return None;
        }
        let mut component = MonitoredComponent::new(fields[0], fields[1]).with_topic(fields[2]);
        if let Some(category) = fields.get(3).filter(|c| !c.is_empty()) {
            component = component.with_category(Category::from_name(category));
        }
        if let Some(path) = fields.get(4).filter(|p| !p.is_empty()) {
            component = component.with_path(*path);
        }
        Some(component)
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.components.write().remove(id);
        match removed {
            Some(component) => {
                info!("[registry] unregistered {}", id);
                self.emit(RegistryEvent::Unregistered(id.to_string()), &component);
                true
            }
            None => {
                debug!("[registry] unregister of unknown component {}", id);
                false
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<MonitoredComponent> {
        self.components.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.components.read().contains_key(id)
    }

    pub fn list_ids(&self) -> Vec<ComponentId> {
        let mut ids: Vec<ComponentId> = self.components.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.components.read().len()
    }

    pub fn snapshot(&self) -> Vec<MonitoredComponent> {
        self.components.read().values().cloned().collect()
    }

    /// Id of the single component registered under `name`, if exactly one exists.
    pub fn find_by_name(&self, name: &str) -> Option<ComponentId> {
        let map = self.components.read();
        let mut matches = map.values().filter(|c| c.name == name);
        match (matches.next(), matches.next()) {
            (Some(component), None) => Some(component.id()),
            _ => None,
        }
    }

    pub fn count_on_alert(&self) -> usize {
        self.components.read().values().filter(|c| c.on_alert).count()
    }

    fn with_component<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut MonitoredComponent) -> T,
    ) -> Result<T, RegistryError> {
        let mut map = self.components.write();
        let component = map
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownComponent(id.to_string()))?;
        Ok(f(component))
    }

    /// Puts `id` on alert at `now`. A new episode starts when it was not on alert.
    pub fn mark_alert(&self, id: &str, now: i64) -> Result<(), RegistryError> {
        self.with_component(id, |c| {
            if !c.on_alert {
                c.alert_started_at = now;
            }
            c.alert_count += 1;
            c.last_alert_time = now;
            c.on_alert = true;
        })
    }

    /// Reminder bookkeeping: only `last_alert_time` moves.
    pub fn refresh_alert(&self, id: &str, now: i64) -> Result<(), RegistryError> {
        self.with_component(id, |c| c.last_alert_time = now)
    }

    pub fn clear_alert(&self, id: &str) -> Result<(), RegistryError> {
        self.with_component(id, |c| {
            c.on_alert = false;
            c.live = true;
            c.alert_started_at = crate::component::NEVER;
        })
    }

    pub fn alert_time_of(&self, id: &str) -> Result<i64, RegistryError> {
        self.with_component(id, |c| c.last_alert_time)
    }

    /// Start of the current alert episode, `None` when not on alert.
    pub fn alert_started_at(&self, id: &str) -> Result<Option<i64>, RegistryError> {
        self.with_component(id, |c| c.on_alert.then_some(c.alert_started_at))
    }

    pub fn is_on_alert(&self, id: &str) -> Result<bool, RegistryError> {
        self.with_component(id, |c| c.on_alert)
    }

    pub fn set_live(&self, id: &str, live: bool) -> Result<(), RegistryError> {
        self.with_component(id, |c| c.live = live)
    }

    pub fn record_restart(&self, id: &str, now: i64) -> Result<(), RegistryError> {
        self.with_component(id, |c| c.last_restart_time = now)
    }
}
