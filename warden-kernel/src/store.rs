/**
 * COMPONENT STORE - Persistance des enregistrements entre redémarrages
 *
 * RÔLE : Baseline des composants connus chargée au démarrage, tenue à jour
 * par un listener du registry. Fichier JSON, une map `id -> component`.
 * L'état d'alerte stocké n'est pas repris au redémarrage.
 */

use crate::component::{ComponentId, MonitoredComponent};
use crate::registry::{RegistryEvent, RegistryListener};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait ComponentStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<MonitoredComponent>, StoreError>;
    fn upsert(&self, component: &MonitoredComponent) -> Result<(), StoreError>;
    fn remove(&self, id: &str) -> Result<(), StoreError>;
}

pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<ComponentId, MonitoredComponent>>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, entries: &BTreeMap<ComponentId, MonitoredComponent>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ComponentStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<MonitoredComponent>, StoreError> {
        if !self.path.exists() {
            info!("[store] no existing store at {}, starting fresh", self.path.display());
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let loaded: BTreeMap<ComponentId, MonitoredComponent> = if content.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&content)?
        };

        let components = loaded.values().cloned().collect::<Vec<_>>();
        *self.entries.lock() = loaded;
        info!("[store] loaded {} component(s) from {}", components.len(), self.path.display());
        Ok(components)
    }

    fn upsert(&self, component: &MonitoredComponent) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        entries.insert(component.id(), component.clone());
        self.save(&entries)
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if entries.remove(id).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }
}

/// Keeps the store in step with registry events. Failures are logged only.
pub struct StoreListener {
    store: Arc<dyn ComponentStore>,
}

impl StoreListener {
    pub fn new(store: Arc<dyn ComponentStore>) -> Self {
        Self { store }
    }
}

impl RegistryListener for StoreListener {
    fn on_event(&self, event: &RegistryEvent, component: &MonitoredComponent) {
        let result = match event {
            RegistryEvent::Registered(_) => self.store.upsert(component),
            RegistryEvent::Unregistered(id) => self.store.remove(id),
        };
        match result {
            Ok(()) => debug!("[store] persisted {:?}", event),
            Err(e) => error!("[store] failed to persist {:?}: {}", event, e),
        }
    }
}
