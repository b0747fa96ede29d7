//! Process-wide record of installed modules and their live instances.
//!
//! Lifecycle state is persisted through a [`LifecycleStore`] and is the
//! source of truth for what should run at next startup. Live instances are
//! owned here; the poller and dispatcher only ever hold [`ModuleHandle`]s,
//! whose generation lets the registry ignore results for instances that have
//! since been reloaded or detached.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{panic_message, ActionError, LoadError, RegistryError};
use crate::module::ServiceModule;
use crate::persistence::{LifecycleRecord, LifecycleStore};
use crate::supervisor::dispatcher::ActionRecord;
use crate::supervisor::snapshot::StatusEntry;

use super::installer::ModuleStore;
use super::loader::ModuleLoader;
use super::types::{ModuleDescriptor, SourceTier};

/// Whether an installed module is usable right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PluginHealth {
    Loaded,
    /// Installed but never loaded in this process.
    NotLoaded,
    /// Record exists but its source is gone from the store.
    Missing,
    Broken { error: String },
}

impl fmt::Display for PluginHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginHealth::Loaded => f.write_str("loaded"),
            PluginHealth::NotLoaded => f.write_str("not loaded"),
            PluginHealth::Missing => f.write_str("missing"),
            PluginHealth::Broken { error } => write!(f, "broken: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstallOutcome {
    Installed,
    /// New content replaced an older install; the enabled flag was kept.
    Updated,
    /// Identical content was already installed.
    Unchanged,
    /// The installed copy came from a higher priority tier and was kept.
    Superseded {
        winner: SourceTier,
        winner_origin: String,
        winner_version: String,
    },
}

/// Registry-mediated access to one live service instance.
#[derive(Clone)]
pub struct ModuleHandle {
    pub plugin_id: String,
    pub id: String,
    pub name: String,
    pub generation: u64,
    module: Arc<dyn ServiceModule>,
}

impl ModuleHandle {
    pub fn module(&self) -> Arc<dyn ServiceModule> {
        self.module.clone()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("plugin_id", &self.plugin_id)
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Read-only view of one live instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
    pub generation: u64,
    pub last_status: Option<StatusEntry>,
    pub last_action: Option<ActionRecord>,
}

/// Read-only view of one installed module.
#[derive(Debug, Clone, Serialize)]
pub struct PluginEntry {
    pub record: LifecycleRecord,
    pub health: PluginHealth,
    pub instances: Vec<InstanceInfo>,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: usize,
    pub loaded: Vec<String>,
    pub failed: Vec<(String, RegistryError)>,
}

struct InstanceSlot {
    id: String,
    name: String,
    icon: Option<String>,
    generation: u64,
    module: Arc<dyn ServiceModule>,
    last_status: Option<StatusEntry>,
    last_action: Option<ActionRecord>,
}

impl InstanceSlot {
    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
            generation: self.generation,
            last_status: self.last_status.clone(),
            last_action: self.last_action.clone(),
        }
    }

    fn handle(&self, plugin_id: &str) -> ModuleHandle {
        ModuleHandle {
            plugin_id: plugin_id.to_string(),
            id: self.id.clone(),
            name: self.name.clone(),
            generation: self.generation,
            module: self.module.clone(),
        }
    }
}

struct Entry {
    record: LifecycleRecord,
    health: PluginHealth,
    instances: Vec<InstanceSlot>,
}

/// Identity read from a freshly constructed instance.
struct LoadedInstance {
    id: String,
    name: String,
    icon: Option<String>,
    module: Arc<dyn ServiceModule>,
}

pub struct LifecycleRegistry {
    loader: ModuleLoader,
    store: ModuleStore,
    records: Arc<dyn LifecycleStore>,
    load_timeout: Duration,
    entries: RwLock<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    generation: AtomicU64,
}

impl LifecycleRegistry {
    pub fn new(
        loader: ModuleLoader,
        store: ModuleStore,
        records: Arc<dyn LifecycleStore>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            loader,
            store,
            records,
            load_timeout,
            entries: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn store(&self) -> &ModuleStore {
        &self.store
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Per-id lock serialising lifecycle mutations.
    fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    fn record(&self, id: &str) -> Result<LifecycleRecord, RegistryError> {
        if let Some(entry) = self.read().get(id) {
            return Ok(entry.record.clone());
        }
        // The store may hold records this process has not restored yet.
        match self.records.get(id).map_err(RegistryError::Storage)? {
            Some(record) => {
                let health = if self.store.path(id).is_file() {
                    PluginHealth::NotLoaded
                } else {
                    PluginHealth::Missing
                };
                self.write().entry(id.to_string()).or_insert(Entry {
                    record: record.clone(),
                    health,
                    instances: Vec::new(),
                });
                Ok(record)
            }
            None => Err(RegistryError::NotInstalled(id.to_string())),
        }
    }

    /// Loads every persisted record. Enabled modules are loaded; failures
    /// are reported and leave the module listed as broken or missing.
    pub async fn restore(&self) -> Result<RestoreReport, RegistryError> {
        let listing = self.records.list().map_err(RegistryError::Storage)?;
        let records = listing.records;
        let mut report = RestoreReport {
            restored: records.len() + listing.corrupt.len(),
            ..Default::default()
        };

        {
            let mut entries = self.write();
            for (id, message) in listing.corrupt {
                warn!(module = %id, error = %message, "Lifecycle record is unreadable");
                // Lowest tier and disabled, so any install or a remove repairs it.
                let record = LifecycleRecord::installed(
                    &id,
                    "unknown",
                    &ModuleStore::file_name(&id),
                    "",
                    SourceTier::Remote,
                );
                entries.entry(id.clone()).or_insert(Entry {
                    record,
                    health: PluginHealth::Broken {
                        error: format!("unreadable lifecycle record: {message}"),
                    },
                    instances: Vec::new(),
                });
                report
                    .failed
                    .push((id.clone(), RegistryError::CorruptRecord { id, message }));
            }
            for record in &records {
                let health = if self.store.path(&record.id).is_file() {
                    PluginHealth::NotLoaded
                } else {
                    warn!(module = %record.id, "Installed source is missing from the store");
                    PluginHealth::Missing
                };
                entries.entry(record.id.clone()).or_insert(Entry {
                    record: record.clone(),
                    health,
                    instances: Vec::new(),
                });
            }
        }

        for record in records.into_iter().filter(|r| r.enabled) {
            let lock = self.lock_for(&record.id);
            let _guard = lock.lock().await;
            match self.ensure_loaded(&record.id).await {
                Ok(()) => report.loaded.push(record.id),
                Err(e) => {
                    warn!(module = %record.id, error = %e, "Failed to restore module");
                    report.failed.push((record.id, e));
                }
            }
        }

        info!(
            "Restored {} modules ({} loaded, {} failed)",
            report.restored,
            report.loaded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Copies the source into the managed store. New installs start disabled.
    ///
    /// A copy installed from a higher priority tier is kept and reported as
    /// [`InstallOutcome::Superseded`]; see [`Self::force_install`].
    pub async fn install(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<InstallOutcome, RegistryError> {
        self.install_inner(descriptor, false).await
    }

    /// Installs regardless of which tier the current copy came from.
    pub async fn force_install(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<InstallOutcome, RegistryError> {
        self.install_inner(descriptor, true).await
    }

    async fn install_inner(
        &self,
        descriptor: &ModuleDescriptor,
        force: bool,
    ) -> Result<InstallOutcome, RegistryError> {
        let lock = self.lock_for(&descriptor.id);
        let _guard = lock.lock().await;

        self.loader.validate(descriptor)?;

        let existing = match self.record(&descriptor.id) {
            Ok(record) => Some(record),
            Err(RegistryError::NotInstalled(_)) => None,
            Err(e) => return Err(e),
        };

        let store_present = self.store.path(&descriptor.id).is_file();
        if let Some(record) = &existing {
            if record.content_hash == descriptor.content_hash && store_present {
                debug!(module = %descriptor.id, "Already installed with identical content");
                return Ok(InstallOutcome::Unchanged);
            }
            if !force && record.source_tier < descriptor.origin.tier {
                info!(
                    module = %descriptor.id,
                    installed = ?record.source_tier,
                    incoming = ?descriptor.origin.tier,
                    "Keeping copy from higher priority tier"
                );
                return Ok(InstallOutcome::Superseded {
                    winner: record.source_tier,
                    winner_origin: record.source_origin.clone(),
                    winner_version: record.installed_version.clone(),
                });
            }
        }

        self.store.write(descriptor).map_err(RegistryError::Storage)?;

        let source_file = ModuleStore::file_name(&descriptor.id);
        let record = match &existing {
            Some(previous) => LifecycleRecord {
                installed_version: descriptor.version.clone(),
                installed_at: chrono::Utc::now(),
                source_file,
                content_hash: descriptor.content_hash.clone(),
                source_tier: descriptor.origin.tier,
                source_origin: descriptor.origin.location.to_string(),
                ..previous.clone()
            },
            None => LifecycleRecord::installed(
                &descriptor.id,
                &descriptor.version,
                &source_file,
                &descriptor.content_hash,
                descriptor.origin.tier,
            )
            .with_origin(descriptor.origin.location.to_string()),
        };
        self.records.put(&record).map_err(RegistryError::Storage)?;

        let reload = {
            let mut entries = self.write();
            let entry = entries.entry(descriptor.id.clone()).or_insert(Entry {
                record: record.clone(),
                health: PluginHealth::NotLoaded,
                instances: Vec::new(),
            });
            entry.record = record.clone();
            entry.instances.clear();
            entry.health = PluginHealth::NotLoaded;
            record.enabled
        };

        if reload {
            if let Err(e) = self.ensure_loaded(&descriptor.id).await {
                warn!(module = %descriptor.id, error = %e, "Reload after update failed");
            }
        }

        Ok(match existing {
            Some(_) => InstallOutcome::Updated,
            None => InstallOutcome::Installed,
        })
    }

    /// Loads the module if it has no live instances, then marks it enabled.
    /// Returns false when it already was.
    pub async fn enable(&self, id: &str) -> Result<bool, RegistryError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self.record(id)?;
        self.ensure_loaded(id).await?;

        if record.enabled {
            return Ok(false);
        }
        self.set_enabled(&record, true)?;
        info!(module = %id, "Enabled");
        Ok(true)
    }

    /// Marks the module disabled. Instances stay resident for a cheap re-enable.
    pub async fn disable(&self, id: &str) -> Result<bool, RegistryError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self.record(id)?;
        if !record.enabled {
            return Ok(false);
        }
        self.set_enabled(&record, false)?;
        info!(module = %id, "Disabled");
        Ok(true)
    }

    /// Deletes the installed source and its record. Permitted only when every
    /// live instance reports it can be removed. Returns the ids of the
    /// instances that were dropped, or `None` when nothing was installed.
    pub async fn remove(&self, id: &str) -> Result<Option<Vec<String>>, RegistryError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        match self.record(id) {
            Ok(_) => {}
            Err(RegistryError::NotInstalled(_)) => {
                debug!(module = %id, "Nothing to remove");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let modules: Vec<(String, Arc<dyn ServiceModule>)> = self
            .read()
            .get(id)
            .map(|entry| {
                entry
                    .instances
                    .iter()
                    .map(|slot| (slot.id.clone(), slot.module.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (instance_id, module) in &modules {
            let module = module.clone();
            let verdict = tokio::time::timeout(
                self.load_timeout,
                tokio::task::spawn_blocking(move || module.can_remove()),
            )
            .await;
            let reason = match verdict {
                Ok(Ok(true)) => continue,
                Ok(Ok(false)) => format!("service '{instance_id}' reports it cannot be removed"),
                Ok(Err(e)) => format!("service '{instance_id}' failed the removal check: {e}"),
                Err(_) => format!("service '{instance_id}' did not answer the removal check"),
            };
            return Err(RegistryError::RemoveRejected {
                id: id.to_string(),
                reason,
            });
        }

        self.store.delete(id).map_err(RegistryError::Storage)?;
        self.records.delete(id).map_err(RegistryError::Storage)?;

        let removed = self
            .write()
            .remove(id)
            .map(|entry| entry.instances.into_iter().map(|slot| slot.id).collect())
            .unwrap_or_default();

        info!(module = %id, "Removed");
        Ok(Some(removed))
    }

    /// Every installed module, including missing and broken ones.
    pub fn get_all(&self) -> Vec<PluginEntry> {
        let mut all: Vec<PluginEntry> = self
            .read()
            .values()
            .map(|entry| PluginEntry {
                record: entry.record.clone(),
                health: entry.health.clone(),
                instances: entry.instances.iter().map(InstanceSlot::info).collect(),
            })
            .collect();
        all.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        all
    }

    pub fn get(&self, id: &str) -> Option<PluginEntry> {
        self.read().get(id).map(|entry| PluginEntry {
            record: entry.record.clone(),
            health: entry.health.clone(),
            instances: entry.instances.iter().map(InstanceSlot::info).collect(),
        })
    }

    /// Handles for every live instance of every enabled module.
    pub fn enabled_handles(&self) -> Vec<ModuleHandle> {
        self.read()
            .values()
            .filter(|entry| entry.record.enabled)
            .flat_map(|entry| entry.instances.iter().map(|s| s.handle(&entry.record.id)))
            .collect()
    }

    /// Handle for an instance by service id.
    pub fn handle(&self, instance_id: &str) -> Result<ModuleHandle, ActionError> {
        let entries = self.read();
        for entry in entries.values() {
            if let Some(slot) = entry.instances.iter().find(|s| s.id == instance_id) {
                if !entry.record.enabled {
                    return Err(ActionError::Disabled(instance_id.to_string()));
                }
                return Ok(slot.handle(&entry.record.id));
            }
        }
        Err(ActionError::NotFound(instance_id.to_string()))
    }

    /// Whether results for `handle` should still be published: its module is
    /// enabled and the instance has not been replaced or detached.
    pub fn is_current(&self, handle: &ModuleHandle) -> bool {
        self.read()
            .get(&handle.plugin_id)
            .filter(|entry| entry.record.enabled)
            .is_some_and(|entry| {
                entry
                    .instances
                    .iter()
                    .any(|s| s.id == handle.id && s.generation == handle.generation)
            })
    }

    fn with_slot<R>(
        &self,
        handle: &ModuleHandle,
        f: impl FnOnce(&mut InstanceSlot) -> R,
    ) -> Option<R> {
        let mut entries = self.write();
        entries
            .get_mut(&handle.plugin_id)?
            .instances
            .iter_mut()
            .find(|s| s.id == handle.id && s.generation == handle.generation)
            .map(f)
    }

    /// Caches the latest status on the instance. Stale handles are ignored.
    pub fn record_status(&self, handle: &ModuleHandle, status: &StatusEntry) -> bool {
        self.with_slot(handle, |slot| slot.last_status = Some(status.clone()))
            .is_some()
    }

    pub fn record_action(&self, handle: &ModuleHandle, action: ActionRecord) -> bool {
        self.with_slot(handle, |slot| slot.last_action = Some(action))
            .is_some()
    }

    /// Drops one instance after the service itself was removed.
    pub fn detach_instance(&self, handle: &ModuleHandle) -> bool {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(&handle.plugin_id) else {
            return false;
        };
        let before = entry.instances.len();
        entry
            .instances
            .retain(|s| !(s.id == handle.id && s.generation == handle.generation));
        let detached = entry.instances.len() != before;
        if detached {
            debug!(module = %handle.plugin_id, service = %handle.id, "Detached instance");
        }
        detached
    }

    fn set_enabled(&self, record: &LifecycleRecord, enabled: bool) -> Result<(), RegistryError> {
        let updated = LifecycleRecord {
            enabled,
            ..record.clone()
        };
        self.records.put(&updated).map_err(RegistryError::Storage)?;
        if let Some(entry) = self.write().get_mut(&record.id) {
            entry.record = updated;
        }
        Ok(())
    }

    /// Loads the module unless it already has live instances. Callers hold
    /// the module's lock.
    async fn ensure_loaded(&self, id: &str) -> Result<(), RegistryError> {
        if self
            .read()
            .get(id)
            .is_some_and(|entry| entry.health == PluginHealth::Loaded)
        {
            return Ok(());
        }

        let descriptor = match self.store.read(id).map_err(RegistryError::Storage)? {
            Some(descriptor) => descriptor,
            None => {
                self.set_health(id, PluginHealth::Missing);
                return Err(LoadError::InvalidSource {
                    origin: self.store.path(id).display().to_string(),
                    message: "installed source is missing".to_string(),
                }
                .into());
            }
        };

        match self.load_instances(&descriptor).await {
            Ok(loaded) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let mut entries = self.write();
                if let Err(e) = find_foreign_duplicate(&entries, id, &loaded) {
                    if let Some(entry) = entries.get_mut(id) {
                        entry.health = PluginHealth::Broken {
                            error: e.to_string(),
                        };
                        entry.instances.clear();
                    }
                    return Err(e.into());
                }
                if let Some(entry) = entries.get_mut(id) {
                    entry.instances = loaded
                        .into_iter()
                        .map(|instance| InstanceSlot {
                            id: instance.id,
                            name: instance.name,
                            icon: instance.icon,
                            generation,
                            module: instance.module,
                            last_status: None,
                            last_action: None,
                        })
                        .collect();
                    entry.health = PluginHealth::Loaded;
                    debug!(
                        module = %id,
                        generation,
                        "Loaded {} instances",
                        entry.instances.len()
                    );
                }
                Ok(())
            }
            Err(e) => {
                warn!(module = %id, error = %e, "Failed to load module");
                self.set_health(id, PluginHealth::Broken {
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    fn set_health(&self, id: &str, health: PluginHealth) {
        if let Some(entry) = self.write().get_mut(id) {
            entry.health = health;
            entry.instances.clear();
        }
    }

    /// Runs the loader on a worker thread under the load deadline.
    async fn load_instances(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<Vec<LoadedInstance>, LoadError> {
        let loader = self.loader.clone();
        let owned = descriptor.clone();
        let task = tokio::task::spawn_blocking(move || {
            let modules = loader.load(&owned)?;
            Ok::<_, LoadError>(
                modules
                    .into_iter()
                    .map(|module| LoadedInstance {
                        id: module.id(),
                        name: module.name(),
                        icon: module.icon(),
                        module,
                    })
                    .collect::<Vec<_>>(),
            )
        });

        match tokio::time::timeout(self.load_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => Err(LoadError::InitFailed {
                module: descriptor.id.clone(),
                cause: format!("panicked: {}", panic_message(e.into_panic().as_ref())),
            }),
            Ok(Err(e)) => Err(LoadError::InitFailed {
                module: descriptor.id.clone(),
                cause: e.to_string(),
            }),
            Err(_) => Err(LoadError::TimedOut {
                module: descriptor.id.clone(),
                timeout: self.load_timeout,
            }),
        }
    }
}

/// Service ids must be unique across all loaded modules.
fn find_foreign_duplicate(
    entries: &HashMap<String, Entry>,
    id: &str,
    loaded: &[LoadedInstance],
) -> Result<(), LoadError> {
    for (other_id, other) in entries.iter().filter(|(other_id, _)| *other_id != id) {
        for instance in loaded {
            if other.instances.iter().any(|s| s.id == instance.id) {
                return Err(LoadError::DuplicateId {
                    id: instance.id.clone(),
                    existing: other_id.clone(),
                });
            }
        }
    }
    Ok(())
}
