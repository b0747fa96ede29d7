//! Host facade wiring settings, discovery, the lifecycle registry, the status
//! poller and the action dispatcher together.
//!
//! Every user-facing operation returns a [`CommandOutcome`]. The outer
//! `Result` is reserved for host-level faults (lifecycle storage
//! unavailable) that the embedding application must decide about.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::RegistryError;
use crate::module::ModuleKinds;
use crate::persistence::{JsonFileStore, LifecycleStore};
use crate::redact::redact_credentials;
use crate::settings::Settings;
use crate::supervisor::{
    Action, ActionDispatcher, PollerConfig, StatusPoller, StatusSnapshot,
};

use super::discovery::{DiscoveryReport, ModuleDiscovery};
use super::installer::{InstallSource, ModuleStore};
use super::loader::ModuleLoader;
use super::registry::{InstallOutcome, LifecycleRegistry, PluginEntry, RestoreReport};
use super::remote::{HttpRepositoryClient, RepositoryClient};
use super::types::{ModuleDescriptor, ModuleOrigin, SourceTier};

/// Result of a user-facing operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Failure messages are shown verbatim, minus anything credential-like.
    pub fn failed(message: impl AsRef<str>) -> Self {
        Self {
            success: false,
            message: redact_credentials(message.as_ref()),
        }
    }
}

/// Splits registry errors into user-facing failures and fatal host faults.
fn outcome(error: RegistryError) -> Result<CommandOutcome> {
    if error.is_fatal() {
        error!(error = %error, "Lifecycle storage failure");
        return Err(anyhow::Error::new(error));
    }
    Ok(CommandOutcome::failed(error.to_string()))
}

pub struct DeckHostBuilder {
    settings: Settings,
    home_dir: Option<PathBuf>,
    workspace_roots: Vec<PathBuf>,
    kinds: ModuleKinds,
    client: Option<Arc<dyn RepositoryClient>>,
    records: Option<Arc<dyn LifecycleStore>>,
}

impl DeckHostBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn home_dir(mut self, home_dir: PathBuf) -> Self {
        self.home_dir = Some(home_dir);
        self
    }

    pub fn workspace_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.workspace_roots = roots;
        self
    }

    /// Module kinds beyond the built-in `command` kind.
    pub fn kinds(mut self, kinds: ModuleKinds) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn repository_client(mut self, client: Arc<dyn RepositoryClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn lifecycle_store(mut self, records: Arc<dyn LifecycleStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn build(self) -> Result<DeckHost> {
        let home_dir = match self.home_dir {
            Some(dir) => dir,
            None => dirs::home_dir().context("Failed to determine home directory")?,
        };
        let settings = self.settings;

        let records: Arc<dyn LifecycleStore> = match self.records {
            Some(records) => records,
            None => Arc::new(JsonFileStore::open(settings.plugins.state_dir(&home_dir))?),
        };
        let client: Arc<dyn RepositoryClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpRepositoryClient::new(settings.plugins.remote_timeout())?),
        };

        let loader = ModuleLoader::new(self.kinds, settings.permissions.clone());
        let registry = Arc::new(LifecycleRegistry::new(
            loader,
            ModuleStore::new(settings.plugins.store_dir(&home_dir)),
            records,
            settings.deck.load_timeout(),
        ));
        let poller = Arc::new(StatusPoller::new(
            registry.clone(),
            PollerConfig::from(&settings.deck),
        ));
        let dispatcher = ActionDispatcher::new(
            registry.clone(),
            poller.clone(),
            settings.deck.action_timeout(),
        );
        let discovery =
            ModuleDiscovery::from_config(&settings.plugins, &self.workspace_roots, &home_dir)?
                .with_client(client.clone());

        Ok(DeckHost {
            settings,
            discovery,
            client,
            registry,
            poller,
            dispatcher,
        })
    }
}

pub struct DeckHost {
    settings: Settings,
    discovery: ModuleDiscovery,
    client: Arc<dyn RepositoryClient>,
    registry: Arc<LifecycleRegistry>,
    poller: Arc<StatusPoller>,
    dispatcher: ActionDispatcher,
}

impl DeckHost {
    pub fn builder() -> DeckHostBuilder {
        DeckHostBuilder {
            settings: Settings::default(),
            home_dir: None,
            workspace_roots: Vec::new(),
            kinds: ModuleKinds::new(),
            client: None,
            records: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<LifecycleRegistry> {
        &self.registry
    }

    pub fn poller(&self) -> &Arc<StatusPoller> {
        &self.poller
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// Loads persisted lifecycle state and every enabled module.
    pub async fn restore(&self) -> Result<RestoreReport> {
        self.registry.restore().await.map_err(anyhow::Error::new)
    }

    pub fn spawn_poller(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.poller.clone().spawn(shutdown)
    }

    pub async fn discover(&self) -> DiscoveryReport {
        self.discovery.discover().await
    }

    pub fn entries(&self) -> Vec<PluginEntry> {
        self.registry.get_all()
    }

    /// Installed modules, including missing and broken ones.
    pub fn list(&self) -> CommandOutcome {
        let entries = self.entries();
        if entries.is_empty() {
            return CommandOutcome::ok("No modules installed");
        }

        let mut out = String::new();
        for entry in &entries {
            let state = if entry.record.enabled {
                "enabled"
            } else {
                "disabled"
            };
            let _ = writeln!(
                out,
                "{:<24} {:<10} {:<9} {}",
                entry.record.id, entry.record.installed_version, state, entry.health
            );
            for instance in &entry.instances {
                let _ = writeln!(out, "    {} ({})", instance.id, instance.name);
            }
        }
        CommandOutcome::ok(out.trim_end())
    }

    /// Modules found by discovery, with superseded copies and warnings.
    pub async fn available(&self) -> CommandOutcome {
        let report = self.discover().await;
        let mut out = String::new();

        for descriptor in &report.descriptors {
            let installed = self.registry.get(&descriptor.id).is_some();
            let _ = writeln!(
                out,
                "{:<24} {:<10} {:<12} {}{}",
                descriptor.id,
                descriptor.version,
                descriptor.author,
                descriptor.origin,
                if installed { " [installed]" } else { "" }
            );
            if let Some(error) = &descriptor.metadata_error {
                let _ = writeln!(out, "    error: {error}");
            }
        }
        for superseded in &report.superseded {
            let _ = writeln!(
                out,
                "superseded: {} at {} by {}{}",
                superseded.descriptor.id,
                superseded.descriptor.origin,
                superseded.winner,
                if superseded.conflict {
                    " (version conflict)"
                } else {
                    ""
                }
            );
        }
        for warning in &report.warnings {
            let _ = writeln!(out, "warning: {warning}");
        }

        if out.is_empty() {
            return CommandOutcome::ok("No modules found");
        }
        CommandOutcome::ok(out.trim_end())
    }

    /// Installs from a path, a URL or a discovered module id.
    pub async fn install(&self, source: &str) -> Result<CommandOutcome> {
        self.install_from(source, false).await
    }

    /// Installs even when the current copy came from a higher priority tier.
    pub async fn force_install(&self, source: &str) -> Result<CommandOutcome> {
        self.install_from(source, true).await
    }

    async fn install_from(&self, source: &str, force: bool) -> Result<CommandOutcome> {
        let parsed = match InstallSource::parse(source) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(CommandOutcome::failed(format!("{e:#}"))),
        };
        let report = match &parsed {
            InstallSource::Discovered(_) => self.discover().await,
            _ => DiscoveryReport::default(),
        };
        let descriptor = match parsed.resolve(&report, Some(self.client.as_ref())).await {
            Ok(descriptor) => descriptor,
            Err(e) => return Ok(CommandOutcome::failed(format!("{e:#}"))),
        };

        let before = self.instance_ids(&descriptor.id);
        let installed = if force {
            self.registry.force_install(&descriptor).await
        } else {
            self.registry.install(&descriptor).await
        };
        let installed = match installed {
            Ok(installed) => installed,
            Err(e) => return outcome(e),
        };
        let after = self.instance_ids(&descriptor.id);
        let vanished: Vec<String> = before.into_iter().filter(|id| !after.contains(id)).collect();
        self.poller.forget(&vanished);

        let message = match installed {
            InstallOutcome::Installed => format!(
                "Installed {} {} (disabled; enable it to start monitoring)",
                descriptor.id, descriptor.version
            ),
            InstallOutcome::Updated => {
                format!("Updated {} to {}", descriptor.id, descriptor.version)
            }
            InstallOutcome::Unchanged => {
                format!("{} {} is already installed", descriptor.id, descriptor.version)
            }
            InstallOutcome::Superseded {
                winner,
                winner_origin,
                winner_version,
            } => {
                let message = format!(
                    "Kept {} {} installed from {} ({:?}); {} from {} has lower priority, use --force to replace it",
                    descriptor.id,
                    winner_version,
                    winner_origin,
                    winner,
                    descriptor.version,
                    descriptor.origin
                );
                warn!("{}", message);
                return Ok(CommandOutcome::failed(message));
            }
        };
        info!("{}", message);
        Ok(CommandOutcome::ok(message))
    }

    pub async fn enable(&self, id: &str) -> Result<CommandOutcome> {
        match self.registry.enable(id).await {
            Ok(true) => Ok(CommandOutcome::ok(format!("Enabled {id}"))),
            Ok(false) => Ok(CommandOutcome::ok(format!("{id} is already enabled"))),
            Err(e) => outcome(e),
        }
    }

    pub async fn disable(&self, id: &str) -> Result<CommandOutcome> {
        match self.registry.disable(id).await {
            Ok(true) => Ok(CommandOutcome::ok(format!("Disabled {id}"))),
            Ok(false) => Ok(CommandOutcome::ok(format!("{id} is already disabled"))),
            Err(e) => outcome(e),
        }
    }

    /// Uninstalls a module. Irreversible.
    pub async fn remove(&self, id: &str) -> Result<CommandOutcome> {
        match self.registry.remove(id).await {
            Ok(Some(removed)) => {
                self.poller.forget(&removed);
                Ok(CommandOutcome::ok(format!("Removed {id}")))
            }
            Ok(None) => Ok(CommandOutcome::ok(format!("{id} is already removed"))),
            Err(e) => outcome(e),
        }
    }

    /// Checks a source file without installing or instantiating it.
    pub fn validate(&self, path: &Path) -> CommandOutcome {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                return CommandOutcome::failed(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                ))
            }
        };
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let descriptor =
            ModuleDescriptor::from_source(content, ModuleOrigin::file(SourceTier::Additional, path), stem);

        match self.registry.loader().validate(&descriptor) {
            Ok(report) => {
                let mut out = format!(
                    "{} {} is valid: {} services, {} factories",
                    report.module,
                    report.version,
                    report.services.len(),
                    report.factories
                );
                for skipped in &report.skipped {
                    let _ = write!(out, "\n    skipped {skipped}");
                }
                CommandOutcome::ok(out)
            }
            Err(e) => CommandOutcome::failed(e.to_string()),
        }
    }

    /// Runs one poll cycle and returns the published snapshot.
    pub async fn refresh_status(&self) -> Arc<StatusSnapshot> {
        self.poller.run_cycle().await
    }

    pub async fn status(&self) -> CommandOutcome {
        let snapshot = self.refresh_status().await;
        CommandOutcome::ok(format_snapshot(&snapshot))
    }

    pub async fn start(&self, id: &str) -> CommandOutcome {
        self.action(id, Action::Start).await
    }

    pub async fn stop(&self, id: &str) -> CommandOutcome {
        self.action(id, Action::Stop).await
    }

    pub async fn restart(&self, id: &str) -> CommandOutcome {
        self.action(id, Action::Restart).await
    }

    /// Removes the service itself (for example a container), not the module.
    pub async fn remove_service(&self, id: &str) -> CommandOutcome {
        self.action(id, Action::Remove).await
    }

    pub async fn action(&self, id: &str, action: Action) -> CommandOutcome {
        match self.dispatcher.request(id, action).await {
            Ok(done) => {
                let state = done
                    .status
                    .map(|status| format!(" ({})", status.state()))
                    .unwrap_or_default();
                CommandOutcome::ok(format!("{}{}", done.message, state))
            }
            Err(e) => CommandOutcome::failed(e.to_string()),
        }
    }

    fn instance_ids(&self, id: &str) -> Vec<String> {
        self.registry
            .get(id)
            .map(|entry| entry.instances.into_iter().map(|i| i.id).collect())
            .unwrap_or_default()
    }
}

pub fn format_snapshot(snapshot: &StatusSnapshot) -> String {
    if snapshot.is_empty() {
        return format!("#{} no enabled services", snapshot.sequence);
    }
    let mut out = format!(
        "#{} at {}",
        snapshot.sequence,
        snapshot.taken_at.format("%H:%M:%S")
    );
    for (id, entry) in &snapshot.entries {
        let _ = write!(out, "\n{:<32} {:<9}", id, entry.state().to_string());
        if let Some(error) = &entry.check_error {
            let _ = write!(out, " {error}");
        } else if !entry.details.is_empty() {
            let _ = write!(out, " {}", entry.details);
        }
    }
    out
}
