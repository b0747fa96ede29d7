//! Module discovery from local directories and remote repositories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::DiscoveryError;
use crate::settings::config::PluginsConfig;

use super::remote::{fetch_index, HttpRepositoryClient, RepositoryClient};
use super::types::{
    ModuleDescriptor, ModuleOrigin, SourceTier, SupersededDescriptor, MODULE_EXTENSION,
    PRIVATE_PREFIX,
};

/// One place modules are looked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverySource {
    LocalDir { path: PathBuf, tier: SourceTier },
    Remote { url: String },
}

impl DiscoverySource {
    pub fn tier(&self) -> SourceTier {
        match self {
            DiscoverySource::LocalDir { tier, .. } => *tier,
            DiscoverySource::Remote { .. } => SourceTier::Remote,
        }
    }
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Winning descriptors, in priority order.
    pub descriptors: Vec<ModuleDescriptor>,
    /// Descriptors shadowed by a higher-priority source with the same id.
    pub superseded: Vec<SupersededDescriptor>,
    /// Sources that could not be scanned. Discovery of the others went on.
    pub warnings: Vec<DiscoveryError>,
}

impl DiscoveryReport {
    pub fn find(&self, id: &str) -> Option<&ModuleDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Scans configured sources for module files.
pub struct ModuleDiscovery {
    sources: Vec<DiscoverySource>,
    client: Option<Arc<dyn RepositoryClient>>,
    remote_timeout: Duration,
}

impl ModuleDiscovery {
    /// Sources are scanned in tier order; within a tier, in the given order.
    pub fn new(mut sources: Vec<DiscoverySource>, remote_timeout: Duration) -> Self {
        sources.sort_by_key(|s| s.tier());
        Self {
            sources,
            client: None,
            remote_timeout,
        }
    }

    /// Builds the source list from settings:
    /// 1. `<workspace>/.controldeck/plugins` for each workspace root (highest priority)
    /// 2. `~/.controldeck/plugins`
    /// 3. the system directory
    /// 4. additional configured directories
    /// 5. remote repositories (lowest priority)
    pub fn from_config(
        config: &PluginsConfig,
        workspace_roots: &[PathBuf],
        home_dir: &Path,
    ) -> Result<Self> {
        let mut sources = Vec::new();

        if !config.enabled {
            debug!("Module discovery is disabled in config");
            return Ok(Self::new(sources, config.remote_timeout()));
        }

        for root in workspace_roots {
            for dir in &config.workspace_dirs {
                let path = if dir.is_absolute() {
                    dir.clone()
                } else {
                    root.join(dir)
                };
                sources.push(DiscoverySource::LocalDir {
                    path,
                    tier: SourceTier::Workspace,
                });
            }
        }

        if config.include_user_dir {
            sources.push(DiscoverySource::LocalDir {
                path: home_dir.join(".controldeck").join("plugins"),
                tier: SourceTier::User,
            });
        }

        if let Some(dir) = &config.system_dir {
            sources.push(DiscoverySource::LocalDir {
                path: dir.clone(),
                tier: SourceTier::System,
            });
        }

        for dir in &config.additional_dirs {
            sources.push(DiscoverySource::LocalDir {
                path: dir.clone(),
                tier: SourceTier::Additional,
            });
        }

        for url in &config.repositories {
            sources.push(DiscoverySource::Remote { url: url.clone() });
        }

        let mut discovery = Self::new(sources, config.remote_timeout());
        if !config.repositories.is_empty() {
            let client = HttpRepositoryClient::new(config.remote_timeout())?;
            discovery.client = Some(Arc::new(client));
        }
        Ok(discovery)
    }

    pub fn with_client(mut self, client: Arc<dyn RepositoryClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn sources(&self) -> &[DiscoverySource] {
        &self.sources
    }

    /// Scans every source. Never fails: unreadable or unreachable sources end
    /// up in the report's warnings.
    pub async fn discover(&self) -> DiscoveryReport {
        let mut found = Vec::new();
        let mut warnings = Vec::new();

        for source in &self.sources {
            match source {
                DiscoverySource::LocalDir { path, tier } => {
                    let (descriptors, errors) = scan_directory(path, *tier);
                    for e in &errors {
                        warn!(error = %e, "Skipping unreadable module source");
                    }
                    found.extend(descriptors);
                    warnings.extend(errors);
                }
                DiscoverySource::Remote { url } => {
                    let (descriptors, errors) = self.scan_remote(url).await;
                    for e in &errors {
                        warn!(error = %e, "Partial discovery");
                    }
                    found.extend(descriptors);
                    warnings.extend(errors);
                }
            }
        }

        let (descriptors, superseded) = deduplicate(found);
        debug!(
            "Discovered {} modules ({} superseded, {} warnings)",
            descriptors.len(),
            superseded.len(),
            warnings.len()
        );

        DiscoveryReport {
            descriptors,
            superseded,
            warnings,
        }
    }

    async fn scan_remote(&self, base: &str) -> (Vec<ModuleDescriptor>, Vec<DiscoveryError>) {
        let unavailable = |url: &str, message: String| DiscoveryError::RemoteUnavailable {
            url: url.to_string(),
            message,
        };

        let Some(client) = &self.client else {
            return (
                Vec::new(),
                vec![unavailable(base, "no repository client configured".into())],
            );
        };

        let index =
            match tokio::time::timeout(self.remote_timeout, fetch_index(client.as_ref(), base))
                .await
            {
                Ok(Ok(index)) => index,
                Ok(Err(e)) => return (Vec::new(), vec![unavailable(base, format!("{e:#}"))]),
                Err(_) => {
                    return (
                        Vec::new(),
                        vec![unavailable(
                            base,
                            format!("timed out after {:?}", self.remote_timeout),
                        )],
                    )
                }
            };

        let mut descriptors = Vec::new();
        let mut errors = Vec::new();

        for entry in index.modules {
            if !is_candidate_name(&entry.file) {
                debug!("Ignoring remote entry {}", entry.file);
                continue;
            }
            let url = entry.resolve_url(base);
            match tokio::time::timeout(self.remote_timeout, client.fetch_text(&url)).await {
                Ok(Ok(content)) => {
                    debug!("Discovered remote module at {}", url);
                    descriptors.push(ModuleDescriptor::from_source(
                        content,
                        ModuleOrigin::url(url),
                        entry.stem(),
                    ));
                }
                Ok(Err(e)) => errors.push(unavailable(&url, format!("{e:#}"))),
                Err(_) => errors.push(unavailable(
                    &url,
                    format!("timed out after {:?}", self.remote_timeout),
                )),
            }
        }

        (descriptors, errors)
    }
}

/// A file is a candidate when it carries the module extension and is not private.
pub fn is_candidate(path: &Path) -> bool {
    if path.is_dir() {
        return false;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(is_candidate_name)
}

fn is_candidate_name(file_name: &str) -> bool {
    let file_name = file_name.rsplit('/').next().unwrap_or(file_name);
    !file_name.starts_with(PRIVATE_PREFIX)
        && Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            == Some(MODULE_EXTENSION)
}

/// Candidates that cannot be read are returned as warnings next to the
/// descriptors that could.
fn scan_directory(dir: &Path, tier: SourceTier) -> (Vec<ModuleDescriptor>, Vec<DiscoveryError>) {
    if !dir.exists() {
        debug!("Module directory {:?} does not exist", dir);
        return (Vec::new(), Vec::new());
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            let error = DiscoveryError::Unreadable {
                path: dir.to_path_buf(),
                message: e.to_string(),
            };
            return (Vec::new(), vec![error]);
        }
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| is_candidate(path))
        .collect();
    paths.sort();

    let mut descriptors = Vec::new();
    let mut errors = Vec::new();
    for path in paths {
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                errors.push(DiscoveryError::Unreadable {
                    path,
                    message: e.to_string(),
                });
                continue;
            }
        };
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        debug!("Discovered module source {:?}", path);
        descriptors.push(ModuleDescriptor::from_source(
            content,
            ModuleOrigin::file(tier, path),
            &stem,
        ));
    }

    (descriptors, errors)
}

/// First-found wins. Later descriptors with the same id are superseded; a
/// differing content hash marks a version conflict.
fn deduplicate(
    found: Vec<ModuleDescriptor>,
) -> (Vec<ModuleDescriptor>, Vec<SupersededDescriptor>) {
    let mut descriptors: Vec<ModuleDescriptor> = Vec::new();
    let mut superseded = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for descriptor in found {
        let Some(&index) = by_id.get(&descriptor.id) else {
            by_id.insert(descriptor.id.clone(), descriptors.len());
            descriptors.push(descriptor);
            continue;
        };

        let winner = &descriptors[index];
        if winner.origin == descriptor.origin {
            continue;
        }

        let conflict = winner.content_hash != descriptor.content_hash;
        if conflict {
            warn!(
                module = %descriptor.id,
                "Version conflict: {} supersedes {}",
                winner.origin,
                descriptor.origin
            );
        } else {
            debug!(module = %descriptor.id, "Identical copy at {} superseded", descriptor.origin);
        }

        superseded.push(SupersededDescriptor {
            descriptor,
            winner: winner.origin.clone(),
            conflict,
        });
    }

    (descriptors, superseded)
}
