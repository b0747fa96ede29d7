use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plugin::types::Permission;

/// Runtime knobs for the deck itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeckConfig {
    #[serde(default = "default_title")]
    pub title: String,

    /// Seconds between status poll cycles
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Deadline for a single status check
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    /// Deadline for start/stop/restart/remove
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,

    /// Deadline for loading one module source (factories run here)
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,

    /// Upper bound on the delay between checks of a failing module
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_title() -> String {
    "Control Deck".to_string()
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_check_timeout() -> u64 {
    2
}

fn default_action_timeout() -> u64 {
    30
}

fn default_load_timeout() -> u64 {
    10
}

fn default_max_backoff() -> u64 {
    60
}

impl Default for DeckConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            refresh_interval_secs: default_refresh_interval(),
            check_timeout_secs: default_check_timeout(),
            action_timeout_secs: default_action_timeout(),
            load_timeout_secs: default_load_timeout(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl DeckConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs.max(1))
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs.max(1))
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("refresh_interval_secs", self.refresh_interval_secs),
            ("check_timeout_secs", self.check_timeout_secs),
            ("action_timeout_secs", self.action_timeout_secs),
            ("load_timeout_secs", self.load_timeout_secs),
        ] {
            if value == 0 {
                bail!("deck.{name} must be at least 1");
            }
        }
        // checks must finish within one cycle
        if self.check_timeout_secs > self.refresh_interval_secs {
            bail!(
                "deck.check_timeout_secs ({}) must not exceed deck.refresh_interval_secs ({})",
                self.check_timeout_secs,
                self.refresh_interval_secs
            );
        }
        if self.max_backoff_secs < self.refresh_interval_secs {
            bail!(
                "deck.max_backoff_secs ({}) must be at least deck.refresh_interval_secs ({})",
                self.max_backoff_secs,
                self.refresh_interval_secs
            );
        }
        Ok(())
    }
}

/// Configuration for module discovery and storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginsConfig {
    /// Master switch for discovery
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Module directories relative to each workspace root
    #[serde(default = "default_workspace_dirs")]
    pub workspace_dirs: Vec<PathBuf>,

    /// Scan `~/.controldeck/plugins`
    #[serde(default = "default_true")]
    pub include_user_dir: bool,

    #[serde(default = "default_system_dir")]
    pub system_dir: Option<PathBuf>,

    #[serde(default)]
    pub additional_dirs: Vec<PathBuf>,

    /// Remote repository base URLs, highest priority first
    #[serde(default)]
    pub repositories: Vec<String>,

    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,

    /// Managed module store; defaults to `~/.controldeck/modules`
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    /// Lifecycle records; defaults to `~/.controldeck/state`
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_workspace_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from(".controldeck").join("plugins")]
}

fn default_system_dir() -> Option<PathBuf> {
    Some(PathBuf::from("/etc/controldeck/plugins"))
}

fn default_remote_timeout() -> u64 {
    5
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workspace_dirs: default_workspace_dirs(),
            include_user_dir: true,
            system_dir: default_system_dir(),
            additional_dirs: Vec::new(),
            repositories: Vec::new(),
            remote_timeout_secs: default_remote_timeout(),
            store_dir: None,
            state_dir: None,
        }
    }
}

impl PluginsConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs.max(1))
    }

    pub fn store_dir(&self, home_dir: &Path) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| home_dir.join(".controldeck").join("modules"))
    }

    pub fn state_dir(&self, home_dir: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| home_dir.join(".controldeck").join("state"))
    }
}

/// Host permission policy: what a module may declare and still be loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionPolicy {
    #[serde(default = "default_allowed_permissions")]
    pub allow: BTreeSet<Permission>,
}

fn default_allowed_permissions() -> BTreeSet<Permission> {
    [
        Permission::Network,
        Permission::Filesystem,
        Permission::Subprocess,
    ]
    .into_iter()
    .collect()
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            allow: default_allowed_permissions(),
        }
    }
}

impl PermissionPolicy {
    pub fn allow_all() -> Self {
        Self {
            allow: [
                Permission::Network,
                Permission::Filesystem,
                Permission::Subprocess,
                Permission::System,
            ]
            .into_iter()
            .collect(),
        }
    }

    /// First declared permission the policy denies.
    pub fn first_denied<'a>(
        &self,
        declared: impl IntoIterator<Item = &'a Permission>,
    ) -> Option<Permission> {
        declared.into_iter().find(|p| !self.allow.contains(p)).copied()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub deck: DeckConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub permissions: PermissionPolicy,
}

impl Settings {
    /// Rejects values that parse but cannot drive the poller.
    pub fn validate(&self) -> Result<()> {
        self.deck.validate()?;
        if self.plugins.remote_timeout_secs == 0 {
            bail!("plugins.remote_timeout_secs must be at least 1");
        }
        Ok(())
    }
}
