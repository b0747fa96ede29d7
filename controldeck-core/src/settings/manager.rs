use crate::settings::config::Settings;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings read once at startup. A missing file is created with defaults;
/// an unparseable one is moved aside and replaced by defaults.
#[derive(Debug, Clone)]
pub struct SettingsManager {
    settings_path: PathBuf,
    settings: Settings,
}

impl SettingsManager {
    /// Loads `~/.controldeck/settings.toml`
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Self::from_path(home.join(".controldeck").join("settings.toml"))
    }

    pub fn from_path(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            write_defaults(&path)?;
        }

        let settings = Self::load_from_file_with_backup(&path)?;
        settings
            .validate()
            .with_context(|| format!("Invalid settings in {path:?}"))?;

        Ok(Self {
            settings_path: path,
            settings,
        })
    }

    fn load_from_file_with_backup(path: &Path) -> Result<Settings> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {path:?}"))?;

        match toml::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!(error = %e, "Settings file is corrupt, restoring defaults");
                let backup_path = path.with_extension("toml.backup");
                fs::rename(path, &backup_path).with_context(|| {
                    format!("Failed to backup corrupted settings to {backup_path:?}")
                })?;
                write_defaults(path)?;
                Ok(Settings::default())
            }
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings.clone()
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

fn write_defaults(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {parent:?}"))?;
    }
    let contents = toml::to_string_pretty(&Settings::default())
        .context("Failed to serialize default settings")?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write default settings to {path:?}"))
}
