//! Module installation into the managed store.
//!
//! Supports installing from:
//! - Local file paths (`./docker.toml`, `/opt/modules/vpn.toml`, `~/x.toml`)
//! - `http(s)` URLs
//! - The id of a module found by discovery

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::persistence::storage::write_atomic;

use super::discovery::DiscoveryReport;
use super::manifest::is_valid_id;
use super::remote::RepositoryClient;
use super::types::{ModuleDescriptor, ModuleOrigin, SourceTier, MODULE_EXTENSION};

/// Where a module to install comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    Path(PathBuf),
    Url(String),
    Discovered(String),
}

impl InstallSource {
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            bail!("Empty install source");
        }

        if source.starts_with("http://") || source.starts_with("https://") {
            return Ok(InstallSource::Url(source.to_string()));
        }

        if let Some(rest) = source.strip_prefix("~/") {
            let home = dirs::home_dir().context("Failed to determine home directory")?;
            return Ok(InstallSource::Path(home.join(rest)));
        }

        let looks_like_path = source.starts_with('/')
            || source.starts_with('.')
            || source.contains(std::path::MAIN_SEPARATOR)
            || source.ends_with(&format!(".{MODULE_EXTENSION}"));
        if looks_like_path {
            return Ok(InstallSource::Path(PathBuf::from(source)));
        }

        if is_valid_id(source) {
            return Ok(InstallSource::Discovered(source.to_string()));
        }

        bail!("Invalid install source '{source}': expected a path, a URL or a module id")
    }

    /// Builds the descriptor to install.
    pub async fn resolve(
        &self,
        report: &DiscoveryReport,
        client: Option<&dyn RepositoryClient>,
    ) -> Result<ModuleDescriptor> {
        match self {
            InstallSource::Path(path) => {
                if !path.is_file() {
                    bail!("Module source not found: {}", path.display());
                }
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Ok(ModuleDescriptor::from_source(
                    content,
                    ModuleOrigin::file(SourceTier::Additional, path),
                    &file_stem(path),
                ))
            }
            InstallSource::Url(url) => {
                let Some(client) = client else {
                    bail!("No repository client available to fetch {url}");
                };
                let content = client.fetch_text(url).await?;
                let name = url.rsplit('/').next().unwrap_or(url.as_str());
                let stem = name
                    .strip_suffix(&format!(".{MODULE_EXTENSION}"))
                    .unwrap_or(name);
                Ok(ModuleDescriptor::from_source(
                    content,
                    ModuleOrigin::url(url.clone()),
                    stem,
                ))
            }
            InstallSource::Discovered(id) => report
                .find(id)
                .cloned()
                .with_context(|| format!("No discovered module named '{id}'")),
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Directory holding installed module sources as `<id>.toml`.
#[derive(Debug, Clone)]
pub struct ModuleStore {
    dir: PathBuf,
}

impl ModuleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(id: &str) -> String {
        format!("{id}.{MODULE_EXTENSION}")
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(Self::file_name(id))
    }

    /// Copies the descriptor's source into the store.
    pub fn write(&self, descriptor: &ModuleDescriptor) -> Result<PathBuf> {
        if !is_valid_id(&descriptor.id) {
            bail!("Refusing to install module with invalid id '{}'", descriptor.id);
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create module store {:?}", self.dir))?;

        let path = self.path(&descriptor.id);
        write_atomic(&path, descriptor.content.as_bytes())?;
        info!(
            module = %descriptor.id,
            "Installed {} from {}",
            descriptor.version,
            descriptor.origin
        );
        Ok(path)
    }

    /// Reads an installed source back as a descriptor, if present.
    pub fn read(&self, id: &str) -> Result<Option<ModuleDescriptor>> {
        let path = self.path(id);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read installed module {}", path.display()))?;
        Ok(Some(ModuleDescriptor::from_source(
            content,
            ModuleOrigin::file(SourceTier::User, path),
            id,
        )))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed installed source {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("https://modules.example.org/docker.toml", InstallSource::Url("https://modules.example.org/docker.toml".into()))]
    #[case("./docker.toml", InstallSource::Path(PathBuf::from("./docker.toml")))]
    #[case("/opt/deck/vpn.toml", InstallSource::Path(PathBuf::from("/opt/deck/vpn.toml")))]
    #[case("vpn.toml", InstallSource::Path(PathBuf::from("vpn.toml")))]
    #[case("docker-containers", InstallSource::Discovered("docker-containers".into()))]
    fn test_parse_install_source(#[case] input: &str, #[case] expected: InstallSource) {
        assert_eq!(InstallSource::parse(input).unwrap(), expected);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(InstallSource::parse("").is_err());
        assert!(InstallSource::parse("not an id!").is_err());
    }

    #[tokio::test]
    async fn test_resolve_path_uses_declared_id() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file-name.toml");
        fs::write(&path, "id = \"declared\"\nversion = \"3\"\n").unwrap();

        let descriptor = InstallSource::Path(path)
            .resolve(&DiscoveryReport::default(), None)
            .await
            .unwrap();
        assert_eq!(descriptor.id, "declared");
        assert_eq!(descriptor.version, "3");
    }

    #[tokio::test]
    async fn test_resolve_missing_sources() {
        let report = DiscoveryReport::default();
        assert!(InstallSource::Path(PathBuf::from("/definitely/not/here.toml"))
            .resolve(&report, None)
            .await
            .is_err());
        assert!(InstallSource::Discovered("ghost".into())
            .resolve(&report, None)
            .await
            .is_err());
        assert!(InstallSource::Url("https://x/y.toml".into())
            .resolve(&report, None)
            .await
            .is_err());
    }

    #[test]
    fn test_store_write_read_delete() {
        let temp = TempDir::new().unwrap();
        let store = ModuleStore::new(temp.path().join("modules"));
        let descriptor = ModuleDescriptor::from_source(
            "version = \"1.2\"\n".to_string(),
            ModuleOrigin::file(SourceTier::Workspace, "/w/docker.toml"),
            "docker",
        );

        let path = store.write(&descriptor).unwrap();
        assert_eq!(path, temp.path().join("modules").join("docker.toml"));

        let read = store.read("docker").unwrap().unwrap();
        assert_eq!(read.content_hash, descriptor.content_hash);
        assert_eq!(read.version, "1.2");

        store.delete("docker").unwrap();
        assert!(store.read("docker").unwrap().is_none());
        store.delete("docker").unwrap();
    }
}
