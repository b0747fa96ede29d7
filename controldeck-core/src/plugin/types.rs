//! Core types for the plugin system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// File extension a module source must carry to be considered.
pub const MODULE_EXTENSION: &str = "toml";

/// Files starting with this prefix are private to their directory.
pub const PRIVATE_PREFIX: char = '_';

/// Capabilities a module may declare it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Network,
    Filesystem,
    Subprocess,
    /// Modifies the host system (service managers, packages, users).
    System,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Network => "network",
            Permission::Filesystem => "filesystem",
            Permission::Subprocess => "subprocess",
            Permission::System => "system",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" => Ok(Permission::Network),
            "filesystem" => Ok(Permission::Filesystem),
            "subprocess" => Ok(Permission::Subprocess),
            "system" => Ok(Permission::System),
            other => Err(format!("unknown permission '{other}'")),
        }
    }
}

/// Priority tier of a discovery source. Declaration order is priority order:
/// workspace plugins override user plugins, which override system plugins,
/// which override remote repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Workspace,
    User,
    System,
    Additional,
    Remote,
}

/// Where a module source came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceLocation {
    File { path: PathBuf },
    Url { url: String },
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::File { path } => write!(f, "{}", path.display()),
            SourceLocation::Url { url } => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleOrigin {
    pub tier: SourceTier,
    pub location: SourceLocation,
}

impl ModuleOrigin {
    pub fn file(tier: SourceTier, path: impl Into<PathBuf>) -> Self {
        Self {
            tier,
            location: SourceLocation::File { path: path.into() },
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            tier: SourceTier::Remote,
            location: SourceLocation::Url { url: url.into() },
        }
    }
}

impl fmt::Display for ModuleOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.location, self.tier)
    }
}

/// Static identity of a discovered module source.
///
/// Built at discovery time and immutable until the source changes. The
/// source text travels with the descriptor so loading and installing never
/// re-read a location that may have changed in between.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    /// Declared module name; the key of its lifecycle record.
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub author: String,
    pub version: String,
    pub license: Option<String>,
    pub source_url: Option<String>,
    pub dependencies: Vec<String>,
    pub permissions: BTreeSet<Permission>,
    pub origin: ModuleOrigin,
    pub content: Arc<str>,
    /// Hex SHA-256 of `content`.
    pub content_hash: String,
    /// Set when the metadata could not be read; the source will fail to load.
    pub metadata_error: Option<String>,
}

impl ModuleDescriptor {
    /// Number of service and factory definitions the source declares, if it parses.
    pub fn declared_definitions(&self) -> usize {
        super::manifest::ModuleSource::parse(&self.content)
            .map(|source| source.services.len() + source.factories.len())
            .unwrap_or(0)
    }
}

/// A descriptor that lost deduplication to a higher-priority source.
#[derive(Debug, Clone)]
pub struct SupersededDescriptor {
    pub descriptor: ModuleDescriptor,
    pub winner: ModuleOrigin,
    /// Same id but different content: a version conflict rather than a copy.
    pub conflict: bool,
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_priority_order() {
        assert!(SourceTier::Workspace < SourceTier::User);
        assert!(SourceTier::User < SourceTier::System);
        assert!(SourceTier::System < SourceTier::Remote);
    }

    #[test]
    fn test_permission_parsing() {
        assert_eq!("System".parse::<Permission>(), Ok(Permission::System));
        assert!("root".parse::<Permission>().is_err());
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("a"), content_hash("a"));
        assert_ne!(content_hash("a"), content_hash("b"));
        assert_eq!(content_hash("").len(), 64);
    }
}
