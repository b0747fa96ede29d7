use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plugin::types::SourceTier;

/// Durable lifecycle state of one installed module: whether it should run at
/// next startup and which version was installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub id: String,
    pub enabled: bool,
    pub installed_version: String,
    pub installed_at: DateTime<Utc>,
    /// File name of the source inside the managed module store
    pub source_file: String,
    pub content_hash: String,
    /// Tier the installed copy was taken from. A later install from a lower
    /// priority tier does not replace it unless forced.
    #[serde(default = "unknown_tier")]
    pub source_tier: SourceTier,
    #[serde(default)]
    pub source_origin: String,
}

fn unknown_tier() -> SourceTier {
    SourceTier::Additional
}

impl LifecycleRecord {
    /// A freshly installed module starts disabled.
    pub fn installed(
        id: &str,
        version: &str,
        source_file: &str,
        content_hash: &str,
        source_tier: SourceTier,
    ) -> Self {
        Self {
            id: id.to_string(),
            enabled: false,
            installed_version: version.to_string(),
            installed_at: Utc::now(),
            source_file: source_file.to_string(),
            content_hash: content_hash.to_string(),
            source_tier,
            source_origin: String::new(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.source_origin = origin.into();
        self
    }
}
