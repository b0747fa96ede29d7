//! Module source parsing.
//!
//! A module source is a TOML document: optional metadata at the top level,
//! `[[service]]` tables for individual services and `[[factory]]` tables for
//! entry points that enumerate services at load time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use super::types::{content_hash, ModuleDescriptor, ModuleOrigin, Permission};

pub const COMMAND_KIND: &str = "command";

fn default_kind() -> String {
    COMMAND_KIND.to_string()
}

/// Parsed module source file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleSource {
    /// Declared module name (defaults to the file stem)
    pub id: Option<String>,

    /// Display name
    pub name: Option<String>,

    pub description: Option<String>,
    pub author: Option<String>,
    pub version: Option<String>,
    pub license: Option<String>,
    pub source_url: Option<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub permissions: BTreeSet<Permission>,

    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDefinition>,

    #[serde(default, rename = "factory")]
    pub factories: Vec<FactoryDefinition>,
}

impl ModuleSource {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse module source")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read module source: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid module source: {}", path.display()))
    }
}

/// When a service reports it may be removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Removable {
    #[default]
    Never,
    Always,
    WhenStopped,
}

/// One `[[service]]` table.
///
/// Unknown keys are kept in `options` so kinds registered by the host can
/// read their own configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: Option<String>,
    pub name: Option<String>,

    #[serde(default = "default_kind")]
    pub kind: String,

    pub icon: Option<String>,

    /// Command whose outcome tells whether the service runs
    pub status: Option<String>,
    pub start: Option<String>,
    pub stop: Option<String>,
    pub restart: Option<String>,
    pub details: Option<String>,
    pub remove: Option<String>,

    /// Substring of the status output meaning "running"; without it a zero
    /// exit status means running.
    pub running_pattern: Option<String>,

    #[serde(default)]
    pub removable: Removable,

    pub timeout_secs: Option<u64>,

    /// Run commands through `sh -c` instead of splitting them into words.
    #[serde(default)]
    pub shell: bool,

    #[serde(flatten)]
    pub options: toml::Table,
}

impl ServiceDefinition {
    /// Names the first required field missing for the command kind, if any.
    pub fn missing_command_field(&self) -> Option<&'static str> {
        if self.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            return Some("id");
        }
        if self.status.is_none() {
            return Some("status");
        }
        if self.start.is_none() {
            return Some("start");
        }
        if self.stop.is_none() {
            return Some("stop");
        }
        None
    }

    /// Substitutes `${Field}` placeholders in every string with values from
    /// a factory record. Values land shell-quoted in command strings.
    pub fn render(&self, fields: &serde_json::Map<String, serde_json::Value>) -> Self {
        let expand = |s: &Option<String>| s.as_ref().map(|s| expand_placeholders(s, fields));
        let command = |s: &Option<String>| s.as_ref().map(|s| expand_quoted(s, fields));
        Self {
            id: expand(&self.id),
            name: expand(&self.name),
            kind: self.kind.clone(),
            icon: expand(&self.icon),
            status: command(&self.status),
            start: command(&self.start),
            stop: command(&self.stop),
            restart: command(&self.restart),
            details: command(&self.details),
            remove: command(&self.remove),
            running_pattern: expand(&self.running_pattern),
            removable: self.removable,
            timeout_secs: self.timeout_secs,
            shell: self.shell,
            options: self.options.clone(),
        }
    }
}

/// One `[[factory]]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactoryDefinition {
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Command printing one JSON object per line, or a JSON array
    pub list: Option<String>,

    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub shell: bool,

    /// Service template rendered once per listed record
    pub template: Option<ServiceDefinition>,

    #[serde(flatten)]
    pub options: toml::Table,
}

impl FactoryDefinition {
    pub fn missing_command_field(&self) -> Option<&'static str> {
        if self.list.is_none() {
            return Some("list");
        }
        match &self.template {
            None => Some("template"),
            Some(template) => template.missing_command_field(),
        }
    }
}

/// Replaces `${Key}` with the matching value from `fields`. Unknown keys are
/// left untouched.
pub fn expand_placeholders(
    input: &str,
    fields: &serde_json::Map<String, serde_json::Value>,
) -> String {
    substitute(input, fields, false)
}

/// Like [`expand_placeholders`], but each value is quoted as one shell word.
pub fn expand_quoted(input: &str, fields: &serde_json::Map<String, serde_json::Value>) -> String {
    substitute(input, fields, true)
}

fn substitute(
    input: &str,
    fields: &serde_json::Map<String, serde_json::Value>,
    quote: bool,
) -> String {
    let mut out = String::with_capacity(input.len());
    let push_value = |out: &mut String, value: &str| {
        if quote {
            out.push_str(&shell_words::quote(value));
        } else {
            out.push_str(value);
        }
    };

    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match fields.get(key) {
                    Some(serde_json::Value::String(s)) => push_value(&mut out, s),
                    Some(serde_json::Value::Null) => {}
                    Some(other) => push_value(&mut out, &other.to_string()),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Module ids double as store file names.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl ModuleDescriptor {
    /// Builds a descriptor from source text. Never fails: unreadable metadata
    /// is recorded in `metadata_error` and defaults apply.
    pub fn from_source(content: String, origin: ModuleOrigin, fallback_id: &str) -> Self {
        let hash = content_hash(&content);
        let (source, mut metadata_error) = match ModuleSource::parse(&content) {
            Ok(source) => (source, None),
            Err(e) => (ModuleSource::default(), Some(format!("{e:#}"))),
        };

        let id = source
            .id
            .clone()
            .unwrap_or_else(|| fallback_id.to_string());
        if metadata_error.is_none() && !is_valid_id(&id) {
            metadata_error = Some(format!(
                "invalid module id '{id}': use letters, digits, '-', '_' or '.'"
            ));
        }

        Self {
            display_name: source.name.clone().unwrap_or_else(|| id.clone()),
            description: source
                .description
                .clone()
                .unwrap_or_else(|| "No description".to_string()),
            author: source.author.clone().unwrap_or_else(|| "Unknown".to_string()),
            version: source.version.clone().unwrap_or_else(|| "1.0".to_string()),
            license: source.license.clone(),
            source_url: source.source_url.clone(),
            dependencies: source.dependencies.clone(),
            permissions: source.permissions.clone(),
            id,
            origin,
            content: Arc::from(content),
            content_hash: hash,
            metadata_error,
        }
    }
}
