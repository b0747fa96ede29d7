use crate::persistence::record::LifecycleRecord;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Keyed storage for lifecycle records. Each `put` must be atomic for its key.
pub trait LifecycleStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<LifecycleRecord>>;
    fn put(&self, record: &LifecycleRecord) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
    fn list(&self) -> Result<RecordListing>;
}

/// Everything found in a store. Records that exist but cannot be read are
/// kept apart so the module still shows up as broken.
#[derive(Debug, Default)]
pub struct RecordListing {
    pub records: Vec<LifecycleRecord>,
    /// `(id, reason)` for each unreadable record.
    pub corrupt: Vec<(String, String)>,
}

/// One pretty-printed JSON file per module id.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create state directory {dir:?}"))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl LifecycleStore for JsonFileStore {
    fn get(&self, id: &str) -> Result<Option<LifecycleRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("failed to read lifecycle record {path:?}"))?;
        let record = serde_json::from_str(&json)
            .with_context(|| format!("failed to deserialize lifecycle record {path:?}"))?;
        Ok(Some(record))
    }

    fn put(&self, record: &LifecycleRecord) -> Result<()> {
        let json =
            serde_json::to_string_pretty(record).context("failed to serialize lifecycle record")?;
        write_atomic(&self.record_path(&record.id), json.as_bytes())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete lifecycle record {path:?}")),
        }
    }

    fn list(&self) -> Result<RecordListing> {
        let mut listing = RecordListing::default();
        let entries = fs::read_dir(&self.dir).context("failed to read state directory")?;

        for entry in entries {
            let entry = entry.context("failed to read directory entry")?;
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|json| {
                    serde_json::from_str::<LifecycleRecord>(&json).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(record) => listing.records.push(record),
                Err(e) => {
                    tracing::warn!("Unreadable lifecycle record {:?}: {}", path, e);
                    listing.corrupt.push((id.to_string(), e));
                }
            }
        }

        listing.records.sort_by(|a, b| a.id.cmp(&b.id));
        listing.corrupt.sort();
        Ok(listing)
    }
}

/// Writes `contents` next to `path` and renames it into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("atomic write target has no file name")?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, contents).with_context(|| format!("failed to write {tmp:?}"))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to move {tmp:?} into place"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::types::SourceTier;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::open(temp.path().join("state")).unwrap();

        assert!(store.get("docker").unwrap().is_none());

        let mut record = LifecycleRecord::installed(
            "docker",
            "1.0",
            "docker.toml",
            "abc",
            SourceTier::Workspace,
        );
        store.put(&record).unwrap();
        assert_eq!(store.get("docker").unwrap(), Some(record.clone()));

        record.enabled = true;
        store.put(&record).unwrap();
        assert!(store.get("docker").unwrap().unwrap().enabled);

        store.delete("docker").unwrap();
        assert!(store.get("docker").unwrap().is_none());
        // deleting twice is fine
        store.delete("docker").unwrap();
    }

    #[test]
    fn test_list_reports_corrupt_records_and_skips_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::open(temp.path()).unwrap();

        store
            .put(&LifecycleRecord::installed("b", "1", "b.toml", "h", SourceTier::User))
            .unwrap();
        store
            .put(&LifecycleRecord::installed("a", "1", "a.toml", "h", SourceTier::User))
            .unwrap();
        fs::write(temp.path().join("junk.json"), "{ nope").unwrap();
        fs::write(temp.path().join(".c.json.tmp"), "{}").unwrap();
        fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let listing = store.list().unwrap();
        let ids: Vec<&str> = listing.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(listing.corrupt.len(), 1);
        assert_eq!(listing.corrupt[0].0, "junk");
    }

    #[test]
    fn test_record_without_tier_defaults_to_additional() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::open(temp.path()).unwrap();
        fs::write(
            temp.path().join("old.json"),
            r#"{"id":"old","enabled":true,"installed_version":"1.0","installed_at":"2024-01-01T00:00:00Z","source_file":"old.toml","content_hash":"h"}"#,
        )
        .unwrap();

        let record = store.get("old").unwrap().unwrap();
        assert_eq!(record.source_tier, SourceTier::Additional);
        assert!(record.source_origin.is_empty());
    }

    #[test]
    fn test_new_record_is_disabled() {
        let record = LifecycleRecord::installed("x", "2.0", "x.toml", "h", SourceTier::Remote);
        assert!(!record.enabled);
        assert_eq!(record.installed_version, "2.0");
    }
}
