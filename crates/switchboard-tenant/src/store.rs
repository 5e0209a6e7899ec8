//! Persisted tenant context record
//!
//! `{"state": {"currentCustomer": ..., "currentProject": ...}, "version": N}`

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use switchboard_core::{Error, Result, TenantContext};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredState {
    #[serde(default)]
    pub current_customer: Option<String>,
    #[serde(default)]
    pub current_project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoredRecord {
    #[serde(default)]
    pub state: StoredState,
    #[serde(default)]
    pub version: u64,
}

impl StoredRecord {
    pub fn new(context: &TenantContext, version: u64) -> Self {
        Self {
            state: StoredState {
                current_customer: context.customer_id.clone(),
                current_project: context.project_id.clone(),
            },
            version,
        }
    }

    pub fn context(&self) -> TenantContext {
        TenantContext {
            customer_id: self.state.current_customer.clone(),
            project_id: self.state.current_project.clone(),
        }
    }
}

/// The record file shared by every process using the same path
#[derive(Debug, Clone)]
pub struct ContextStore {
    path: PathBuf,
}

impl ContextStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record; `None` if nobody has committed yet
    pub fn load(&self) -> Result<Option<StoredRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "failed to read {:?}: {}",
                    self.path, e
                )));
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::Persistence(format!("corrupt record at {:?}: {}", self.path, e)))
    }

    /// Write the record atomically: temp file, fsync, rename
    pub fn save(&self, record: &StoredRecord) -> Result<()> {
        let persistence = |what: &str, e: std::io::Error| {
            Error::Persistence(format!("failed to {} {:?}: {}", what, self.path, e))
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| persistence("create directory for", e))?;
        }

        let contents = serde_json::to_string_pretty(record)?;
        let temp_path = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        {
            let mut temp_file = File::create(&temp_path).map_err(|e| persistence("write", e))?;
            temp_file
                .write_all(contents.as_bytes())
                .map_err(|e| persistence("write", e))?;
            temp_file.sync_all().map_err(|e| persistence("sync", e))?;
        }
        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(persistence("replace", e));
        }

        debug!("Saved tenant context v{} to {:?}", record.version, self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = ContextStore::new(dir.path().join("ctx.json"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_writes_camel_case_record() {
        let dir = TempDir::new().unwrap();
        let store = ContextStore::new(dir.path().join("nested").join("ctx.json"));
        let record = StoredRecord::new(&TenantContext::new("cust-1", "proj-9"), 3);
        store.save(&record).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["state"]["currentCustomer"], "cust-1");
        assert_eq!(raw["state"]["currentProject"], "proj-9");
        assert_eq!(raw["version"], 3);

        assert_eq!(store.load().unwrap(), Some(record));
        // No temp file left behind
        let entries = fs::read_dir(store.path().parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_partial_record_defaults() {
        let dir = TempDir::new().unwrap();
        let store = ContextStore::new(dir.path().join("ctx.json"));
        fs::write(store.path(), r#"{"state":{"currentCustomer":"cust-2"}}"#).unwrap();
        let record = store.load().unwrap().unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(record.context().customer_id.as_deref(), Some("cust-2"));
        assert!(record.context().project_id.is_none());
    }

    #[test]
    fn test_corrupt_record_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        let store = ContextStore::new(dir.path().join("ctx.json"));
        fs::write(store.path(), "{nope").unwrap();
        assert!(matches!(store.load(), Err(Error::Persistence(_))));
    }

    #[test]
    fn test_save_into_file_parent_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let store = ContextStore::new(blocker.join("ctx.json"));
        let record = StoredRecord::new(&TenantContext::new("c", "p"), 1);
        assert!(matches!(store.save(&record), Err(Error::Persistence(_))));
    }
}
