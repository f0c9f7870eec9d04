//! File-backed key-value store using JSON lines.
//!
//! Each line holds one `{"key": ..., "value": ...}` record. The whole map is
//! loaded on creation and rewritten on every mutation, so reads never touch
//! the disk. A mutation only becomes visible once the rewrite succeeded.
//!
//! Default location: `~/.parlance/store.jsonl`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parlance_core::error::StoreError;
use parlance_core::store::KeyValueStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Serialize, Deserialize)]
struct Record {
    key: String,
    value: Value,
}

pub struct JsonFileStore {
    path: PathBuf,
    values: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file starts empty and is created
    /// on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = Self::load_from_disk(&path);
        debug!(path = %path.display(), keys = values.len(), "JSON file store loaded");
        Self {
            path,
            values: Arc::new(RwLock::new(values)),
        }
    }

    /// `~/.parlance/store.jsonl`
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".parlance").join("store.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_disk(path: &Path) -> BTreeMap<String, Value> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return BTreeMap::new();
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Record>(line) {
                Ok(record) => Some((record.key, record.value)),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted store record");
                    None
                }
            })
            .collect()
    }

    async fn flush(&self, values: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io(format!("Failed to create store directory: {e}")))?;
        }

        let mut content = String::new();
        for (key, value) in values.iter() {
            let line = serde_json::to_string(&Record {
                key: key.clone(),
                value: value.clone(),
            })
            .map_err(|e| StoreError::Malformed {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            content.push_str(&line);
            content.push('\n');
        }

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to write store file: {e}")))
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut values = self.values.write().await;
        let mut next = values.clone();
        next.insert(key.to_string(), value);
        self.flush(&next).await?;
        *values = next;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut values = self.values.write().await;
        if !values.contains_key(key) {
            return Ok(false);
        }
        let mut next = values.clone();
        next.remove(key);
        self.flush(&next).await?;
        *values = next;
        Ok(true)
    }
}
