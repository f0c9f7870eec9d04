//! In-memory key-value store. Used by tests and throwaway sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parlance_core::error::StoreError;
use parlance_core::store::KeyValueStore;
use serde_json::Value;
use tokio::sync::RwLock;

/// Keeps every value in a map; nothing survives the process.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.values.write().await.clear();
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.write().await.remove(key).is_some())
    }
}
