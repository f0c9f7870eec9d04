//! Key-value persistence surface.
//!
//! The runtime never owns durable storage. Conversations, memories,
//! documents, usage records and settings are read from and written to an
//! injected [`KeyValueStore`] under the well-known keys in [`StoreKey`].

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::message::ConversationId;

/// Well-known store keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKey {
    /// Message log of one conversation
    Messages(ConversationId),
    /// All user memories
    Memories,
    /// All document chunks
    Documents,
    /// Per-model usage table
    Usage,
    /// Sampling configuration
    LlmConfig,
    /// API credential
    ApiKey,
    /// Currently selected model id
    SelectedModel,
}

impl StoreKey {
    pub fn as_key(&self) -> String {
        match self {
            Self::Messages(id) => format!("messages:{id}"),
            Self::Memories => "memories".into(),
            Self::Documents => "documents".into(),
            Self::Usage => "usage".into(),
            Self::LlmConfig => "llm_config".into(),
            Self::ApiKey => "api_key".into(),
            Self::SelectedModel => "selected_model".into(),
        }
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// The core KeyValueStore trait.
///
/// Implementations: in-memory (tests, ephemeral sessions) and a JSON file.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// The backend name (e.g., "in_memory", "json_file").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> std::result::Result<Option<serde_json::Value>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: serde_json::Value) -> std::result::Result<(), StoreError>;

    /// Remove `key`. Returns whether anything was removed.
    async fn remove(&self, key: &str) -> std::result::Result<bool, StoreError>;
}

/// Read and deserialize a typed value.
pub async fn load<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &StoreKey,
) -> std::result::Result<Option<T>, StoreError> {
    let key = key.as_key();
    match store.get(&key).await? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::Malformed {
                key,
                reason: e.to_string(),
            }),
    }
}

/// Serialize and write a typed value.
pub async fn save<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &StoreKey,
    value: &T,
) -> std::result::Result<(), StoreError> {
    let key = key.as_key();
    let value = serde_json::to_value(value).map_err(|e| StoreError::Malformed {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    store.set(&key, value).await
}
