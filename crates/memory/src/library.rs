//! Uploaded documents, stored as chunks under the `documents` key.

use std::collections::BTreeSet;
use std::sync::Arc;

use parlance_core::error::{Error, Result};
use parlance_core::memory::DocumentChunk;
use parlance_core::store::{self, KeyValueStore, StoreKey};
use tracing::{debug, info};

use crate::chunker::{ChunkOptions, chunk_document};

pub struct DocumentLibrary {
    store: Arc<dyn KeyValueStore>,
    options: ChunkOptions,
}

impl DocumentLibrary {
    pub fn new(store: Arc<dyn KeyValueStore>, options: ChunkOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { store, options })
    }

    pub fn options(&self) -> ChunkOptions {
        self.options
    }

    /// Every stored chunk, in insertion order.
    pub async fn all_chunks(&self) -> Result<Vec<DocumentChunk>> {
        Ok(store::load(self.store.as_ref(), &StoreKey::Documents)
            .await?
            .unwrap_or_default())
    }

    /// Chunk `text` and store it under `source_name`.
    ///
    /// An existing source with the same name is replaced; the ids of its
    /// old chunks are returned alongside the new chunks so callers can
    /// evict cached fingerprints.
    pub async fn add_document(
        &self,
        source_name: &str,
        text: &str,
    ) -> Result<(Vec<DocumentChunk>, Vec<String>)> {
        let added = chunk_document(source_name, text, self.options)?;

        let mut chunks = self.all_chunks().await?;
        let replaced: Vec<String> = chunks
            .iter()
            .filter(|c| c.source_name() == source_name)
            .map(|c| c.id.clone())
            .collect();
        chunks.retain(|c| c.source_name() != source_name);
        chunks.extend(added.iter().cloned());

        store::save(self.store.as_ref(), &StoreKey::Documents, &chunks).await?;

        info!(
            source = source_name,
            chunks = added.len(),
            replaced = replaced.len(),
            "Document added"
        );
        Ok((added, replaced))
    }

    /// Drop every chunk of `source_name`. Returns the removed chunk ids.
    pub async fn remove_document(&self, source_name: &str) -> Result<Vec<String>> {
        let mut chunks = self.all_chunks().await?;
        let removed: Vec<String> = chunks
            .iter()
            .filter(|c| c.source_name() == source_name)
            .map(|c| c.id.clone())
            .collect();

        if removed.is_empty() {
            return Err(Error::DocumentNotFound(source_name.to_string()));
        }

        chunks.retain(|c| c.source_name() != source_name);
        store::save(self.store.as_ref(), &StoreKey::Documents, &chunks).await?;

        debug!(source = source_name, chunks = removed.len(), "Document removed");
        Ok(removed)
    }

    /// Distinct source names, sorted.
    pub async fn sources(&self) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .all_chunks()
            .await?
            .into_iter()
            .map(|c| c.metadata.source_name)
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Chunks belonging to any of `sources`, in storage order.
    pub async fn chunks_for(&self, sources: &[String]) -> Result<Vec<DocumentChunk>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .all_chunks()
            .await?
            .into_iter()
            .filter(|c| sources.iter().any(|s| s == c.source_name()))
            .collect())
    }
}
