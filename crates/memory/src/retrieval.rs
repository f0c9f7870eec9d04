//! Ranking document chunks against a query.
//!
//! The engine keeps a side-table of chunk fingerprints keyed by chunk id.
//! Entries are filled the first time a chunk takes part in a retrieval and
//! dropped when its source document is removed.

use std::collections::HashMap;

use parlance_core::error::RetrievalError;
use parlance_core::memory::DocumentChunk;
use tracing::debug;

use crate::fingerprint::{Embedder, HashEmbedder};
use crate::vector::{cosine_similarity, rank_by_similarity};

/// A chunk selected by retrieval, with its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

pub struct RetrievalEngine<E: Embedder = HashEmbedder> {
    embedder: E,
    cache: HashMap<String, Vec<f32>>,
}

impl RetrievalEngine<HashEmbedder> {
    pub fn new() -> Self {
        Self::with_embedder(HashEmbedder)
    }
}

impl Default for RetrievalEngine<HashEmbedder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Embedder> RetrievalEngine<E> {
    pub fn with_embedder(embedder: E) -> Self {
        Self {
            embedder,
            cache: HashMap::new(),
        }
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        self.embedder.embed(text)
    }

    /// Cosine similarity; vectors of different width compare as 0.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b)
    }

    /// Return the `top_k` chunks most similar to `query`, best first.
    ///
    /// Missing fingerprints are computed and cached. Ties keep the order of
    /// `chunks`.
    pub fn retrieve(
        &mut self,
        query: &str,
        chunks: &[DocumentChunk],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if chunks.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(query)?;

        let mut computed = 0;
        for chunk in chunks {
            if !self.cache.contains_key(&chunk.id) {
                let embedding = self.embedder.embed(&chunk.content)?;
                self.cache.insert(chunk.id.clone(), embedding);
                computed += 1;
            }
        }

        let ranked = rank_by_similarity(
            &query_embedding,
            chunks.iter().map(|c| self.cache[&c.id].as_slice()),
            top_k,
        );

        debug!(
            candidates = chunks.len(),
            computed,
            returned = ranked.len(),
            "Ranked document chunks"
        );

        Ok(ranked
            .into_iter()
            .map(|(idx, score)| RetrievedChunk {
                chunk: chunks[idx].clone(),
                score,
            })
            .collect())
    }

    /// Drop cached fingerprints for the given chunk ids.
    pub fn forget<'a, I>(&mut self, chunk_ids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for id in chunk_ids {
            self.cache.remove(id);
        }
    }

    /// Number of cached fingerprints.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    pub fn is_cached(&self, chunk_id: &str) -> bool {
        self.cache.contains_key(chunk_id)
    }
}
