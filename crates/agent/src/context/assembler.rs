//! Context assembly pipeline.
//!
//! Builds the ordered message list for one completion request from up to
//! five sources: the system prompt, selected memories, chunks retrieved
//! from selected documents, recent history, and the new user input.
//!
//! # Determinism
//!
//! Identical inputs (and an identical retrieval cache) always produce
//! identical output. Token estimates are reported in the metadata but
//! never change which messages are sent.

use parlance_config::ContextConfig;
use parlance_core::memory::{DocumentChunk, Memory};
use parlance_core::message::{Message, Role};
use parlance_memory::fingerprint::Embedder;
use parlance_memory::retrieval::{RetrievalEngine, RetrievedChunk};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::token;

// ── Types ─────────────────────────────────────────────────────────────────

/// All inputs required by the assembler for a single request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblyInput<'a> {
    /// Raw system prompt; blank prompts are skipped.
    pub system_prompt: Option<&'a str>,
    /// Memories selected for this turn, in display order.
    pub memories: &'a [Memory],
    /// Chunks of the selected documents only.
    pub document_chunks: &'a [DocumentChunk],
    /// Prior conversation, oldest first.
    pub history: &'a [Message],
    /// New user input. `None` for a rerun, where the user turn already
    /// ends `history`.
    pub user_message: Option<&'a str>,
}

impl AssemblyInput<'_> {
    /// The text retrieval is ranked against.
    pub fn query(&self) -> Option<&str> {
        self.user_message.or_else(|| {
            self.history
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
        })
    }
}

/// The assembled context, ready for a completion request.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<Message>,
    pub metadata: AssemblyMetadata,
}

/// Observational statistics about one assembly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Estimated tokens across all layers.
    pub total_tokens: usize,
    /// Per-layer statistics, in send order.
    pub per_layer: Vec<LayerStats>,
    /// History messages included.
    pub history_included: usize,
    /// History messages available.
    pub history_available: usize,
    /// Chunks returned by retrieval.
    pub chunks_retrieved: usize,
}

/// Statistics for a single context layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerStats {
    /// Layer name.
    pub name: String,
    /// Estimated tokens, including per-message overhead.
    pub tokens: usize,
    /// Items included.
    pub items_included: usize,
    /// Items available.
    pub items_total: usize,
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// The context assembler. Holds only configuration; create one and reuse it.
#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    history_window: usize,
    top_k: usize,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

impl ContextAssembler {
    /// At most `history_window` messages of history are kept.
    pub fn new(history_window: usize, top_k: usize) -> Self {
        Self {
            history_window,
            top_k,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.history_window, config.retrieval_top_k)
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Assemble the request messages.
    ///
    /// Retrieval failures are logged and the document layer is skipped.
    pub fn assemble<E: Embedder>(
        &self,
        input: &AssemblyInput<'_>,
        retrieval: &mut RetrievalEngine<E>,
    ) -> AssembledContext {
        let mut messages = Vec::new();
        let mut stats = Vec::new();

        // ── 1: System prompt ───────────────────────────────────────────────
        match input.system_prompt.filter(|p| !p.trim().is_empty()) {
            Some(prompt) => {
                let message = Message::system(prompt);
                stats.push(Self::layer_stats("system", &[&message], 1));
                messages.push(message);
            }
            None => stats.push(Self::empty_stats("system", 0)),
        }

        // ── 2: Memories ────────────────────────────────────────────────────
        if input.memories.is_empty() {
            stats.push(Self::empty_stats("memories", 0));
        } else {
            let message = Message::system(render_memories(input.memories));
            stats.push(Self::layer_stats("memories", &[&message], input.memories.len()));
            messages.push(message);
        }

        // ── 3: Retrieved document chunks ───────────────────────────────────
        let retrieved = self.retrieve(input, retrieval);
        if retrieved.is_empty() {
            stats.push(Self::empty_stats("documents", input.document_chunks.len()));
        } else {
            let message = Message::system(render_chunks(&retrieved));
            let mut layer = Self::layer_stats("documents", &[&message], input.document_chunks.len());
            layer.items_included = retrieved.len();
            stats.push(layer);
            messages.push(message);
        }

        // ── 4: History window ──────────────────────────────────────────────
        let start = input.history.len().saturating_sub(self.history_window);
        let window = &input.history[start..];
        let window_refs: Vec<&Message> = window.iter().collect();
        stats.push(Self::layer_stats("history", &window_refs, input.history.len()));
        messages.extend(window.iter().cloned());

        // ── 5: New user message ────────────────────────────────────────────
        if let Some(text) = input.user_message {
            let message = Message::user(text);
            stats.push(Self::layer_stats("user_message", &[&message], 1));
            messages.push(message);
        }

        let total_tokens = stats.iter().map(|s| s.tokens).sum();
        debug!(
            messages = messages.len(),
            total_tokens,
            history = window.len(),
            chunks = retrieved.len(),
            "Context assembled"
        );

        AssembledContext {
            messages,
            metadata: AssemblyMetadata {
                total_tokens,
                per_layer: stats,
                history_included: window.len(),
                history_available: input.history.len(),
                chunks_retrieved: retrieved.len(),
            },
        }
    }

    fn retrieve<E: Embedder>(
        &self,
        input: &AssemblyInput<'_>,
        retrieval: &mut RetrievalEngine<E>,
    ) -> Vec<RetrievedChunk> {
        if input.document_chunks.is_empty() {
            return Vec::new();
        }
        let Some(query) = input.query() else {
            return Vec::new();
        };

        match retrieval.retrieve(query, input.document_chunks, self.top_k) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, "Retrieval failed; continuing without document context");
                Vec::new()
            }
        }
    }

    fn layer_stats(name: &str, messages: &[&Message], total: usize) -> LayerStats {
        LayerStats {
            name: name.into(),
            tokens: messages.iter().map(|m| token::estimate_message_tokens(m)).sum(),
            items_included: messages.len(),
            items_total: total,
        }
    }

    fn empty_stats(name: &str, total: usize) -> LayerStats {
        LayerStats {
            name: name.into(),
            tokens: 0,
            items_included: 0,
            items_total: total,
        }
    }
}

fn render_memories(memories: &[Memory]) -> String {
    memories
        .iter()
        .map(|m| format!("Memory: {}\n{}", m.title, m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_chunks(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|r| format!("[From {}]: {}", r.chunk.source_name(), r.chunk.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
