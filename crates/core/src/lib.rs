//! # Parlance Core
//!
//! Domain types, traits, and error definitions for the Parlance chat runtime.
//! This crate has **no transport dependencies**; it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping the LLM endpoint or the persistence layer via configuration
//! - Easy testing with scripted/in-memory implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod memory;
pub mod message;
pub mod provider;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, RetrievalError, StoreError};
pub use memory::{ChunkMetadata, DocumentChunk, Memory};
pub use message::{Conversation, ConversationId, Message, Role};
pub use provider::{
    CompletionRequest, ModelCatalog, ModelInfo, ModelPricing, Provider, SamplingParams,
    StreamEvent, Usage,
};
pub use store::{KeyValueStore, StoreKey};
