//! Document retrieval and key-value stores for Parlance.

pub mod chunker;
pub mod file_backend;
pub mod fingerprint;
pub mod in_memory;
pub mod library;
pub mod retrieval;
pub mod vector;

pub use chunker::{ChunkOptions, chunk_document, chunk_text};
pub use file_backend::JsonFileStore;
pub use fingerprint::{Embedder, FINGERPRINT_DIMS, HashEmbedder, fingerprint};
pub use in_memory::InMemoryStore;
pub use library::DocumentLibrary;
pub use retrieval::{RetrievalEngine, RetrievedChunk};
pub use vector::{cosine_similarity, rank_by_similarity};
