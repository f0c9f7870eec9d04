//! Error types for the Parlance domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Parlance operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Retrieval errors ---
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Orchestration ---
    #[error("A response is already streaming for conversation {0}")]
    TurnInProgress(String),

    #[error("Nothing to rerun: {0}")]
    NothingToRerun(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Memory not found: {0}")]
    MemoryNotFound(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures of the network exchange with the LLM endpoint.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed (status: {status_code}): {body}")]
    Api { status_code: u16, body: String },

    #[error("No API key configured")]
    MissingCredential,

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Invalid chunking: overlap {overlap} must be smaller than size {size}")]
    InvalidChunking { size: usize, overlap: usize },

    #[error("Embedding generation failed: {0}")]
    Embedding(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O failed: {0}")]
    Io(String),

    #[error("Stored value under '{key}' is malformed: {reason}")]
    Malformed { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::Api {
            status_code: 429,
            body: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn chunking_error_names_both_sizes() {
        let err = RetrievalError::InvalidChunking {
            size: 100,
            overlap: 100,
        };
        let text = err.to_string();
        assert!(text.contains("100"));
        assert!(text.contains("overlap"));
    }
}
