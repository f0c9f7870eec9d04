//! User-authored memories and uploaded document chunks.
//!
//! Both are context sources the assembler can inject into a turn:
//! memories verbatim when selected, document chunks when retrieval ranks
//! them against the user's input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A hand-authored note the user can attach to turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// Unique ID for this memory
    pub id: String,

    /// Short label, rendered as the memory heading
    pub title: String,

    /// The body of the memory
    pub content: String,

    /// When this memory was created or last edited
    pub timestamp: DateTime<Utc>,

    /// Number of turns this memory was attached to
    #[serde(default)]
    pub use_count: u64,

    /// Words that auto-select this memory when they appear in the input
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger_words: Vec<String>,
}

impl Memory {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            content: content.into(),
            timestamp: Utc::now(),
            use_count: 0,
            trigger_words: Vec::new(),
        }
    }

    pub fn with_trigger_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_words = words.into_iter().map(Into::into).collect();
        self
    }

    /// Whether any trigger word occurs as a whole word in `input`
    /// (case-insensitive).
    pub fn is_triggered_by(&self, input: &str) -> bool {
        if self.trigger_words.is_empty() {
            return false;
        }
        let words: Vec<String> = input
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        self.trigger_words.iter().any(|trigger| {
            let trigger = trigger.trim().to_lowercase();
            !trigger.is_empty() && words.iter().any(|w| *w == trigger)
        })
    }
}

/// Provenance of a document chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Name of the uploaded source (filename, URL, ...)
    pub source_name: String,

    /// Position of the chunk within its source, contiguous from 0
    pub chunk_index: usize,

    /// When the source was processed
    pub timestamp: DateTime<Utc>,
}

/// A bounded, immutable excerpt of an uploaded document.
///
/// Fingerprints are cached by the retrieval engine keyed on `id`, never on
/// the chunk itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
}

impl DocumentChunk {
    pub fn new(source_name: impl Into<String>, chunk_index: usize, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            metadata: ChunkMetadata {
                source_name: source_name.into(),
                chunk_index,
                timestamp: Utc::now(),
            },
        }
    }

    pub fn source_name(&self) -> &str {
        &self.metadata.source_name
    }
}
