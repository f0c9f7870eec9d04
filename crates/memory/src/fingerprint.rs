//! Local text fingerprints.
//!
//! A cheap, fully local stand-in for a learned embedding: tokens are hashed
//! into a fixed number of buckets, weighted by position, and the result is
//! L2-normalized. What downstream ranking relies on is the [`Embedder`]
//! contract (deterministic, fixed width, unit length), so a real model can
//! be plugged in behind the same trait.

use parlance_core::error::RetrievalError;

/// Width of a [`HashEmbedder`] fingerprint.
pub const FINGERPRINT_DIMS: usize = 128;

/// Turns text into a fixed-width vector.
pub trait Embedder: Send + Sync {
    /// Vector width produced by this embedder.
    fn dimensions(&self) -> usize;

    /// Embed `text`. Identical input must yield an identical vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

/// The built-in hashing embedder.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashEmbedder;

impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        FINGERPRINT_DIMS
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        Ok(fingerprint(text))
    }
}

/// Compute the fingerprint of `text`.
///
/// Case-insensitive and whitespace-tokenized; the token at position `idx`
/// contributes `1 / (idx + 1)` to its bucket. Empty text (or text with no
/// tokens) yields the zero vector.
pub fn fingerprint(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; FINGERPRINT_DIMS];
    let lowered = text.to_lowercase();

    for (idx, token) in lowered.split_whitespace().enumerate() {
        vector[bucket(token)] += 1.0 / (idx as f32 + 1.0);
    }

    let magnitude = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for v in &mut vector {
            *v /= magnitude;
        }
    }
    vector
}

/// 31-multiplier string hash folded into `[0, FINGERPRINT_DIMS)`.
fn bucket(token: &str) -> usize {
    let hash = token.chars().fold(0i32, |h, c| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(c as i32)
    });
    hash.unsigned_abs() as usize % FINGERPRINT_DIMS
}
