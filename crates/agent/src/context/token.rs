//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. Only used
//! for assembly metadata, never to decide what gets sent.

use parlance_core::message::Message;

/// Per-message overhead for role name and delimiters in the wire format.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Estimate tokens for a single message including per-message overhead.
pub fn estimate_message_tokens(message: &Message) -> usize {
    MESSAGE_OVERHEAD + estimate_tokens(&message.content)
}
