//! LLM provider implementations for Parlance.
//!
//! All providers implement the `parlance_core::Provider` trait. The
//! streaming machinery (SSE decoding and the per-request state machine)
//! is endpoint-agnostic and lives in [`sse`] and [`stream`].

pub mod openai_compat;
pub mod sse;
pub mod stream;

pub use openai_compat::{OpenAiCompatProvider, parse_model_list};
pub use sse::{SseDecoder, SseLine};
pub use stream::{StreamSession, StreamState, pump};
