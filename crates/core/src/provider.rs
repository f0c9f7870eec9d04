//! Provider trait: the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM and stream the
//! response back as a sequence of [`StreamEvent`]s. A [`ModelCatalog`]
//! lists the models an endpoint serves together with their pricing.
//!
//! Implementations: OpenAI-compatible endpoints (OpenAI, OpenRouter, Ollama, vLLM).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::Message;

/// Sampling parameters forwarded to the endpoint. `None` fields are omitted
/// from the request body so the endpoint default applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
}

/// A single streamed completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4", "gpt-4o")
    pub model: String,

    /// The assembled messages, in send order
    pub messages: Vec<Message>,

    /// Sampling configuration
    #[serde(default)]
    pub sampling: SamplingParams,
}

/// Token usage information.
///
/// Accepts both the snake_case keys OpenAI emits and the camelCase keys
/// some proxies use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, alias = "promptTokens")]
    pub prompt_tokens: u32,
    #[serde(default, alias = "completionTokens")]
    pub completion_tokens: u32,
    #[serde(default, alias = "totalTokens")]
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32, total_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// The decoded alphabet of a streamed completion.
///
/// A healthy stream is `Chunk* UsageFinal Done`. A failed stream ends with
/// exactly one `Error`; a cancelled one with exactly one `Aborted`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Non-empty content delta, in wire order.
    Chunk(String),
    /// Final token usage, delivered once after the sentinel or end of body.
    UsageFinal(Usage),
    /// The exchange failed; no further events follow.
    Error(ProviderError),
    /// The exchange completed normally.
    Done,
    /// The exchange was cancelled by the caller.
    Aborted,
}

impl StreamEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Done | Self::Aborted)
    }
}

/// Per-million-token pricing for a model, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M prompt tokens.
    pub prompt_rate: f64,
    /// Price per 1M completion tokens.
    pub completion_rate: f64,
}

impl ModelPricing {
    pub fn new(prompt_rate: f64, completion_rate: f64) -> Self {
        Self {
            prompt_rate,
            completion_rate,
        }
    }

    /// Cost of a prompt/completion split.
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1_000_000.0 * self.prompt_rate
            + completion_tokens as f64 / 1_000_000.0 * self.completion_rate
    }

    /// Average of the two rates, used when only a total token count is known.
    pub fn blended_rate(&self) -> f64 {
        (self.prompt_rate + self.completion_rate) / 2.0
    }
}

/// A model entry from an endpoint's catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<ModelPricing>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
}

/// The core Provider trait.
///
/// The orchestrator calls `stream()` without knowing which endpoint is
/// behind it. Pre-flight failures (such as a missing credential) are
/// returned as `Err`. Everything after the request is handed off (open
/// failures, transport errors, cancellation) and arrives through the receiver.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "ollama").
    fn name(&self) -> &str;

    /// Open a streamed completion.
    async fn stream(
        &self,
        api_key: &str,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<mpsc::Receiver<StreamEvent>, ProviderError>;
}

/// Lookup of the models an endpoint serves.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn get_models(
        &self,
        credential: Option<&str>,
    ) -> std::result::Result<Vec<ModelInfo>, ProviderError>;
}
