//! Configuration loading, validation, and management for Parlance.
//!
//! Loads configuration from `~/.parlance/config.toml` with environment
//! variable overrides. Validates all settings at startup.

pub mod logging;

use parlance_core::provider::SamplingParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use logging::LoggingConfig;

/// The root configuration structure.
///
/// Maps directly to `~/.parlance/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key used when the store holds none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider label used in logs
    #[serde(default = "default_provider")]
    pub provider: String,

    /// OpenAI-compatible base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used when the store has no selected model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// System prompt prepended to every turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Sampling defaults
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Context assembly and retrieval settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Streaming transport settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Cost tracking configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .field("system_prompt", &self.system_prompt)
            .field("sampling", &self.sampling)
            .field("context", &self.context)
            .field("stream", &self.stream)
            .field("telemetry", &self.telemetry)
            .field("logging", &self.logging)
            .finish()
    }
}

/// Default sampling parameters. Also the shape stored under `llm_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }
}

impl SamplingConfig {
    /// Request-level sampling parameters.
    pub fn to_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "sampling.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(ConfigError::ValidationError(
                    "sampling.top_p must be between 0.0 and 1.0".into(),
                ));
            }
        }
        for (name, value) in [
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
        ] {
            if let Some(v) = value {
                if !(-2.0..=2.0).contains(&v) {
                    return Err(ConfigError::ValidationError(format!(
                        "sampling.{name} must be between -2.0 and 2.0"
                    )));
                }
            }
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "sampling.max_tokens must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// How many prior messages are sent with each turn
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// How many document chunks retrieval returns
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    /// Characters per document chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared by neighbouring chunks
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_history_window() -> usize {
    10
}
fn default_retrieval_top_k() -> usize {
    3
}
fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            retrieval_top_k: default_retrieval_top_k(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// HTTP client timeout for the whole exchange
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Buffered events between decoder and consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Delay before applying each content delta (0 = off)
    #[serde(default)]
    pub pacing_delay_ms: u64,
}

fn default_request_timeout() -> u64 {
    120
}
fn default_channel_capacity() -> usize {
    64
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            channel_capacity: default_channel_capacity(),
            pacing_delay_ms: 0,
        }
    }
}

/// Cost tracking configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Custom model pricing overrides (model id → pricing)
    #[serde(default)]
    pub custom_pricing: HashMap<String, PricingOverrideConfig>,
}

/// Custom per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    /// Price per 1M prompt tokens in USD
    pub prompt_per_m: f64,
    /// Price per 1M completion tokens in USD
    pub completion_per_m: f64,
}

impl AppConfig {
    /// Load configuration from the default path (~/.parlance/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `PARLANCE_API_KEY` (highest priority)
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("PARLANCE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("PARLANCE_MODEL") {
            self.default_model = model;
        }

        if let Ok(base_url) = std::env::var("PARLANCE_BASE_URL") {
            self.base_url = base_url;
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parlance")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sampling.validate()?;

        if self.context.history_window == 0 {
            return Err(ConfigError::ValidationError(
                "context.history_window must be > 0".into(),
            ));
        }

        if self.context.retrieval_top_k == 0 {
            return Err(ConfigError::ValidationError(
                "context.retrieval_top_k must be > 0".into(),
            ));
        }

        if self.context.chunk_overlap >= self.context.chunk_size {
            return Err(ConfigError::ValidationError(format!(
                "context.chunk_overlap ({}) must be smaller than context.chunk_size ({})",
                self.context.chunk_overlap, self.context.chunk_size
            )));
        }

        if self.stream.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "stream.channel_capacity must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: default_provider(),
            base_url: default_base_url(),
            default_model: default_model(),
            system_prompt: None,
            sampling: SamplingConfig::default(),
            context: ContextConfig::default(),
            stream: StreamConfig::default(),
            telemetry: TelemetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to install log subscriber: {0}")]
    LoggingError(String),
}

impl From<ConfigError> for parlance_core::Error {
    fn from(err: ConfigError) -> Self {
        parlance_core::Error::Config {
            message: err.to_string(),
        }
    }
}
