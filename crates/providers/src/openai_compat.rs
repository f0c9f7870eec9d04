//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, and any
//! endpoint that serves `/chat/completions` with SSE streaming.
//!
//! Supports:
//! - Streamed chat completions with usage reporting
//! - Cooperative cancellation while opening and between reads
//! - Model listing with per-million-token pricing

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parlance_config::AppConfig;
use parlance_core::error::ProviderError;
use parlance_core::message::Message;
use parlance_core::provider::*;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::{StreamSession, StreamState, pump};

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// An OpenAI-compatible LLM provider.
///
/// The credential is supplied per call, so one provider can serve whatever
/// key the user currently has configured.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    client: reqwest::Client,
    channel_capacity: usize,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter() -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1")
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai() -> Self {
        Self::new("openai", "https://api.openai.com/v1")
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new("ollama", base_url.unwrap_or("http://localhost:11434/v1"))
    }

    /// Build from the `provider`, `base_url` and `[stream]` settings.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.provider.clone(), config.base_url.clone())
            .with_timeout(Duration::from_secs(config.stream.request_timeout_secs))
            .with_channel_capacity(config.stream.channel_capacity)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage<'_>> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect()
    }

    fn request_body(request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        let sampling = &request.sampling;
        if let Some(temperature) = sampling.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = sampling.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(top_p) = sampling.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(penalty) = sampling.frequency_penalty {
            body["frequency_penalty"] = serde_json::json!(penalty);
        }
        if let Some(penalty) = sampling.presence_penalty {
            body["presence_penalty"] = serde_json::json!(penalty);
        }

        body
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        api_key: &str,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<mpsc::Receiver<StreamEvent>, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingCredential);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            "Sending streaming request"
        );

        let pending = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key.trim()))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send();

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let provider_name = self.name.clone();

        tokio::spawn(async move {
            let mut session = StreamSession::new(tx);
            session.advance(StreamState::Opening);

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    session.abort().await;
                    return;
                }
                response = pending => response,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    session.fail(ProviderError::Transport(e.to_string())).await;
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let error_body = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        session.abort().await;
                        return;
                    }
                    text = response.text() => text.unwrap_or_default(),
                };
                warn!(provider = %provider_name, status = status.as_u16(), body = %error_body, "Provider streaming error");
                session
                    .fail(ProviderError::Api {
                        status_code: status.as_u16(),
                        body: error_body,
                    })
                    .await;
                return;
            }

            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| ProviderError::StreamInterrupted(e.to_string())));

            let state = pump(session, body, cancel).await;
            debug!(provider = %provider_name, state = ?state, "Stream finished");
        });

        Ok(rx)
    }
}

#[async_trait]
impl ModelCatalog for OpenAiCompatProvider {
    async fn get_models(
        &self,
        credential: Option<&str>,
    ) -> std::result::Result<Vec<ModelInfo>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(key) = credential.map(str::trim).filter(|k| !k.is_empty()) {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status_code: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let models = parse_model_list(&body);
        debug!(provider = %self.name, count = models.len(), "Fetched model catalog");
        Ok(models)
    }
}

/// Parse a `GET /models` response body.
///
/// Catalog prices are per token (usually as decimal strings); they are
/// converted to per-million rates. Entries without an id are skipped.
pub fn parse_model_list(body: &serde_json::Value) -> Vec<ModelInfo> {
    body["data"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    let id = m["id"].as_str()?.to_string();
                    let prompt = per_token_price(&m["pricing"]["prompt"]);
                    let completion = per_token_price(&m["pricing"]["completion"]);
                    let pricing = match (prompt, completion) {
                        (None, None) => None,
                        (p, c) => Some(ModelPricing::new(
                            p.unwrap_or(0.0) * 1_000_000.0,
                            c.unwrap_or(0.0) * 1_000_000.0,
                        )),
                    };
                    let context_length = m["context_length"]
                        .as_u64()
                        .or_else(|| m["contextLength"].as_u64())
                        .and_then(|n| u32::try_from(n).ok());
                    Some(ModelInfo {
                        id,
                        pricing,
                        context_length,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn per_token_price(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
    .filter(|p| p.is_finite() && *p >= 0.0)
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::ReceiverStream;

    fn request(model: &str) -> CompletionRequest {
        CompletionRequest {
            model: model.into(),
            messages: vec![Message::system("You are helpful"), Message::user("Hello")],
            sampling: SamplingParams {
                temperature: Some(0.5),
                max_tokens: Some(256),
                ..Default::default()
            },
        }
    }

    /// Serve a single canned HTTP response and hand back the raw request.
    async fn serve_once(status_line: &str, content_type: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n{body}"
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let raw = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            raw
        });

        (format!("http://{addr}"), handle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    async fn collect(rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        ReceiverStream::new(rx).collect().await
    }

    #[test]
    fn openrouter_constructor() {
        let provider = OpenAiCompatProvider::openrouter();
        assert_eq!(provider.name(), "openrouter");
        assert!(provider.base_url().contains("openrouter.ai"));
    }

    #[test]
    fn ollama_constructor() {
        let provider = OpenAiCompatProvider::ollama(None);
        assert_eq!(provider.name(), "ollama");
        assert!(provider.base_url().contains("localhost:11434"));
    }

    #[test]
    fn trailing_slash_trimmed() {
        let provider = OpenAiCompatProvider::new("custom", "http://localhost:8000/v1/");
        assert_eq!(provider.base_url(), "http://localhost:8000/v1");
    }

    #[test]
    fn from_config_uses_endpoint_settings() {
        let config = AppConfig {
            provider: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            stream: parlance_config::StreamConfig {
                channel_capacity: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let provider = OpenAiCompatProvider::from_config(&config);
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.channel_capacity, 1);
    }

    #[test]
    fn message_conversion() {
        let messages = vec![Message::system("You are helpful"), Message::user("Hello")];
        let api_messages = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api_messages.len(), 2);
        assert_eq!(api_messages[0].role, "system");
        assert_eq!(api_messages[1].role, "user");
        assert_eq!(api_messages[1].content, "Hello");
    }

    #[test]
    fn request_body_shape() {
        let body = OpenAiCompatProvider::request_body(&request("openai/gpt-4o"));
        assert_eq!(body["model"], "openai/gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body.get("top_p").is_none());
        assert!(body.get("presence_penalty").is_none());
    }

    #[tokio::test]
    async fn missing_credential_fails_fast() {
        let provider = OpenAiCompatProvider::new("test", "http://127.0.0.1:1");
        let result = provider
            .stream("   ", request("m"), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ProviderError::MissingCredential)));
    }

    #[tokio::test]
    async fn streams_from_live_endpoint() {
        let sse = concat!(
            ": OPENROUTER PROCESSING\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
            "data: [DONE]\n\n",
        );
        let (base, server) = serve_once("200 OK", "text/event-stream", sse).await;

        let provider = OpenAiCompatProvider::new("test", base);
        let rx = provider
            .stream("sk-test", request("openai/gpt-4o"), CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], StreamEvent::Chunk(t) if t == "Hel"));
        assert!(matches!(&events[1], StreamEvent::Chunk(t) if t == "lo"));
        assert!(matches!(events[2], StreamEvent::UsageFinal(u) if u == Usage::new(5, 2, 7)));
        assert!(matches!(events[3], StreamEvent::Done));

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /chat/completions"));
        assert!(raw.to_lowercase().contains("authorization: bearer sk-test"));
        assert!(raw.contains("\"stream\":true"));
    }

    #[tokio::test]
    async fn non_success_status_carries_body() {
        let (base, _server) = serve_once(
            "401 Unauthorized",
            "application/json",
            r#"{"error":{"message":"No auth credentials found"}}"#,
        )
        .await;

        let provider = OpenAiCompatProvider::new("test", base);
        let rx = provider
            .stream("sk-bad", request("m"), CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Error(ProviderError::Api { status_code, body }) => {
                assert_eq!(*status_code, 401);
                assert!(body.contains("No auth credentials"));
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_while_reading_error_body_aborts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (head_sent, head_seen) = tokio::sync::oneshot::channel();

        let _server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 64\r\n\r\n{\"error\":")
                .await
                .unwrap();
            let _ = head_sent.send(());
            // The rest of the body never arrives.
            std::future::pending::<()>().await;
        });

        let cancel = CancellationToken::new();
        let provider = OpenAiCompatProvider::new("test", format!("http://{addr}"));
        let rx = provider
            .stream("sk-test", request("m"), cancel.clone())
            .await
            .unwrap();

        head_seen.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let events = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .expect("stream should end promptly after cancel");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Aborted));
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = OpenAiCompatProvider::new("test", format!("http://{addr}"));
        let rx = provider
            .stream("sk-test", request("m"), CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(ProviderError::Transport(_))));
    }

    #[tokio::test]
    async fn cancelled_before_open_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let provider = OpenAiCompatProvider::new("test", "http://127.0.0.1:1");
        let rx = provider.stream("sk-test", request("m"), cancel).await.unwrap();
        let events = collect(rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Aborted));
    }

    #[tokio::test]
    async fn catalog_fetch() {
        let body = r#"{"data":[{"id":"openai/gpt-4o","pricing":{"prompt":"0.0000025","completion":"0.00001"},"context_length":128000}]}"#;
        let (base, _server) = serve_once("200 OK", "application/json", body).await;

        let provider = OpenAiCompatProvider::new("test", base);
        let models = provider.get_models(None).await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "openai/gpt-4o");
        assert_eq!(models[0].context_length, Some(128_000));
    }

    #[test]
    fn parse_catalog_prices_per_million() {
        let body = serde_json::json!({
            "data": [
                {"id": "a", "pricing": {"prompt": "0.000003", "completion": "0.000015"}},
                {"id": "b", "pricing": {"prompt": 0.000001, "completion": 0.000002}, "contextLength": 8192},
                {"id": "free", "pricing": {"prompt": "0", "completion": "0"}},
                {"id": "unpriced"},
                {"pricing": {"prompt": "1"}}
            ]
        });
        let models = parse_model_list(&body);
        assert_eq!(models.len(), 4);

        let a = models[0].pricing.unwrap();
        assert!((a.prompt_rate - 3.0).abs() < 1e-9);
        assert!((a.completion_rate - 15.0).abs() < 1e-9);

        let b = models[1].pricing.unwrap();
        assert!((b.prompt_rate - 1.0).abs() < 1e-9);
        assert_eq!(models[1].context_length, Some(8192));

        assert_eq!(models[2].pricing, Some(ModelPricing::new(0.0, 0.0)));
        assert!(models[3].pricing.is_none());
    }

    #[test]
    fn parse_catalog_without_data() {
        assert!(parse_model_list(&serde_json::json!({"error": "nope"})).is_empty());
    }
}
