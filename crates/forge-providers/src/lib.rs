use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use forge_types::{ChatMessage, TokenUsage};

mod sanitize;

pub use sanitize::{sanitize_messages, sanitize_prompt, REDACTED};

pub const DEFAULT_PROVIDER_ID: &str = "openrouter";
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "xai/grok-beta";
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("provider request timed out")]
    Timeout,
    #[error("provider returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("malformed provider response: {0}")]
    Envelope(String),
    #[error("provider is not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    fn is_retryable_transport(&self) -> bool {
        matches!(self, ProviderError::Transport(_) | ProviderError::Timeout)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    /// Ceiling on generated tokens per call.
    pub max_tokens: u32,
    /// Connect and read inactivity limit; also the whole-call deadline for
    /// non-streamed calls.
    pub timeout_secs: u64,
    /// Total attempts for a non-streamed call, including the first one.
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_PROVIDER_ID.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_secs: 60,
            max_attempts: 3,
            retry_backoff_ms: 1000,
            referer: None,
            title: Some("Forge".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub provider_id: String,
    pub model_id: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub stream: bool,
    /// Optional per-call limit; the client clamps it to its configured ceiling.
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.7,
            stream: false,
            max_tokens: None,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

pub enum Response {
    Full(Completion),
    Stream(TokenStream),
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn info(&self) -> ClientInfo;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError>;

    /// Lazy token stream. Concatenating every fragment yields the content a
    /// non-streamed call would return.
    async fn stream(
        &self,
        request: CompletionRequest,
        _cancel: CancellationToken,
    ) -> Result<TokenStream, ProviderError> {
        let completion = self.complete(request.streaming(false)).await?;
        let stream = futures::stream::iter(vec![Ok(completion.content)]);
        Ok(Box::pin(stream))
    }

    async fn send(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<Response, ProviderError> {
        if request.stream {
            self.stream(request, cancel).await.map(Response::Stream)
        } else {
            self.complete(request).await.map(Response::Full)
        }
    }
}

/// Client for providers speaking the `/chat/completions` protocol.
pub struct OpenAiCompatibleClient {
    config: ProviderConfig,
    base_url: String,
    client: Client,
}

impl OpenAiCompatibleClient {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        if config.base_url.trim().is_empty() {
            return Err(ProviderError::NotConfigured("base_url is empty".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(ProviderError::NotConfigured("model is empty".to_string()));
        }
        if config.max_tokens == 0 {
            return Err(ProviderError::NotConfigured(
                "max_tokens must be positive".to_string(),
            ));
        }
        // idle limits; a streamed reply may run longer than timeout_secs
        let idle = Duration::from_secs(config.timeout_secs.max(1));
        let client = Client::builder()
            .connect_timeout(idle)
            .read_timeout(idle)
            .build()?;
        Ok(Self {
            base_url: normalize_base(&config.base_url),
            config,
            client,
        })
    }

    fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs.max(1))
    }

    fn effective_max_tokens(&self, requested: Option<u32>) -> u32 {
        requested
            .filter(|n| *n > 0)
            .map(|n| n.min(self.config.max_tokens))
            .unwrap_or(self.config.max_tokens)
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let messages = sanitize_messages(&request.messages)
            .into_iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect::<Vec<_>>();
        json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": self.effective_max_tokens(request.max_tokens),
            "stream": stream,
        })
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(body);
        if let Some(referer) = &self.config.referer {
            req = req.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.config.title {
            req = req.header("X-Title", title);
        }
        if let Some(api_key) = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !is_placeholder_api_key(key))
        {
            req = req.bearer_auth(api_key);
        }
        req
    }

    async fn post_with_retry(&self, body: &Value) -> Result<Value, ProviderError> {
        let attempts = self.config.max_attempts.max(1);
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let last_attempt = attempt >= attempts;
            let response = match self
                .post(body)
                .timeout(self.request_deadline())
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let err = ProviderError::from(err);
                    if !last_attempt && err.is_retryable_transport() {
                        tracing::warn!(
                            provider = %self.config.id,
                            attempt,
                            "provider transport error, retrying: {}",
                            err
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(err);
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && !last_attempt {
                let delay = backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                tracing::warn!(
                    provider = %self.config.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "provider rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let text = response.text().await?;
            let value = serde_json::from_str::<Value>(&text).ok();
            if !status.is_success() {
                let detail = value
                    .as_ref()
                    .and_then(extract_openai_error)
                    .unwrap_or_else(|| truncate_for_error(&text, 500));
                return Err(ProviderError::Status {
                    status: status.as_u16(),
                    detail,
                });
            }
            return value.ok_or_else(|| {
                ProviderError::Envelope(format!(
                    "response is not JSON: {}",
                    truncate_for_error(&text, 200)
                ))
            });
        }
    }
}

#[async_trait]
impl GenerationClient for OpenAiCompatibleClient {
    fn info(&self) -> ClientInfo {
        ClientInfo {
            provider_id: self.config.id.clone(),
            model_id: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let body = self.request_body(&request, false);
        let value = self.post_with_retry(&body).await?;

        if let Some(detail) = extract_openai_error(&value) {
            return Err(ProviderError::Envelope(detail));
        }
        let Some(content) = extract_message_content(&value) else {
            return Err(ProviderError::Envelope(format!(
                "no completion content for model `{}` (response: {})",
                self.config.model,
                truncate_for_error(&value.to_string(), 500)
            )));
        };
        let usage = extract_usage(&value);
        if let Some(usage) = &usage {
            tracing::debug!(
                provider = %self.config.id,
                model = %self.config.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "provider usage"
            );
        }
        Ok(Completion { content, usage })
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<TokenStream, ProviderError> {
        let body = self.request_body(&request, true);
        let resp = self.post(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .as_ref()
                .and_then(extract_openai_error)
                .unwrap_or_else(|| truncate_for_error(&text, 500));
            return Err(ProviderError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        let provider_id = self.config.id.clone();
        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut done = false;
            'read: while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    tracing::debug!(provider = %provider_id, "token stream cancelled");
                    done = true;
                    break;
                }
                let chunk = chunk?;
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line_bytes = buffer.drain(..=pos).collect::<Vec<u8>>();
                    match parse_sse_line(&String::from_utf8_lossy(&line_bytes), &provider_id) {
                        SseLine::Skip => {}
                        SseLine::Done => {
                            done = true;
                            break 'read;
                        }
                        SseLine::Token(text) => yield text,
                        SseLine::Error(detail) => Err(ProviderError::Envelope(detail))?,
                    }
                }
            }
            // last line may arrive without a trailing newline
            if !done && !buffer.is_empty() {
                match parse_sse_line(&String::from_utf8_lossy(&buffer), &provider_id) {
                    SseLine::Token(text) => yield text,
                    SseLine::Error(detail) => Err(ProviderError::Envelope(detail))?,
                    SseLine::Skip | SseLine::Done => {}
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

enum SseLine {
    Skip,
    Done,
    Token(String),
    Error(String),
}

fn parse_sse_line(line: &str, provider_id: &str) -> SseLine {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return SseLine::Skip;
    };
    if let Some(detail) = extract_openai_error(&value) {
        return SseLine::Error(detail);
    }
    if let Some(usage) = extract_usage(&value) {
        tracing::debug!(
            provider = %provider_id,
            total_tokens = usage.total_tokens,
            "provider stream usage"
        );
    }
    match extract_delta_content(&value) {
        Some(text) if !text.is_empty() => SseLine::Token(text),
        _ => SseLine::Skip,
    }
}

fn normalize_base(input: &str) -> String {
    input.trim().trim_end_matches('/').to_string()
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_message_content(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.get(0)?;
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| choice.get("text").and_then(|t| t.as_str()))
        .map(str::to_string)
}

fn extract_delta_content(value: &Value) -> Option<String> {
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

fn extract_openai_error(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|v| v.as_str())
        .or_else(|| error.as_str())
        .map(str::to_string)
}
