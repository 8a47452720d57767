// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provider clients: the trait and the OpenAI-compatible HTTP implementation.

use crate::ProviderError;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use helm_core::{ChatMessage, CostBreakdown, Role, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;

/// A chat request as the provider sees it.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// System prompt, when present.
    pub system: Option<String>,
    /// Prior turns.
    pub history: Vec<ChatMessage>,
    /// Current user message.
    pub user: String,
    /// Bare model name (no provider prefix).
    pub model: String,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Output token cap.
    pub max_tokens: Option<u64>,
}

impl ChatRequest {
    fn messages_payload(&self) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(system) = &self.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for turn in &self.history {
            let mut msg = json!({"role": turn.role.as_str(), "content": turn.content});
            if turn.role == Role::Tool
                && let Some(id) = &turn.tool_call_id
            {
                msg["tool_call_id"] = json!(id);
            }
            messages.push(msg);
        }
        messages.push(json!({"role": "user", "content": self.user}));
        messages
    }
}

/// A completed (non-streaming) provider response.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    /// Assistant text content (empty when the turn is tool-calls only).
    pub content: String,
    /// The raw assistant message, preserved so the tool arbiter can parse
    /// either tool-call encoding out of it.
    pub raw_message: Value,
    /// Token usage as reported by the provider.
    pub usage: TokenUsage,
}

/// One event in a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Exactly one, before any chunk.
    Start,
    /// Zero or more text deltas.
    Chunk {
        /// Text delta.
        data: String,
    },
    /// Terminal success event.
    Done {
        /// Usage totals for the stream.
        usage: TokenUsage,
        /// Cost of the stream.
        cost: CostBreakdown,
    },
    /// Terminal failure event.
    Error {
        /// Failure description.
        error: String,
    },
}

/// One model provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider name (`openai`, `anthropic`, …).
    fn name(&self) -> &str;

    /// One chat completion.
    async fn complete(&self, request: &ChatRequest) -> Result<RawCompletion, ProviderError>;

    /// Stream a chat completion as text deltas into `tx`. The caller wraps
    /// the deltas in [`StreamEvent`]s; implementations send raw text and
    /// return final usage.
    async fn stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<TokenUsage, ProviderError>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Value,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl WireUsage {
    fn into_usage(self) -> TokenUsage {
        TokenUsage::new(self.prompt_tokens, self.completion_tokens)
    }
}

/// Chat client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatClient {
    name: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiCompatClient {
    /// Build a client for `name` at `base_url` with `api_key`.
    #[must_use]
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        }
    }

    fn request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages_payload(),
            "stream": stream,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        body
    }

    async fn post(
        &self,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::MissingKey(self.name.clone()));
        }
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request, stream))
            .send()
            .await
            .map_err(|e|

                if e.is_timeout() {
                    ProviderError::Timeout {
                        provider: self.name.clone(),
                        message: format!("request timed out at {}", Utc::now().to_rfc3339()),
                    }
                } else {
                    ProviderError::Upstream {
                        provider: self.name.clone(),
                        message: format!("network: {e}"),
                    }
                }
            )?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(300).collect();
            return Err(ProviderError::Upstream {
                provider: self.name.clone(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ChatRequest) -> Result<RawCompletion, ProviderError> {
        let response = self.post(request, false).await?;
        let payload: ChatResponse = response.json().await.map_err(|e| ProviderError::BadResponse {
            provider: self.name.clone(),
            message: e.to_string(),
        })?;

        let message = payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| ProviderError::BadResponse {
                provider: self.name.clone(),
                message: "response has no choices".to_string(),
            })?;
        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(RawCompletion {
            content,
            raw_message: message,
            usage: payload.usage.unwrap_or_default().into_usage(),
        })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<TokenUsage, ProviderError> {
        let response = self.post(request, true).await?;

        // SSE framing: "data: {...}\n\n" per event, "data: [DONE]" terminal.
        let mut usage = TokenUsage::default();
        let mut completion_chars: u64 = 0;
        let mut buffer = String::new();
        let mut bytes = response.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Upstream {
                provider: self.name.clone(),
                message: format!("stream read: {e}"),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                let Ok(frame) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Some(wire) = frame.get("usage")
                    && !wire.is_null()
                    && let Ok(parsed) = serde_json::from_value::<WireUsage>(wire.clone())
                {
                    usage = parsed.into_usage();
                }
                let delta = frame
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !delta.is_empty() {
                    completion_chars += delta.chars().count() as u64;
                    if tx.send(delta.to_string()).await.is_err() {
                        // Receiver dropped: the client disconnected.
                        return Err(ProviderError::Cancelled);
                    }
                }
            }
        }

        // Providers that omit stream usage get a character-based estimate.
        if usage.total_tokens == 0 {
            usage = TokenUsage::new(
                helm_core::estimate_tokens(&request.user),
                completion_chars.div_ceil(4),
            );
        }
        Ok(usage)
    }
}

/// Default base URL for a known provider name.
#[must_use]
pub fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "anthropic" => Some("https://api.anthropic.com/v1"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(model: &str) -> ChatRequest {
        ChatRequest {
            system: Some("be brief".to_string()),
            history: vec![ChatMessage::new(Role::Assistant, "earlier")],
            user: "hello".to_string(),
            model: model.to_string(),
            temperature: Some(0.2),
            max_tokens: Some(256),
        }
    }

    #[tokio::test]
    async fn complete_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3},
            })))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new("openai", server.uri(), "sk-test");
        let completion = client.complete(&request("gpt-4o-mini")).await.unwrap();
        assert_eq!(completion.content, "hi there");
        assert_eq!(completion.usage.prompt_tokens, 12);
        assert_eq!(completion.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn non_2xx_is_an_upstream_error_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new("openai", server.uri(), "sk-test");
        let err = client.complete(&request("gpt-4o-mini")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn stream_reassembles_sse_deltas() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{}}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new("openai", server.uri(), "sk-test");
        let (tx, mut rx) = mpsc::channel(16);
        let usage = client.stream(&request("gpt-4o-mini"), tx).await.unwrap();

        let mut text = String::new();
        while let Some(delta) = rx.recv().await {
            text.push_str(&delta);
        }
        assert_eq!(text, "Hello");
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 2);
    }

    #[tokio::test]
    async fn stream_without_usage_estimates() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"four char\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = OpenAiCompatClient::new("openai", server.uri(), "sk-test");
        let (tx, mut rx) = mpsc::channel(16);
        let usage = client.stream(&request("gpt-4o-mini"), tx).await.unwrap();
        while rx.recv().await.is_some() {}
        assert!(usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn empty_key_fails_before_any_network_io() {
        let client = OpenAiCompatClient::new("openai", "http://127.0.0.1:9", "");
        let err = client.complete(&request("gpt-4o-mini")).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingKey(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn known_providers_have_base_urls() {
        assert!(default_base_url("openai").is_some());
        assert!(default_base_url("anthropic").is_some());
        assert!(default_base_url("nope").is_none());
    }
}
