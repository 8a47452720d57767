// SPDX-License-Identifier: MIT OR Apache-2.0
//! The model gateway: retry, failover, streaming, structured tasks, and
//! history compaction over registered provider clients.

use crate::cancel::CancellationToken;
use crate::client::{ChatRequest, ProviderClient, RawCompletion, StreamEvent};
use crate::retry::backoff_delay;
use crate::schema::validate_shallow;
use crate::{ModelRef, ProviderError};
use helm_config::{ModelTiers, RetryConfig};
use helm_core::{ChatMessage, CostBreakdown, Role, TokenUsage, cost_for};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One completion request as the orchestrator issues it.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt.
    pub system: Option<String>,
    /// Prior turns.
    pub history: Vec<ChatMessage>,
    /// Current user message.
    pub user: String,
    /// `provider/model` or bare model string.
    pub model: String,
    /// Fallback `provider/model`, tried after the primary is exhausted.
    pub fallback: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Output token cap.
    pub max_tokens: Option<u64>,
}

/// A served completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Assistant text.
    pub response: String,
    /// Raw assistant message (tool-call encodings intact).
    pub raw_message: Value,
    /// Usage for this call.
    pub usage: TokenUsage,
    /// Cost for this call.
    pub cost: CostBreakdown,
    /// Model that actually served it (reflects failover).
    pub model: String,
    /// Provider that actually served it (reflects failover).
    pub provider: String,
}

/// Structured-task result.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Parsed output object.
    pub output: Value,
    /// Usage for the call.
    pub usage: TokenUsage,
    /// Cost for the call.
    pub cost: CostBreakdown,
    /// Whether the output satisfied the schema's shallow checks.
    pub validated: bool,
}

/// Compaction result.
#[derive(Debug, Clone)]
pub struct CompactResult {
    /// The compacted history: one summary system turn + the preserved tail.
    pub messages: Vec<ChatMessage>,
    /// Usage spent producing the summary (zero when nothing was compacted).
    pub usage: TokenUsage,
    /// Turn count before compaction.
    pub original_count: usize,
    /// Turn count after compaction.
    pub compacted_count: usize,
}

/// Unified model gateway over registered provider clients.
pub struct ModelGateway {
    clients: BTreeMap<String, Arc<dyn ProviderClient>>,
    retry: RetryConfig,
    tiers: ModelTiers,
    default_provider: String,
}

impl std::fmt::Debug for ModelGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelGateway")
            .field("providers", &self.clients.keys().collect::<Vec<_>>())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ModelGateway {
    /// Build a gateway with no providers registered.
    #[must_use]
    pub fn new(retry: RetryConfig, tiers: ModelTiers, default_provider: impl Into<String>) -> Self {
        Self {
            clients: BTreeMap::new(),
            retry,
            tiers,
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider client under its name.
    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.name().to_string(), client);
    }

    /// Registered provider names.
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    /// The configured model tiers.
    #[must_use]
    pub fn tiers(&self) -> &ModelTiers {
        &self.tiers
    }

    fn client_for(&self, model_ref: &ModelRef) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        self.clients
            .get(&model_ref.provider)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(model_ref.provider.clone()))
    }

    /// One completion with retry on the primary, then the same retry
    /// discipline on the fallback. Non-retryable failures surface
    /// immediately; cancellation aborts waits and in-flight attempts.
    ///
    /// # Errors
    ///
    /// The last [`ProviderError`] after both lineages are exhausted.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let primary = ModelRef::parse(&request.model, &self.default_provider);
        let fallback = request
            .fallback
            .clone()
            .unwrap_or_else(|| self.tiers.fallback.clone());
        let fallback = ModelRef::parse(&fallback, &self.default_provider);

        match self.complete_with_retries(request, &primary, cancel).await {
            Ok(completion) => Ok(completion),
            Err(err) if err.is_retryable() && fallback != primary => {
                warn!(
                    primary = %primary,
                    fallback = %fallback,
                    error = %err,
                    "primary exhausted; failing over"
                );
                self.complete_with_retries(request, &fallback, cancel).await
            }
            Err(err) => Err(err),
        }
    }

    async fn complete_with_retries(
        &self,
        request: &CompletionRequest,
        model_ref: &ModelRef,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let client = self.client_for(model_ref)?;
        let chat = ChatRequest {
            system: request.system.clone(),
            history: request.history.clone(),
            user: request.user.clone(),
            model: model_ref.model.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts.max(1) {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            if attempt > 0 {
                let delay = backoff_delay(&self.retry, attempt - 1);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                }
            }

            let outcome = tokio::select! {
                outcome = client.complete(&chat) => outcome,
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            };
            match outcome {
                Ok(raw) => return Ok(self.finish(raw, model_ref)),
                Err(err) if err.is_retryable() => {
                    warn!(model = %model_ref, attempt, error = %err, "model call failed; will retry");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ProviderError::Upstream {
            provider: model_ref.provider.clone(),
            message: "retry budget exhausted".to_string(),
        }))
    }

    fn finish(&self, raw: RawCompletion, model_ref: &ModelRef) -> Completion {
        let cost = cost_for(&model_ref.model, &raw.usage);
        Completion {
            response: raw.content,
            raw_message: raw.raw_message,
            usage: raw.usage,
            cost,
            model: model_ref.model.clone(),
            provider: model_ref.provider.clone(),
        }
    }

    /// Stream a completion. The returned receiver yields exactly one
    /// [`StreamEvent::Start`], zero or more chunks, and one terminal
    /// [`StreamEvent::Done`] or [`StreamEvent::Error`].
    ///
    /// The same retry discipline as [`ModelGateway::complete`] applies, but
    /// only while nothing has been forwarded yet: a retryable failure before
    /// the first chunk retries the primary up to the attempt budget and then
    /// fails over to the fallback. Once a chunk has reached the caller the
    /// stream is committed and any failure is terminal.
    #[must_use]
    pub fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let primary = ModelRef::parse(&request.model, &self.default_provider);
        let fallback = request
            .fallback
            .clone()
            .unwrap_or_else(|| self.tiers.fallback.clone());
        let fallback = ModelRef::parse(&fallback, &self.default_provider);

        // Resolve the lineages up front; the serving task owns no &self.
        let mut lineages: Vec<(ModelRef, Arc<dyn ProviderClient>)> = Vec::new();
        let mut resolve_err = None;
        match self.client_for(&primary) {
            Ok(client) => lineages.push((primary.clone(), client)),
            Err(err) => resolve_err = Some(err),
        }
        if fallback != primary
            && let Ok(client) = self.client_for(&fallback)
        {
            lineages.push((fallback, client));
        }
        if lineages.is_empty() {
            let error = resolve_err
                .map_or_else(|| "no provider available".to_string(), |e| e.to_string());
            tokio::spawn(async move {
                let _ = events_tx.send(StreamEvent::Start).await;
                let _ = events_tx.send(StreamEvent::Error { error }).await;
            });
            return events_rx;
        }

        let request = request.clone();
        let retry = self.retry;
        let cancel = cancel.clone();

        tokio::spawn(async move {
            if events_tx.send(StreamEvent::Start).await.is_err() {
                return;
            }

            let mut last_err: Option<ProviderError> = None;
            for (lineage, (model_ref, client)) in lineages.into_iter().enumerate() {
                if lineage > 0 {
                    let why = last_err
                        .as_ref()
                        .map_or_else(String::new, ToString::to_string);
                    warn!(fallback = %model_ref, error = %why, "primary stream exhausted; failing over");
                }
                let chat = ChatRequest {
                    system: request.system.clone(),
                    history: request.history.clone(),
                    user: request.user.clone(),
                    model: model_ref.model.clone(),
                    temperature: request.temperature,
                    max_tokens: request.max_tokens,
                };

                for attempt in 0..retry.max_attempts.max(1) {
                    if cancel.is_cancelled() {
                        let _ = events_tx
                            .send(StreamEvent::Error { error: "cancelled".to_string() })
                            .await;
                        return;
                    }
                    if attempt > 0 {
                        let delay = backoff_delay(&retry, attempt - 1);
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = cancel.cancelled() => {
                                let _ = events_tx
                                    .send(StreamEvent::Error { error: "cancelled".to_string() })
                                    .await;
                                return;
                            }
                        }
                    }

                    match stream_attempt(Arc::clone(&client), chat.clone(), &events_tx, &cancel)
                        .await
                    {
                        StreamAttempt::Done(usage) => {
                            let _ = events_tx
                                .send(StreamEvent::Done {
                                    cost: cost_for(&model_ref.model, &usage),
                                    usage,
                                })
                                .await;
                            return;
                        }
                        StreamAttempt::ClientGone => return,
                        StreamAttempt::Cancelled => {
                            let _ = events_tx
                                .send(StreamEvent::Error { error: "cancelled".to_string() })
                                .await;
                            return;
                        }
                        StreamAttempt::Failed { err, streamed } => {
                            if streamed || !err.is_retryable() {
                                let _ = events_tx
                                    .send(StreamEvent::Error { error: err.to_string() })
                                    .await;
                                return;
                            }
                            warn!(model = %model_ref, attempt, error = %err,
                                  "stream attempt failed before first chunk; will retry");
                            last_err = Some(err);
                        }
                    }
                }
            }

            let error = last_err
                .map_or_else(|| "retry budget exhausted".to_string(), |e| e.to_string());
            let _ = events_tx.send(StreamEvent::Error { error }).await;
        });

        events_rx
    }

    /// Structured task: constrain the model to emit JSON conforming to
    /// `schema`, parse, and validate shallowly.
    ///
    /// # Errors
    ///
    /// [`ProviderError::BadResponse`] when the output is not decodable JSON;
    /// upstream errors as in [`ModelGateway::complete`].
    #[allow(clippy::too_many_arguments)]
    pub async fn task(
        &self,
        prompt: &str,
        input: Option<&Value>,
        schema: Option<&Value>,
        model: Option<&str>,
        temperature: Option<f64>,
        max_tokens: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, ProviderError> {
        let model = model.unwrap_or(&self.tiers.cheap).to_string();
        let mut system = String::from(prompt);
        if let Some(schema) = schema {
            system.push_str(&format!(
                "\n\nRespond with ONLY a JSON value conforming to this schema, no prose:\n{schema}"
            ));
        } else {
            system.push_str("\n\nRespond with ONLY a JSON value, no prose.");
        }

        let user = match input {
            Some(value) => value.to_string(),
            None => "{}".to_string(),
        };
        let request = CompletionRequest {
            system: Some(system),
            history: Vec::new(),
            user,
            model,
            fallback: None,
            temperature,
            max_tokens,
        };
        let completion = self.complete(&request, cancel).await?;

        let stripped = strip_code_fences(&completion.response);
        let output: Value =
            serde_json::from_str(stripped).map_err(|e| ProviderError::BadResponse {
                provider: completion.provider.clone(),
                message: format!("task output is not JSON: {e}"),
            })?;

        let validated = match schema {
            Some(schema) => validate_shallow(&output, schema).is_empty(),
            None => true,
        };
        Ok(TaskResult {
            output,
            usage: completion.usage,
            cost: completion.cost,
            validated,
        })
    }

    /// Compact a history: replace everything but the last `keep_recent`
    /// turns with a single summary system turn produced by the cheap tier.
    /// Histories at or under `keep_recent` return unchanged with zero usage.
    ///
    /// # Errors
    ///
    /// Upstream errors as in [`ModelGateway::complete`].
    pub async fn compact(
        &self,
        history: &[ChatMessage],
        instructions: Option<&str>,
        keep_recent: usize,
        cancel: &CancellationToken,
    ) -> Result<CompactResult, ProviderError> {
        if history.len() <= keep_recent {
            return Ok(CompactResult {
                messages: history.to_vec(),
                usage: TokenUsage::default(),
                original_count: history.len(),
                compacted_count: history.len(),
            });
        }

        let (head, tail) = history.split_at(history.len() - keep_recent);
        let transcript: String = head
            .iter()
            .map(|turn| format!("{}: {}", turn.role.as_str(), turn.content))
            .collect::<Vec<_>>()
            .join("\n");

        let mut system = String::from(
            "Summarize the conversation so far into a compact brief that preserves \
             facts, decisions, open questions, and user preferences.",
        );
        if let Some(extra) = instructions {
            system.push_str("\nAdditional instructions: ");
            system.push_str(extra);
        }

        let request = CompletionRequest {
            system: Some(system),
            history: Vec::new(),
            user: transcript,
            model: self.tiers.cheap.clone(),
            fallback: None,
            temperature: Some(0.2),
            max_tokens: None,
        };
        let completion = self.complete(&request, cancel).await?;

        let mut messages = Vec::with_capacity(keep_recent + 1);
        messages.push(ChatMessage::new(
            Role::System,
            format!("[Conversation summary]\n{}", completion.response),
        ));
        messages.extend(tail.iter().cloned());

        info!(
            original = history.len(),
            compacted = messages.len(),
            "history compacted"
        );
        Ok(CompactResult {
            original_count: history.len(),
            compacted_count: messages.len(),
            messages,
            usage: completion.usage,
        })
    }
}

/// Outcome of one streaming attempt against one client.
enum StreamAttempt {
    /// The provider finished; usage is final.
    Done(TokenUsage),
    /// The provider failed. `streamed` records whether any chunk already
    /// reached the caller, which forbids a retry.
    Failed {
        err: ProviderError,
        streamed: bool,
    },
    /// The request's cancellation token fired mid-attempt.
    Cancelled,
    /// The caller dropped the event receiver (client disconnect).
    ClientGone,
}

/// Run one streaming attempt, forwarding deltas as [`StreamEvent::Chunk`]s.
async fn stream_attempt(
    client: Arc<dyn ProviderClient>,
    chat: ChatRequest,
    events_tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
) -> StreamAttempt {
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
    let mut call = tokio::spawn(async move { client.stream(&chat, delta_tx).await });
    let mut streamed = false;

    let outcome = loop {
        tokio::select! {
            delta = delta_rx.recv() => match delta {
                Some(text) => {
                    if events_tx.send(StreamEvent::Chunk { data: text }).await.is_err() {
                        call.abort();
                        return StreamAttempt::ClientGone;
                    }
                    streamed = true;
                }
                // Provider finished sending deltas; wait for usage.
                None => break (&mut call).await,
            },
            () = cancel.cancelled() => {
                call.abort();
                return StreamAttempt::Cancelled;
            }
        }
    };

    match outcome {
        Ok(Ok(usage)) => StreamAttempt::Done(usage),
        Ok(Err(err)) => StreamAttempt::Failed { err, streamed },
        Err(join_err) => StreamAttempt::Failed {
            err: ProviderError::Upstream {
                provider: "stream".to_string(),
                message: format!("stream task failed: {join_err}"),
            },
            // A crashed serving task is never safely retryable.
            streamed: true,
        },
    }
}

/// Strip a surrounding markdown code fence from a model response.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted provider: each call pops the next outcome. Stream calls pop
    /// from their own script; an empty script streams successfully. A
    /// `pre_chunk` failure errors before any delta; a `mid_stream` failure
    /// sends one delta first.
    struct ScriptedClient {
        name: String,
        outcomes: Mutex<Vec<Result<String, ProviderError>>>,
        stream_outcomes: Mutex<Vec<StreamScript>>,
        calls: AtomicU32,
    }

    enum StreamScript {
        Ok,
        FailPreChunk(ProviderError),
        FailMidStream(ProviderError),
    }

    impl ScriptedClient {
        fn new(name: &str, outcomes: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                outcomes: Mutex::new(outcomes),
                stream_outcomes: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
            })
        }

        fn with_stream_script(name: &str, script: Vec<StreamScript>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                outcomes: Mutex::new(Vec::new()),
                stream_outcomes: Mutex::new(script),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, _request: &ChatRequest) -> Result<RawCompletion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            let outcome = if outcomes.is_empty() {
                Ok("default".to_string())
            } else {
                outcomes.remove(0)
            };
            outcome.map(|content| RawCompletion {
                raw_message: serde_json::json!({"role": "assistant", "content": content}),
                content,
                usage: TokenUsage::new(10, 5),
            })
        }

        async fn stream(
            &self,
            _request: &ChatRequest,
            tx: mpsc::Sender<String>,
        ) -> Result<TokenUsage, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = {
                let mut scripts = self.stream_outcomes.lock().unwrap();
                if scripts.is_empty() {
                    StreamScript::Ok
                } else {
                    scripts.remove(0)
                }
            };
            match script {
                StreamScript::FailPreChunk(err) => return Err(err),
                StreamScript::FailMidStream(err) => {
                    let _ = tx.send("par".to_string()).await;
                    return Err(err);
                }
                StreamScript::Ok => {}
            }
            for part in ["str", "eam"] {
                if tx.send(part.to_string()).await.is_err() {
                    return Err(ProviderError::Cancelled);
                }
            }
            Ok(TokenUsage::new(4, 2))
        }
    }

    fn unavailable() -> ProviderError {
        ProviderError::Upstream {
            provider: "primary".to_string(),
            message: "HTTP 503 unavailable".to_string(),
        }
    }

    fn gateway_with(clients: Vec<Arc<ScriptedClient>>) -> ModelGateway {
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
        };
        let tiers = ModelTiers {
            cheap: "primary/cheap-model".to_string(),
            default: "primary/main-model".to_string(),
            best: "primary/best-model".to_string(),
            fallback: "backup/fallback-model".to_string(),
        };
        let mut gateway = ModelGateway::new(retry, tiers, "primary");
        for client in clients {
            gateway.register(client);
        }
        gateway
    }

    fn request(model: &str) -> CompletionRequest {
        CompletionRequest {
            system: None,
            history: Vec::new(),
            user: "hi".to_string(),
            model: model.to_string(),
            fallback: None,
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds_on_primary() {
        let primary = ScriptedClient::new(
            "primary",
            vec![Err(unavailable()), Ok("recovered".to_string())],
        );
        let gateway = gateway_with(vec![Arc::clone(&primary)]);

        let completion = gateway
            .complete(&request("main-model"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.response, "recovered");
        assert_eq!(completion.provider, "primary");
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn fails_over_after_exhausting_primary() {
        let primary = ScriptedClient::new(
            "primary",
            vec![Err(unavailable()), Err(unavailable()), Err(unavailable())],
        );
        let backup = ScriptedClient::new("backup", vec![Ok("from backup".to_string())]);
        let gateway = gateway_with(vec![Arc::clone(&primary), Arc::clone(&backup)]);

        let completion = gateway
            .complete(&request("main-model"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.response, "from backup");
        assert_eq!(completion.provider, "backup");
        assert_eq!(completion.model, "fallback-model");
        assert_eq!(primary.calls(), 3, "full retry budget on the primary");
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test]
    async fn non_retryable_surfaces_immediately() {
        let primary = ScriptedClient::new(
            "primary",
            vec![Err(ProviderError::Upstream {
                provider: "primary".to_string(),
                message: "HTTP 401 unauthorized".to_string(),
            })],
        );
        let backup = ScriptedClient::new("backup", vec![Ok("never".to_string())]);
        let gateway = gateway_with(vec![Arc::clone(&primary), Arc::clone(&backup)]);

        let err = gateway
            .complete(&request("main-model"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_before_retry() {
        let primary = ScriptedClient::new("primary", vec![Err(unavailable())]);
        let gateway = gateway_with(vec![Arc::clone(&primary)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = gateway.complete(&request("main-model"), &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn stream_event_ordering_contract() {
        let primary = ScriptedClient::new("primary", vec![]);
        let gateway = gateway_with(vec![primary]);

        let mut rx = gateway.stream(&request("main-model"), &CancellationToken::new());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert!(matches!(events.first(), Some(StreamEvent::Start)));
        let chunks: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk { data } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, "stream");
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
        let starts = events.iter().filter(|e| matches!(e, StreamEvent::Start)).count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn stream_unknown_provider_errors() {
        let gateway = gateway_with(vec![]);
        let mut rx = gateway.stream(&request("main-model"), &CancellationToken::new());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn stream_retries_before_first_chunk() {
        let primary = ScriptedClient::with_stream_script(
            "primary",
            vec![StreamScript::FailPreChunk(unavailable()), StreamScript::Ok],
        );
        let gateway = gateway_with(vec![Arc::clone(&primary)]);

        let events =
            drain(gateway.stream(&request("main-model"), &CancellationToken::new())).await;

        assert_eq!(primary.calls(), 2, "one failed attempt, one retry");
        assert_eq!(
            events.iter().filter(|e| matches!(e, StreamEvent::Start)).count(),
            1,
            "retries never repeat the start event"
        );
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk { data } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "stream");
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn stream_fails_over_after_exhausting_primary() {
        let primary = ScriptedClient::with_stream_script(
            "primary",
            vec![
                StreamScript::FailPreChunk(unavailable()),
                StreamScript::FailPreChunk(unavailable()),
                StreamScript::FailPreChunk(unavailable()),
            ],
        );
        let backup = ScriptedClient::with_stream_script("backup", vec![StreamScript::Ok]);
        let gateway = gateway_with(vec![Arc::clone(&primary), Arc::clone(&backup)]);

        let events =
            drain(gateway.stream(&request("main-model"), &CancellationToken::new())).await;

        assert_eq!(primary.calls(), 3, "full retry budget on the primary");
        assert_eq!(backup.calls(), 1);
        match events.last() {
            Some(StreamEvent::Done { cost, .. }) => {
                assert_eq!(cost.model, "fallback-model", "cost reflects the serving model");
            }
            other => panic!("expected done from the fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_non_retryable_failure_is_terminal() {
        let primary = ScriptedClient::with_stream_script(
            "primary",
            vec![StreamScript::FailPreChunk(ProviderError::Upstream {
                provider: "primary".to_string(),
                message: "HTTP 401 unauthorized".to_string(),
            })],
        );
        let backup = ScriptedClient::with_stream_script("backup", vec![StreamScript::Ok]);
        let gateway = gateway_with(vec![Arc::clone(&primary), Arc::clone(&backup)]);

        let events =
            drain(gateway.stream(&request("main-model"), &CancellationToken::new())).await;

        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 0, "no failover on a permanent failure");
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn stream_failure_after_a_chunk_never_retries() {
        let primary = ScriptedClient::with_stream_script(
            "primary",
            vec![StreamScript::FailMidStream(unavailable())],
        );
        let backup = ScriptedClient::with_stream_script("backup", vec![StreamScript::Ok]);
        let gateway = gateway_with(vec![Arc::clone(&primary), Arc::clone(&backup)]);

        let events =
            drain(gateway.stream(&request("main-model"), &CancellationToken::new())).await;

        assert_eq!(primary.calls(), 1, "committed streams are not retried");
        assert_eq!(backup.calls(), 0);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Chunk { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn task_parses_and_validates() {
        let primary = ScriptedClient::new(
            "primary",
            vec![Ok("```json\n{\"category\": \"bug\"}\n```".to_string())],
        );
        let gateway = gateway_with(vec![primary]);

        let schema = serde_json::json!({"type": "object", "required": ["category"]});
        let result = gateway
            .task(
                "classify",
                Some(&serde_json::json!({"subject": "crash"})),
                Some(&schema),
                None,
                None,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.validated);
        assert_eq!(result.output["category"], "bug");
    }

    #[tokio::test]
    async fn task_flags_schema_violations_without_failing() {
        let primary = ScriptedClient::new("primary", vec![Ok("{\"other\": 1}".to_string())]);
        let gateway = gateway_with(vec![primary]);

        let schema = serde_json::json!({"type": "object", "required": ["category"]});
        let result = gateway
            .task("classify", None, Some(&schema), None, None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.validated);
    }

    #[tokio::test]
    async fn task_non_json_is_bad_response() {
        let primary = ScriptedClient::new("primary", vec![Ok("sorry, no".to_string())]);
        let gateway = gateway_with(vec![primary]);

        let err = gateway
            .task("classify", None, None, None, None, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::BadResponse { .. }));
    }

    #[tokio::test]
    async fn compact_short_history_is_a_no_op() {
        let primary = ScriptedClient::new("primary", vec![]);
        let gateway = gateway_with(vec![Arc::clone(&primary)]);
        let history = vec![
            ChatMessage::new(Role::User, "a"),
            ChatMessage::new(Role::Assistant, "b"),
        ];

        let result = gateway
            .compact(&history, None, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.messages, history);
        assert_eq!(result.usage, TokenUsage::default());
        assert_eq!(primary.calls(), 0, "no model call made");
    }

    #[tokio::test]
    async fn compact_replaces_head_with_summary() {
        let primary = ScriptedClient::new("primary", vec![Ok("they discussed budgets".to_string())]);
        let gateway = gateway_with(vec![primary]);
        let history: Vec<ChatMessage> = (0..6)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                ChatMessage::new(role, format!("turn {i}"))
            })
            .collect();

        let result = gateway
            .compact(&history, Some("keep numbers"), 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.original_count, 6);
        assert_eq!(result.compacted_count, 3);
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.messages[0].role, Role::System);
        assert!(result.messages[0].content.contains("they discussed budgets"));
        assert_eq!(result.messages[1].content, "turn 4");
        assert_eq!(result.messages[2].content, "turn 5");
        assert!(result.usage.total_tokens > 0);
    }
}
