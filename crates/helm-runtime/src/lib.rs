// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Per-request orchestration: bind, forecast, resolve, invoke, arbitrate, persist, notify."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The orchestrator is the per-request state machine:
//!
//! `ADMITTED → FORECAST → RESOLVED → INVOKING → ARBITRATING → COMPLETING →
//! SEALED`
//!
//! Admission binds tenancy and the session key; the forecast gate consults
//! the tenant budget; resolution binds the workspace pin, persona, skills,
//! and model; invocation runs the provider loop with retry and failover;
//! arbitration runs tool rounds up to a cap; completion redacts, persists
//! the trace, records spend, posts to the control plane, and fires the
//! webhook. A terminal error from any state still seals an error trace.

mod counters;
mod request;

pub use counters::{UsageCounters, UsageSnapshot};
pub use request::{
    CompactRequest, CompactResponse, SendMetadata, SendRequest, SendResponse, TaskRequest,
    TaskResponse,
};

use helm_arbiter::{RoundPolicy, ToolArbiter, ToolBackend, parse_tool_calls, results_as_messages};
use helm_audit::{AuditLog, NewAuditEntry};
use helm_budget::{BudgetError, BudgetManager};
use helm_config::HelmConfig;
use helm_control::{ControlPlaneClient, ToolCallContext};
use helm_core::{
    AuditEventType, ChatMessage, EntityLinks, Role, SessionKey, StepDetail, TenantIdentity,
    TokenUsage, cost_for, estimate_tokens,
};
use helm_error::{ErrorKind, HelmError};
use helm_provider::{
    CancellationToken, CompletionRequest, ModelGateway, ProviderError, StreamEvent,
};
use helm_redact::Redactor;
use helm_skills::{SkillRegistry, SkillState, check_gating};
use helm_store::Store;
use helm_tenancy::{AgentClaims, AgentTokenService};
use helm_trace::{RetentionManager, TraceBuilder, TraceStore};
use helm_webhook::{WebhookEvent, build_payload, fire_and_forget};
use helm_workspace::{EnvironmentManager, PromptMode, TimeContext, WorkspaceLoader};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Assumed context window for the warning threshold.
const MODEL_WINDOW_TOKENS: u64 = 128_000;

/// Output cap assumed by the pre-execution forecast.
const FORECAST_MAX_OUTPUT: u64 = 1_024;

/// Everything resolved for one execution.
struct Resolved {
    system_prompt: String,
    skill_permissions: Vec<String>,
    skill_versions: BTreeMap<String, String>,
    deprecated: Vec<(String, String)>,
    model: String,
    workspace_hash: Option<String>,
}

/// The per-request orchestrator. One instance serves the whole process;
/// each request runs on its own task with its own cancellation token.
pub struct Orchestrator {
    config: Arc<HelmConfig>,
    workspace_id: String,
    store: Store,
    audit: AuditLog,
    budget: BudgetManager,
    traces: TraceStore,
    retention: RetentionManager,
    registry: SkillRegistry,
    envs: EnvironmentManager,
    gateway: Arc<ModelGateway>,
    arbiter: Arc<ToolArbiter>,
    control: Arc<ControlPlaneClient>,
    tokens: Option<AgentTokenService>,
    redactor: Arc<Redactor>,
    counters: Arc<UsageCounters>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workspace_id", &self.workspace_id)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wire the orchestrator over the shared store and collaborators.
    #[must_use]
    pub fn new(
        config: HelmConfig,
        workspace_id: impl Into<String>,
        store: Store,
        gateway: Arc<ModelGateway>,
        tool_backend: Arc<dyn ToolBackend>,
        control: Arc<ControlPlaneClient>,
    ) -> Self {
        let audit = AuditLog::new(store.clone());
        let tokens = AgentTokenService::new(config.jwt_secret.as_deref()).ok();
        let arbiter = Arc::new(ToolArbiter::new(
            tool_backend,
            audit.clone(),
            config.tool_timeout,
        ));
        Self {
            workspace_id: workspace_id.into(),
            audit: audit.clone(),
            budget: BudgetManager::new(store.clone(), audit.clone()),
            traces: TraceStore::new(store.clone()),
            retention: RetentionManager::new(store.clone()),
            registry: SkillRegistry::new(store.clone(), audit.clone()),
            envs: EnvironmentManager::new(store.clone(), audit),
            store,
            gateway,
            arbiter,
            control,
            tokens,
            redactor: Arc::new(Redactor::with_defaults(config.redaction_salt.clone())),
            counters: Arc::new(UsageCounters::new()),
            config: Arc::new(config),
        }
    }

    /// Process-wide usage counters.
    #[must_use]
    pub fn counters(&self) -> Arc<UsageCounters> {
        Arc::clone(&self.counters)
    }

    /// The audit log handle (shared with the daemon for boundary events).
    #[must_use]
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// A handle to the shared store (for repositories the daemon wires up
    /// itself, like workspace versioning).
    #[must_use]
    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// The trace store handle.
    #[must_use]
    pub fn traces(&self) -> &TraceStore {
        &self.traces
    }

    /// The retention manager handle.
    #[must_use]
    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    /// The skill registry handle.
    #[must_use]
    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    /// The budget manager handle.
    #[must_use]
    pub fn budget(&self) -> &BudgetManager {
        &self.budget
    }

    /// The environment/pin manager handle.
    #[must_use]
    pub fn envs(&self) -> &EnvironmentManager {
        &self.envs
    }

    /// The model gateway handle.
    #[must_use]
    pub fn gateway(&self) -> &Arc<ModelGateway> {
        &self.gateway
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &HelmConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // ADMITTED
    // -----------------------------------------------------------------------

    /// Bind the session key to the signed token. Mismatches are audited and
    /// rejected before anything else runs.
    fn admit(
        &self,
        identity: &TenantIdentity,
        claims: Option<&AgentClaims>,
        request: &SendRequest,
    ) -> Result<SessionKey, HelmError> {
        let session = SessionKey::parse(&request.session_key).map_err(|message| {
            self.audit.record_or_log(
                &NewAuditEntry::new(&identity.tenant_id, AuditEventType::AuthFailure)
                    .user(&request.user_id)
                    .payload(json!({"reason": "bad_session_key", "detail": message})),
            );
            HelmError::auth_invalid(message)
        })?;

        let token_user = claims.and_then(|c| c.user_id.as_deref());
        let mismatch = session.user_id != request.user_id
            || token_user.is_some_and(|u| u != session.user_id);
        if mismatch {
            self.audit.record_or_log(
                &NewAuditEntry::new(&identity.tenant_id, AuditEventType::AuthFailure)
                    .user(&request.user_id)
                    .payload(json!({"reason": "session_user_mismatch"})),
            );
            return Err(HelmError::auth_invalid(
                "session key user does not match the authenticated user",
            ));
        }

        self.audit.record_or_log(
            &NewAuditEntry::new(&identity.tenant_id, AuditEventType::AuthSuccess)
                .user(&session.user_id),
        );
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // RESOLVED
    // -----------------------------------------------------------------------

    fn resolve(
        &self,
        identity: &TenantIdentity,
        request: &SendRequest,
    ) -> Result<Resolved, HelmError> {
        let pin = self
            .envs
            .resolve_pin(&self.workspace_id, request.environment.as_deref())
            .map_err(|e| HelmError::internal(format!("pin resolution failed: {e}")))?;

        // Skills: pins are the final source of truth; otherwise every active
        // version is admitted.
        let mut records = Vec::new();
        let mut deprecated = Vec::new();
        match pin.as_ref().filter(|p| !p.skill_pins.is_empty()) {
            Some(pin) => {
                for (name, version) in &pin.skill_pins {
                    match self.registry.get_exact(name, version) {
                        Ok(record) => records.push(record),
                        Err(e) => warn!(skill = %name, %version, error = %e, "pinned skill missing"),
                    }
                }
            }
            None => {
                records = self
                    .registry
                    .list_by_state(SkillState::Active)
                    .map_err(|e| HelmError::internal(format!("skill listing failed: {e}")))?;
            }
        }

        let mut skill_versions = BTreeMap::new();
        let mut skill_permissions = Vec::new();
        let mut skill_bodies = Vec::new();
        for record in records {
            let name = record.manifest.name.clone();
            let version = record.manifest.version.clone();
            match record.state {
                SkillState::Active => {}
                SkillState::Deprecated => deprecated.push((name.clone(), version.clone())),
                other => {
                    warn!(skill = %name, %version, state = other.as_str(), "skill not admissible");
                    continue;
                }
            }
            if !identity.capabilities.permits_skill(&name) {
                continue;
            }
            if let Err(reason) = check_gating(&record.manifest.gating) {
                warn!(skill = %name, %reason, "skill gated off on this host");
                continue;
            }
            for tool in &record.manifest.permissions {
                if !skill_permissions.contains(tool) {
                    skill_permissions.push(tool.clone());
                }
            }
            skill_versions.insert(name, version);
            skill_bodies.push(record.body);
        }

        // Prompt assembly. A caller-supplied system prompt replaces it all.
        let system_prompt = match &request.metadata.system_prompt {
            Some(prompt) => prompt.clone(),
            None => {
                let loader = WorkspaceLoader::new(
                    &self.config.workspace_path,
                    self.config.workspace_file_char_limit,
                );
                let memory = loader.memory(chrono::Utc::now());
                let time = self.config.time_context_enabled.then(|| TimeContext {
                    request_timezone: request.metadata.timezone.clone(),
                    default_timezone: self.config.default_timezone.clone(),
                });
                loader.compose_prompt(
                    PromptMode::Full,
                    &identity.agent_role,
                    &skill_bodies,
                    Some(&memory),
                    time.as_ref(),
                )
            }
        };

        // Model: pin override wins, then the default tier.
        let model = match pin.as_ref() {
            Some(pin) => match (&pin.provider, &pin.model) {
                (Some(provider), Some(model)) => format!("{provider}/{model}"),
                (None, Some(model)) => model.clone(),
                _ => self.config.model_tiers.default.clone(),
            },
            None => self.config.model_tiers.default.clone(),
        };

        Ok(Resolved {
            system_prompt,
            skill_permissions,
            skill_versions,
            deprecated,
            model,
            workspace_hash: pin.and_then(|p| p.version_hash),
        })
    }

    fn resolve_task_inputs(&self, request: &SendRequest) -> Result<(), HelmError> {
        if request.task_id.is_none()
            && request.task_title.is_none()
            && self.config.default_task_title.is_empty()
        {
            return Err(HelmError::validation(
                "one of task_id or task_title is required (no default task title configured)",
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // The non-streaming pipeline
    // -----------------------------------------------------------------------

    /// Execute one `/api/agents/send` request end to end.
    ///
    /// # Errors
    ///
    /// A [`HelmError`] carrying the trace id whenever a trace was created;
    /// terminal failures still seal and persist an error trace.
    pub async fn send(
        &self,
        identity: &TenantIdentity,
        claims: Option<&AgentClaims>,
        request: SendRequest,
        cancel: CancellationToken,
    ) -> Result<SendResponse, HelmError> {
        // ADMITTED
        let session = self.admit(identity, claims, &request)?;
        self.resolve_task_inputs(&request)?;

        // RESOLVED (prompt is needed for an honest forecast)
        let resolved = self.resolve(identity, &request)?;

        let mut builder = TraceBuilder::new(
            &identity.tenant_id,
            &self.workspace_id,
            &identity.agent_role,
            &resolved.model,
            helm_provider::ModelRef::parse(&resolved.model, &self.config.default_provider).provider,
            &request.message,
            request.messages.len(),
        );
        if let Some(hash) = &resolved.workspace_hash {
            builder.set_workspace_hash(hash.clone());
        }
        builder.set_skill_versions(resolved.skill_versions.clone());
        builder.set_redacted_prompt(resolved.system_prompt.clone());
        let trace_id = builder.id().to_string();

        self.audit.record_or_log(
            &NewAuditEntry::new(&identity.tenant_id, AuditEventType::AgentExecutionStarted)
                .trace(&trace_id)
                .user(&session.user_id)
                .payload(json!({"model": resolved.model})),
        );
        for (name, version) in &resolved.deprecated {
            self.registry
                .note_deprecated_use(&identity.tenant_id, name, version, &trace_id);
        }

        // FORECAST
        let prompt_estimate = estimate_tokens(&resolved.system_prompt)
            + request
                .messages
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum::<u64>()
            + estimate_tokens(&request.message);
        let forecast = self
            .budget
            .forecast(
                &identity.tenant_id,
                prompt_estimate,
                FORECAST_MAX_OUTPUT,
                &resolved.model,
            )
            .map_err(|e| HelmError::internal(format!("forecast failed: {e}")))?;
        if let Err(err) = self
            .budget
            .check_before_execution(&identity.tenant_id, &forecast, Some(&trace_id))
        {
            let wire = match &err {
                BudgetError::Exceeded { .. } => HelmError::budget_exceeded(err.to_string()),
                _ => HelmError::internal(err.to_string()),
            };
            return Err(self.fail(builder, identity, &request, wire));
        }

        let context_warning = (prompt_estimate
            > MODEL_WINDOW_TOKENS * u64::from(self.config.context_warning_pct) / 100)
            .then(|| {
                format!(
                    "prompt estimate {prompt_estimate} tokens exceeds {}% of the model window",
                    self.config.context_warning_pct
                )
            });

        // INVOKING + ARBITRATING
        let outcome = self
            .invoke_with_tools(identity, &session, &resolved, &request, &mut builder, &cancel)
            .await;
        let response_text = match outcome {
            Ok(text) => text,
            Err(err) => return Err(self.fail(builder, identity, &request, err)),
        };

        // COMPLETING
        let agent_token = self.mint_token(identity, &session);
        let task_id = self
            .resolve_task(&request, agent_token.as_deref())
            .await
            .unwrap_or_default();
        if !task_id.is_empty() {
            builder.set_entities(EntityLinks {
                task_id: Some(task_id.clone()),
                document_id: None,
                message_id: None,
            });
        }

        let mut trace = builder.seal(&response_text);
        self.redactor.redact_trace(&mut trace);
        self.persist_trace(&trace);

        if let Err(e) = self
            .budget
            .record_spend(&identity.tenant_id, trace.cost, Some(&trace.id))
        {
            error!(error = %e, "spend recording failed");
        }
        self.counters.record(&trace.usage, trace.cost, false);

        self.audit.record_or_log(
            &NewAuditEntry::new(&identity.tenant_id, AuditEventType::AgentExecutionCompleted)
                .trace(&trace.id)
                .user(&session.user_id)
                .payload(json!({
                    "total_tokens": trace.usage.total_tokens,
                    "cost": trace.cost,
                })),
        );

        // Control-plane persistence, best-effort.
        if let Some(token) = &agent_token
            && !task_id.is_empty()
        {
            if let Err(e) = self
                .control
                .post_message(token, &task_id, &response_text, &trace.id)
                .await
            {
                warn!(error = %e, "control-plane message post failed");
            }
            if let Some(plan) = &request.metadata.kickoff_plan {
                let title = request
                    .metadata
                    .kickoff_note
                    .clone()
                    .unwrap_or_else(|| "Kickoff plan".to_string());
                if let Err(e) = self
                    .control
                    .post_document(token, Some(&task_id), &title, plan)
                    .await
                {
                    warn!(error = %e, "control-plane document post failed");
                }
            }
        }

        let cost = cost_for(&trace.model, &trace.usage);
        if let Some(webhook) = request.webhook.clone() {
            let payload = build_payload(
                WebhookEvent::Completed,
                (!task_id.is_empty()).then_some(task_id.as_str()),
                Some(&session.user_id),
                Some(&identity.agent_role),
                Some(&response_text),
                None,
                Some(&trace.usage),
                Some(&cost),
                None,
            );
            fire_and_forget(webhook, payload);
        }

        info!(trace = %trace.id, tokens = trace.usage.total_tokens, "execution sealed");
        Ok(SendResponse {
            status: "ok".to_string(),
            task_id,
            response: response_text,
            usage: trace.usage,
            cost,
            trace_id: trace.id,
            context_warning,
        })
    }

    /// The model-call loop: invoke, arbitrate tool rounds up to the cap,
    /// re-invoke with the tool results appended.
    async fn invoke_with_tools(
        &self,
        identity: &TenantIdentity,
        session: &SessionKey,
        resolved: &Resolved,
        request: &SendRequest,
        builder: &mut TraceBuilder,
        cancel: &CancellationToken,
    ) -> Result<String, HelmError> {
        let mut history = request.messages.clone();
        let mut user_message = request.message.clone();
        let agent_token = self.mint_token(identity, session).unwrap_or_default();
        let tool_context = ToolCallContext {
            tenant_id: identity.tenant_id.clone(),
            workspace_id: self.workspace_id.clone(),
            trace_id: builder.id().to_string(),
            agent_token,
        };

        for round in 0..=self.config.max_tool_rounds {
            let completion_request = CompletionRequest {
                system: Some(resolved.system_prompt.clone()),
                history: history.clone(),
                user: user_message.clone(),
                model: resolved.model.clone(),
                fallback: None,
                temperature: None,
                max_tokens: identity.capabilities.max_tokens_per_request,
            };
            let started = std::time::Instant::now();
            let completion = self
                .gateway
                .complete(&completion_request, cancel)
                .await
                .map_err(map_provider_error)?;

            builder.set_served_by(&completion.model, &completion.provider);
            builder.push_step(
                StepDetail::LlmCall {
                    model: completion.model.clone(),
                    provider: completion.provider.clone(),
                    input_tokens: completion.usage.prompt_tokens,
                    output_tokens: completion.usage.completion_tokens,
                    cost: completion.cost.total_cost,
                },
                started.elapsed().as_millis() as u64,
            );

            let calls = parse_tool_calls(&completion.raw_message);
            if calls.is_empty() || round == self.config.max_tool_rounds {
                if !calls.is_empty() {
                    warn!(
                        trace = %builder.id(),
                        cap = self.config.max_tool_rounds,
                        "tool round cap reached; returning without executing further calls"
                    );
                }
                return Ok(completion.response);
            }

            let policy = RoundPolicy {
                skill_permissions: &resolved.skill_permissions,
                capabilities: &identity.capabilities,
                sandbox_roots: &[self.config.workspace_path.clone()],
            };
            let arbitrated = self
                .arbiter
                .execute_round(calls, &policy, &tool_context)
                .await;

            for outcome in &arbitrated {
                builder.push_step(
                    StepDetail::ToolCall {
                        id: outcome.call.id.clone(),
                        name: outcome.call.name.clone(),
                        arguments: outcome.call.arguments.clone(),
                        permitted: outcome.permitted,
                    },
                    0,
                );
                builder.push_step(
                    StepDetail::ToolResult {
                        id: outcome.result.id.clone(),
                        success: outcome.result.success,
                        result: outcome.result.result.clone(),
                        error: outcome.result.error.clone(),
                    },
                    outcome.result.duration_ms,
                );
                for warning in &outcome.warnings {
                    builder.label(
                        format!("warning:{}", outcome.call.id),
                        warning.clone(),
                    );
                }
            }

            // Feed the assistant turn and each tool result back for the next
            // round.
            if !completion.response.is_empty() {
                history.push(ChatMessage::new(Role::Assistant, completion.response.clone()));
            }
            history.extend(results_as_messages(&arbitrated));
            user_message =
                "Continue with the tool results above and answer the original request."
                    .to_string();
        }
        unreachable!("the loop always returns within the round cap");
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    /// Execute a streaming request. The returned receiver yields the
    /// ordered event sequence; tool calls are not executed mid-stream by
    /// contract. Dropping the receiver (client disconnect) cancels the
    /// stream and seals the trace with error kind `cancelled`, recording no
    /// spend for the incomplete call.
    ///
    /// # Errors
    ///
    /// Admission, validation, forecast, and resolution failures surface
    /// before any event is emitted.
    pub async fn stream(
        &self,
        identity: &TenantIdentity,
        claims: Option<&AgentClaims>,
        request: SendRequest,
    ) -> Result<(String, mpsc::Receiver<StreamEvent>), HelmError> {
        let session = self.admit(identity, claims, &request)?;
        let resolved = self.resolve(identity, &request)?;

        let mut builder = TraceBuilder::new(
            &identity.tenant_id,
            &self.workspace_id,
            &identity.agent_role,
            &resolved.model,
            helm_provider::ModelRef::parse(&resolved.model, &self.config.default_provider).provider,
            &request.message,
            request.messages.len(),
        );
        builder.set_skill_versions(resolved.skill_versions.clone());
        if let Some(hash) = &resolved.workspace_hash {
            builder.set_workspace_hash(hash.clone());
        }
        let trace_id = builder.id().to_string();

        // The forecast must cover everything the model call will carry:
        // system prompt, the full prior window, and the current message.
        let prompt_estimate = estimate_tokens(&resolved.system_prompt)
            + request
                .messages
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum::<u64>()
            + estimate_tokens(&request.message);
        let forecast = self
            .budget
            .forecast(
                &identity.tenant_id,
                prompt_estimate,
                FORECAST_MAX_OUTPUT,
                &resolved.model,
            )
            .map_err(|e| HelmError::internal(format!("forecast failed: {e}")))?;
        if let Err(err) = self
            .budget
            .check_before_execution(&identity.tenant_id, &forecast, Some(&trace_id))
        {
            let wire = match &err {
                BudgetError::Exceeded { .. } => HelmError::budget_exceeded(err.to_string()),
                _ => HelmError::internal(err.to_string()),
            };
            return Err(self.fail(builder, identity, &request, wire));
        }

        self.audit.record_or_log(
            &NewAuditEntry::new(&identity.tenant_id, AuditEventType::AgentExecutionStarted)
                .trace(&trace_id)
                .user(&session.user_id)
                .payload(json!({"model": resolved.model, "streaming": true})),
        );

        let cancel = CancellationToken::new();
        let completion_request = CompletionRequest {
            system: Some(resolved.system_prompt.clone()),
            history: request.messages.clone(),
            user: request.message.clone(),
            model: resolved.model.clone(),
            fallback: None,
            temperature: None,
            max_tokens: identity.capabilities.max_tokens_per_request,
        };
        let mut upstream = self.gateway.stream(&completion_request, &cancel);

        let (client_tx, client_rx) = mpsc::channel(64);
        let provider_name =
            helm_provider::ModelRef::parse(&resolved.model, &self.config.default_provider).provider;
        let tenant_id = identity.tenant_id.clone();
        let redactor = Arc::clone(&self.redactor);
        let traces = self.traces.clone();
        let retention = self.retention.clone();
        let budget = self.budget.clone();
        let audit = self.audit.clone();
        let counters = Arc::clone(&self.counters);
        let started = std::time::Instant::now();

        tokio::spawn(async move {
            let mut collected = String::new();
            let mut terminal: Option<StreamEvent> = None;

            while let Some(event) = upstream.recv().await {
                if let StreamEvent::Chunk { data } = &event {
                    collected.push_str(data);
                }
                let is_terminal =
                    matches!(event, StreamEvent::Done { .. } | StreamEvent::Error { .. });
                if is_terminal {
                    terminal = Some(event.clone());
                }
                if client_tx.send(event).await.is_err() {
                    // Client disconnected mid-stream.
                    cancel.cancel();
                    terminal = Some(StreamEvent::Error {
                        error: "cancelled".to_string(),
                    });
                    break;
                }
                if terminal.is_some() {
                    break;
                }
            }

            let duration = started.elapsed().as_millis() as u64;
            let trace = match terminal {
                Some(StreamEvent::Done { usage, cost }) => {
                    builder.push_step(
                        StepDetail::LlmCall {
                            model: cost.model.clone(),
                            provider: provider_name.clone(),
                            input_tokens: usage.prompt_tokens,
                            output_tokens: usage.completion_tokens,
                            cost: cost.total_cost,
                        },
                        duration,
                    );
                    let trace = builder.seal(&collected);
                    if let Err(e) = budget.record_spend(&tenant_id, trace.cost, Some(&trace.id)) {
                        error!(error = %e, "spend recording failed");
                    }
                    audit.record_or_log(
                        &NewAuditEntry::new(&tenant_id, AuditEventType::AgentExecutionCompleted)
                            .trace(&trace.id)
                            .payload(json!({"streaming": true})),
                    );
                    counters.record(&trace.usage, trace.cost, false);
                    trace
                }
                Some(StreamEvent::Error { error }) => {
                    let kind = if error == "cancelled" { "cancelled" } else { "upstream" };
                    let trace = builder.seal_with_error(kind, error);
                    audit.record_or_log(
                        &NewAuditEntry::new(&tenant_id, AuditEventType::AgentExecutionFailed)
                            .trace(&trace.id)
                            .payload(json!({"kind": kind, "streaming": true})),
                    );
                    counters.record(&TokenUsage::default(), 0.0, true);
                    trace
                }
                _ => {
                    // Upstream closed without a terminal event.
                    let trace = builder.seal_with_error("upstream", "stream ended unexpectedly");
                    counters.record(&TokenUsage::default(), 0.0, true);
                    trace
                }
            };

            let mut trace = trace;
            redactor.redact_trace(&mut trace);
            match retention.admit(&trace) {
                Ok(true) | Err(_) => {
                    if let Err(e) = traces.save(&trace) {
                        error!(error = %e, trace = %trace.id, "trace save failed");
                    }
                }
                Ok(false) => {}
            }
        });

        Ok((trace_id, client_rx))
    }

    // -----------------------------------------------------------------------
    // Compaction & structured-task endpoints
    // -----------------------------------------------------------------------

    /// `POST /compact`; history compaction, still traced and billed.
    ///
    /// # Errors
    ///
    /// Provider failures map per the wire taxonomy.
    pub async fn compact(
        &self,
        identity: &TenantIdentity,
        request: CompactRequest,
        cancel: CancellationToken,
    ) -> Result<CompactResponse, HelmError> {
        let keep = request.keep_recent.unwrap_or(2);
        let mut builder = TraceBuilder::new(
            &identity.tenant_id,
            &self.workspace_id,
            &identity.agent_role,
            &self.config.model_tiers.cheap,
            &self.config.default_provider,
            "[compaction]",
            request.messages.len(),
        );

        let started = std::time::Instant::now();
        let result = self
            .gateway
            .compact(&request.messages, request.instructions.as_deref(), keep, &cancel)
            .await
            .map_err(map_provider_error)?;

        if result.usage.total_tokens > 0 {
            let cost = cost_for(&self.config.model_tiers.cheap, &result.usage);
            builder.push_step(
                StepDetail::LlmCall {
                    model: self.config.model_tiers.cheap.clone(),
                    provider: self.config.default_provider.clone(),
                    input_tokens: result.usage.prompt_tokens,
                    output_tokens: result.usage.completion_tokens,
                    cost: cost.total_cost,
                },
                started.elapsed().as_millis() as u64,
            );
        }
        let trace = builder.seal(format!(
            "compacted {} → {} turns",
            result.original_count, result.compacted_count
        ));
        self.persist_trace(&trace);
        if trace.cost > 0.0
            && let Err(e) = self.budget.record_spend(&identity.tenant_id, trace.cost, Some(&trace.id))
        {
            error!(error = %e, "spend recording failed");
        }

        Ok(CompactResponse {
            status: "ok".to_string(),
            compacted_messages: result.messages,
            usage: result.usage,
            original_count: result.original_count,
            compacted_count: result.compacted_count,
        })
    }

    /// `POST /llm-task`; structured output, still traced and billed.
    ///
    /// # Errors
    ///
    /// Provider failures map per the wire taxonomy.
    pub async fn run_task(
        &self,
        identity: &TenantIdentity,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> Result<TaskResponse, HelmError> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.model_tiers.cheap.clone());
        let mut builder = TraceBuilder::new(
            &identity.tenant_id,
            &self.workspace_id,
            &identity.agent_role,
            &model,
            helm_provider::ModelRef::parse(&model, &self.config.default_provider).provider,
            &request.prompt,
            0,
        );

        let started = std::time::Instant::now();
        let result = self
            .gateway
            .task(
                &request.prompt,
                request.input.as_ref(),
                request.schema.as_ref(),
                Some(&model),
                request.temperature,
                request.max_tokens,
                &cancel,
            )
            .await
            .map_err(map_provider_error)?;

        builder.push_step(
            StepDetail::LlmCall {
                model: model.clone(),
                provider: helm_provider::ModelRef::parse(&model, &self.config.default_provider)
                    .provider,
                input_tokens: result.usage.prompt_tokens,
                output_tokens: result.usage.completion_tokens,
                cost: result.cost.total_cost,
            },
            started.elapsed().as_millis() as u64,
        );
        let trace = builder.seal(result.output.to_string());
        self.persist_trace(&trace);
        if let Err(e) = self.budget.record_spend(&identity.tenant_id, trace.cost, Some(&trace.id)) {
            error!(error = %e, "spend recording failed");
        }

        Ok(TaskResponse {
            status: "ok".to_string(),
            output: result.output,
            usage: result.usage,
            cost: result.cost,
            validated: result.validated,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn mint_token(&self, identity: &TenantIdentity, session: &SessionKey) -> Option<String> {
        let service = self.tokens.as_ref()?;
        service
            .mint(
                &identity.tenant_id,
                &identity.agent_role,
                Some(&session.user_id),
            )
            .map_err(|e| warn!(error = %e, "agent token minting failed"))
            .ok()
    }

    /// Task resolution priority: explicit id > explicit title
    /// (find-or-create) > configured default title.
    async fn resolve_task(
        &self,
        request: &SendRequest,
        agent_token: Option<&str>,
    ) -> Option<String> {
        if let Some(id) = &request.task_id {
            return Some(id.clone());
        }
        let token = agent_token?;
        let title = request
            .task_title
            .clone()
            .unwrap_or_else(|| self.config.default_task_title.clone());
        match self
            .control
            .find_or_create_task(
                token,
                &title,
                request.task_description.as_deref(),
                request.task_metadata.as_ref(),
            )
            .await
        {
            Ok(task) => Some(task.id),
            Err(e) => {
                warn!(error = %e, "task resolution failed; response degrades without a task");
                None
            }
        }
    }

    /// Persist a sealed trace subject to retention admission; failures
    /// degrade the response, never fail it.
    fn persist_trace(&self, trace: &helm_core::Trace) {
        match self.retention.admit(trace) {
            Ok(false) => {}
            Ok(true) | Err(_) => {
                if let Err(e) = self.traces.save(trace) {
                    error!(trace = %trace.id, error = %e, "trace save failed");
                }
            }
        }
    }

    /// Terminal error path: seal with the error, redact, persist, audit,
    /// fire the error webhook, and return the wire error with the trace id.
    fn fail(
        &self,
        builder: TraceBuilder,
        identity: &TenantIdentity,
        request: &SendRequest,
        err: HelmError,
    ) -> HelmError {
        let mut trace = builder.seal_with_error(err.kind.as_str(), err.message.clone());
        self.redactor.redact_trace(&mut trace);
        self.persist_trace(&trace);
        self.counters.record(&trace.usage, trace.cost, true);
        self.audit.record_or_log(
            &NewAuditEntry::new(&identity.tenant_id, AuditEventType::AgentExecutionFailed)
                .trace(&trace.id)
                .payload(json!({"kind": err.kind.as_str(), "message": err.message})),
        );
        if let Some(webhook) = request.webhook.clone() {
            let payload = build_payload(
                WebhookEvent::Error,
                request.task_id.as_deref(),
                Some(&request.user_id),
                Some(&identity.agent_role),
                None,
                Some(&err.message),
                None,
                None,
                None,
            );
            fire_and_forget(webhook, payload);
        }
        err.with_trace_id(trace.id)
    }
}

/// Map provider failures onto the wire taxonomy.
fn map_provider_error(err: ProviderError) -> HelmError {
    match &err {
        ProviderError::MissingKey(_) | ProviderError::UnknownProvider(_) => {
            HelmError::new(ErrorKind::ConfigError, err.to_string())
        }
        ProviderError::Timeout { .. } => HelmError::new(ErrorKind::Timeout, err.to_string()),
        ProviderError::Cancelled => {
            HelmError::new(ErrorKind::Internal, "cancelled").with_detail("kind", "cancelled")
        }
        ProviderError::Upstream { .. } | ProviderError::BadResponse { .. } => {
            HelmError::new(ErrorKind::UpstreamUnavailable, err.to_string())
        }
    }
}
