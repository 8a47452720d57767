// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent endpoints: send, stream, compact, llm-task, context stats.

use crate::{ApiError, ApiResult, AppState};
use async_trait::async_trait;
use axum::{
    Json,
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use helm_core::{SessionKey, TenantIdentity, TokenUsage};
use helm_error::HelmError;
use helm_provider::{CancellationToken, ModelGateway, StreamEvent};
use helm_runtime::{CompactRequest, SendRequest, TaskRequest};
use helm_skills::TaskRunner;
use helm_tenancy::{AgentClaims, AgentTokenService, verify_daemon_key};
use helm_workspace::WorkspaceLoader;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Header carrying the shared daemon key.
const DAEMON_KEY_HEADER: &str = "x-agent-daemon-key";
/// Header carrying an agent identity token.
const AGENT_TOKEN_HEADER: &str = "x-agent-token";
/// Tenant assumed when requests arrive without an agent token (single-tenant
/// deployments behind the daemon key).
const DEFAULT_TENANT: &str = "default";

/// Authenticated request context: tenant identity plus the validated agent
/// claims when a token was presented.
pub struct AgentAuth {
    pub identity: TenantIdentity,
    pub claims: Option<AgentClaims>,
}

/// Authenticate an agent-endpoint request: daemon key first, then the
/// optional agent identity token.
pub fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    session_key: &str,
    user_id: &str,
) -> Result<AgentAuth, ApiError> {
    let presented = headers
        .get(DAEMON_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    verify_daemon_key(state.config().daemon_key.as_deref(), presented).map_err(|e| {
        ApiError(match e {
            helm_tenancy::TenancyError::MissingToken(m) => HelmError::auth_missing(m),
            other => HelmError::auth_invalid(other.to_string()),
        })
    })?;

    let token = headers.get(AGENT_TOKEN_HEADER).and_then(|v| v.to_str().ok());
    let claims = match (token, state.config().jwt_secret.as_deref()) {
        (Some(token), Some(secret)) => {
            let service = AgentTokenService::new(Some(secret))
                .map_err(|e| ApiError(HelmError::config(e.to_string())))?;
            Some(
                service
                    .validate(token)
                    .map_err(|e| ApiError(HelmError::auth_invalid(e.to_string())))?,
            )
        }
        (Some(_), None) => {
            return Err(ApiError(HelmError::config(
                "agent token presented but no JWT secret is configured",
            )));
        }
        (None, _) => None,
    };

    let role = SessionKey::parse(session_key)
        .map(|s| s.agent_role)
        .unwrap_or_else(|_| "assistant".to_string());
    let identity = match &claims {
        Some(claims) => TenantIdentity {
            tenant_id: claims.tenant_id.clone(),
            user_id: claims.user_id.clone().unwrap_or_else(|| user_id.to_string()),
            agent_role: claims.role.clone(),
            capabilities: helm_core::Capabilities::default(),
        },
        None => TenantIdentity {
            tenant_id: DEFAULT_TENANT.to_string(),
            user_id: user_id.to_string(),
            agent_role: role,
            capabilities: helm_core::Capabilities::default(),
        },
    };

    Ok(AgentAuth { identity, claims })
}

pub async fn cmd_send(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Result<Response, ApiError> {
    let auth = authenticate(&state, &headers, &request.session_key, &request.user_id)?;
    let cancel = CancellationToken::new();
    let response = state
        .orchestrator
        .send(&auth.identity, auth.claims.as_ref(), request, cancel)
        .await
        .map_err(ApiError)?;

    let trace_id = response.trace_id.clone();
    let mut http = Json(response).into_response();
    if let Ok(value) = axum::http::HeaderValue::from_str(&trace_id) {
        http.headers_mut().insert("x-trace-id", value);
    }
    Ok(http)
}

pub async fn cmd_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Result<Response, ApiError> {
    let auth = authenticate(&state, &headers, &request.session_key, &request.user_id)?;
    let (trace_id, events) = state
        .orchestrator
        .stream(&auth.identity, auth.claims.as_ref(), request)
        .await
        .map_err(ApiError)?;

    let stream = ReceiverStream::new(events).map(|event| {
        let sse = match &event {
            StreamEvent::Start => SseEvent::default().event("start").data("{}"),
            StreamEvent::Chunk { data } => SseEvent::default()
                .event("chunk")
                .data(json!({"data": data}).to_string()),
            StreamEvent::Done { usage, cost } => SseEvent::default()
                .event("done")
                .data(json!({"usage": usage, "cost": cost}).to_string()),
            StreamEvent::Error { error } => SseEvent::default()
                .event("error")
                .data(json!({"error": error}).to_string()),
        };
        Ok::<SseEvent, Infallible>(sse)
    });

    let mut response = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    if let Ok(value) = axum::http::HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert("x-trace-id", value);
    }
    Ok(response)
}

use tokio_stream::StreamExt as _;

pub async fn cmd_compact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CompactRequest>,
) -> ApiResult<Json<helm_runtime::CompactResponse>> {
    let auth = authenticate(&state, &headers, "user:internal:assistant", "internal")?;
    let response = state
        .orchestrator
        .compact(&auth.identity, request, CancellationToken::new())
        .await
        .map_err(ApiError)?;
    Ok(Json(response))
}

pub async fn cmd_llm_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<TaskRequest>,
) -> ApiResult<Json<helm_runtime::TaskResponse>> {
    let auth = authenticate(&state, &headers, "user:internal:assistant", "internal")?;
    let response = state
        .orchestrator
        .run_task(&auth.identity, request, CancellationToken::new())
        .await
        .map_err(ApiError)?;
    Ok(Json(response))
}

/// `GET /context?role`; prompt-size stats per bootstrap file.
pub async fn cmd_context(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let role = params.get("role").map_or("assistant", String::as_str);
    let loader = WorkspaceLoader::new(
        &state.config().workspace_path,
        state.config().workspace_file_char_limit,
    );
    let stats = loader.bootstrap_stats(role);
    let total_tokens: u64 = stats.iter().map(|s| s.estimated_tokens).sum();
    debug!(role, total_tokens, "context stats computed");
    Json(json!({
        "role": role,
        "files": stats,
        "estimated_total_tokens": total_tokens,
        "boot_complete": loader.boot_complete(),
        "char_limit": state.config().workspace_file_char_limit,
    }))
}

// ---------------------------------------------------------------------------
// Gateway-backed skill test runner
// ---------------------------------------------------------------------------

/// Adapts the model gateway to the skill test runner's seam, pinned to the
/// cheap tier.
pub struct GatewayTaskRunner {
    gateway: Arc<ModelGateway>,
}

impl GatewayTaskRunner {
    /// Wrap the gateway.
    #[must_use]
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl TaskRunner for GatewayTaskRunner {
    async fn run_task(
        &self,
        prompt: &str,
        input: &Value,
        schema: &Value,
    ) -> Result<(Value, TokenUsage), String> {
        let result = self
            .gateway
            .task(
                prompt,
                Some(input),
                Some(schema),
                None,
                Some(0.0),
                None,
                &CancellationToken::new(),
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok((result.output, result.usage))
    }
}
