// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! HTTP daemon for the agent-helm runtime.
//!
//! Routes (stable surface):
//!
//! - agent endpoints: `/api/agents/send`, `/api/agents/stream`, `/compact`,
//!   `/llm-task`;
//! - observability: `/traces*`;
//! - skill registry: `/skills/*`;
//! - governance: `/audit`, `/budget*`, `/cost/forecast`, `/risk/score`;
//! - retention: `/retention/*`;
//! - workspace: `/workspace/*`;
//! - ops read API: `/ops/api/*` (OIDC bearer, RBAC-projected);
//! - health: `/health`, `/context`, `/api/version`, `/api/compatibility`.

mod agent;
mod govern;
pub mod middleware;
mod observe;
mod ops;

pub use agent::GatewayTaskRunner;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use helm_config::HelmConfig;
use helm_control::ControlPlaneClient;
use helm_error::HelmError;
use helm_runtime::Orchestrator;
use helm_tenancy::OpsVerifier;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Shared daemon state.
pub struct AppState {
    /// The orchestrator and its governance handles.
    pub orchestrator: Arc<Orchestrator>,
    /// Control-plane client for version probes.
    pub control: Arc<ControlPlaneClient>,
    /// Ops token verifier, when ops auth is configured.
    pub ops_verifier: Option<OpsVerifier>,
    /// Process start, for uptime.
    pub started: Instant,
}

impl AppState {
    /// Shortcut to the runtime config.
    #[must_use]
    pub fn config(&self) -> &HelmConfig {
        self.orchestrator.config()
    }
}

/// HTTP-facing error wrapper: maps [`HelmError`] onto its status and JSON
/// wire body.
#[derive(Debug)]
pub struct ApiError(pub HelmError);

impl From<HelmError> for ApiError {
    fn from(err: HelmError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self.0.to_wire())).into_response();
        if let Some(trace_id) = &self.0.trace_id
            && let Ok(value) = axum::http::HeaderValue::from_str(trace_id)
        {
            response.headers_mut().insert("x-trace-id", value);
        }
        response
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Build the Axum router with the full route surface.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        // Agent endpoints
        .route("/api/agents/send", post(agent::cmd_send))
        .route("/api/agents/stream", post(agent::cmd_stream))
        .route("/compact", post(agent::cmd_compact))
        .route("/llm-task", post(agent::cmd_llm_task))
        // Observability
        .route("/traces", get(observe::cmd_list_traces))
        .route("/traces/diff", post(observe::cmd_diff_traces))
        .route("/traces/by-label", get(observe::cmd_traces_by_label))
        .route("/traces/by-entity", get(observe::cmd_traces_by_entity))
        .route("/traces/{id}", get(observe::cmd_get_trace))
        .route("/traces/{id}/replay", get(observe::cmd_replay_trace))
        .route("/traces/{id}/label", post(observe::cmd_label_trace))
        .route("/traces/{id}/annotate", post(observe::cmd_annotate_trace))
        // Skills
        .route("/skills/publish", post(govern::cmd_publish_skill))
        .route("/skills/by-state", get(govern::cmd_skills_by_state))
        .route("/skills/registry/{name}", get(govern::cmd_get_skill))
        .route("/skills/registry/{name}/test", post(govern::cmd_test_skill))
        .route(
            "/skills/registry/{name}/{version}",
            get(govern::cmd_get_skill_version),
        )
        .route(
            "/skills/registry/{name}/{version}/state",
            post(govern::cmd_set_skill_state),
        )
        // Governance
        .route("/audit", get(govern::cmd_query_audit))
        .route("/budget", get(govern::cmd_get_budget).post(govern::cmd_set_budget))
        .route("/budget/check", post(govern::cmd_check_budget))
        .route("/cost/forecast", post(govern::cmd_forecast))
        .route("/risk/score", post(govern::cmd_risk_score))
        // Retention
        .route(
            "/retention/policy",
            get(govern::cmd_get_retention).post(govern::cmd_set_retention),
        )
        .route("/retention/enforce", post(govern::cmd_enforce_retention))
        .route("/retention/stats", get(govern::cmd_retention_stats))
        // Workspace
        .route("/workspace/pin", get(govern::cmd_get_pin).post(govern::cmd_set_pin))
        .route("/workspace/{id}/pins", get(govern::cmd_list_pins))
        .route("/workspace/envs", post(govern::cmd_upsert_env).get(govern::cmd_list_envs))
        .route("/workspace/envs/init", post(govern::cmd_init_envs))
        .route("/workspace/envs/promote", post(govern::cmd_promote_env))
        .route("/workspace/snapshot", post(govern::cmd_snapshot))
        .route("/workspace/impact", post(govern::cmd_impact))
        // Ops read API
        .route("/ops/api/me", get(ops::cmd_me))
        .route("/ops/api/traces/{id}", get(ops::cmd_ops_trace))
        .route("/ops/api/dashboard", get(ops::cmd_dashboard))
        .route("/ops/api/override", post(ops::cmd_override))
        // Health & probes
        .route("/health", get(cmd_health))
        .route("/context", get(agent::cmd_context))
        .route("/api/version", get(cmd_version))
        .route("/api/compatibility", get(cmd_compatibility))
        .layer(from_fn({
            let limiter = middleware::RateLimiter::new(600, std::time::Duration::from_secs(60));
            move |req, next| middleware::RateLimiter::middleware(limiter.clone(), req, next)
        }))
        .layer(from_fn(middleware::request_logger))
        .layer(from_fn(middleware::request_id_middleware))
        .layer(
            // The ops console is a browser client on another origin.
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}

async fn cmd_health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    axum::extract::Query(params): axum::extract::Query<
        std::collections::HashMap<String, String>,
    >,
) -> impl IntoResponse {
    let mut body = json!({
        "status": "ok",
        "uptime_seconds": state.started.elapsed().as_secs(),
        "time": chrono::Utc::now().to_rfc3339(),
    });
    if params.contains_key("deep") {
        let control = match state.control.version().await {
            Ok(version) => json!({"status": "ok", "version": version}),
            Err(e) => json!({"status": "unreachable", "error": e.to_string()}),
        };
        let store = match state.orchestrator.traces().list(&helm_trace::TraceFilter {
            limit: Some(1),
            ..helm_trace::TraceFilter::default()
        }) {
            Ok(_) => json!({"status": "ok"}),
            Err(e) => json!({"status": "error", "error": e.to_string()}),
        };
        body["components"] = json!({
            "control_plane": control,
            "store": store,
            "providers": state.orchestrator.gateway().provider_names(),
        });
    }
    Json(body)
}

async fn cmd_version(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .control
        .version()
        .await
        .map(Json)
        .map_err(|e| ApiError(HelmError::upstream(e.to_string())))
}

async fn cmd_compatibility(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .control
        .compatibility()
        .await
        .map(Json)
        .map_err(|e| ApiError(HelmError::upstream(e.to_string())))
}
