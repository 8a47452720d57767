// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operations Console read API: OIDC bearer auth, RBAC projection, and
//! break-glass overrides.
//!
//! Non-admin callers never receive raw prompt or tool-call payloads -
//! fields are boundary-sampled (first N characters + length) or replaced
//! with a `[redacted-for-role]` token.

use crate::{ApiError, ApiResult, AppState};
use axum::{
    Json,
    extract::{Path as AxPath, Query, State},
    http::HeaderMap,
};
use chrono::Utc;
use helm_audit::NewAuditEntry;
use helm_core::{AuditEventType, StepDetail, Trace};
use helm_error::HelmError;
use helm_tenancy::{OpsIdentity, OpsRole, Permission};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Sample length for boundary-projected text fields.
const SAMPLE_CHARS: usize = 200;
/// Replacement token for payloads hidden from non-admin roles.
const REDACTED: &str = "[redacted-for-role]";

/// Authenticate an ops-console bearer token.
pub fn authenticate_ops(state: &AppState, headers: &HeaderMap) -> Result<OpsIdentity, ApiError> {
    let Some(verifier) = &state.ops_verifier else {
        return Err(ApiError(HelmError::config(
            "ops auth is not configured on this deployment",
        )));
    };
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError(HelmError::auth_missing("missing bearer token")))?;
    verifier.verify(token).map_err(|e| {
        ApiError(match &e {
            helm_tenancy::TenancyError::MissingClaim(_) => HelmError::auth_invalid(e.to_string()),
            _ => HelmError::auth_invalid(e.to_string()),
        })
    })
}

fn require(identity: &OpsIdentity, permission: Permission) -> Result<(), ApiError> {
    if identity.can(permission) {
        Ok(())
    } else {
        Err(ApiError(HelmError::permission_denied(format!(
            "role '{}' lacks {}",
            identity.role.as_str(),
            permission.as_str()
        ))))
    }
}

/// `GET /ops/api/me`; the caller's identity, permissions, and scope.
pub async fn cmd_me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let identity = authenticate_ops(&state, &headers)?;
    let permissions: Vec<&str> = identity.permissions().iter().map(|p| p.as_str()).collect();
    Ok(Json(json!({
        "user": identity.subject,
        "role": identity.role.as_str(),
        "permissions": permissions,
        "scope": {
            "tenant_id": identity.tenant_id,
            "workspace_id": identity.workspace_id,
            "allowed_tenants": identity.allowed_tenants,
        },
    })))
}

/// `GET /ops/api/traces/:id`; a trace projected for the caller's role.
pub async fn cmd_ops_trace(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let identity = authenticate_ops(&state, &headers)?;
    require(&identity, Permission::TraceView)?;

    let tenant = params
        .get("tenant_id")
        .cloned()
        .unwrap_or_else(|| identity.tenant_id.clone());
    if !identity.can_read_tenant(&tenant) {
        return Err(ApiError(HelmError::permission_denied(
            "cross-tenant read is not permitted for this caller",
        )));
    }

    let trace = state
        .orchestrator
        .traces()
        .load(&tenant, &id)
        .map_err(|e| ApiError(HelmError::not_found(e.to_string())))?;
    Ok(Json(project_trace(&trace, identity.role)))
}

/// `GET /ops/api/dashboard`; runtime posture with retention coverage so
/// operators can tell what share of traces is actually captured.
pub async fn cmd_dashboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let identity = authenticate_ops(&state, &headers)?;
    require(&identity, Permission::DashboardView)?;

    let usage = state.orchestrator.counters().snapshot();
    let retention = state
        .orchestrator
        .retention()
        .stats()
        .map_err(|e| ApiError(HelmError::internal(e.to_string())))?;
    Ok(Json(json!({
        "usage": usage,
        "retention": retention,
        "providers": state.orchestrator.gateway().provider_names(),
    })))
}

// ---------------------------------------------------------------------------
// Break-glass overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    /// Override action (`unlock_environment` or `enforce_retention`).
    pub action: String,
    /// Target (environment name, tenant id, …).
    #[serde(default)]
    pub target_id: Option<String>,
    /// Workspace scope for workspace actions.
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Mandatory machine-readable reason code.
    pub reason_code: String,
    /// Mandatory human justification.
    pub justification: String,
}

/// `POST /ops/api/override`; apply a break-glass action. Requires
/// `override:use`; always audited with actor, role, action, target, code,
/// justification, and a UTC timestamp.
pub async fn cmd_override(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<Json<Value>> {
    let identity = authenticate_ops(&state, &headers)?;
    require(&identity, Permission::OverrideUse)?;
    if request.reason_code.trim().is_empty() || request.justification.trim().is_empty() {
        return Err(ApiError(HelmError::validation(
            "reason_code and justification are both required",
        )));
    }

    let applied: Value = match request.action.as_str() {
        "unlock_environment" => {
            let workspace = request
                .workspace_id
                .as_deref()
                .ok_or_else(|| ApiError(HelmError::validation("workspace_id is required")))?;
            let environment = request
                .target_id
                .as_deref()
                .ok_or_else(|| ApiError(HelmError::validation("target_id is required")))?;
            let env = state
                .orchestrator
                .envs()
                .upsert_environment(workspace, environment, "", None, false, false)
                .map_err(|e| ApiError(HelmError::internal(e.to_string())))?;
            json!({"environment": env})
        }
        "enforce_retention" => {
            let removed = state
                .orchestrator
                .retention()
                .enforce()
                .map_err(|e| ApiError(HelmError::internal(e.to_string())))?;
            json!({"removed": removed.len()})
        }
        other => {
            return Err(ApiError(HelmError::validation(format!(
                "unknown override action '{other}'"
            ))));
        }
    };

    state.orchestrator.audit().record_or_log(
        &NewAuditEntry::new(&identity.tenant_id, AuditEventType::OverrideUsed)
            .user(&identity.subject)
            .payload(json!({
                "actor": identity.subject,
                "role": identity.role.as_str(),
                "action": request.action,
                "target_id": request.target_id,
                "reason_code": request.reason_code,
                "justification": request.justification,
                "at": Utc::now().to_rfc3339(),
            })),
    );
    info!(actor = %identity.subject, action = %request.action, "break-glass override applied");

    Ok(Json(json!({"status": "ok", "applied": applied})))
}

// ---------------------------------------------------------------------------
// Role projection
// ---------------------------------------------------------------------------

/// Boundary sample: first [`SAMPLE_CHARS`] characters plus the length.
fn sample(text: &str) -> Value {
    let total = text.chars().count();
    let head: String = text.chars().take(SAMPLE_CHARS).collect();
    json!({"sample": head, "length": total})
}

/// Project a trace for a console role. Admins see everything; everyone else
/// gets sampled messages and fully hidden tool payloads.
#[must_use]
pub fn project_trace(trace: &Trace, role: OpsRole) -> Value {
    if role == OpsRole::Admin {
        return serde_json::to_value(trace).unwrap_or(Value::Null);
    }

    let steps: Vec<Value> = trace
        .steps
        .iter()
        .map(|step| match &step.detail {
            StepDetail::LlmCall {
                model,
                provider,
                input_tokens,
                output_tokens,
                cost,
            } => json!({
                "type": "llm_call",
                "at": step.at,
                "model": model,
                "provider": provider,
                "input_tokens": input_tokens,
                "output_tokens": output_tokens,
                "cost": cost,
            }),
            StepDetail::ToolCall { id, name, permitted, .. } => json!({
                "type": "tool_call",
                "at": step.at,
                "id": id,
                "name": name,
                "permitted": permitted,
                "arguments": REDACTED,
            }),
            StepDetail::ToolResult { id, success, .. } => json!({
                "type": "tool_result",
                "at": step.at,
                "id": id,
                "success": success,
                "result": REDACTED,
            }),
            StepDetail::Error { kind, message } => json!({
                "type": "error",
                "at": step.at,
                "kind": kind,
                "message": message,
            }),
        })
        .collect();

    json!({
        "id": trace.id,
        "tenant_id": trace.tenant_id,
        "workspace_id": trace.workspace_id,
        "agent_role": trace.agent_role,
        "started_at": trace.started_at,
        "completed_at": trace.completed_at,
        "duration_ms": trace.duration_ms,
        "workspace_hash": trace.workspace_hash,
        "skill_versions": trace.skill_versions,
        "model": trace.model,
        "provider": trace.provider,
        "input_message": sample(&trace.input_message),
        "output_message": trace.output.as_ref().map(|o| sample(&o.message)),
        "redacted_prompt": REDACTED,
        "steps": steps,
        "usage": trace.usage,
        "cost": trace.cost,
        "error": trace.error,
        "labels": trace.labels,
        "entities": trace.entities,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_trace::TraceBuilder;
    use std::collections::BTreeMap;

    fn trace_with_payloads() -> Trace {
        let mut builder = TraceBuilder::new(
            "t1",
            "w1",
            "assistant",
            "gpt-4o-mini",
            "openai",
            "a".repeat(500),
            0,
        );
        builder.set_redacted_prompt("system secret sauce");
        builder.push_step(
            StepDetail::ToolCall {
                id: "c1".into(),
                name: "search".into(),
                arguments: BTreeMap::from([("q".to_string(), json!("private query"))]),
                permitted: true,
            },
            0,
        );
        builder.push_step(
            StepDetail::ToolResult {
                id: "c1".into(),
                success: true,
                result: Some(json!({"rows": ["private data"]})),
                error: None,
            },
            4,
        );
        builder.seal("the answer")
    }

    #[test]
    fn admin_sees_everything() {
        let trace = trace_with_payloads();
        let projected = project_trace(&trace, OpsRole::Admin);
        assert!(projected.to_string().contains("private query"));
    }

    #[test]
    fn viewer_gets_sampled_messages_and_hidden_payloads() {
        let trace = trace_with_payloads();
        let projected = project_trace(&trace, OpsRole::Viewer);
        let text = projected.to_string();

        assert!(!text.contains("private query"));
        assert!(!text.contains("private data"));
        assert!(text.contains(REDACTED));

        assert_eq!(projected["input_message"]["length"], 500);
        assert_eq!(
            projected["input_message"]["sample"].as_str().unwrap().len(),
            SAMPLE_CHARS
        );
        // Metadata survives projection.
        assert_eq!(projected["model"], "gpt-4o-mini");
        assert_eq!(projected["steps"][0]["name"], "search");
    }

    #[test]
    fn operator_is_projected_like_viewer() {
        let trace = trace_with_payloads();
        let projected = project_trace(&trace, OpsRole::Operator);
        assert_eq!(projected["redacted_prompt"], REDACTED);
    }
}
