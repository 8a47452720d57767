// SPDX-License-Identifier: MIT OR Apache-2.0
//! Governance routes: skills, audit, budget, retention, workspace
//! environments/pins, cost forecasting, and impact/risk scoring.

use crate::agent::GatewayTaskRunner;
use crate::{ApiError, ApiResult, AppState};
use axum::{
    Json,
    extract::{Path as AxPath, Query, State},
};
use chrono::{DateTime, Utc};
use helm_core::AuditEventType;
use helm_error::HelmError;
use helm_skills::{SkillState, parse_manifest, run_tests};
use helm_trace::SamplingStrategy;
use helm_workspace::{ImpactInput, SkillRef, VersionManager, analyze_impact};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

fn internal(err: impl std::fmt::Display) -> ApiError {
    ApiError(HelmError::internal(err.to_string()))
}

// ---------------------------------------------------------------------------
// Skills
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// The raw SKILL.md content (frontmatter + body).
    pub content: String,
}

pub async fn cmd_publish_skill(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<Json<Value>> {
    let (manifest, body) = parse_manifest(&request.content)
        .map_err(|e| ApiError(HelmError::validation(e.to_string())))?;
    let record = state
        .orchestrator
        .registry()
        .publish(&manifest, &body)
        .map_err(|e| match e {
            helm_skills::RegistryError::AlreadyPublished { .. } => {
                ApiError(HelmError::new(helm_error::ErrorKind::IdempotencyConflict, e.to_string()))
            }
            other => internal(other),
        })?;
    Ok(Json(json!({"status": "ok", "skill": record})))
}

pub async fn cmd_get_skill(
    State(state): State<Arc<AppState>>,
    AxPath(name): AxPath<String>,
) -> ApiResult<Json<Value>> {
    let record = state
        .orchestrator
        .registry()
        .get(&name)
        .map_err(|e| ApiError(HelmError::not_found(e.to_string())))?;
    Ok(Json(json!({"skill": record})))
}

pub async fn cmd_get_skill_version(
    State(state): State<Arc<AppState>>,
    AxPath((name, version)): AxPath<(String, String)>,
) -> ApiResult<Json<Value>> {
    let record = state
        .orchestrator
        .registry()
        .get_exact(&name, &version)
        .map_err(|e| ApiError(HelmError::not_found(e.to_string())))?;
    Ok(Json(json!({"skill": record})))
}

#[derive(Debug, Deserialize)]
pub struct SetStateRequest {
    pub state: String,
    #[serde(default)]
    pub actor: Option<String>,
}

pub async fn cmd_set_skill_state(
    State(state): State<Arc<AppState>>,
    AxPath((name, version)): AxPath<(String, String)>,
    Json(request): Json<SetStateRequest>,
) -> ApiResult<Json<Value>> {
    let next = SkillState::parse(&request.state)
        .ok_or_else(|| ApiError(HelmError::validation(format!("unknown state '{}'", request.state))))?;
    let record = state
        .orchestrator
        .registry()
        .set_state(
            &name,
            &version,
            next,
            request.actor.as_deref().unwrap_or("api"),
        )
        .map_err(|e| match e {
            helm_skills::RegistryError::NotFound(_) => ApiError(HelmError::not_found(e.to_string())),
            helm_skills::RegistryError::IllegalTransition { .. } => {
                ApiError(HelmError::validation(e.to_string()))
            }
            other => internal(other),
        })?;
    Ok(Json(json!({"status": "ok", "skill": record})))
}

#[derive(Debug, Deserialize)]
pub struct TestSkillRequest {
    #[serde(default)]
    pub version: Option<String>,
}

pub async fn cmd_test_skill(
    State(state): State<Arc<AppState>>,
    AxPath(name): AxPath<String>,
    Json(request): Json<TestSkillRequest>,
) -> ApiResult<Json<Value>> {
    let registry = state.orchestrator.registry();
    let record = match &request.version {
        Some(version) => registry.get_exact(&name, version),
        None => registry.get_any_state(&name),
    }
    .map_err(|e| ApiError(HelmError::not_found(e.to_string())))?;

    let runner = GatewayTaskRunner::new(Arc::clone(state.orchestrator.gateway()));
    let report = run_tests(&record.manifest, &record.body, &runner).await;
    registry
        .record_eval(
            &record.manifest.name,
            &record.manifest.version,
            report.passed,
            report.total,
            &report.results_json(),
        )
        .map_err(internal)?;
    Ok(Json(json!({"status": "ok", "report": report})))
}

pub async fn cmd_skills_by_state(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let filter = params
        .get("state")
        .and_then(|s| SkillState::parse(s))
        .ok_or_else(|| ApiError(HelmError::validation("state query parameter is required")))?;
    let records = state
        .orchestrator
        .registry()
        .list_by_state(filter)
        .map_err(internal)?;
    Ok(Json(json!({"skills": records})))
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub tenant_id: Option<String>,
    pub workspace_id: Option<String>,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn cmd_query_audit(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditQueryParams>,
) -> ApiResult<Json<Value>> {
    let event_types = params
        .event_type
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .filter_map(AuditEventType::parse)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let page = state
        .orchestrator
        .audit()
        .query(&helm_audit::AuditQuery {
            tenant_id: params.tenant_id,
            workspace_id: params.workspace_id,
            trace_id: params.trace_id,
            user_id: params.user_id,
            event_types,
            from: params.from,
            to: params.to,
            limit: params.limit,
            offset: params.offset,
        })
        .map_err(internal)?;
    Ok(Json(json!({"entries": page.entries, "total": page.total})))
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

pub async fn cmd_get_budget(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let tenant = params
        .get("tenant_id")
        .ok_or_else(|| ApiError(HelmError::validation("tenant_id is required")))?;
    let budget = state.orchestrator.budget().get(tenant).map_err(internal)?;
    Ok(Json(json!({"budget": budget})))
}

#[derive(Debug, Deserialize)]
pub struct SetBudgetRequest {
    pub tenant_id: String,
    pub limit_usd: f64,
    #[serde(default)]
    pub hard_limit: bool,
    #[serde(default)]
    pub alert_threshold: Option<f64>,
    #[serde(default)]
    pub soft_limit_usd: Option<f64>,
}

pub async fn cmd_set_budget(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetBudgetRequest>,
) -> ApiResult<Json<Value>> {
    let budget = state
        .orchestrator
        .budget()
        .set_budget(
            &request.tenant_id,
            request.limit_usd,
            request.hard_limit,
            request.alert_threshold,
            request.soft_limit_usd,
            None,
        )
        .map_err(internal)?;
    state.orchestrator.audit().record_or_log(
        &helm_audit::NewAuditEntry::new(&request.tenant_id, AuditEventType::ConfigChange)
            .payload(json!({"what": "budget", "limit": request.limit_usd})),
    );
    Ok(Json(json!({"status": "ok", "budget": budget})))
}

#[derive(Debug, Deserialize)]
pub struct CheckBudgetRequest {
    pub tenant_id: String,
}

pub async fn cmd_check_budget(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CheckBudgetRequest>,
) -> ApiResult<Json<Value>> {
    let check = state
        .orchestrator
        .budget()
        .check_budget(&request.tenant_id)
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(check).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct ForecastRequest {
    pub tenant_id: String,
    pub prompt_tokens: u64,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
}

pub async fn cmd_forecast(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForecastRequest>,
) -> ApiResult<Json<Value>> {
    let model = request
        .model
        .unwrap_or_else(|| state.config().model_tiers.default.clone());
    let forecast = state
        .orchestrator
        .budget()
        .forecast(
            &request.tenant_id,
            request.prompt_tokens,
            request.max_output_tokens.unwrap_or(1024),
            &model,
        )
        .map_err(internal)?;
    Ok(Json(serde_json::to_value(forecast).unwrap_or(Value::Null)))
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

pub async fn cmd_get_retention(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let tenant = params
        .get("tenant_id")
        .ok_or_else(|| ApiError(HelmError::validation("tenant_id is required")))?;
    let policy = state
        .orchestrator
        .retention()
        .get_policy(tenant)
        .map_err(internal)?;
    Ok(Json(json!({"policy": policy})))
}

#[derive(Debug, Deserialize)]
pub struct SetRetentionRequest {
    pub tenant_id: String,
    pub retention_days: u32,
    #[serde(default)]
    pub sampling: Option<SamplingStrategy>,
    #[serde(default)]
    pub storage_mode: Option<String>,
}

pub async fn cmd_set_retention(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetRetentionRequest>,
) -> ApiResult<Json<Value>> {
    let policy = state
        .orchestrator
        .retention()
        .set_policy(
            &request.tenant_id,
            request.retention_days,
            request.sampling.unwrap_or(SamplingStrategy::Full),
            request.storage_mode.as_deref().unwrap_or("standard"),
        )
        .map_err(internal)?;
    Ok(Json(json!({"status": "ok", "policy": policy})))
}

pub async fn cmd_enforce_retention(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Value>> {
    let removed = state.orchestrator.retention().enforce().map_err(internal)?;
    Ok(Json(json!({
        "status": "ok",
        "removed": removed
            .into_iter()
            .map(|(tenant, count)| json!({"tenant_id": tenant, "deleted": count}))
            .collect::<Vec<_>>(),
    })))
}

pub async fn cmd_retention_stats(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Value>> {
    let stats = state.orchestrator.retention().stats().map_err(internal)?;
    Ok(Json(json!({"stats": stats})))
}

// ---------------------------------------------------------------------------
// Workspace: environments, pins, snapshots, impact
// ---------------------------------------------------------------------------

fn map_workspace_error(err: helm_workspace::WorkspaceError) -> ApiError {
    use helm_workspace::WorkspaceError as W;
    ApiError(match &err {
        W::PromotionRefused(_) => HelmError::validation(err.to_string()),
        W::UnknownEnvironment(_) | W::UnknownSnapshot(_) => HelmError::not_found(err.to_string()),
        _ => HelmError::internal(err.to_string()),
    })
}

#[derive(Debug, Deserialize)]
pub struct UpsertEnvRequest {
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version_hash: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub locked: bool,
}

pub async fn cmd_upsert_env(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpsertEnvRequest>,
) -> ApiResult<Json<Value>> {
    let env = state
        .orchestrator
        .envs()
        .upsert_environment(
            &request.workspace_id,
            &request.name,
            request.description.as_deref().unwrap_or(""),
            request.version_hash.as_deref(),
            request.is_default,
            request.locked,
        )
        .map_err(map_workspace_error)?;
    Ok(Json(json!({"status": "ok", "environment": env})))
}

pub async fn cmd_list_envs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let workspace = params
        .get("workspace_id")
        .ok_or_else(|| ApiError(HelmError::validation("workspace_id is required")))?;
    let envs = state
        .orchestrator
        .envs()
        .list_environments(workspace)
        .map_err(map_workspace_error)?;
    Ok(Json(json!({"environments": envs})))
}

#[derive(Debug, Deserialize)]
pub struct InitEnvsRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub default_env: Option<String>,
}

pub async fn cmd_init_envs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InitEnvsRequest>,
) -> ApiResult<Json<Value>> {
    let envs = state
        .orchestrator
        .envs()
        .initialize_standard(
            &request.workspace_id,
            request.default_env.as_deref().unwrap_or("dev"),
        )
        .map_err(map_workspace_error)?;
    Ok(Json(json!({"status": "ok", "environments": envs})))
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub workspace_id: String,
    pub source: String,
    pub target: String,
}

pub async fn cmd_promote_env(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PromoteRequest>,
) -> ApiResult<Json<Value>> {
    let env = state
        .orchestrator
        .envs()
        .promote(&request.workspace_id, &request.source, &request.target)
        .map_err(map_workspace_error)?;
    Ok(Json(json!({"status": "ok", "environment": env})))
}

#[derive(Debug, Deserialize)]
pub struct SetPinRequest {
    pub workspace_id: String,
    pub environment: String,
    #[serde(default)]
    pub version_hash: Option<String>,
    #[serde(default)]
    pub skill_pins: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

pub async fn cmd_set_pin(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetPinRequest>,
) -> ApiResult<Json<Value>> {
    let pin = state
        .orchestrator
        .envs()
        .upsert_pin(
            &request.workspace_id,
            &request.environment,
            request.version_hash.as_deref(),
            request.skill_pins.as_ref(),
            request.model.as_deref(),
            request.provider.as_deref(),
        )
        .map_err(map_workspace_error)?;
    Ok(Json(json!({"status": "ok", "pin": pin})))
}

pub async fn cmd_get_pin(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let workspace = params
        .get("workspace_id")
        .ok_or_else(|| ApiError(HelmError::validation("workspace_id is required")))?;
    let environment = params
        .get("environment")
        .ok_or_else(|| ApiError(HelmError::validation("environment is required")))?;
    let pin = state
        .orchestrator
        .envs()
        .get_pin(workspace, environment)
        .map_err(map_workspace_error)?;
    Ok(Json(json!({"pin": pin})))
}

pub async fn cmd_list_pins(
    State(state): State<Arc<AppState>>,
    AxPath(workspace_id): AxPath<String>,
) -> ApiResult<Json<Value>> {
    let pins = state
        .orchestrator
        .envs()
        .list_pins(&workspace_id)
        .map_err(map_workspace_error)?;
    Ok(Json(json!({"pins": pins})))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

pub async fn cmd_snapshot(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SnapshotRequest>,
) -> ApiResult<Json<Value>> {
    let versions = VersionManager::new(
        state.orchestrator.store(),
        state.orchestrator.audit().clone(),
    );
    let info = versions
        .snapshot(
            &request.workspace_id,
            std::path::Path::new(&state.config().workspace_path),
            request.message.as_deref().unwrap_or(""),
        )
        .map_err(map_workspace_error)?;
    Ok(Json(json!({"status": "ok", "snapshot": info})))
}

#[derive(Debug, Deserialize)]
pub struct ImpactRequest {
    #[serde(default)]
    pub old_hash: Option<String>,
    pub new_hash: String,
    #[serde(default)]
    pub permission_changes: Option<u32>,
}

pub async fn cmd_impact(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImpactRequest>,
) -> ApiResult<Json<Value>> {
    let versions = VersionManager::new(
        state.orchestrator.store(),
        state.orchestrator.audit().clone(),
    );
    let old_hash = request
        .old_hash
        .ok_or_else(|| ApiError(HelmError::validation("old_hash is required")))?;
    let diff = versions
        .diff(&old_hash, &request.new_hash)
        .map_err(map_workspace_error)?;

    let registered = state
        .orchestrator
        .registry()
        .list_all()
        .map_err(internal)?
        .into_iter()
        .map(|record| SkillRef {
            name: record.manifest.name,
            state: record.state.as_str().to_string(),
        })
        .collect();

    let report = analyze_impact(&ImpactInput {
        diff: &diff,
        registered_skills: registered,
        permission_changes: request.permission_changes.unwrap_or(0),
    });
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}

/// `POST /risk/score`; the impact report's risk fields only.
pub async fn cmd_risk_score(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImpactRequest>,
) -> ApiResult<Json<Value>> {
    let full = cmd_impact(State(state), Json(request)).await?;
    let body = full.0;
    Ok(Json(json!({
        "risk_score": body.get("risk_score"),
        "risk_level": body.get("risk_level"),
        "recommendations": body.get("recommendations"),
    })))
}
