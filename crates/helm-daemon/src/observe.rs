// SPDX-License-Identifier: MIT OR Apache-2.0
//! Observability routes: trace listing, detail, replay, diff, labels,
//! annotations, and lookups by label or entity.

use crate::{ApiError, ApiResult, AppState};
use axum::{
    Json,
    extract::{Path as AxPath, Query, State},
};
use helm_error::HelmError;
use helm_store::StoreError;
use helm_trace::{TraceFilter, diff_traces};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

fn map_store_error(err: StoreError) -> ApiError {
    ApiError(match err {
        StoreError::NotFound(what) => HelmError::not_found(what),
        StoreError::Invalid(what) => HelmError::validation(what),
        other => HelmError::internal(other.to_string()),
    })
}

/// Tenant scope for observability reads. These routes serve the runtime's
/// own operators; callers name the tenant explicitly and cross-tenant
/// protection is enforced by the ops layer for console traffic.
fn tenant_of(params: &HashMap<String, String>) -> String {
    params
        .get("tenant_id")
        .cloned()
        .unwrap_or_else(|| "default".to_string())
}

#[derive(Debug, Deserialize)]
pub struct ListTracesQuery {
    pub tenant_id: Option<String>,
    pub workspace_id: Option<String>,
    pub agent_role: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn cmd_list_traces(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTracesQuery>,
) -> ApiResult<Json<Value>> {
    let page = state
        .orchestrator
        .traces()
        .list(&TraceFilter {
            tenant_id: query.tenant_id,
            workspace_id: query.workspace_id,
            agent_role: query.agent_role,
            status: query.status,
            limit: query.limit,
            offset: query.offset,
        })
        .map_err(map_store_error)?;
    Ok(Json(json!({
        "items": page.items,
        "total": page.total,
        "has_more": page.has_more,
    })))
}

pub async fn cmd_get_trace(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_of(&params);
    let trace = state
        .orchestrator
        .traces()
        .load(&tenant, &id)
        .map_err(map_store_error)?;
    let annotations = state
        .orchestrator
        .traces()
        .annotations(&id)
        .map_err(map_store_error)?;
    Ok(Json(json!({"trace": trace, "annotations": annotations})))
}

pub async fn cmd_replay_trace(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_of(&params);
    let context = state
        .orchestrator
        .traces()
        .replay_context(&tenant, &id)
        .map_err(map_store_error)?;
    Ok(Json(serde_json::to_value(context).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct DiffRequest {
    pub base_id: String,
    pub compare_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

pub async fn cmd_diff_traces(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DiffRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = request.tenant_id.unwrap_or_else(|| "default".to_string());
    let base = state
        .orchestrator
        .traces()
        .load(&tenant, &request.base_id)
        .map_err(map_store_error)?;
    let compare = state
        .orchestrator
        .traces()
        .load(&tenant, &request.compare_id)
        .map_err(map_store_error)?;
    let diff = diff_traces(&base, &compare);
    Ok(Json(serde_json::to_value(diff).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct LabelRequest {
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub labels: BTreeMap<String, String>,
}

pub async fn cmd_label_trace(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
    Json(request): Json<LabelRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = request.tenant_id.unwrap_or_else(|| "default".to_string());
    state
        .orchestrator
        .traces()
        .merge_labels(&tenant, &id, &request.labels)
        .map_err(map_store_error)?;
    Ok(Json(json!({"status": "ok", "trace_id": id})))
}

#[derive(Debug, Deserialize)]
pub struct AnnotateRequest {
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub author: Option<String>,
}

pub async fn cmd_annotate_trace(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
    Json(request): Json<AnnotateRequest>,
) -> ApiResult<Json<Value>> {
    let tenant = request.tenant_id.unwrap_or_else(|| "default".to_string());
    let annotation = state
        .orchestrator
        .traces()
        .annotate(
            &tenant,
            &id,
            &request.key,
            &request.value,
            request.author.as_deref().unwrap_or("api"),
        )
        .map_err(map_store_error)?;
    Ok(Json(json!({"status": "ok", "annotation": annotation})))
}

pub async fn cmd_traces_by_label(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_of(&params);
    let (Some(key), Some(value)) = (params.get("key"), params.get("value")) else {
        return Err(ApiError(HelmError::validation("key and value are required")));
    };
    let ids = state
        .orchestrator
        .traces()
        .find_by_label(&tenant, key, value)
        .map_err(map_store_error)?;
    Ok(Json(json!({"trace_ids": ids})))
}

pub async fn cmd_traces_by_entity(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let tenant = tenant_of(&params);
    let ids = state
        .orchestrator
        .traces()
        .find_by_entity(
            &tenant,
            params.get("task_id").map(String::as_str),
            params.get("document_id").map(String::as_str),
            params.get("message_id").map(String::as_str),
        )
        .map_err(map_store_error)?;
    Ok(Json(json!({"trace_ids": ids})))
}
