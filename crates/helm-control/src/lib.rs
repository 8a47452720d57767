// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound client for the control plane.
//!
//! The runtime never stores domain data; tasks, messages, documents, and
//! tool execution all belong to the control plane, reached through this
//! narrow client. Every mutating call carries an idempotency key derived
//! from the operation so retries collapse server-side, and every call
//! carries a freshly minted agent identity token in `X-Agent-Token`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use helm_core::ToolResult;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Client failures. Tool-proxy failures are NOT surfaced here; they map to
/// a failed [`ToolResult`] per the arbitration contract.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Transport-level failure.
    #[error("control plane unreachable: {0}")]
    Network(String),

    /// Non-2xx response.
    #[error("control plane error ({status}): {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Body excerpt.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("control plane returned an undecodable body: {0}")]
    Decode(String),
}

/// A task as the control plane reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task id.
    pub id: String,
    /// Task title.
    pub title: String,
    /// Task status, when reported.
    #[serde(default)]
    pub status: Option<String>,
}

/// A tool the control plane exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
}

/// Context headers attached to a proxied tool call.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    /// Tenant the call acts for.
    pub tenant_id: String,
    /// Workspace scope.
    pub workspace_id: String,
    /// Trace the call belongs to.
    pub trace_id: String,
    /// Minted agent identity token.
    pub agent_token: String,
}

/// HTTP client for the control plane.
#[derive(Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for ControlPlaneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ControlPlaneClient {
    /// Client against `base_url` (no trailing slash required).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    /// List recent tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport, HTTP, or decode failure.
    pub async fn list_tasks(
        &self,
        agent_token: &str,
        limit: u32,
    ) -> Result<Vec<TaskInfo>, ControlError> {
        let url = format!("{}/api/mission-control/tasks?limit={limit}", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-Agent-Token", agent_token)
            .send()
            .await
            .map_err(|e| ControlError::Network(e.to_string()))?;
        let body: Value = Self::decode(response).await?;
        // The list may arrive bare or wrapped in {tasks: [...]}.
        let list = body
            .get("tasks")
            .cloned()
            .unwrap_or(body);
        serde_json::from_value(list).map_err(|e| ControlError::Decode(e.to_string()))
    }

    /// Create a task.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport, HTTP, or decode failure.
    pub async fn create_task(
        &self,
        agent_token: &str,
        title: &str,
        description: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<TaskInfo, ControlError> {
        let url = format!("{}/api/mission-control/tasks", self.base_url);
        let payload = json!({
            "title": title,
            "description": description,
            "metadata": metadata,
            "idempotency_key": idempotency_key("create_task", &[title]),
        });
        let response = self
            .http
            .post(&url)
            .header("X-Agent-Token", agent_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ControlError::Network(e.to_string()))?;
        let body: Value = Self::decode(response).await?;
        let task = body.get("task").cloned().unwrap_or(body);
        serde_json::from_value(task).map_err(|e| ControlError::Decode(e.to_string()))
    }

    /// Find a task by exact title, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport, HTTP, or decode failure.
    pub async fn find_or_create_task(
        &self,
        agent_token: &str,
        title: &str,
        description: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<TaskInfo, ControlError> {
        let existing = self.list_tasks(agent_token, 100).await?;
        if let Some(task) = existing.into_iter().find(|t| t.title == title) {
            debug!(task = %task.id, title, "task matched by title");
            return Ok(task);
        }
        self.create_task(agent_token, title, description, metadata).await
    }

    /// Persist an agent message under a task.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport, HTTP, or decode failure.
    pub async fn post_message(
        &self,
        agent_token: &str,
        task_id: &str,
        content: &str,
        trace_id: &str,
    ) -> Result<Option<String>, ControlError> {
        let url = format!("{}/api/mission-control/messages", self.base_url);
        let payload = json!({
            "task_id": task_id,
            "content": content,
            "trace_id": trace_id,
            "idempotency_key": idempotency_key("post_message", &[task_id, trace_id]),
        });
        let response = self
            .http
            .post(&url)
            .header("X-Agent-Token", agent_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ControlError::Network(e.to_string()))?;
        let body: Value = Self::decode(response).await?;
        Ok(body
            .pointer("/message/id")
            .or_else(|| body.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Persist a document (e.g. a kickoff plan) under a task.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport, HTTP, or decode failure.
    pub async fn post_document(
        &self,
        agent_token: &str,
        task_id: Option<&str>,
        title: &str,
        content: &str,
    ) -> Result<Option<String>, ControlError> {
        let url = format!("{}/api/mission-control/documents", self.base_url);
        let payload = json!({
            "task_id": task_id,
            "title": title,
            "content": content,
            "idempotency_key": idempotency_key("post_document", &[title, task_id.unwrap_or("")]),
        });
        let response = self
            .http
            .post(&url)
            .header("X-Agent-Token", agent_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ControlError::Network(e.to_string()))?;
        let body: Value = Self::decode(response).await?;
        Ok(body
            .pointer("/document/id")
            .or_else(|| body.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Tools the control plane exposes.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport, HTTP, or decode failure.
    pub async fn list_tools(&self, agent_token: &str) -> Result<Vec<ToolSpec>, ControlError> {
        let url = format!("{}/api/tools", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("X-Agent-Token", agent_token)
            .send()
            .await
            .map_err(|e| ControlError::Network(e.to_string()))?;
        let body: Value = Self::decode(response).await?;
        let list = body.get("tools").cloned().unwrap_or(body);
        serde_json::from_value(list).map_err(|e| ControlError::Decode(e.to_string()))
    }

    /// Proxy one tool call. Never returns `Err`: every failure mode maps to
    /// a failed [`ToolResult`] so the model always receives a result turn.
    ///
    /// Mapping: 2xx → success with the decoded body; non-2xx →
    /// `Backend error (<status>): <body>`; timeout → `Tool call timed out
    /// after <ms>ms`; other transport failures → the error message.
    pub async fn call_tool(
        &self,
        call_id: &str,
        name: &str,
        arguments: &Value,
        context: &ToolCallContext,
        timeout: Duration,
    ) -> ToolResult {
        let url = format!("{}/api/tools/{name}", self.base_url);
        let started = Instant::now();
        let outcome = self
            .http
            .post(&url)
            .timeout(timeout)
            .header("X-Agent-Token", &context.agent_token)
            .header("X-Tenant-Id", &context.tenant_id)
            .header("X-Workspace-Id", &context.workspace_id)
            .header("X-Trace-Id", &context.trace_id)
            .json(&json!({
                "arguments": arguments,
                "idempotency_key": idempotency_key("call_tool", &[&context.trace_id, call_id, name]),
            }))
            .send()
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    match response.json::<Value>().await {
                        Ok(body) => ToolResult::ok(call_id, body, duration_ms),
                        Err(e) => ToolResult::err(
                            call_id,
                            format!("Backend returned undecodable body: {e}"),
                            duration_ms,
                        ),
                    }
                } else {
                    let body = response.text().await.unwrap_or_default();
                    let excerpt: String = body.chars().take(300).collect();
                    ToolResult::err(
                        call_id,
                        format!("Backend error ({}): {excerpt}", status.as_u16()),
                        duration_ms,
                    )
                }
            }
            Err(e) if e.is_timeout() => {
                warn!(tool = name, timeout_ms = timeout.as_millis() as u64,
                      at = %Utc::now().to_rfc3339(), "tool call timed out");
                ToolResult::err(
                    call_id,
                    format!("Tool call timed out after {}ms", timeout.as_millis()),
                    duration_ms,
                )
            }
            Err(e) => ToolResult::err(call_id, e.to_string(), duration_ms),
        }
    }

    /// Control-plane version probe, for deep health checks.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport, HTTP, or decode failure.
    pub async fn version(&self) -> Result<Value, ControlError> {
        let url = format!("{}/api/version", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ControlError::Network(e.to_string()))?;
        Self::decode(response).await
    }

    /// Compatibility probe.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] on transport, HTTP, or decode failure.
    pub async fn compatibility(&self) -> Result<Value, ControlError> {
        let url = format!("{}/api/compatibility", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ControlError::Network(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value, ControlError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(300).collect();
            return Err(ControlError::Http {
                status: status.as_u16(),
                body: excerpt,
            });
        }
        response
            .json()
            .await
            .map_err(|e| ControlError::Decode(e.to_string()))
    }
}

/// Derive a stable idempotency key for an operation: retries of the same
/// logical call collapse server-side; distinct calls never collide.
#[must_use]
pub fn idempotency_key(operation: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    for part in parts {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{operation}-{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> ToolCallContext {
        ToolCallContext {
            tenant_id: "t1".to_string(),
            workspace_id: "w1".to_string(),
            trace_id: "tr_1".to_string(),
            agent_token: "tok".to_string(),
        }
    }

    #[test]
    fn idempotency_keys_are_stable_and_distinct() {
        let a = idempotency_key("post_message", &["task-1", "tr_1"]);
        let b = idempotency_key("post_message", &["task-1", "tr_1"]);
        let c = idempotency_key("post_message", &["task-1", "tr_2"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("post_message-"));
    }

    #[tokio::test]
    async fn find_or_create_matches_by_title() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/mission-control/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tasks": [{"id": "task-1", "title": "Chat"}],
            })))
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(server.uri());
        let task = client.find_or_create_task("tok", "Chat", None, None).await.unwrap();
        assert_eq!(task.id, "task-1");
    }

    #[tokio::test]
    async fn find_or_create_creates_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/mission-control/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tasks": []})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/mission-control/tasks"))
            .and(body_partial_json(json!({"title": "New task"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task": {"id": "task-9", "title": "New task"},
            })))
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(server.uri());
        let task = client
            .find_or_create_task("tok", "New task", Some("desc"), None)
            .await
            .unwrap();
        assert_eq!(task.id, "task-9");
    }

    #[tokio::test]
    async fn call_tool_success_decodes_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tools/search"))
            .and(header("X-Tenant-Id", "t1"))
            .and(header("X-Trace-Id", "tr_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": [1, 2]})))
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(server.uri());
        let result = client
            .call_tool("c1", "search", &json!({"q": "x"}), &context(), Duration::from_secs(5))
            .await;
        assert!(result.success);
        assert_eq!(result.result.unwrap()["rows"][0], 1);
    }

    #[tokio::test]
    async fn call_tool_maps_backend_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tools/search"))
            .respond_with(ResponseTemplate::new(500).set_body_string("db down"))
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(server.uri());
        let result = client
            .call_tool("c1", "search", &json!({}), &context(), Duration::from_secs(5))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Backend error (500): db down"));
    }

    #[tokio::test]
    async fn call_tool_maps_timeouts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/tools/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(server.uri());
        let result = client
            .call_tool("c1", "slow", &json!({}), &context(), Duration::from_millis(50))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Tool call timed out after 50ms"));
    }

    #[tokio::test]
    async fn post_message_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/mission-control/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"id": "msg-1"},
            })))
            .mount(&server)
            .await;

        let client = ControlPlaneClient::new(server.uri());
        let id = client.post_message("tok", "task-1", "hello", "tr_1").await.unwrap();
        assert_eq!(id.as_deref(), Some("msg-1"));
    }
}
