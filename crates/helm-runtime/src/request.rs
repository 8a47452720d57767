// SPDX-License-Identifier: MIT OR Apache-2.0
//! Public request and response shapes for the agent endpoints.

use helm_core::{ChatMessage, CostBreakdown, TokenUsage};
use helm_webhook::WebhookConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request metadata block.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SendMetadata {
    /// Override the assembled system prompt entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Kickoff plan document persisted alongside the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kickoff_plan: Option<String>,
    /// Note attached to the kickoff document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kickoff_note: Option<String>,
    /// Timezone override for the time-context block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// `POST /api/agents/send` body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendRequest {
    /// User the request acts on behalf of.
    pub user_id: String,
    /// Session key `user:<user_id>:<agent_role>`.
    pub session_key: String,
    /// The inbound message.
    pub message: String,
    /// Prior conversation window.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Explicit target task id (highest priority).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Target task title (find-or-create).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    /// Description for a newly created task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
    /// Metadata for a newly created task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_metadata: Option<Value>,
    /// Request metadata.
    #[serde(default)]
    pub metadata: SendMetadata,
    /// Optional completion webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    /// Environment to resolve pins against (defaults to the workspace's
    /// default environment).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// `POST /api/agents/send` response.
#[derive(Debug, Clone, Serialize)]
pub struct SendResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Task the execution ran under (empty when the control plane was
    /// unreachable).
    pub task_id: String,
    /// Assistant response text.
    pub response: String,
    /// Token usage totals.
    pub usage: TokenUsage,
    /// Cost breakdown.
    pub cost: CostBreakdown,
    /// Trace id for this execution.
    pub trace_id: String,
    /// Set when the prompt approaches the model window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_warning: Option<String>,
}

/// `POST /compact` body.
#[derive(Debug, Clone, Deserialize)]
pub struct CompactRequest {
    /// The history to compact.
    pub messages: Vec<ChatMessage>,
    /// Extra summarization instructions.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Tail length preserved verbatim (default 2).
    #[serde(default)]
    pub keep_recent: Option<usize>,
}

/// `POST /compact` response.
#[derive(Debug, Clone, Serialize)]
pub struct CompactResponse {
    /// Always `"ok"`.
    pub status: String,
    /// The compacted history.
    pub compacted_messages: Vec<ChatMessage>,
    /// Usage spent producing the summary.
    pub usage: TokenUsage,
    /// Turn count before compaction.
    pub original_count: usize,
    /// Turn count after compaction.
    pub compacted_count: usize,
}

/// `POST /llm-task` body.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    /// Instruction prompt.
    pub prompt: String,
    /// Input object.
    #[serde(default)]
    pub input: Option<Value>,
    /// Output schema (validated shallowly).
    #[serde(default)]
    pub schema: Option<Value>,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
    /// Temperature override.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Output token cap.
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

/// `POST /llm-task` response.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Structured output.
    pub output: Value,
    /// Usage for the call.
    pub usage: TokenUsage,
    /// Cost for the call.
    pub cost: CostBreakdown,
    /// Whether the output satisfied the schema.
    pub validated: bool,
}
