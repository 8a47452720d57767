// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execution trace model.
//!
//! A trace is the sealed structured record of one execution: which versions
//! ran (workspace hash, skill versions, model), what happened (ordered
//! steps), and what it cost (usage + USD totals). Traces reference the
//! workspace by hash and skills by `(name, version)`; never by pointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Trace id
// ---------------------------------------------------------------------------

static TRACE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Produce a time-ordered trace id: `tr_<unix_millis>_<seq>_<suffix>`.
///
/// Lexical ordering of ids approximates chronological ordering across
/// requests; the per-process sequence disambiguates bursts within one
/// millisecond.
#[must_use]
pub fn next_trace_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0);
    let seq = TRACE_SEQ.fetch_add(1, Ordering::Relaxed) % 10_000;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("tr_{millis:013}_{seq:04}_{}", &suffix[..8])
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// What happened at one point in the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDetail {
    /// One model invocation.
    LlmCall {
        /// Model name that served the call.
        model: String,
        /// Provider that served the call.
        provider: String,
        /// Input tokens consumed.
        input_tokens: u64,
        /// Output tokens produced.
        output_tokens: u64,
        /// Cost of this call in USD.
        cost: f64,
    },
    /// A tool invocation requested by the model.
    ToolCall {
        /// Correlation id.
        id: String,
        /// Tool name.
        name: String,
        /// Argument map as supplied by the model.
        arguments: BTreeMap<String, Value>,
        /// Whether the call passed both permission gates.
        permitted: bool,
    },
    /// The outcome of a tool invocation.
    ToolResult {
        /// Correlation id matching the earlier `ToolCall` step.
        id: String,
        /// Whether the call succeeded.
        success: bool,
        /// Decoded result on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Error text on failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A terminal or recoverable error observed mid-execution.
    Error {
        /// Stable error kind (wire code).
        kind: String,
        /// Human-readable message.
        message: String,
    },
}

/// One entry in a trace's ordered step sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    /// When the step occurred.
    pub at: DateTime<Utc>,
    /// How long the step took, in milliseconds.
    pub duration_ms: u64,
    /// What the step was.
    #[serde(flatten)]
    pub detail: StepDetail,
}

// ---------------------------------------------------------------------------
// Output & links
// ---------------------------------------------------------------------------

/// Summary of one successful tool call, carried in the finalized output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSummary {
    /// Correlation id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Duration of the call in milliseconds.
    pub duration_ms: u64,
}

/// Finalized output of a sealed trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceOutput {
    /// Final assistant message.
    pub message: String,
    /// Successful tool calls, in completion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallSummary>,
}

/// Links from a trace to entities owned by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityLinks {
    /// Task the execution ran under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Document produced during the execution, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Message persisted for the execution, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

/// Sealed structured record of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Time-ordered identifier (see [`next_trace_id`]).
    pub id: String,
    /// Tenant the execution belonged to.
    pub tenant_id: String,
    /// Workspace the execution ran against.
    pub workspace_id: String,
    /// Agent role the execution ran as.
    pub agent_role: String,
    /// When the orchestrator admitted the request.
    pub started_at: DateTime<Utc>,
    /// When the trace was sealed. `None` while the execution is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// `completed_at − started_at`, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Resolved workspace snapshot hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_hash: Option<String>,
    /// Skill name → version admitted into the prompt.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub skill_versions: BTreeMap<String, String>,
    /// Model that served the execution.
    pub model: String,
    /// Provider that served the execution.
    pub provider: String,
    /// The inbound user message.
    pub input_message: String,
    /// How many prior-history turns accompanied the request (count only).
    pub history_len: usize,
    /// Ordered step sequence.
    pub steps: Vec<TraceStep>,
    /// Finalized output, present once sealed without error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TraceOutput>,
    /// Token totals across all model-call steps.
    pub usage: crate::TokenUsage,
    /// USD cost total across all model-call steps.
    pub cost: f64,
    /// Redacted copy of the assembled prompt, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_prompt: Option<String>,
    /// Terminal error, when the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Mutable label map (the only mutable field after sealing, besides
    /// annotations which live in their own table).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Links to control-plane entities.
    #[serde(default)]
    pub entities: EntityLinks,
}

impl Trace {
    /// `true` once the trace has a completion timestamp.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Recompute usage and cost totals from the model-call steps.
    ///
    /// The invariant `usage == Σ llm_call steps` must hold for every sealed
    /// trace; this is the checking side of that invariant.
    #[must_use]
    pub fn totals_from_steps(&self) -> (crate::TokenUsage, f64) {
        let mut usage = crate::TokenUsage::default();
        let mut cost = 0.0;
        for step in &self.steps {
            if let StepDetail::LlmCall {
                input_tokens,
                output_tokens,
                cost: c,
                ..
            } = &step.detail
            {
                usage.add(&crate::TokenUsage::new(*input_tokens, *output_tokens));
                cost += c;
            }
        }
        (usage, cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_lexically_increasing() {
        let a = next_trace_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = next_trace_id();
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn trace_ids_are_unique_in_a_burst() {
        let ids: Vec<String> = (0..100).map(|_| next_trace_id()).collect();
        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn step_detail_tagged_serialization() {
        let step = TraceStep {
            at: Utc::now(),
            duration_ms: 5,
            detail: StepDetail::Error {
                kind: "timeout".into(),
                message: "model call timed out".into(),
            },
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "timeout");
    }

    #[test]
    fn totals_from_steps_sums_llm_calls_only() {
        let mk_llm = |tokens_in: u64, tokens_out: u64, cost: f64| TraceStep {
            at: Utc::now(),
            duration_ms: 1,
            detail: StepDetail::LlmCall {
                model: "m".into(),
                provider: "p".into(),
                input_tokens: tokens_in,
                output_tokens: tokens_out,
                cost,
            },
        };
        let trace = Trace {
            id: next_trace_id(),
            tenant_id: "t".into(),
            workspace_id: "w".into(),
            agent_role: "assistant".into(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            workspace_hash: None,
            skill_versions: BTreeMap::new(),
            model: "m".into(),
            provider: "p".into(),
            input_message: "hi".into(),
            history_len: 0,
            steps: vec![
                mk_llm(100, 50, 0.01),
                TraceStep {
                    at: Utc::now(),
                    duration_ms: 2,
                    detail: StepDetail::ToolCall {
                        id: "c1".into(),
                        name: "search".into(),
                        arguments: BTreeMap::new(),
                        permitted: true,
                    },
                },
                mk_llm(200, 100, 0.02),
            ],
            output: None,
            usage: crate::TokenUsage::default(),
            cost: 0.0,
            redacted_prompt: None,
            error: None,
            labels: BTreeMap::new(),
            entities: EntityLinks::default(),
        };
        let (usage, cost) = trace.totals_from_steps();
        assert_eq!(usage.prompt_tokens, 300);
        assert_eq!(usage.completion_tokens, 150);
        assert!((cost - 0.03).abs() < 1e-9);
    }
}
