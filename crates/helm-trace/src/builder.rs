// SPDX-License-Identifier: MIT OR Apache-2.0
//! Builder for constructing and sealing [`Trace`]s.

use chrono::Utc;
use helm_core::{
    EntityLinks, StepDetail, TokenUsage, Trace, TraceOutput, TraceStep, ToolCallSummary,
    next_trace_id,
};
use std::collections::BTreeMap;

/// Accumulates an execution's steps and seals exactly once.
///
/// Sealing consumes the builder, so a sealed trace can never be appended to
/// again; only labels and annotations may change afterwards.
///
/// Usage and cost totals are accumulated on every
/// [`StepDetail::LlmCall`] append, keeping the summary invariant
/// (`usage == Σ llm_call steps`) true by construction.
#[derive(Debug)]
pub struct TraceBuilder {
    trace: Trace,
}

impl TraceBuilder {
    /// Start a trace for an admitted request. The id is assigned here and is
    /// time-ordered.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        workspace_id: impl Into<String>,
        agent_role: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        input_message: impl Into<String>,
        history_len: usize,
    ) -> Self {
        Self {
            trace: Trace {
                id: next_trace_id(),
                tenant_id: tenant_id.into(),
                workspace_id: workspace_id.into(),
                agent_role: agent_role.into(),
                started_at: Utc::now(),
                completed_at: None,
                duration_ms: None,
                workspace_hash: None,
                skill_versions: BTreeMap::new(),
                model: model.into(),
                provider: provider.into(),
                input_message: input_message.into(),
                history_len,
                steps: Vec::new(),
                output: None,
                usage: TokenUsage::default(),
                cost: 0.0,
                redacted_prompt: None,
                error: None,
                labels: BTreeMap::new(),
                entities: EntityLinks::default(),
            },
        }
    }

    /// The assigned trace id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.trace.id
    }

    /// Record the resolved workspace snapshot hash.
    pub fn set_workspace_hash(&mut self, hash: impl Into<String>) {
        self.trace.workspace_hash = Some(hash.into());
    }

    /// Record the resolved skill versions.
    pub fn set_skill_versions(&mut self, versions: BTreeMap<String, String>) {
        self.trace.skill_versions = versions;
    }

    /// Update the serving model/provider (after a failover they differ from
    /// the requested pair).
    pub fn set_served_by(&mut self, model: impl Into<String>, provider: impl Into<String>) {
        self.trace.model = model.into();
        self.trace.provider = provider.into();
    }

    /// Capture the redacted prompt.
    pub fn set_redacted_prompt(&mut self, prompt: impl Into<String>) {
        self.trace.redacted_prompt = Some(prompt.into());
    }

    /// Link the trace to control-plane entities.
    pub fn set_entities(&mut self, entities: EntityLinks) {
        self.trace.entities = entities;
    }

    /// Add a label.
    pub fn label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.trace.labels.insert(key.into(), value.into());
    }

    /// Append a step with the current timestamp. Model-call steps roll their
    /// usage and cost into the summary totals.
    pub fn push_step(&mut self, detail: StepDetail, duration_ms: u64) {
        if let StepDetail::LlmCall {
            input_tokens,
            output_tokens,
            cost,
            ..
        } = &detail
        {
            self.trace
                .usage
                .add(&TokenUsage::new(*input_tokens, *output_tokens));
            self.trace.cost += cost;
        }
        self.trace.steps.push(TraceStep {
            at: Utc::now(),
            duration_ms,
            detail,
        });
    }

    /// Successful tool calls recorded so far, for the finalized output.
    #[must_use]
    pub fn successful_tool_calls(&self) -> Vec<ToolCallSummary> {
        let mut names: BTreeMap<&str, &str> = BTreeMap::new();
        for step in &self.trace.steps {
            if let StepDetail::ToolCall { id, name, .. } = &step.detail {
                names.insert(id.as_str(), name.as_str());
            }
        }
        self.trace
            .steps
            .iter()
            .filter_map(|step| match &step.detail {
                StepDetail::ToolResult { id, success: true, .. } => Some(ToolCallSummary {
                    id: id.clone(),
                    name: names.get(id.as_str()).unwrap_or(&"").to_string(),
                    duration_ms: step.duration_ms,
                }),
                _ => None,
            })
            .collect()
    }

    /// Seal with a successful output. Consumes the builder.
    #[must_use]
    pub fn seal(mut self, message: impl Into<String>) -> Trace {
        self.trace.output = Some(TraceOutput {
            message: message.into(),
            tool_calls: self.successful_tool_calls(),
        });
        self.finish()
    }

    /// Seal with a terminal error. Consumes the builder.
    #[must_use]
    pub fn seal_with_error(mut self, kind: &str, message: impl Into<String>) -> Trace {
        let message = message.into();
        self.trace.error = Some(message.clone());
        self.push_step(
            StepDetail::Error {
                kind: kind.to_string(),
                message,
            },
            0,
        );
        self.finish()
    }

    fn finish(mut self) -> Trace {
        let completed = Utc::now();
        self.trace.duration_ms = Some(
            (completed - self.trace.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.trace.completed_at = Some(completed);
        self.trace
    }
}
