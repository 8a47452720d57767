// SPDX-License-Identifier: MIT OR Apache-2.0
//! Field-level diffing of two sealed traces.
//!
//! Used by operators to answer "what changed between these two runs": a
//! promotion gone wrong, a model swap, a skill bump. The
//! `significant_changes` list applies a fixed rubric so dashboards can
//! surface only the differences that matter.

use helm_core::{StepDetail, Trace};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A skill whose resolved version differs between the traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillVersionChange {
    /// Skill name.
    pub name: String,
    /// Version in the base trace, if present there.
    pub base: Option<String>,
    /// Version in the compare trace, if present there.
    pub compare: Option<String>,
}

/// A tool call that differs between the traces. Calls are paired by name
/// and occurrence order (ids are unique per execution and never match).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallChange {
    /// Tool name.
    pub name: String,
    /// Occurrence index among calls of this name.
    pub occurrence: usize,
    /// Whether the arguments differ.
    pub arguments_changed: bool,
    /// Whether the results differ.
    pub result_changed: bool,
    /// Whether the success flag flipped.
    pub success_changed: bool,
}

/// Structured comparison of two sealed traces.
#[derive(Debug, Clone, Serialize)]
pub struct TraceDiff {
    /// Base trace id.
    pub base_id: String,
    /// Compare trace id.
    pub compare_id: String,
    /// `compare.duration − base.duration`, milliseconds.
    pub duration_delta_ms: i64,
    /// Duration change as a percentage of the base.
    pub duration_delta_pct: f64,
    /// Set when the serving model changed.
    pub model_changed: Option<(String, String)>,
    /// Set when the serving provider changed.
    pub provider_changed: Option<(String, String)>,
    /// Set when the workspace snapshot hash changed.
    pub workspace_changed: Option<(Option<String>, Option<String>)>,
    /// Skills added in the compare trace.
    pub skills_added: Vec<String>,
    /// Skills removed in the compare trace.
    pub skills_removed: Vec<String>,
    /// Skills whose version changed.
    pub skills_changed: Vec<SkillVersionChange>,
    /// Token total delta (compare − base).
    pub tokens_delta: i64,
    /// Cost delta in USD (compare − base).
    pub cost_delta: f64,
    /// Cost change as a percentage of the base cost.
    pub cost_delta_pct: f64,
    /// Tool calls present only in the compare trace (name, occurrence count).
    pub tool_calls_added: Vec<String>,
    /// Tool calls present only in the base trace.
    pub tool_calls_removed: Vec<String>,
    /// Tool calls present in both but differing.
    pub tool_calls_changed: Vec<ToolCallChange>,
    /// Step counts per type, base then compare.
    pub step_counts: BTreeMap<String, (usize, usize)>,
    /// Whether the final output messages are byte-identical.
    pub output_identical: bool,
    /// Output length delta in characters (compare − base).
    pub output_len_delta: i64,
    /// Whether the error status flipped.
    pub error_status_changed: bool,
    /// Human-oriented list of the changes that matter, per the fixed rubric.
    pub significant_changes: Vec<String>,
}

/// Cost-delta percentage above which a change is significant.
const SIGNIFICANT_COST_PCT: f64 = 20.0;

/// Compare two sealed traces.
#[must_use]
pub fn diff_traces(base: &Trace, compare: &Trace) -> TraceDiff {
    let base_duration = base.duration_ms.unwrap_or(0) as i64;
    let compare_duration = compare.duration_ms.unwrap_or(0) as i64;
    let duration_delta_ms = compare_duration - base_duration;
    let duration_delta_pct = if base_duration > 0 {
        duration_delta_ms as f64 / base_duration as f64 * 100.0
    } else {
        0.0
    };

    let model_changed = (base.model != compare.model)
        .then(|| (base.model.clone(), compare.model.clone()));
    let provider_changed = (base.provider != compare.provider)
        .then(|| (base.provider.clone(), compare.provider.clone()));
    let workspace_changed = (base.workspace_hash != compare.workspace_hash)
        .then(|| (base.workspace_hash.clone(), compare.workspace_hash.clone()));

    // Skill versions.
    let base_skills: BTreeSet<&String> = base.skill_versions.keys().collect();
    let compare_skills: BTreeSet<&String> = compare.skill_versions.keys().collect();
    let skills_added: Vec<String> = compare_skills
        .difference(&base_skills)
        .map(|s| (*s).clone())
        .collect();
    let skills_removed: Vec<String> = base_skills
        .difference(&compare_skills)
        .map(|s| (*s).clone())
        .collect();
    let skills_changed: Vec<SkillVersionChange> = base_skills
        .intersection(&compare_skills)
        .filter(|name| base.skill_versions[**name] != compare.skill_versions[**name])
        .map(|name| SkillVersionChange {
            name: (*name).clone(),
            base: Some(base.skill_versions[*name].clone()),
            compare: Some(compare.skill_versions[*name].clone()),
        })
        .collect();

    // Usage and cost.
    let tokens_delta =
        compare.usage.total_tokens as i64 - base.usage.total_tokens as i64;
    let cost_delta = compare.cost - base.cost;
    let cost_delta_pct = if base.cost.abs() > f64::EPSILON {
        cost_delta / base.cost * 100.0
    } else if compare.cost.abs() > f64::EPSILON {
        100.0
    } else {
        0.0
    };

    // Tool calls, paired by (name, occurrence).
    let base_calls = collect_tool_calls(base);
    let compare_calls = collect_tool_calls(compare);
    let mut tool_calls_added = Vec::new();
    let mut tool_calls_removed = Vec::new();
    let mut tool_calls_changed = Vec::new();

    let all_names: BTreeSet<&String> =
        base_calls.keys().chain(compare_calls.keys()).collect();
    for name in all_names {
        let empty = Vec::new();
        let in_base = base_calls.get(name).unwrap_or(&empty);
        let in_compare = compare_calls.get(name).unwrap_or(&empty);
        for occurrence in 0..in_base.len().max(in_compare.len()) {
            match (in_base.get(occurrence), in_compare.get(occurrence)) {
                (None, Some(_)) => tool_calls_added.push(name.clone()),
                (Some(_), None) => tool_calls_removed.push(name.clone()),
                (Some(a), Some(b)) => {
                    let arguments_changed = a.arguments != b.arguments;
                    let result_changed = a.result != b.result;
                    let success_changed = a.success != b.success;
                    if arguments_changed || result_changed || success_changed {
                        tool_calls_changed.push(ToolCallChange {
                            name: name.clone(),
                            occurrence,
                            arguments_changed,
                            result_changed,
                            success_changed,
                        });
                    }
                }
                (None, None) => {}
            }
        }
    }

    // Step type counts.
    let mut step_counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for step in &base.steps {
        step_counts.entry(step_type(&step.detail).to_string()).or_default().0 += 1;
    }
    for step in &compare.steps {
        step_counts.entry(step_type(&step.detail).to_string()).or_default().1 += 1;
    }

    // Output.
    let base_output = base.output.as_ref().map(|o| o.message.as_str()).unwrap_or("");
    let compare_output = compare.output.as_ref().map(|o| o.message.as_str()).unwrap_or("");
    let output_identical = base_output == compare_output;
    let output_len_delta =
        compare_output.chars().count() as i64 - base_output.chars().count() as i64;

    let error_status_changed = base.error.is_some() != compare.error.is_some();

    // Fixed significance rubric.
    let mut significant_changes = Vec::new();
    if let Some((from, to)) = &model_changed {
        significant_changes.push(format!("model changed: {from} → {to}"));
    }
    if workspace_changed.is_some() {
        significant_changes.push("workspace snapshot changed".to_string());
    }
    if !skills_added.is_empty() || !skills_removed.is_empty() || !skills_changed.is_empty() {
        significant_changes.push("skill versions changed".to_string());
    }
    if !tool_calls_added.is_empty()
        || !tool_calls_removed.is_empty()
        || !tool_calls_changed.is_empty()
    {
        significant_changes.push("tool calls differ".to_string());
    }
    if error_status_changed {
        significant_changes.push("error status changed".to_string());
    }
    if cost_delta_pct.abs() > SIGNIFICANT_COST_PCT {
        significant_changes.push(format!("cost changed by {cost_delta_pct:.1}%"));
    }
    if !output_identical {
        significant_changes.push("output differs".to_string());
    }

    TraceDiff {
        base_id: base.id.clone(),
        compare_id: compare.id.clone(),
        duration_delta_ms,
        duration_delta_pct,
        model_changed,
        provider_changed,
        workspace_changed,
        skills_added,
        skills_removed,
        skills_changed,
        tokens_delta,
        cost_delta,
        cost_delta_pct,
        tool_calls_added,
        tool_calls_removed,
        tool_calls_changed,
        step_counts,
        output_identical,
        output_len_delta,
        error_status_changed,
        significant_changes,
    }
}

struct PairedCall {
    arguments: BTreeMap<String, Value>,
    result: Option<Value>,
    success: Option<bool>,
}

/// Group a trace's tool calls by name, in order, pairing each call with its
/// matching result step.
fn collect_tool_calls(trace: &Trace) -> BTreeMap<String, Vec<PairedCall>> {
    let mut results: BTreeMap<&str, (Option<&Value>, bool)> = BTreeMap::new();
    for step in &trace.steps {
        if let StepDetail::ToolResult { id, success, result, .. } = &step.detail {
            results.insert(id.as_str(), (result.as_ref(), *success));
        }
    }

    let mut calls: BTreeMap<String, Vec<PairedCall>> = BTreeMap::new();
    for step in &trace.steps {
        if let StepDetail::ToolCall { id, name, arguments, .. } = &step.detail {
            let (result, success) = match results.get(id.as_str()) {
                Some((r, s)) => (r.map(|v| (*v).clone()), Some(*s)),
                None => (None, None),
            };
            calls.entry(name.clone()).or_default().push(PairedCall {
                arguments: arguments.clone(),
                result,
                success,
            });
        }
    }
    calls
}

fn step_type(detail: &StepDetail) -> &'static str {
    match detail {
        StepDetail::LlmCall { .. } => "llm_call",
        StepDetail::ToolCall { .. } => "tool_call",
        StepDetail::ToolResult { .. } => "tool_result",
        StepDetail::Error { .. } => "error",
    }
}
