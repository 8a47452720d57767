// SPDX-License-Identifier: MIT OR Apache-2.0
//! Skill test runner.
//!
//! Runs a skill's embedded test cases through the provider's structured-task
//! operation (cheap tier) and validates each result against the declared
//! output fields. The runner only needs the narrow [`TaskRunner`] seam, so
//! tests and the daemon can hand it different backends.

use crate::manifest::SkillManifest;
use async_trait::async_trait;
use helm_core::TokenUsage;
use serde::Serialize;
use serde_json::{Value, json};
use std::time::Instant;
use tracing::info;

/// The one provider operation the runner needs.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run a structured task: `prompt` + `input` constrained to `schema`,
    /// returning the parsed output object and usage.
    async fn run_task(
        &self,
        prompt: &str,
        input: &Value,
        schema: &Value,
    ) -> Result<(Value, TokenUsage), String>;
}

/// Outcome of one test case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillTestCaseResult {
    /// Case name.
    pub name: String,
    /// Whether the case passed.
    pub passed: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Failure description, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated report across all cases.
#[derive(Debug, Clone, Serialize)]
pub struct SkillTestReport {
    /// Skill name.
    pub name: String,
    /// Skill version.
    pub version: String,
    /// Per-case outcomes.
    pub cases: Vec<SkillTestCaseResult>,
    /// Passed count.
    pub passed: u32,
    /// Total count.
    pub total: u32,
    /// Usage across all cases.
    pub usage: TokenUsage,
}

impl SkillTestReport {
    /// Whether every case passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }

    /// Serialized per-case results for `eval_results`.
    #[must_use]
    pub fn results_json(&self) -> Value {
        serde_json::to_value(&self.cases).unwrap_or(Value::Null)
    }
}

/// Build the shallow validation schema from a manifest's declared outputs.
fn output_schema(manifest: &SkillManifest) -> Value {
    json!({
        "type": "object",
        "required": manifest.outputs,
    })
}

/// Run every embedded test case of `manifest` against `body` using `runner`.
pub async fn run_tests(
    manifest: &SkillManifest,
    body: &str,
    runner: &dyn TaskRunner,
) -> SkillTestReport {
    let schema = output_schema(manifest);
    let mut cases = Vec::new();
    let mut usage = TokenUsage::default();

    for test in &manifest.tests {
        let start = Instant::now();
        let outcome = runner.run_task(body, &test.input, &schema).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok((output, case_usage)) => {
                usage.add(&case_usage);
                let missing: Vec<&String> = test
                    .expect_fields
                    .iter()
                    .filter(|field| output.get(field.as_str()).is_none())
                    .collect();
                if missing.is_empty() {
                    SkillTestCaseResult {
                        name: test.name.clone(),
                        passed: true,
                        duration_ms,
                        error: None,
                    }
                } else {
                    SkillTestCaseResult {
                        name: test.name.clone(),
                        passed: false,
                        duration_ms,
                        error: Some(format!(
                            "missing expected fields: {}",
                            missing
                                .iter()
                                .map(|field| field.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        )),
                    }
                }
            }
            Err(error) => SkillTestCaseResult {
                name: test.name.clone(),
                passed: false,
                duration_ms,
                error: Some(error),
            },
        };
        cases.push(result);
    }

    let passed = cases.iter().filter(|c| c.passed).count() as u32;
    let total = cases.len() as u32;
    info!(skill = %manifest.name, version = %manifest.version, passed, total, "skill tests finished");

    SkillTestReport {
        name: manifest.name.clone(),
        version: manifest.version.clone(),
        cases,
        passed,
        total,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;

    struct FixedRunner {
        output: Value,
        fail_named: Option<&'static str>,
    }

    #[async_trait]
    impl TaskRunner for FixedRunner {
        async fn run_task(
            &self,
            _prompt: &str,
            input: &Value,
            _schema: &Value,
        ) -> Result<(Value, TokenUsage), String> {
            if let Some(marker) = self.fail_named
                && input.get("subject").and_then(Value::as_str) == Some(marker)
            {
                return Err("provider unavailable".to_string());
            }
            Ok((self.output.clone(), TokenUsage::new(50, 10)))
        }
    }

    fn manifest() -> (SkillManifest, String) {
        let raw = r#"---
name: triage
version: 1.0.0
outputs: [category, urgency]
tests:
  - name: bug report
    input: {subject: "crash"}
    expect_fields: [category, urgency]
  - name: feature ask
    input: {subject: "darker theme"}
    expect_fields: [category]
---
Classify the message.
"#;
        parse_manifest(raw).unwrap()
    }

    #[tokio::test]
    async fn all_cases_pass_with_matching_fields() {
        let (manifest, body) = manifest();
        let runner = FixedRunner {
            output: json!({"category": "bug", "urgency": "high"}),
            fail_named: None,
        };
        let report = run_tests(&manifest, &body, &runner).await;
        assert!(report.all_passed());
        assert_eq!(report.total, 2);
        assert_eq!(report.usage.prompt_tokens, 100);
    }

    #[tokio::test]
    async fn missing_field_fails_the_case() {
        let (manifest, body) = manifest();
        let runner = FixedRunner {
            output: json!({"category": "bug"}),
            fail_named: None,
        };
        let report = run_tests(&manifest, &body, &runner).await;
        assert_eq!(report.passed, 1);
        let failed = report.cases.iter().find(|c| !c.passed).unwrap();
        assert!(failed.error.as_deref().unwrap().contains("urgency"));
    }

    #[tokio::test]
    async fn provider_error_fails_the_case_only() {
        let (manifest, body) = manifest();
        let runner = FixedRunner {
            output: json!({"category": "bug", "urgency": "low"}),
            fail_named: Some("crash"),
        };
        let report = run_tests(&manifest, &body, &runner).await;
        assert_eq!(report.passed, 1);
        assert_eq!(report.total, 2);
        let failed = &report.cases[0];
        assert_eq!(failed.error.as_deref(), Some("provider unavailable"));
    }

    #[tokio::test]
    async fn no_tests_is_not_all_passed() {
        let raw = "---\nname: empty\nversion: 1.0.0\n---\nbody";
        let (manifest, body) = parse_manifest(raw).unwrap();
        let runner = FixedRunner {
            output: json!({}),
            fail_named: None,
        };
        let report = run_tests(&manifest, &body, &runner).await;
        assert_eq!(report.total, 0);
        assert!(!report.all_passed());
    }
}
