// SPDX-License-Identifier: MIT OR Apache-2.0
//! Skill manifest parsing and gating.
//!
//! A skill file is YAML frontmatter between `---` fences followed by the
//! markdown body. The frontmatter declares everything the arbiter and the
//! test runner need; the body is the instruction text spliced into prompts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle states, in promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillState {
    /// Just published; not yet tested.
    Draft,
    /// Embedded tests have run and passed.
    Tested,
    /// Explicitly approved for promotion.
    Approved,
    /// Serving production executions.
    Active,
    /// Still executable, but audited on every use.
    Deprecated,
}

impl SkillState {
    /// Stable wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Tested => "tested",
            Self::Approved => "approved",
            Self::Active => "active",
            Self::Deprecated => "deprecated",
        }
    }

    /// Parse a stable wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "tested" => Some(Self::Tested),
            "approved" => Some(Self::Approved),
            "active" => Some(Self::Active),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }

    /// Valid successor states. Transitions are monotonic; anything may be
    /// deprecated; a deprecated version can never come back to active.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [SkillState] {
        match self {
            Self::Draft => &[Self::Tested, Self::Deprecated],
            Self::Tested => &[Self::Approved, Self::Deprecated],
            Self::Approved => &[Self::Active, Self::Deprecated],
            Self::Active => &[Self::Deprecated],
            Self::Deprecated => &[],
        }
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: SkillState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// One declared input parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Declared type (`string`, `number`, `boolean`, `object`, `array`).
    #[serde(default = "default_type")]
    pub r#type: String,
    /// Whether callers must supply it.
    #[serde(default)]
    pub required: bool,
    /// Human description.
    #[serde(default)]
    pub description: String,
}

fn default_type() -> String {
    "string".to_string()
}

/// Conditions gating whether a skill may run on this host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatingConditions {
    /// Environment variables that must be set.
    #[serde(default)]
    pub env: Vec<String>,
    /// Executables that must be on PATH.
    #[serde(default)]
    pub executables: Vec<String>,
    /// Operating systems the skill may run on (`linux`, `macos`, `windows`).
    #[serde(default)]
    pub os: Vec<String>,
    /// Bypass every other condition.
    #[serde(default)]
    pub always: bool,
}

/// Declared redaction behavior for the skill's outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedactionSpec {
    /// Pattern names from the redactor's set.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Strategy override (`mask`, `hash`, `drop`, `summarize`).
    #[serde(default)]
    pub strategy: Option<String>,
}

/// One embedded test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillTestCase {
    /// Case name.
    pub name: String,
    /// Input object handed to the model.
    #[serde(default)]
    pub input: Value,
    /// Output field names the result must contain.
    #[serde(default)]
    pub expect_fields: Vec<String>,
}

/// Parsed skill manifest (frontmatter only; the body travels separately).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillManifest {
    /// Skill name. Unique per registry.
    pub name: String,
    /// Semver-shaped version.
    pub version: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// Declared input parameters.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Declared output field names.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Tools the skill may invoke. The arbiter's first gate.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Models the skill may run on. Empty = any.
    #[serde(default)]
    pub models: Vec<String>,
    /// Host gating conditions.
    #[serde(default)]
    pub gating: GatingConditions,
    /// Redaction declaration.
    #[serde(default)]
    pub redaction: RedactionSpec,
    /// Embedded test cases.
    #[serde(default)]
    pub tests: Vec<SkillTestCase>,
}

/// Manifest parse/validation failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    /// Missing opening/closing frontmatter fence.
    #[error("manifest must start with '---' frontmatter")]
    MissingFrontmatter,
    /// The YAML between the fences failed to parse.
    #[error("invalid frontmatter: {0}")]
    InvalidYaml(String),
    /// A required field is absent or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// The version is not `MAJOR.MINOR.PATCH`.
    #[error("version '{0}' is not semver-shaped")]
    BadVersion(String),
    /// A test case is malformed.
    #[error("invalid test case '{0}': {1}")]
    BadTest(String, String),
}

/// Parse a `SKILL.md` file into `(manifest, body)`.
///
/// # Errors
///
/// Returns [`ManifestError`] when the fences are missing, the YAML is
/// invalid, name/version are absent, the version is not semver-shaped, or a
/// test case lacks a name.
pub fn parse_manifest(raw: &str) -> Result<(SkillManifest, String), ManifestError> {
    let rest = raw
        .strip_prefix("---")
        .ok_or(ManifestError::MissingFrontmatter)?;
    let (front, body) = rest
        .split_once("\n---")
        .ok_or(ManifestError::MissingFrontmatter)?;

    let manifest: SkillManifest =
        serde_yaml::from_str(front).map_err(|e| ManifestError::InvalidYaml(e.to_string()))?;

    if manifest.name.trim().is_empty() {
        return Err(ManifestError::MissingField("name"));
    }
    if manifest.version.trim().is_empty() {
        return Err(ManifestError::MissingField("version"));
    }
    parse_semver(&manifest.version)
        .ok_or_else(|| ManifestError::BadVersion(manifest.version.clone()))?;
    for test in &manifest.tests {
        if test.name.trim().is_empty() {
            return Err(ManifestError::BadTest(
                manifest.name.clone(),
                "test case has no name".to_string(),
            ));
        }
    }

    let body = body.trim_start_matches(['-']).trim_start().to_string();
    Ok((manifest, body))
}

/// Parse `MAJOR.MINOR.PATCH` into a comparable tuple.
#[must_use]
pub fn parse_semver(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// Check the gating conditions against this host.
///
/// # Errors
///
/// Returns the first unmet condition as a human-readable message.
pub fn check_gating(gating: &GatingConditions) -> Result<(), String> {
    if gating.always {
        return Ok(());
    }
    for var in &gating.env {
        if std::env::var(var).is_err() {
            return Err(format!("required environment variable '{var}' is not set"));
        }
    }
    for exe in &gating.executables {
        if !on_path(exe) {
            return Err(format!("required executable '{exe}' not found on PATH"));
        }
    }
    if !gating.os.is_empty() && !gating.os.iter().any(|os| os == std::env::consts::OS) {
        return Err(format!(
            "operating system '{}' is not permitted",
            std::env::consts::OS
        ));
    }
    Ok(())
}

fn on_path(bin: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(bin).exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"---
name: triage
version: 1.2.0
description: Route inbound requests
parameters:
  - name: subject
    required: true
outputs: [category, urgency]
permissions: [search, create_task]
gating:
  os: [linux, macos]
tests:
  - name: routes a bug report
    input: {subject: "crash on save"}
    expect_fields: [category]
---

# Triage

Classify the message and open a task.
"#;

    #[test]
    fn parses_manifest_and_body() {
        let (manifest, body) = parse_manifest(SAMPLE).unwrap();
        assert_eq!(manifest.name, "triage");
        assert_eq!(manifest.version, "1.2.0");
        assert_eq!(manifest.permissions, vec!["search", "create_task"]);
        assert_eq!(manifest.outputs, vec!["category", "urgency"]);
        assert_eq!(manifest.parameters[0].name, "subject");
        assert!(manifest.parameters[0].required);
        assert_eq!(manifest.tests.len(), 1);
        assert!(body.starts_with("# Triage"));
        assert!(body.contains("open a task"));
    }

    #[test]
    fn rejects_missing_fences() {
        assert_eq!(
            parse_manifest("name: x\nversion: 1.0.0").unwrap_err(),
            ManifestError::MissingFrontmatter
        );
        assert_eq!(
            parse_manifest("---\nname: x").unwrap_err(),
            ManifestError::MissingFrontmatter
        );
    }

    #[test]
    fn rejects_missing_name_or_version() {
        let raw = "---\nname: ''\nversion: 1.0.0\n---\nbody";
        assert_eq!(parse_manifest(raw).unwrap_err(), ManifestError::MissingField("name"));
    }

    #[test]
    fn rejects_non_semver_version() {
        let raw = "---\nname: x\nversion: v1\n---\nbody";
        assert!(matches!(parse_manifest(raw), Err(ManifestError::BadVersion(_))));
        let raw = "---\nname: x\nversion: 1.2\n---\nbody";
        assert!(matches!(parse_manifest(raw), Err(ManifestError::BadVersion(_))));
        let raw = "---\nname: x\nversion: 1.2.3.4\n---\nbody";
        assert!(matches!(parse_manifest(raw), Err(ManifestError::BadVersion(_))));
    }

    #[test]
    fn rejects_unnamed_test_case() {
        let raw = "---\nname: x\nversion: 1.0.0\ntests:\n  - name: ''\n---\nbody";
        assert!(matches!(parse_manifest(raw), Err(ManifestError::BadTest(_, _))));
    }

    #[test]
    fn semver_ordering_tuples() {
        assert!(parse_semver("2.0.0") > parse_semver("1.9.9"));
        assert!(parse_semver("1.10.0") > parse_semver("1.9.0"));
        assert_eq!(parse_semver("01.2.3"), Some((1, 2, 3)));
    }

    #[test]
    fn state_transitions_are_monotonic() {
        assert!(SkillState::Draft.can_transition_to(SkillState::Tested));
        assert!(SkillState::Tested.can_transition_to(SkillState::Approved));
        assert!(SkillState::Approved.can_transition_to(SkillState::Active));
        assert!(!SkillState::Draft.can_transition_to(SkillState::Active));
        assert!(!SkillState::Active.can_transition_to(SkillState::Draft));
    }

    #[test]
    fn anything_may_deprecate_but_never_return() {
        for state in [
            SkillState::Draft,
            SkillState::Tested,
            SkillState::Approved,
            SkillState::Active,
        ] {
            assert!(state.can_transition_to(SkillState::Deprecated));
        }
        assert!(!SkillState::Deprecated.can_transition_to(SkillState::Active));
        assert!(SkillState::Deprecated.valid_transitions().is_empty());
    }

    #[test]
    fn gating_always_bypasses() {
        let gating = GatingConditions {
            env: vec!["DEFINITELY_NOT_SET_ANYWHERE_123".to_string()],
            always: true,
            ..GatingConditions::default()
        };
        assert!(check_gating(&gating).is_ok());
    }

    #[test]
    fn gating_missing_env_fails() {
        let gating = GatingConditions {
            env: vec!["DEFINITELY_NOT_SET_ANYWHERE_123".to_string()],
            ..GatingConditions::default()
        };
        assert!(check_gating(&gating).unwrap_err().contains("environment variable"));
    }

    #[test]
    fn gating_wrong_os_fails() {
        let gating = GatingConditions {
            os: vec!["plan9".to_string()],
            ..GatingConditions::default()
        };
        assert!(check_gating(&gating).unwrap_err().contains("operating system"));
    }

    #[test]
    fn gating_current_os_passes() {
        let gating = GatingConditions {
            os: vec![std::env::consts::OS.to_string()],
            ..GatingConditions::default()
        };
        assert!(check_gating(&gating).is_ok());
    }
}
