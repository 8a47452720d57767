// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Skill manifests, versioned registry, lifecycle, and test runner."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! A skill is a named, versioned capability declaration: a YAML-frontmatter
//! manifest (parameters, outputs, tool permissions, gating, redaction,
//! embedded tests) plus markdown body instructions that get spliced into the
//! system prompt. Published `(name, version)` pairs are immutable; lifecycle
//! states move monotonically draft → tested → approved → active, any state
//! may be deprecated, and deprecated versions still execute but are audited
//! on every use.

mod manifest;
mod registry;
mod runner;

pub use manifest::{
    GatingConditions, ManifestError, ParameterSpec, RedactionSpec, SkillManifest, SkillState,
    SkillTestCase, check_gating, parse_manifest,
};
pub use registry::{RegistryError, SkillRecord, SkillRegistry};
pub use runner::{SkillTestCaseResult, SkillTestReport, TaskRunner, run_tests};
