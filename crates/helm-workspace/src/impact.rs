// SPDX-License-Identifier: MIT OR Apache-2.0
//! Impact analysis: what would shipping this diff affect?
//!
//! Pure analysis over a [`WorkspaceDiff`]: it never promotes. The bounded
//! risk rubric scores skills affected, permission changes, prompt-size
//! delta, deletions, and draft-state exposure; the report carries
//! human-oriented recommendations for the release manager.

use crate::versioning::{FileStatus, WorkspaceDiff};
use crate::loader::files;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A registered skill, as seen by the analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillRef {
    /// Skill name.
    pub name: String,
    /// Lifecycle state (`draft`, `tested`, `approved`, `active`, `deprecated`).
    pub state: String,
}

/// Analyzer input.
#[derive(Debug, Clone)]
pub struct ImpactInput<'a> {
    /// The diff under consideration.
    pub diff: &'a WorkspaceDiff,
    /// Every registered skill of the workspace.
    pub registered_skills: Vec<SkillRef>,
    /// Count of tool-permission changes detected in the changed manifests
    /// (computed by the skill registry; this analyzer treats it as a score
    /// input).
    pub permission_changes: u32,
}

/// Changed files, bucketed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileBuckets {
    /// Added paths.
    pub added: Vec<PathBuf>,
    /// Modified paths.
    pub modified: Vec<PathBuf>,
    /// Deleted paths.
    pub deleted: Vec<PathBuf>,
}

/// Risk classification from the bounded rubric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Score below 2.
    Low,
    /// Score in `[2, 5)`.
    Medium,
    /// Score 5 or above.
    High,
}

impl RiskLevel {
    fn from_score(score: u32) -> Self {
        if score >= 5 {
            Self::High
        } else if score >= 2 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Structured impact report.
#[derive(Debug, Clone, Serialize)]
pub struct ImpactReport {
    /// Changed files by bucket.
    pub files: FileBuckets,
    /// Skills whose own manifest/body changed.
    pub affected_skills: Vec<String>,
    /// Whether a core file change fans out to every registered skill.
    pub all_skills_dependency_changed: bool,
    /// Estimated prompt-size delta in bytes (new − old, summed).
    pub prompt_size_delta: i64,
    /// Prompt-size delta as a percentage of the old size.
    pub prompt_size_delta_pct: f64,
    /// Rubric score.
    pub risk_score: u32,
    /// Classified risk.
    pub risk_level: RiskLevel,
    /// Human-oriented recommendations.
    pub recommendations: Vec<String>,
}

/// Core files whose change affects every skill's behavior.
const CORE_FILES: &[&str] = &[
    files::OPERATING_RULES,
    files::DEFAULT_PERSONA,
    files::IDENTITY,
    files::MEMORY,
];

/// Analyze a workspace diff. Pure; does not promote or mutate.
#[must_use]
pub fn analyze_impact(input: &ImpactInput<'_>) -> ImpactReport {
    let mut buckets = FileBuckets::default();
    let mut old_total: u64 = 0;
    let mut new_total: u64 = 0;

    for change in &input.diff.changes {
        old_total += change.old_size.unwrap_or(0);
        new_total += change.new_size.unwrap_or(0);
        match change.status {
            FileStatus::Added => buckets.added.push(change.path.clone()),
            FileStatus::Modified => buckets.modified.push(change.path.clone()),
            FileStatus::Deleted => buckets.deleted.push(change.path.clone()),
            FileStatus::Unchanged => {}
        }
    }

    // Skills directly touched by the diff: skills/<name>/... paths.
    let mut affected: BTreeSet<String> = BTreeSet::new();
    for path in buckets
        .added
        .iter()
        .chain(buckets.modified.iter())
        .chain(buckets.deleted.iter())
    {
        if let Some(name) = skill_name_of(path) {
            affected.insert(name);
        }
    }

    // Core-file changes count as a dependency change for every skill.
    let core_changed = buckets
        .modified
        .iter()
        .chain(buckets.deleted.iter())
        .any(|p| CORE_FILES.iter().any(|core| Path::new(core) == p));

    let prompt_size_delta = new_total as i64 - old_total as i64;
    let prompt_size_delta_pct = if old_total > 0 {
        prompt_size_delta as f64 / old_total as f64 * 100.0
    } else if new_total > 0 {
        100.0
    } else {
        0.0
    };

    let skills_in_scope: usize = if core_changed {
        input.registered_skills.len()
    } else {
        affected.len()
    };
    let draft_affected = input
        .registered_skills
        .iter()
        .any(|s| s.state == "draft" && (core_changed || affected.contains(&s.name)));

    // Bounded rubric: each factor contributes a capped share.
    let mut score = 0u32;
    score += (skills_in_scope as u32).min(3);
    score += input.permission_changes.min(2) * 2;
    if prompt_size_delta_pct.abs() > 20.0 {
        score += 1;
    }
    if !buckets.deleted.is_empty() {
        score += 2;
    }
    if draft_affected {
        score += 2;
    }

    let mut recommendations = Vec::new();
    if core_changed {
        recommendations
            .push("Core bootstrap files changed; re-test every active skill before promoting.".to_string());
    }
    if !buckets.deleted.is_empty() {
        recommendations.push(format!(
            "{} file(s) deleted; confirm nothing references them.",
            buckets.deleted.len()
        ));
    }
    if input.permission_changes > 0 {
        recommendations.push(
            "Tool permissions changed; review the affected skills' permission lists.".to_string(),
        );
    }
    if prompt_size_delta_pct > 20.0 {
        recommendations.push(format!(
            "Prompt size grows by {prompt_size_delta_pct:.0}%; watch token budgets."
        ));
    }
    if draft_affected {
        recommendations
            .push("Draft-state skills are affected; promote or remove them first.".to_string());
    }
    if recommendations.is_empty() {
        recommendations.push("Change looks routine; standard promotion applies.".to_string());
    }

    ImpactReport {
        files: buckets,
        affected_skills: affected.into_iter().collect(),
        all_skills_dependency_changed: core_changed,
        prompt_size_delta,
        prompt_size_delta_pct,
        risk_score: score,
        risk_level: RiskLevel::from_score(score),
        recommendations,
    }
}

/// Extract the skill name from a `skills/<name>/...` or `skills/<name>.<ext>`
/// path.
fn skill_name_of(path: &Path) -> Option<String> {
    let mut components = path.components();
    let first = components.next()?.as_os_str().to_string_lossy();
    if first != files::SKILLS_DIR {
        return None;
    }
    let second = components.next()?.as_os_str().to_string_lossy().to_string();
    Some(match second.rsplit_once('.') {
        Some((stem, _ext)) if components.next().is_none() => stem.to_string(),
        _ => second,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::versioning::FileChange;

    fn change(path: &str, status: FileStatus, old: Option<u64>, new: Option<u64>) -> FileChange {
        FileChange {
            path: PathBuf::from(path),
            status,
            old_size: old,
            new_size: new,
        }
    }

    fn skills(list: &[(&str, &str)]) -> Vec<SkillRef> {
        list.iter()
            .map(|(name, state)| SkillRef {
                name: (*name).to_string(),
                state: (*state).to_string(),
            })
            .collect()
    }

    #[test]
    fn empty_diff_is_low_risk() {
        let diff = WorkspaceDiff::default();
        let report = analyze_impact(&ImpactInput {
            diff: &diff,
            registered_skills: skills(&[("triage", "active")]),
            permission_changes: 0,
        });
        assert_eq!(report.risk_level, RiskLevel::Low);
        assert_eq!(report.risk_score, 0);
        assert!(report.affected_skills.is_empty());
    }

    #[test]
    fn skill_file_change_names_the_skill() {
        let diff = WorkspaceDiff {
            changes: vec![change(
                "skills/triage/SKILL.md",
                FileStatus::Modified,
                Some(100),
                Some(120),
            )],
        };
        let report = analyze_impact(&ImpactInput {
            diff: &diff,
            registered_skills: skills(&[("triage", "active"), ("summarize", "active")]),
            permission_changes: 0,
        });
        assert_eq!(report.affected_skills, vec!["triage".to_string()]);
        assert!(!report.all_skills_dependency_changed);
    }

    #[test]
    fn flat_skill_file_also_matches() {
        assert_eq!(
            skill_name_of(Path::new("skills/triage.md")),
            Some("triage".to_string())
        );
        assert_eq!(
            skill_name_of(Path::new("skills/triage/SKILL.md")),
            Some("triage".to_string())
        );
        assert_eq!(skill_name_of(Path::new("AGENTS.md")), None);
    }

    #[test]
    fn core_change_fans_out_to_all_skills() {
        let diff = WorkspaceDiff {
            changes: vec![change("AGENTS.md", FileStatus::Modified, Some(50), Some(60))],
        };
        let report = analyze_impact(&ImpactInput {
            diff: &diff,
            registered_skills: skills(&[("a", "active"), ("b", "active"), ("c", "active"), ("d", "active")]),
            permission_changes: 0,
        });
        assert!(report.all_skills_dependency_changed);
        // 4 skills in scope, capped at 3 points.
        assert_eq!(report.risk_score, 3);
        assert_eq!(report.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn deletions_and_permissions_raise_risk_to_high() {
        let diff = WorkspaceDiff {
            changes: vec![
                change("skills/triage/SKILL.md", FileStatus::Modified, Some(100), Some(110)),
                change("TOOLS.md", FileStatus::Deleted, Some(40), None),
            ],
        };
        let report = analyze_impact(&ImpactInput {
            diff: &diff,
            registered_skills: skills(&[("triage", "active")]),
            permission_changes: 1,
        });
        // 1 skill + 2 (permissions) + 2 (deletion) = 5
        assert_eq!(report.risk_score, 5);
        assert_eq!(report.risk_level, RiskLevel::High);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("permission")));
    }

    #[test]
    fn draft_exposure_scores() {
        let diff = WorkspaceDiff {
            changes: vec![change(
                "skills/newbie/SKILL.md",
                FileStatus::Modified,
                Some(10),
                Some(12),
            )],
        };
        let report = analyze_impact(&ImpactInput {
            diff: &diff,
            registered_skills: skills(&[("newbie", "draft")]),
            permission_changes: 0,
        });
        // 1 skill + 2 draft = 3
        assert_eq!(report.risk_score, 3);
        assert!(report.recommendations.iter().any(|r| r.contains("Draft")));
    }

    #[test]
    fn large_prompt_growth_is_flagged() {
        let diff = WorkspaceDiff {
            changes: vec![change("SOUL.md", FileStatus::Modified, Some(100), Some(200))],
        };
        let report = analyze_impact(&ImpactInput {
            diff: &diff,
            registered_skills: vec![],
            permission_changes: 0,
        });
        assert!(report.prompt_size_delta_pct > 20.0);
        assert!(report.recommendations.iter().any(|r| r.contains("Prompt size")));
    }
}
