// SPDX-License-Identifier: MIT OR Apache-2.0
//! Versioned skill registry with audited lifecycle transitions.

use crate::manifest::{SkillManifest, SkillState, parse_semver};
use chrono::{DateTime, Utc};
use helm_audit::{AuditLog, NewAuditEntry};
use helm_core::AuditEventType;
use helm_store::Store;
use serde::Serialize;
use serde_json::json;
use tracing::info;

/// One stored skill version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillRecord {
    /// Parsed manifest.
    pub manifest: SkillManifest,
    /// Body instructions.
    pub body: String,
    /// Lifecycle state.
    pub state: SkillState,
    /// First publication time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Registry failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// `(name, version)` is already published; published versions are
    /// immutable.
    #[error("skill {name}@{version} is already published")]
    AlreadyPublished {
        /// Skill name.
        name: String,
        /// Conflicting version.
        version: String,
    },

    /// The requested skill or version does not exist.
    #[error("skill not found: {0}")]
    NotFound(String),

    /// The requested lifecycle transition is not legal.
    #[error("illegal transition for {name}@{version}: {from} → {to}")]
    IllegalTransition {
        /// Skill name.
        name: String,
        /// Version.
        version: String,
        /// Current state.
        from: &'static str,
        /// Requested state.
        to: &'static str,
    },

    /// Store failure.
    #[error(transparent)]
    Store(#[from] helm_store::StoreError),
}

/// Store-backed skill registry.
#[derive(Debug, Clone)]
pub struct SkillRegistry {
    store: Store,
    audit: AuditLog,
}

impl SkillRegistry {
    /// Wrap the shared store and audit log.
    #[must_use]
    pub fn new(store: Store, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Publish a new `(name, version)` in the draft state.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyPublished`] when the pair exists; published
    /// versions are never overwritten.
    pub fn publish(
        &self,
        manifest: &SkillManifest,
        body: &str,
    ) -> Result<SkillRecord, RegistryError> {
        if self.get_exact(&manifest.name, &manifest.version).is_ok() {
            return Err(RegistryError::AlreadyPublished {
                name: manifest.name.clone(),
                version: manifest.version.clone(),
            });
        }

        let now = Utc::now();
        let manifest_json =
            serde_json::to_string(manifest).map_err(helm_store::StoreError::from)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO skill_registry (name, version, state, manifest, body, created_at, updated_at)
                 VALUES (?1, ?2, 'draft', ?3, ?4, ?5, ?5)",
                rusqlite::params![
                    manifest.name,
                    manifest.version,
                    manifest_json,
                    body,
                    now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        self.audit.record_or_log(
            &NewAuditEntry::new("system", AuditEventType::SkillPublished).payload(json!({
                "name": manifest.name,
                "version": manifest.version,
            })),
        );
        info!(skill = %manifest.name, version = %manifest.version, "skill published");

        self.get_exact(&manifest.name, &manifest.version)
    }

    /// Latest version of `name` in the active state, falling back to the
    /// latest approved version. This is what production resolution uses when
    /// no pin names a version.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when no active-or-approved version exists.
    pub fn get(&self, name: &str) -> Result<SkillRecord, RegistryError> {
        let mut candidates = self.versions_of(name)?;
        candidates.retain(|r| matches!(r.state, SkillState::Active | SkillState::Approved));
        candidates.sort_by_key(|r| {
            (
                matches!(r.state, SkillState::Active),
                parse_semver(&r.manifest.version),
            )
        });
        candidates
            .pop()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Exactly `name@version`, in any state.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when the pair does not exist.
    pub fn get_exact(&self, name: &str, version: &str) -> Result<SkillRecord, RegistryError> {
        self.versions_of(name)?
            .into_iter()
            .find(|r| r.manifest.version == version)
            .ok_or_else(|| RegistryError::NotFound(format!("{name}@{version}")))
    }

    /// Latest version of `name` regardless of lifecycle state.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when the skill has no versions.
    pub fn get_any_state(&self, name: &str) -> Result<SkillRecord, RegistryError> {
        let mut versions = self.versions_of(name)?;
        versions.sort_by_key(|r| parse_semver(&r.manifest.version));
        versions
            .pop()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// All versions in `state`, name order.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn list_by_state(&self, state: SkillState) -> Result<Vec<SkillRecord>, RegistryError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT manifest, body, state, created_at, updated_at
                 FROM skill_registry WHERE state = ?1 ORDER BY name, version",
            )?;
            let rows = stmt.query_map([state.as_str()], row_to_record)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        Ok(rows)
    }

    /// Names and states of every registered skill (latest version each),
    /// for impact analysis.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn list_all(&self) -> Result<Vec<SkillRecord>, RegistryError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT manifest, body, state, created_at, updated_at
                 FROM skill_registry ORDER BY name, version",
            )?;
            let rows = stmt.query_map([], row_to_record)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        Ok(rows)
    }

    /// Move `name@version` to `next`, enforcing the transition table and
    /// auditing the change.
    ///
    /// # Errors
    ///
    /// [`RegistryError::IllegalTransition`] when the move is not legal,
    /// [`RegistryError::NotFound`] when the pair does not exist.
    pub fn set_state(
        &self,
        name: &str,
        version: &str,
        next: SkillState,
        actor: &str,
    ) -> Result<SkillRecord, RegistryError> {
        let record = self.get_exact(name, version)?;
        if !record.state.can_transition_to(next) {
            return Err(RegistryError::IllegalTransition {
                name: name.to_string(),
                version: version.to_string(),
                from: record.state.as_str(),
                to: next.as_str(),
            });
        }

        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE skill_registry SET state = ?3, updated_at = ?4
                 WHERE name = ?1 AND version = ?2",
                rusqlite::params![name, version, next.as_str(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;

        self.audit.record_or_log(
            &NewAuditEntry::new("system", AuditEventType::SkillStateChanged)
                .user(actor)
                .payload(json!({
                    "name": name,
                    "version": version,
                    "from": record.state.as_str(),
                    "to": next.as_str(),
                })),
        );
        self.get_exact(name, version)
    }

    /// Record that a deprecated version was selected for an execution.
    pub fn note_deprecated_use(&self, tenant_id: &str, name: &str, version: &str, trace_id: &str) {
        self.audit.record_or_log(
            &NewAuditEntry::new(tenant_id, AuditEventType::SkillDeprecatedUsed)
                .trace(trace_id)
                .payload(json!({ "name": name, "version": version })),
        );
    }

    /// Persist a test run and, when every case passed, move a draft version
    /// to tested.
    ///
    /// # Errors
    ///
    /// Returns a store error on write failure.
    pub fn record_eval(
        &self,
        name: &str,
        version: &str,
        passed: u32,
        total: u32,
        results: &serde_json::Value,
    ) -> Result<(), RegistryError> {
        let results_json = serde_json::to_string(results).map_err(helm_store::StoreError::from)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO eval_results (skill_name, skill_version, passed, total, results, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![name, version, passed, total, results_json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;

        self.audit.record_or_log(
            &NewAuditEntry::new("system", AuditEventType::SkillTested).payload(json!({
                "name": name,
                "version": version,
                "passed": passed,
                "total": total,
            })),
        );

        if passed == total && total > 0
            && let Ok(record) = self.get_exact(name, version)
            && record.state == SkillState::Draft
        {
            self.set_state(name, version, SkillState::Tested, "test-runner")?;
        }
        Ok(())
    }

    fn versions_of(&self, name: &str) -> Result<Vec<SkillRecord>, RegistryError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT manifest, body, state, created_at, updated_at
                 FROM skill_registry WHERE name = ?1",
            )?;
            let rows = stmt.query_map([name], row_to_record)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        Ok(rows)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SkillRecord> {
    let manifest_raw: String = row.get(0)?;
    let state_raw: String = row.get(2)?;
    let created: String = row.get(3)?;
    let updated: String = row.get(4)?;
    let manifest: SkillManifest = serde_json::from_str(&manifest_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(SkillRecord {
        manifest,
        body: row.get(1)?,
        state: SkillState::parse(&state_raw).unwrap_or(SkillState::Draft),
        created_at: created.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        updated_at: updated.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;
    use helm_audit::AuditQuery;

    fn registry() -> (SkillRegistry, AuditLog) {
        let store = Store::open_in_memory().unwrap();
        let audit = AuditLog::new(store.clone());
        (SkillRegistry::new(store, audit.clone()), audit)
    }

    fn manifest(name: &str, version: &str) -> SkillManifest {
        let raw = format!("---\nname: {name}\nversion: {version}\npermissions: [search]\n---\nbody");
        parse_manifest(&raw).unwrap().0
    }

    #[test]
    fn publish_starts_in_draft() {
        let (reg, _) = registry();
        let record = reg.publish(&manifest("triage", "1.0.0"), "instructions").unwrap();
        assert_eq!(record.state, SkillState::Draft);
        assert_eq!(record.body, "instructions");
    }

    #[test]
    fn republish_is_rejected() {
        let (reg, _) = registry();
        reg.publish(&manifest("triage", "1.0.0"), "a").unwrap();
        let err = reg.publish(&manifest("triage", "1.0.0"), "b").unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyPublished { .. }));
        // Original body is untouched.
        assert_eq!(reg.get_exact("triage", "1.0.0").unwrap().body, "a");
    }

    #[test]
    fn get_prefers_active_over_approved_and_higher_versions() {
        let (reg, _) = registry();
        for version in ["1.0.0", "1.1.0", "2.0.0"] {
            reg.publish(&manifest("triage", version), "b").unwrap();
        }
        // 1.0.0 → active, 2.0.0 → approved, 1.1.0 stays draft.
        for (version, states) in [
            ("1.0.0", vec![SkillState::Tested, SkillState::Approved, SkillState::Active]),
            ("2.0.0", vec![SkillState::Tested, SkillState::Approved]),
        ] {
            for state in states {
                reg.set_state("triage", version, state, "ops").unwrap();
            }
        }

        let resolved = reg.get("triage").unwrap();
        assert_eq!(resolved.manifest.version, "1.0.0", "active beats a newer approved");

        let any = reg.get_any_state("triage").unwrap();
        assert_eq!(any.manifest.version, "2.0.0");
    }

    #[test]
    fn get_without_promotable_version_fails() {
        let (reg, _) = registry();
        reg.publish(&manifest("triage", "1.0.0"), "b").unwrap();
        assert!(matches!(reg.get("triage"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let (reg, _) = registry();
        reg.publish(&manifest("triage", "1.0.0"), "b").unwrap();
        let err = reg
            .set_state("triage", "1.0.0", SkillState::Active, "ops")
            .unwrap_err();
        assert!(matches!(err, RegistryError::IllegalTransition { .. }));
    }

    #[test]
    fn deprecated_never_reactivates() {
        let (reg, _) = registry();
        reg.publish(&manifest("triage", "1.0.0"), "b").unwrap();
        reg.set_state("triage", "1.0.0", SkillState::Deprecated, "ops").unwrap();
        assert!(reg
            .set_state("triage", "1.0.0", SkillState::Active, "ops")
            .is_err());
    }

    #[test]
    fn transitions_are_audited() {
        let (reg, audit) = registry();
        reg.publish(&manifest("triage", "1.0.0"), "b").unwrap();
        reg.set_state("triage", "1.0.0", SkillState::Tested, "ops").unwrap();

        let changed = audit
            .query(&AuditQuery {
                event_types: vec![AuditEventType::SkillStateChanged],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(changed.total, 1);
        assert_eq!(changed.entries[0].payload["to"], "tested");
    }

    #[test]
    fn deprecated_use_is_audited_per_execution() {
        let (reg, audit) = registry();
        reg.note_deprecated_use("t1", "triage", "1.0.0", "tr_1");
        reg.note_deprecated_use("t1", "triage", "1.0.0", "tr_2");

        let page = audit
            .query(&AuditQuery {
                event_types: vec![AuditEventType::SkillDeprecatedUsed],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 2);
    }

    #[test]
    fn passing_eval_promotes_draft_to_tested() {
        let (reg, _) = registry();
        reg.publish(&manifest("triage", "1.0.0"), "b").unwrap();
        reg.record_eval("triage", "1.0.0", 3, 3, &serde_json::json!([])).unwrap();
        assert_eq!(
            reg.get_exact("triage", "1.0.0").unwrap().state,
            SkillState::Tested
        );
    }

    #[test]
    fn failing_eval_keeps_draft() {
        let (reg, _) = registry();
        reg.publish(&manifest("triage", "1.0.0"), "b").unwrap();
        reg.record_eval("triage", "1.0.0", 2, 3, &serde_json::json!([])).unwrap();
        assert_eq!(
            reg.get_exact("triage", "1.0.0").unwrap().state,
            SkillState::Draft
        );
    }

    #[test]
    fn list_by_state_filters() {
        let (reg, _) = registry();
        reg.publish(&manifest("a", "1.0.0"), "b").unwrap();
        reg.publish(&manifest("b", "1.0.0"), "b").unwrap();
        reg.set_state("a", "1.0.0", SkillState::Tested, "ops").unwrap();

        let drafts = reg.list_by_state(SkillState::Draft).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].manifest.name, "b");
    }
}
