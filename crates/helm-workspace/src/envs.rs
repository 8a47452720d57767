// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workspace environments and pins.
//!
//! An environment is a named binding (dev, staging, prod) from a workspace
//! to a snapshot hash. A pin is the resolver's final source of truth for
//! `(workspace, environment)`: the snapshot hash, the skill versions, and an
//! optional model/provider override. Promotion copies the source
//! environment's hash into the target environment *and* its pin in one
//! transaction, subject to the target's lock.

use crate::WorkspaceError;
use chrono::{DateTime, Utc};
use helm_audit::{AuditLog, NewAuditEntry};
use helm_core::AuditEventType;
use helm_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

/// The standard promotion chain.
pub const STANDARD_ENVIRONMENTS: &[&str] = &["dev", "staging", "prod"];

/// One named environment binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEnvironment {
    /// Workspace the environment belongs to.
    pub workspace_id: String,
    /// Environment name.
    pub name: String,
    /// Operator description.
    pub description: String,
    /// Snapshot hash the environment currently references.
    pub version_hash: Option<String>,
    /// Whether this is the workspace's default environment.
    pub is_default: bool,
    /// A locked environment cannot be deleted or overwritten except via a
    /// successful promotion into it; and promotion refuses locked targets,
    /// so unlocking is a deliberate operator action.
    pub locked: bool,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

/// Resolver pin for `(workspace, environment)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    /// Workspace.
    pub workspace_id: String,
    /// Environment.
    pub environment: String,
    /// Pinned snapshot hash.
    pub version_hash: Option<String>,
    /// Skill name → pinned version.
    #[serde(default)]
    pub skill_pins: BTreeMap<String, String>,
    /// Pinned model, when overridden.
    pub model: Option<String>,
    /// Pinned provider, when overridden.
    pub provider: Option<String>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

/// Environment + pin repository over the shared store.
#[derive(Debug, Clone)]
pub struct EnvironmentManager {
    store: Store,
    audit: AuditLog,
}

impl EnvironmentManager {
    /// Wrap the shared store and audit log.
    #[must_use]
    pub fn new(store: Store, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Create or update an environment. Setting `is_default` clears any
    /// prior default in the same transaction, keeping the single-default
    /// invariant.
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::PromotionRefused`] when overwriting a locked
    /// environment's hash outside promotion, or a store error on failure.
    pub fn upsert_environment(
        &self,
        workspace_id: &str,
        name: &str,
        description: &str,
        version_hash: Option<&str>,
        is_default: bool,
        locked: bool,
    ) -> Result<WorkspaceEnvironment, WorkspaceError> {
        if let Some(existing) = self.get_environment(workspace_id, name)?
            && existing.locked
            && version_hash.is_some()
            && version_hash != existing.version_hash.as_deref()
        {
            return Err(WorkspaceError::PromotionRefused(format!(
                "environment '{name}' is locked"
            )));
        }

        let now = Utc::now();
        self.store.with_tx(|tx| {
            if is_default {
                tx.execute(
                    "UPDATE workspace_environments SET is_default = 0 WHERE workspace_id = ?1",
                    [workspace_id],
                )?;
            }
            tx.execute(
                "INSERT INTO workspace_environments
                     (workspace_id, name, description, version_hash, is_default, locked, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (workspace_id, name) DO UPDATE SET
                     description = excluded.description,
                     version_hash = COALESCE(excluded.version_hash, workspace_environments.version_hash),
                     is_default = excluded.is_default,
                     locked = excluded.locked,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    workspace_id,
                    name,
                    description,
                    version_hash,
                    is_default as i64,
                    locked as i64,
                    now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        Ok(self
            .get_environment(workspace_id, name)?
            .expect("environment upserted above"))
    }

    /// Fetch one environment.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn get_environment(
        &self,
        workspace_id: &str,
        name: &str,
    ) -> Result<Option<WorkspaceEnvironment>, WorkspaceError> {
        let row = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT workspace_id, name, description, version_hash, is_default, locked, updated_at
                 FROM workspace_environments WHERE workspace_id = ?1 AND name = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![workspace_id, name])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_environment(row)?)),
                None => Ok(None),
            }
        })?;
        Ok(row)
    }

    /// All environments of a workspace, in name order.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn list_environments(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<WorkspaceEnvironment>, WorkspaceError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT workspace_id, name, description, version_hash, is_default, locked, updated_at
                 FROM workspace_environments WHERE workspace_id = ?1 ORDER BY name",
            )?;
            let rows = stmt.query_map([workspace_id], row_to_environment)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        Ok(rows)
    }

    /// Create the standard dev/staging/prod chain with prod locked.
    ///
    /// # Errors
    ///
    /// Returns a store error on write failure.
    pub fn initialize_standard(
        &self,
        workspace_id: &str,
        default_env: &str,
    ) -> Result<Vec<WorkspaceEnvironment>, WorkspaceError> {
        for name in STANDARD_ENVIRONMENTS {
            self.upsert_environment(
                workspace_id,
                name,
                &format!("{name} environment"),
                None,
                *name == default_env,
                *name == "prod",
            )?;
        }
        self.list_environments(workspace_id)
    }

    /// Promote `source`'s snapshot hash into `target`, updating the target
    /// environment and the target pin atomically.
    ///
    /// Refused when: the source has no hash, the target is locked, or the
    /// source is `prod` (the chain only moves dev → staging → prod).
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::PromotionRefused`] on a failed precondition,
    /// [`WorkspaceError::UnknownEnvironment`] when either side is missing.
    pub fn promote(
        &self,
        workspace_id: &str,
        source: &str,
        target: &str,
    ) -> Result<WorkspaceEnvironment, WorkspaceError> {
        if source == "prod" {
            return Err(WorkspaceError::PromotionRefused(
                "prod is never a promotion source".to_string(),
            ));
        }

        let source_env = self
            .get_environment(workspace_id, source)?
            .ok_or_else(|| WorkspaceError::UnknownEnvironment(source.to_string()))?;
        let target_env = self
            .get_environment(workspace_id, target)?
            .ok_or_else(|| WorkspaceError::UnknownEnvironment(target.to_string()))?;

        let Some(hash) = source_env.version_hash else {
            return Err(WorkspaceError::PromotionRefused(format!(
                "environment '{source}' has no snapshot to promote"
            )));
        };
        if target_env.locked {
            return Err(WorkspaceError::PromotionRefused(format!(
                "environment '{target}' is locked"
            )));
        }

        let now = Utc::now().to_rfc3339();
        self.store.with_tx(|tx| {
            tx.execute(
                "UPDATE workspace_environments SET version_hash = ?3, updated_at = ?4
                 WHERE workspace_id = ?1 AND name = ?2",
                rusqlite::params![workspace_id, target, hash, now],
            )?;
            tx.execute(
                "INSERT INTO workspace_pins (workspace_id, environment, version_hash, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (workspace_id, environment) DO UPDATE SET
                     version_hash = excluded.version_hash,
                     updated_at = excluded.updated_at",
                rusqlite::params![workspace_id, target, hash, now],
            )?;
            Ok(())
        })?;

        self.audit.record_or_log(
            &NewAuditEntry::new("system", AuditEventType::WorkspaceChange)
                .workspace(workspace_id)
                .payload(json!({
                    "action": "promote",
                    "source": source,
                    "target": target,
                    "hash": hash,
                })),
        );
        info!(workspace = workspace_id, source, target, %hash, "environment promoted");

        Ok(self
            .get_environment(workspace_id, target)?
            .expect("target environment checked above"))
    }

    // -- pins --------------------------------------------------------------

    /// Create or update a pin.
    ///
    /// # Errors
    ///
    /// Returns a store error on write failure.
    pub fn upsert_pin(
        &self,
        workspace_id: &str,
        environment: &str,
        version_hash: Option<&str>,
        skill_pins: Option<&BTreeMap<String, String>>,
        model: Option<&str>,
        provider: Option<&str>,
    ) -> Result<Pin, WorkspaceError> {
        let skill_json = skill_pins
            .map(serde_json::to_string)
            .transpose()
            .map_err(helm_store::StoreError::from)?;
        let now = Utc::now().to_rfc3339();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workspace_pins
                     (workspace_id, environment, version_hash, skill_pins, model, provider, updated_at)
                 VALUES (?1, ?2, ?3, COALESCE(?4, '{}'), ?5, ?6, ?7)
                 ON CONFLICT (workspace_id, environment) DO UPDATE SET
                     version_hash = COALESCE(excluded.version_hash, workspace_pins.version_hash),
                     skill_pins = COALESCE(?4, workspace_pins.skill_pins),
                     model = COALESCE(excluded.model, workspace_pins.model),
                     provider = COALESCE(excluded.provider, workspace_pins.provider),
                     updated_at = excluded.updated_at",
                rusqlite::params![workspace_id, environment, version_hash, skill_json, model, provider, now],
            )?;
            Ok(())
        })?;
        Ok(self
            .get_pin(workspace_id, environment)?
            .expect("pin upserted above"))
    }

    /// Fetch the pin for `(workspace, environment)`.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn get_pin(
        &self,
        workspace_id: &str,
        environment: &str,
    ) -> Result<Option<Pin>, WorkspaceError> {
        let row = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT workspace_id, environment, version_hash, skill_pins, model, provider, updated_at
                 FROM workspace_pins WHERE workspace_id = ?1 AND environment = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![workspace_id, environment])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_pin(row)?)),
                None => Ok(None),
            }
        })?;
        Ok(row)
    }

    /// All pins of a workspace.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn list_pins(&self, workspace_id: &str) -> Result<Vec<Pin>, WorkspaceError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT workspace_id, environment, version_hash, skill_pins, model, provider, updated_at
                 FROM workspace_pins WHERE workspace_id = ?1 ORDER BY environment",
            )?;
            let rows = stmt.query_map([workspace_id], row_to_pin)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;
        Ok(rows)
    }

    /// Resolve the pin for a request: explicit environment, else the
    /// workspace's default environment, else `dev`.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn resolve_pin(
        &self,
        workspace_id: &str,
        environment: Option<&str>,
    ) -> Result<Option<Pin>, WorkspaceError> {
        let environment = match environment {
            Some(env) => env.to_string(),
            None => self
                .list_environments(workspace_id)?
                .into_iter()
                .find(|e| e.is_default)
                .map_or_else(|| "dev".to_string(), |e| e.name),
        };
        self.get_pin(workspace_id, &environment)
    }
}

fn row_to_environment(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceEnvironment> {
    let updated: String = row.get(6)?;
    Ok(WorkspaceEnvironment {
        workspace_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        version_hash: row.get(3)?,
        is_default: row.get::<_, i64>(4)? != 0,
        locked: row.get::<_, i64>(5)? != 0,
        updated_at: updated.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_pin(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pin> {
    let skills: String = row.get(3)?;
    let updated: String = row.get(6)?;
    Ok(Pin {
        workspace_id: row.get(0)?,
        environment: row.get(1)?,
        version_hash: row.get(2)?,
        skill_pins: serde_json::from_str(&skills).unwrap_or_default(),
        model: row.get(4)?,
        provider: row.get(5)?,
        updated_at: updated.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_audit::AuditQuery;

    fn manager() -> (EnvironmentManager, AuditLog) {
        let store = Store::open_in_memory().unwrap();
        let audit = AuditLog::new(store.clone());
        (EnvironmentManager::new(store, audit.clone()), audit)
    }

    #[test]
    fn standard_init_locks_prod_and_sets_default() {
        let (mgr, _) = manager();
        let envs = mgr.initialize_standard("w1", "dev").unwrap();
        assert_eq!(envs.len(), 3);
        let prod = envs.iter().find(|e| e.name == "prod").unwrap();
        assert!(prod.locked);
        let defaults: Vec<_> = envs.iter().filter(|e| e.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "dev");
    }

    #[test]
    fn setting_default_clears_prior_default() {
        let (mgr, _) = manager();
        mgr.initialize_standard("w1", "dev").unwrap();
        mgr.upsert_environment("w1", "staging", "", None, true, false).unwrap();

        let envs = mgr.list_environments("w1").unwrap();
        let defaults: Vec<_> = envs.iter().filter(|e| e.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "staging");
    }

    #[test]
    fn promote_updates_env_and_pin_atomically() {
        let (mgr, audit) = manager();
        mgr.initialize_standard("w1", "dev").unwrap();
        mgr.upsert_environment("w1", "staging", "", Some("H1"), false, false).unwrap();
        // prod starts unlocked for this scenario
        mgr.upsert_environment("w1", "prod", "", None, false, false).unwrap();

        let promoted = mgr.promote("w1", "staging", "prod").unwrap();
        assert_eq!(promoted.version_hash.as_deref(), Some("H1"));

        let pin = mgr.get_pin("w1", "prod").unwrap().unwrap();
        assert_eq!(pin.version_hash.as_deref(), Some("H1"));

        let page = audit
            .query(&AuditQuery {
                event_types: vec![helm_core::AuditEventType::WorkspaceChange],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn promote_refuses_locked_target_without_mutation() {
        let (mgr, _) = manager();
        mgr.initialize_standard("w1", "dev").unwrap();
        mgr.upsert_environment("w1", "staging", "", Some("H1"), false, false).unwrap();

        let err = mgr.promote("w1", "staging", "prod").unwrap_err();
        assert!(matches!(err, WorkspaceError::PromotionRefused(_)));

        let prod = mgr.get_environment("w1", "prod").unwrap().unwrap();
        assert!(prod.version_hash.is_none(), "no mutation on refusal");
        assert!(mgr.get_pin("w1", "prod").unwrap().is_none());
    }

    #[test]
    fn promote_refuses_empty_source_and_prod_source() {
        let (mgr, _) = manager();
        mgr.initialize_standard("w1", "dev").unwrap();

        assert!(matches!(
            mgr.promote("w1", "dev", "staging"),
            Err(WorkspaceError::PromotionRefused(_))
        ));
        assert!(matches!(
            mgr.promote("w1", "prod", "staging"),
            Err(WorkspaceError::PromotionRefused(_))
        ));
    }

    #[test]
    fn locked_env_hash_cannot_be_overwritten_directly() {
        let (mgr, _) = manager();
        mgr.initialize_standard("w1", "dev").unwrap();
        let err = mgr
            .upsert_environment("w1", "prod", "", Some("H9"), false, true)
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::PromotionRefused(_)));
    }

    #[test]
    fn pin_upsert_merges_fields() {
        let (mgr, _) = manager();
        let pins = BTreeMap::from([("triage".to_string(), "1.0.0".to_string())]);
        mgr.upsert_pin("w1", "dev", Some("H1"), Some(&pins), None, None).unwrap();
        mgr.upsert_pin("w1", "dev", None, None, Some("gpt-4o"), Some("openai")).unwrap();

        let pin = mgr.get_pin("w1", "dev").unwrap().unwrap();
        assert_eq!(pin.version_hash.as_deref(), Some("H1"), "hash survives partial update");
        assert_eq!(pin.skill_pins["triage"], "1.0.0");
        assert_eq!(pin.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn resolve_pin_prefers_explicit_then_default() {
        let (mgr, _) = manager();
        mgr.initialize_standard("w1", "staging").unwrap();
        mgr.upsert_pin("w1", "dev", Some("HD"), None, None, None).unwrap();
        mgr.upsert_pin("w1", "staging", Some("HS"), None, None, None).unwrap();

        let explicit = mgr.resolve_pin("w1", Some("dev")).unwrap().unwrap();
        assert_eq!(explicit.version_hash.as_deref(), Some("HD"));

        let defaulted = mgr.resolve_pin("w1", None).unwrap().unwrap();
        assert_eq!(defaulted.version_hash.as_deref(), Some("HS"));
    }
}
