// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistence for sealed traces: save/load under a tenant scope, filtered
//! listing, labels, entity lookups, replay context, and append-only
//! annotations.

use chrono::{DateTime, Utc};
use helm_core::Trace;
use helm_store::{Store, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Repository for sealed traces.
#[derive(Debug, Clone)]
pub struct TraceStore {
    store: Store,
}

/// Filter for [`TraceStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    /// Tenant scope (required for API callers; optional for internal jobs).
    pub tenant_id: Option<String>,
    /// Restrict to one workspace.
    pub workspace_id: Option<String>,
    /// Restrict to one agent role.
    pub agent_role: Option<String>,
    /// `"ok"` or `"error"`.
    pub status: Option<String>,
    /// Page size (default 50).
    pub limit: Option<u32>,
    /// Page offset.
    pub offset: Option<u32>,
}

/// Slim listing row (no steps or messages).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummaryRow {
    /// Trace id.
    pub id: String,
    /// Tenant.
    pub tenant_id: String,
    /// Workspace.
    pub workspace_id: String,
    /// Agent role.
    pub agent_role: String,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// Duration, when sealed.
    pub duration_ms: Option<u64>,
    /// Serving model.
    pub model: String,
    /// Serving provider.
    pub provider: String,
    /// Total tokens.
    pub total_tokens: u64,
    /// Total cost, USD.
    pub cost: f64,
    /// Whether the trace sealed with an error.
    pub errored: bool,
}

/// One page of listing results.
#[derive(Debug, Clone, Serialize)]
pub struct TracePage {
    /// Matching rows, newest first.
    pub items: Vec<TraceSummaryRow>,
    /// Total matches ignoring pagination.
    pub total: u64,
    /// Whether another page exists beyond this one.
    pub has_more: bool,
}

/// Everything needed to replay a traced request against the same versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayContext {
    /// Trace the context was taken from.
    pub trace_id: String,
    /// Original input message.
    pub input_message: String,
    /// Prior-history turn count (content is not retained).
    pub history_len: usize,
    /// Workspace snapshot hash the execution resolved to.
    pub workspace_hash: Option<String>,
    /// Skill versions the execution resolved to.
    pub skill_versions: BTreeMap<String, String>,
    /// Model that served the execution.
    pub model: String,
    /// Provider that served the execution.
    pub provider: String,
}

/// One append-only trace annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Trace the annotation belongs to.
    pub trace_id: String,
    /// Annotation key (`baseline`, `incident`, `reviewed`, `note`, `tag`, …).
    pub key: String,
    /// Annotation value.
    pub value: String,
    /// Who wrote it.
    pub author: String,
    /// When it was written.
    pub created_at: DateTime<Utc>,
}

impl TraceStore {
    /// Wrap the shared store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persist a sealed trace. Re-saving the same id replaces the row (the
    /// orchestrator saves exactly once; replacement covers crash-retry).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on serialization or write failure.
    pub fn save(&self, trace: &Trace) -> StoreResult<()> {
        let steps = serde_json::to_string(&trace.steps)?;
        let skill_versions = serde_json::to_string(&trace.skill_versions)?;
        let labels = serde_json::to_string(&trace.labels)?;
        let output = trace
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO traces
                     (id, tenant_id, workspace_id, agent_role, started_at, completed_at,
                      duration_ms, workspace_hash, skill_versions, model, provider,
                      input_message, history_len, steps, output, prompt_tokens,
                      completion_tokens, total_tokens, cost, redacted_prompt, error,
                      labels, task_id, document_id, message_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
                rusqlite::params![
                    trace.id,
                    trace.tenant_id,
                    trace.workspace_id,
                    trace.agent_role,
                    trace.started_at.to_rfc3339(),
                    trace.completed_at.map(|t| t.to_rfc3339()),
                    trace.duration_ms,
                    trace.workspace_hash,
                    skill_versions,
                    trace.model,
                    trace.provider,
                    trace.input_message,
                    trace.history_len as i64,
                    steps,
                    output,
                    trace.usage.prompt_tokens as i64,
                    trace.usage.completion_tokens as i64,
                    trace.usage.total_tokens as i64,
                    trace.cost,
                    trace.redacted_prompt,
                    trace.error,
                    labels,
                    trace.entities.task_id,
                    trace.entities.document_id,
                    trace.entities.message_id,
                ],
            )?;
            Ok(())
        })
    }

    /// Load a trace by id under a tenant scope. A trace belonging to another
    /// tenant is indistinguishable from a missing one.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when absent or cross-tenant.
    pub fn load(&self, tenant_id: &str, id: &str) -> StoreResult<Trace> {
        let json = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, workspace_id, agent_role, started_at, completed_at,
                        duration_ms, workspace_hash, skill_versions, model, provider,
                        input_message, history_len, steps, output, prompt_tokens,
                        completion_tokens, cost, redacted_prompt, error, labels,
                        task_id, document_id, message_id
                 FROM traces WHERE id = ?1 AND tenant_id = ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![id, tenant_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_trace(row)?)),
                None => Ok(None),
            }
        })?;
        json.ok_or_else(|| StoreError::NotFound(format!("trace {id}")))
    }

    /// List traces newest first with a total count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn list(&self, filter: &TraceFilter) -> StoreResult<TracePage> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        for (sql, value) in [
            ("tenant_id =", filter.tenant_id.clone()),
            ("workspace_id =", filter.workspace_id.clone()),
            ("agent_role =", filter.agent_role.clone()),
        ] {
            if let Some(v) = value {
                params.push(Box::new(v));
                clauses.push(format!("{sql} ?{}", params.len()));
            }
        }
        match filter.status.as_deref() {
            Some("error") => clauses.push("error IS NOT NULL".to_string()),
            Some("ok") => clauses.push("error IS NULL".to_string()),
            _ => {}
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = filter.limit.unwrap_or(50);
        let offset = filter.offset.unwrap_or(0);

        self.store.with_conn(|conn| {
            let total: u64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM traces{where_sql}"),
                rusqlite::params_from_iter(params.iter().map(|p| &**p)),
                |row| row.get::<_, i64>(0),
            )? as u64;

            let sql = format!(
                "SELECT id, tenant_id, workspace_id, agent_role, started_at, duration_ms,
                        model, provider, total_tokens, cost, error
                 FROM traces{where_sql}
                 ORDER BY id DESC LIMIT {limit} OFFSET {offset}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(params.iter().map(|p| &**p)),
                |row| {
                    let started: String = row.get(4)?;
                    let error: Option<String> = row.get(10)?;
                    Ok(TraceSummaryRow {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        workspace_id: row.get(2)?,
                        agent_role: row.get(3)?,
                        started_at: started
                            .parse::<DateTime<Utc>>()
                            .unwrap_or_else(|_| Utc::now()),
                        duration_ms: row.get::<_, Option<i64>>(5)?.map(|d| d.max(0) as u64),
                        model: row.get(6)?,
                        provider: row.get(7)?,
                        total_tokens: row.get::<_, i64>(8)?.max(0) as u64,
                        cost: row.get(9)?,
                        errored: error.is_some(),
                    })
                },
            )?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            let has_more = (offset as u64 + items.len() as u64) < total;
            Ok(TracePage {
                items,
                total,
                has_more,
            })
        })
    }

    /// Merge labels into a sealed trace. Labels are the one mutable field.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the trace is absent or cross-tenant.
    pub fn merge_labels(
        &self,
        tenant_id: &str,
        id: &str,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<()> {
        let mut trace = self.load(tenant_id, id)?;
        for (k, v) in labels {
            trace.labels.insert(k.clone(), v.clone());
        }
        let serialized = serde_json::to_string(&trace.labels)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE traces SET labels = ?3 WHERE id = ?1 AND tenant_id = ?2",
                rusqlite::params![id, tenant_id, serialized],
            )?;
            Ok(())
        })
    }

    /// Find traces carrying a `key=value` label.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn find_by_label(
        &self,
        tenant_id: &str,
        key: &str,
        value: &str,
    ) -> StoreResult<Vec<String>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM traces
                 WHERE tenant_id = ?1 AND json_extract(labels, '$.' || ?2) = ?3
                 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(rusqlite::params![tenant_id, key, value], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// Find traces linked to a control-plane entity. Exactly one of the ids
    /// should be set; the first present one wins.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure, or [`StoreError::Invalid`]
    /// when no entity id was given.
    pub fn find_by_entity(
        &self,
        tenant_id: &str,
        task_id: Option<&str>,
        document_id: Option<&str>,
        message_id: Option<&str>,
    ) -> StoreResult<Vec<String>> {
        let (column, value) = if let Some(v) = task_id {
            ("task_id", v)
        } else if let Some(v) = document_id {
            ("document_id", v)
        } else if let Some(v) = message_id {
            ("message_id", v)
        } else {
            return Err(StoreError::Invalid(
                "one of task_id, document_id, message_id is required".to_string(),
            ));
        };
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM traces WHERE tenant_id = ?1 AND {column} = ?2 ORDER BY id DESC"
            ))?;
            let rows = stmt.query_map(rusqlite::params![tenant_id, value], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// Replay context for one trace.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when absent or cross-tenant.
    pub fn replay_context(&self, tenant_id: &str, id: &str) -> StoreResult<ReplayContext> {
        let trace = self.load(tenant_id, id)?;
        Ok(ReplayContext {
            trace_id: trace.id,
            input_message: trace.input_message,
            history_len: trace.history_len,
            workspace_hash: trace.workspace_hash,
            skill_versions: trace.skill_versions,
            model: trace.model,
            provider: trace.provider,
        })
    }

    /// Delete traces older than `cutoff` for one tenant. Retention only.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on write failure.
    pub fn delete_older_than(
        &self,
        tenant_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<usize> {
        self.store.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM traces WHERE tenant_id = ?1 AND started_at < ?2",
                rusqlite::params![tenant_id, cutoff.to_rfc3339()],
            )?;
            Ok(removed)
        })
    }

    /// Count traces per tenant, for retention stats.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn count_for_tenant(&self, tenant_id: &str) -> StoreResult<u64> {
        self.store.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM traces WHERE tenant_id = ?1",
                [tenant_id],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }

    // -- annotations -------------------------------------------------------

    /// Append an annotation. Annotations are never updated or deleted.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] when the trace is absent or cross-tenant.
    pub fn annotate(
        &self,
        tenant_id: &str,
        trace_id: &str,
        key: &str,
        value: &str,
        author: &str,
    ) -> StoreResult<Annotation> {
        // Existence check keeps annotations tenant-scoped.
        self.load(tenant_id, trace_id)?;
        let annotation = Annotation {
            trace_id: trace_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            author: author.to_string(),
            created_at: Utc::now(),
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trace_annotations (trace_id, key, value, author, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    annotation.trace_id,
                    annotation.key,
                    annotation.value,
                    annotation.author,
                    annotation.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(annotation)
    }

    /// All annotations for a trace, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn annotations(&self, trace_id: &str) -> StoreResult<Vec<Annotation>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT trace_id, key, value, author, created_at
                 FROM trace_annotations WHERE trace_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([trace_id], |row| {
                let created: String = row.get(4)?;
                Ok(Annotation {
                    trace_id: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                    author: row.get(3)?,
                    created_at: created
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

fn row_to_trace(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trace> {
    use helm_core::{EntityLinks, TokenUsage};

    let started: String = row.get(4)?;
    let completed: Option<String> = row.get(5)?;
    let skill_versions: String = row.get(8)?;
    let steps: String = row.get(13)?;
    let output: Option<String> = row.get(14)?;
    let labels: String = row.get(20)?;
    let prompt_tokens = row.get::<_, i64>(15)?.max(0) as u64;
    let completion_tokens = row.get::<_, i64>(16)?.max(0) as u64;

    Ok(Trace {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        workspace_id: row.get(2)?,
        agent_role: row.get(3)?,
        started_at: started.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        completed_at: completed.and_then(|t| t.parse::<DateTime<Utc>>().ok()),
        duration_ms: row.get::<_, Option<i64>>(6)?.map(|d| d.max(0) as u64),
        workspace_hash: row.get(7)?,
        skill_versions: serde_json::from_str(&skill_versions).unwrap_or_default(),
        model: row.get(9)?,
        provider: row.get(10)?,
        input_message: row.get(11)?,
        history_len: row.get::<_, i64>(12)?.max(0) as usize,
        steps: serde_json::from_str(&steps).unwrap_or_default(),
        output: output.and_then(|o| serde_json::from_str(&o).ok()),
        usage: TokenUsage::new(prompt_tokens, completion_tokens),
        cost: row.get(17)?,
        redacted_prompt: row.get(18)?,
        error: row.get(19)?,
        labels: serde_json::from_str(&labels).unwrap_or_default(),
        entities: EntityLinks {
            task_id: row.get(21)?,
            document_id: row.get(22)?,
            message_id: row.get(23)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TraceBuilder;
    use helm_core::StepDetail;

    fn sealed_trace(tenant: &str) -> Trace {
        let mut b = TraceBuilder::new(tenant, "w1", "assistant", "gpt-4o-mini", "openai", "hi", 0);
        b.push_step(
            StepDetail::LlmCall {
                model: "gpt-4o-mini".into(),
                provider: "openai".into(),
                input_tokens: 120,
                output_tokens: 40,
                cost: 0.0003,
            },
            25,
        );
        b.seal("hello back")
    }

    fn store() -> TraceStore {
        TraceStore::new(Store::open_in_memory().unwrap())
    }

    #[test]
    fn save_then_load_roundtrips() {
        let store = store();
        let trace = sealed_trace("t1");
        store.save(&trace).unwrap();
        let loaded = store.load("t1", &trace.id).unwrap();
        assert_eq!(loaded, trace);
    }

    #[test]
    fn cross_tenant_load_is_not_found() {
        let store = store();
        let trace = sealed_trace("t1");
        store.save(&trace).unwrap();
        let err = store.load("t2", &trace.id).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_filters_by_status() {
        let store = store();
        store.save(&sealed_trace("t1")).unwrap();
        let failed = TraceBuilder::new("t1", "w1", "assistant", "gpt-4o-mini", "openai", "x", 0)
            .seal_with_error("timeout", "boom");
        store.save(&failed).unwrap();

        let errors = store
            .list(&TraceFilter {
                tenant_id: Some("t1".into()),
                status: Some("error".into()),
                ..TraceFilter::default()
            })
            .unwrap();
        assert_eq!(errors.total, 1);
        assert!(errors.items[0].errored);

        let ok = store
            .list(&TraceFilter {
                tenant_id: Some("t1".into()),
                status: Some("ok".into()),
                ..TraceFilter::default()
            })
            .unwrap();
        assert_eq!(ok.total, 1);
        assert!(!ok.items[0].errored);
    }

    #[test]
    fn list_pagination_has_more() {
        let store = store();
        for _ in 0..3 {
            store.save(&sealed_trace("t1")).unwrap();
        }
        let page = store
            .list(&TraceFilter {
                tenant_id: Some("t1".into()),
                limit: Some(2),
                ..TraceFilter::default()
            })
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
    }

    #[test]
    fn labels_merge_and_lookup() {
        let store = store();
        let trace = sealed_trace("t1");
        store.save(&trace).unwrap();

        store
            .merge_labels(
                "t1",
                &trace.id,
                &BTreeMap::from([("env".to_string(), "prod".to_string())]),
            )
            .unwrap();

        let ids = store.find_by_label("t1", "env", "prod").unwrap();
        assert_eq!(ids, vec![trace.id.clone()]);
        assert!(store.find_by_label("t1", "env", "dev").unwrap().is_empty());
    }

    #[test]
    fn entity_lookup_requires_an_id() {
        let store = store();
        let err = store.find_by_entity("t1", None, None, None).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn entity_lookup_by_task() {
        let store = store();
        let mut trace = sealed_trace("t1");
        trace.entities.task_id = Some("task-9".into());
        store.save(&trace).unwrap();

        let ids = store.find_by_entity("t1", Some("task-9"), None, None).unwrap();
        assert_eq!(ids, vec![trace.id]);
    }

    #[test]
    fn replay_context_carries_versions() {
        let store = store();
        let mut b = TraceBuilder::new("t1", "w1", "assistant", "gpt-4o", "openai", "replay me", 3);
        b.set_workspace_hash("abc123");
        b.set_skill_versions(BTreeMap::from([(
            "triage".to_string(),
            "1.2.0".to_string(),
        )]));
        let trace = b.seal("ok");
        store.save(&trace).unwrap();

        let ctx = store.replay_context("t1", &trace.id).unwrap();
        assert_eq!(ctx.input_message, "replay me");
        assert_eq!(ctx.history_len, 3);
        assert_eq!(ctx.workspace_hash.as_deref(), Some("abc123"));
        assert_eq!(ctx.skill_versions["triage"], "1.2.0");
    }

    #[test]
    fn annotations_append_only_and_ordered() {
        let store = store();
        let trace = sealed_trace("t1");
        store.save(&trace).unwrap();

        store.annotate("t1", &trace.id, "baseline", "true", "alice").unwrap();
        store.annotate("t1", &trace.id, "note", "checked", "bob").unwrap();

        let notes = store.annotations(&trace.id).unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].key, "baseline");
        assert_eq!(notes[1].author, "bob");
    }

    #[test]
    fn annotating_foreign_trace_fails() {
        let store = store();
        let trace = sealed_trace("t1");
        store.save(&trace).unwrap();
        assert!(store.annotate("t2", &trace.id, "note", "x", "eve").is_err());
    }
}
