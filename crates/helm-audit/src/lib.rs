// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only audit log.
//!
//! Every governance-relevant event in the runtime lands here: execution
//! lifecycle, tool permission decisions, skill lifecycle changes, budget
//! breaches, workspace changes, auth outcomes, and break-glass overrides.
//! Entries are never updated; the only removal path is a compliance-approved
//! bulk purge by cutoff date.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use helm_core::AuditEventType;
use helm_store::{Store, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// One recorded audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Sequential id (monotonic per store).
    pub id: i64,
    /// Tenant the event belongs to.
    pub tenant_id: String,
    /// Workspace, when the event is workspace-scoped.
    pub workspace_id: Option<String>,
    /// Trace, when the event belongs to one execution.
    pub trace_id: Option<String>,
    /// Acting user, when known.
    pub user_id: Option<String>,
    /// Event type from the closed vocabulary.
    pub event_type: AuditEventType,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
    /// Structured payload.
    pub payload: Value,
}

/// A new event to record.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    /// Tenant the event belongs to.
    pub tenant_id: String,
    /// Optional workspace scope.
    pub workspace_id: Option<String>,
    /// Optional trace scope.
    pub trace_id: Option<String>,
    /// Optional acting user.
    pub user_id: Option<String>,
    /// Event type.
    pub event_type: AuditEventType,
    /// Structured payload.
    pub payload: Value,
}

impl NewAuditEntry {
    /// A minimal tenant-scoped event with an empty payload.
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, event_type: AuditEventType) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            workspace_id: None,
            trace_id: None,
            user_id: None,
            event_type,
            payload: Value::Object(serde_json::Map::new()),
        }
    }

    /// Scope the event to a workspace.
    #[must_use]
    pub fn workspace(mut self, id: impl Into<String>) -> Self {
        self.workspace_id = Some(id.into());
        self
    }

    /// Scope the event to a trace.
    #[must_use]
    pub fn trace(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    /// Attribute the event to a user.
    #[must_use]
    pub fn user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Filter for [`AuditLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Restrict to one tenant.
    pub tenant_id: Option<String>,
    /// Restrict to one workspace.
    pub workspace_id: Option<String>,
    /// Restrict to one trace.
    pub trace_id: Option<String>,
    /// Restrict to one acting user.
    pub user_id: Option<String>,
    /// Restrict to any of these event types.
    pub event_types: Vec<AuditEventType>,
    /// Events at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Events strictly before this instant.
    pub to: Option<DateTime<Utc>>,
    /// Page size (default 50).
    pub limit: Option<u32>,
    /// Page offset.
    pub offset: Option<u32>,
}

/// One page of query results.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    /// Matching entries, newest first.
    pub entries: Vec<AuditEntry>,
    /// Total matches ignoring pagination.
    pub total: u64,
}

/// Append-only audit repository over the shared store.
#[derive(Debug, Clone)]
pub struct AuditLog {
    store: Store,
}

impl AuditLog {
    /// Wrap the shared store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append one event. Returns its sequential id.
    ///
    /// # Errors
    ///
    /// Returns [`helm_store::StoreError`] on write failure. Callers on the hot path use
    /// [`AuditLog::record_or_log`] instead.
    pub fn record(&self, entry: &NewAuditEntry) -> StoreResult<i64> {
        let payload = serde_json::to_string(&entry.payload)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log
                     (tenant_id, workspace_id, trace_id, user_id, event_type, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    entry.tenant_id,
                    entry.workspace_id,
                    entry.trace_id,
                    entry.user_id,
                    entry.event_type.as_str(),
                    Utc::now().to_rfc3339(),
                    payload,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Append one event, logging instead of propagating failure.
    ///
    /// Audit persistence failures must not take down the request path, but
    /// they are never silently dropped either.
    pub fn record_or_log(&self, entry: &NewAuditEntry) {
        if let Err(err) = self.record(entry) {
            error!(
                event = entry.event_type.as_str(),
                tenant = %entry.tenant_id,
                error = %err,
                "audit write failed"
            );
        }
    }

    /// Query with any subset of filters, newest first, with a total count.
    ///
    /// # Errors
    ///
    /// Returns [`helm_store::StoreError`] on query failure.
    pub fn query(&self, query: &AuditQuery) -> StoreResult<AuditPage> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        let scalar_filters: [(&str, Option<String>); 6] = [
            ("tenant_id =", query.tenant_id.clone()),
            ("workspace_id =", query.workspace_id.clone()),
            ("trace_id =", query.trace_id.clone()),
            ("user_id =", query.user_id.clone()),
            ("created_at >=", query.from.map(|t| t.to_rfc3339())),
            ("created_at <", query.to.map(|t| t.to_rfc3339())),
        ];
        for (prefix, value) in scalar_filters {
            if let Some(v) = value {
                params.push(Box::new(v));
                clauses.push(format!("{prefix} ?{}", params.len()));
            }
        }
        if !query.event_types.is_empty() {
            let mut placeholders = Vec::new();
            for t in &query.event_types {
                params.push(Box::new(t.as_str().to_string()));
                placeholders.push(format!("?{}", params.len()));
            }
            clauses.push(format!("event_type IN ({})", placeholders.join(", ")));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = query.limit.unwrap_or(50);
        let offset = query.offset.unwrap_or(0);

        self.store.with_conn(|conn| {
            let total: u64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM audit_log{where_sql}"),
                rusqlite::params_from_iter(params.iter().map(|p| &**p)),
                |row| row.get::<_, i64>(0),
            )? as u64;

            let sql = format!(
                "SELECT id, tenant_id, workspace_id, trace_id, user_id, event_type, created_at, payload
                 FROM audit_log{where_sql}
                 ORDER BY id DESC LIMIT {limit} OFFSET {offset}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(params.iter().map(|p| &**p)),
                row_to_entry,
            )?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(AuditPage { entries, total })
        })
    }

    /// All entries for one trace, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`helm_store::StoreError`] on query failure.
    pub fn get_by_trace(&self, trace_id: &str) -> StoreResult<Vec<AuditEntry>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, workspace_id, trace_id, user_id, event_type, created_at, payload
                 FROM audit_log WHERE trace_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([trace_id], row_to_entry)?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    /// The sole removal path: delete entries older than `cutoff`, optionally
    /// restricted to one tenant. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`helm_store::StoreError`] on write failure.
    pub fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
        tenant_id: Option<&str>,
    ) -> StoreResult<usize> {
        self.store.with_conn(|conn| {
            let removed = match tenant_id {
                Some(tenant) => conn.execute(
                    "DELETE FROM audit_log WHERE created_at < ?1 AND tenant_id = ?2",
                    rusqlite::params![cutoff.to_rfc3339(), tenant],
                )?,
                None => conn.execute(
                    "DELETE FROM audit_log WHERE created_at < ?1",
                    rusqlite::params![cutoff.to_rfc3339()],
                )?,
            };
            Ok(removed)
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let event_raw: String = row.get(5)?;
    let created_raw: String = row.get(6)?;
    let payload_raw: String = row.get(7)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        workspace_id: row.get(2)?,
        trace_id: row.get(3)?,
        user_id: row.get(4)?,
        event_type: AuditEventType::parse(&event_raw).unwrap_or(AuditEventType::ConfigChange),
        created_at: created_raw
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> AuditLog {
        AuditLog::new(Store::open_in_memory().unwrap())
    }

    #[test]
    fn record_assigns_monotonic_ids() {
        let log = log();
        let a = log
            .record(&NewAuditEntry::new("t1", AuditEventType::AgentExecutionStarted))
            .unwrap();
        let b = log
            .record(&NewAuditEntry::new("t1", AuditEventType::AgentExecutionCompleted))
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn query_filters_by_tenant_and_type() {
        let log = log();
        log.record(&NewAuditEntry::new("t1", AuditEventType::AuthSuccess)).unwrap();
        log.record(&NewAuditEntry::new("t1", AuditEventType::AuthFailure)).unwrap();
        log.record(&NewAuditEntry::new("t2", AuditEventType::AuthFailure)).unwrap();

        let page = log
            .query(&AuditQuery {
                tenant_id: Some("t1".into()),
                event_types: vec![AuditEventType::AuthFailure],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].tenant_id, "t1");
        assert_eq!(page.entries[0].event_type, AuditEventType::AuthFailure);
    }

    #[test]
    fn query_paginates_with_total() {
        let log = log();
        for _ in 0..5 {
            log.record(&NewAuditEntry::new("t1", AuditEventType::RateLimited)).unwrap();
        }
        let page = log
            .query(&AuditQuery {
                tenant_id: Some("t1".into()),
                limit: Some(2),
                offset: Some(2),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.entries.len(), 2);
    }

    #[test]
    fn by_trace_is_chronological() {
        let log = log();
        for event in [
            AuditEventType::AgentExecutionStarted,
            AuditEventType::ToolCallRequested,
            AuditEventType::AgentExecutionCompleted,
        ] {
            log.record(&NewAuditEntry::new("t1", event).trace("tr_1")).unwrap();
        }
        log.record(&NewAuditEntry::new("t1", AuditEventType::AuthSuccess).trace("tr_2")).unwrap();

        let entries = log.get_by_trace("tr_1").unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(entries[0].event_type, AuditEventType::AgentExecutionStarted);
    }

    #[test]
    fn payload_roundtrips() {
        let log = log();
        log.record(
            &NewAuditEntry::new("t1", AuditEventType::ToolPermissionDenied)
                .trace("tr_9")
                .payload(json!({"tool": "delete_user", "reason": "skill"})),
        )
        .unwrap();
        let entries = log.get_by_trace("tr_9").unwrap();
        assert_eq!(entries[0].payload["reason"], "skill");
    }

    #[test]
    fn purge_respects_tenant_scope() {
        let log = log();
        log.record(&NewAuditEntry::new("t1", AuditEventType::AuthSuccess)).unwrap();
        log.record(&NewAuditEntry::new("t2", AuditEventType::AuthSuccess)).unwrap();

        let removed = log
            .purge_older_than(Utc::now() + chrono::Duration::minutes(1), Some("t1"))
            .unwrap();
        assert_eq!(removed, 1);

        let all = log.query(&AuditQuery::default()).unwrap();
        assert_eq!(all.total, 1);
        assert_eq!(all.entries[0].tenant_id, "t2");
    }

    #[test]
    fn time_range_filters() {
        let log = log();
        log.record(&NewAuditEntry::new("t1", AuditEventType::AuthSuccess)).unwrap();
        let future_only = log
            .query(&AuditQuery {
                from: Some(Utc::now() + chrono::Duration::hours(1)),
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(future_only.total, 0);
    }
}
