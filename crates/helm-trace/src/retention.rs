// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-tenant retention policies: sampling at admission, deletion at age.
//!
//! Sampling is applied once, before a trace is persisted; there is no
//! retroactive re-sampling. The sampled strategy is deterministic over the
//! trace id so a given execution is either always or never admitted,
//! independent of process restarts.

use chrono::{DateTime, Duration, Utc};
use helm_core::Trace;
use helm_store::{Store, StoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::store::TraceStore;

/// How traces are admitted for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Persist every trace.
    Full,
    /// Persist only traces that sealed with an error.
    ErrorsOnly,
    /// Persist a deterministic fraction of traces (errors always kept).
    Sampled {
        /// Admission rate in `[0, 1]`.
        rate: f64,
    },
}

impl SamplingStrategy {
    fn as_column(&self) -> String {
        match self {
            Self::Full => "full".to_string(),
            Self::ErrorsOnly => "errors_only".to_string(),
            Self::Sampled { rate } => format!("sampled:{rate}"),
        }
    }

    fn from_column(raw: &str) -> Self {
        match raw {
            "full" => Self::Full,
            "errors_only" => Self::ErrorsOnly,
            other => match other.strip_prefix("sampled:").and_then(|r| r.parse().ok()) {
                Some(rate) => Self::Sampled { rate },
                None => Self::Full,
            },
        }
    }

    /// Nominal fraction of traces this strategy admits, for coverage stats.
    #[must_use]
    pub fn coverage(&self) -> f64 {
        match self {
            Self::Full => 1.0,
            Self::ErrorsOnly => 0.0,
            Self::Sampled { rate } => rate.clamp(0.0, 1.0),
        }
    }
}

/// One tenant's retention policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Tenant the policy governs.
    pub tenant_id: String,
    /// Traces older than this many days are deleted by enforcement.
    pub retention_days: u32,
    /// Admission sampling.
    pub sampling: SamplingStrategy,
    /// Storage mode label (informational; e.g. `standard`, `archival`).
    pub storage_mode: String,
    /// Last policy update.
    pub updated_at: DateTime<Utc>,
}

/// Coverage stats for operator dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RetentionStats {
    /// Tenant.
    pub tenant_id: String,
    /// Stored trace count.
    pub stored_traces: u64,
    /// Retention window in days.
    pub retention_days: u32,
    /// Nominal admission coverage (share of traces captured).
    pub coverage: f64,
    /// Sampling strategy in effect.
    pub sampling: SamplingStrategy,
}

/// Retention policy repository + enforcement.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    store: Store,
    traces: TraceStore,
}

impl RetentionManager {
    /// Wrap the shared store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        let traces = TraceStore::new(store.clone());
        Self { store, traces }
    }

    /// Create or replace a tenant's policy.
    ///
    /// # Errors
    ///
    /// Returns a store error on write failure.
    pub fn set_policy(
        &self,
        tenant_id: &str,
        retention_days: u32,
        sampling: SamplingStrategy,
        storage_mode: &str,
    ) -> StoreResult<RetentionPolicy> {
        let policy = RetentionPolicy {
            tenant_id: tenant_id.to_string(),
            retention_days,
            sampling,
            storage_mode: storage_mode.to_string(),
            updated_at: Utc::now(),
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tenant_retention_policies
                     (tenant_id, retention_days, sampling, storage_mode, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    policy.tenant_id,
                    policy.retention_days,
                    policy.sampling.as_column(),
                    policy.storage_mode,
                    policy.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(policy)
    }

    /// Fetch a tenant's policy, if configured.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn get_policy(&self, tenant_id: &str) -> StoreResult<Option<RetentionPolicy>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tenant_id, retention_days, sampling, storage_mode, updated_at
                 FROM tenant_retention_policies WHERE tenant_id = ?1",
            )?;
            let mut rows = stmt.query([tenant_id])?;
            match rows.next()? {
                Some(row) => {
                    let sampling: String = row.get(2)?;
                    let updated: String = row.get(4)?;
                    Ok(Some(RetentionPolicy {
                        tenant_id: row.get(0)?,
                        retention_days: row.get(1)?,
                        sampling: SamplingStrategy::from_column(&sampling),
                        storage_mode: row.get(3)?,
                        updated_at: updated
                            .parse::<DateTime<Utc>>()
                            .unwrap_or_else(|_| Utc::now()),
                    }))
                }
                None => Ok(None),
            }
        })
    }

    /// Decide whether `trace` should be persisted at all.
    ///
    /// Tenants without a policy admit everything. Error traces are always
    /// admitted under `errors_only` and `sampled`.
    ///
    /// # Errors
    ///
    /// Returns a store error on policy lookup failure.
    pub fn admit(&self, trace: &Trace) -> StoreResult<bool> {
        let Some(policy) = self.get_policy(&trace.tenant_id)? else {
            return Ok(true);
        };
        Ok(match policy.sampling {
            SamplingStrategy::Full => true,
            SamplingStrategy::ErrorsOnly => trace.error.is_some(),
            SamplingStrategy::Sampled { rate } => {
                trace.error.is_some() || sample_bucket(&trace.id) < rate.clamp(0.0, 1.0)
            }
        })
    }

    /// Enforce every tenant's retention window. Returns `(tenant, deleted)`
    /// pairs for tenants where anything was removed.
    ///
    /// # Errors
    ///
    /// Returns a store error on the first failed delete.
    pub fn enforce(&self) -> StoreResult<Vec<(String, usize)>> {
        let policies = self.all_policies()?;
        let mut removed = Vec::new();
        for policy in policies {
            let cutoff = Utc::now() - Duration::days(i64::from(policy.retention_days));
            let deleted = self.traces.delete_older_than(&policy.tenant_id, cutoff)?;
            if deleted > 0 {
                info!(
                    tenant = %policy.tenant_id,
                    deleted,
                    retention_days = policy.retention_days,
                    "retention enforced"
                );
                removed.push((policy.tenant_id, deleted));
            }
        }
        Ok(removed)
    }

    /// Coverage stats for every tenant with a policy.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn stats(&self) -> StoreResult<Vec<RetentionStats>> {
        let policies = self.all_policies()?;
        let mut out = Vec::new();
        for policy in policies {
            let stored = self.traces.count_for_tenant(&policy.tenant_id)?;
            out.push(RetentionStats {
                tenant_id: policy.tenant_id.clone(),
                stored_traces: stored,
                retention_days: policy.retention_days,
                coverage: policy.sampling.coverage(),
                sampling: policy.sampling,
            });
        }
        Ok(out)
    }

    fn all_policies(&self) -> StoreResult<Vec<RetentionPolicy>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tenant_id, retention_days, sampling, storage_mode, updated_at
                 FROM tenant_retention_policies ORDER BY tenant_id",
            )?;
            let rows = stmt.query_map([], |row| {
                let sampling: String = row.get(2)?;
                let updated: String = row.get(4)?;
                Ok(RetentionPolicy {
                    tenant_id: row.get(0)?,
                    retention_days: row.get(1)?,
                    sampling: SamplingStrategy::from_column(&sampling),
                    storage_mode: row.get(3)?,
                    updated_at: updated
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

/// Deterministic `[0, 1)` bucket for a trace id.
fn sample_bucket(trace_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(trace_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) as f64 / u64::MAX as f64
}
