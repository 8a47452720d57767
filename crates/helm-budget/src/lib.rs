// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-tenant budget windows, pre-execution forecasting, and enforcement.
//!
//! Each tenant carries a monetary limit over a period window (defaulting to
//! the current calendar month), a monotonically non-decreasing spent amount,
//! a hard-limit flag, an alert fraction, and an optional soft limit. The
//! orchestrator forecasts before every execution and records actual spend
//! after; breaches emit `budget_warning` / `budget_exceeded` audit events.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Datelike, TimeZone, Utc};
use helm_audit::{AuditLog, NewAuditEntry};
use helm_core::{AuditEventType, TokenUsage, cost_for};
use helm_store::{Store, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One tenant's budget row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantBudget {
    /// Tenant this budget governs.
    pub tenant_id: String,
    /// Monetary limit for the period, USD.
    pub limit_usd: f64,
    /// Amount spent so far in the period, USD. Monotonic within a period.
    pub spent_usd: f64,
    /// Period window start.
    pub period_start: DateTime<Utc>,
    /// Period window end.
    pub period_end: DateTime<Utc>,
    /// When true, a would-exceed forecast blocks execution.
    pub hard_limit: bool,
    /// Fraction of the limit at which warnings start (e.g. 0.8).
    pub alert_threshold: f64,
    /// Optional soft limit below the hard one; crossing it warns.
    pub soft_limit_usd: Option<f64>,
}

impl TenantBudget {
    /// Remaining headroom, floored at zero.
    #[must_use]
    pub fn remaining(&self) -> f64 {
        (self.limit_usd - self.spent_usd).max(0.0)
    }

    /// Whether the period window has ended.
    #[must_use]
    pub fn period_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.period_end
    }
}

/// Deterministic pre-execution cost estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostForecast {
    /// Total estimated cost, USD.
    pub estimated: f64,
    /// Input-side share of the estimate.
    pub input_cost: f64,
    /// Output-side share of the estimate (at the requested max).
    pub output_cost: f64,
    /// Whether execution may proceed.
    pub allowed: bool,
    /// Remaining headroom, when the tenant has a budget.
    pub remaining: Option<f64>,
    /// Whether `spent + estimated` would cross the limit.
    pub would_exceed: bool,
    /// Advisory message when approaching or crossing a threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Combined status + period-expiry decision from [`BudgetManager::check_budget`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetCheck {
    /// Whether new executions may run.
    pub allowed: bool,
    /// Whether the period window has ended.
    pub period_expired: bool,
    /// Advisory message, when allowed with a warning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Errors surfaced by the budget subsystem.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// A hard-limited tenant would exceed its budget.
    #[error("budget exceeded for tenant {tenant_id}: estimated ${estimated:.4}, remaining ${remaining:.4}")]
    Exceeded {
        /// Tenant that was blocked.
        tenant_id: String,
        /// Estimated cost of the rejected execution.
        estimated: f64,
        /// Headroom left in the period.
        remaining: f64,
    },

    /// Store failure underneath the budget table.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Budget repository + enforcement over the shared store.
#[derive(Debug, Clone)]
pub struct BudgetManager {
    store: Store,
    audit: AuditLog,
}

impl BudgetManager {
    /// Wrap the shared store and audit log.
    #[must_use]
    pub fn new(store: Store, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Create or replace a tenant's budget. When `period` is `None` the
    /// window defaults to the current calendar month.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Store`] on write failure.
    pub fn set_budget(
        &self,
        tenant_id: &str,
        limit_usd: f64,
        hard_limit: bool,
        alert_threshold: Option<f64>,
        soft_limit_usd: Option<f64>,
        period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<TenantBudget, BudgetError> {
        let (period_start, period_end) = period.unwrap_or_else(|| current_month(Utc::now()));
        let budget = TenantBudget {
            tenant_id: tenant_id.to_string(),
            limit_usd,
            spent_usd: 0.0,
            period_start,
            period_end,
            hard_limit,
            alert_threshold: alert_threshold.unwrap_or(0.8).clamp(0.0, 1.0),
            soft_limit_usd,
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tenant_budgets
                     (tenant_id, limit_usd, spent_usd, period_start, period_end,
                      hard_limit, alert_threshold, soft_limit_usd)
                 VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (tenant_id) DO UPDATE SET
                     limit_usd = excluded.limit_usd,
                     period_start = excluded.period_start,
                     period_end = excluded.period_end,
                     hard_limit = excluded.hard_limit,
                     alert_threshold = excluded.alert_threshold,
                     soft_limit_usd = excluded.soft_limit_usd",
                rusqlite::params![
                    budget.tenant_id,
                    budget.limit_usd,
                    budget.period_start.to_rfc3339(),
                    budget.period_end.to_rfc3339(),
                    budget.hard_limit as i64,
                    budget.alert_threshold,
                    budget.soft_limit_usd,
                ],
            )?;
            Ok(())
        })?;
        Ok(budget)
    }

    /// Fetch a tenant's budget, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Store`] on query failure.
    pub fn get(&self, tenant_id: &str) -> Result<Option<TenantBudget>, BudgetError> {
        let row = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tenant_id, limit_usd, spent_usd, period_start, period_end,
                        hard_limit, alert_threshold, soft_limit_usd
                 FROM tenant_budgets WHERE tenant_id = ?1",
            )?;
            let mut rows = stmt.query_map([tenant_id], row_to_budget)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })?;
        Ok(row)
    }

    /// Deterministic forecast for one prospective model call.
    ///
    /// Tenants without a budget row are unlimited: always allowed, no
    /// remaining figure.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Store`] on query failure.
    pub fn forecast(
        &self,
        tenant_id: &str,
        prompt_tokens: u64,
        max_output_tokens: u64,
        model: &str,
    ) -> Result<CostForecast, BudgetError> {
        let cost = cost_for(model, &TokenUsage::new(prompt_tokens, max_output_tokens));
        let estimated = cost.total_cost;

        let Some(budget) = self.get(tenant_id)? else {
            return Ok(CostForecast {
                estimated,
                input_cost: cost.input_cost,
                output_cost: cost.output_cost,
                allowed: true,
                remaining: None,
                would_exceed: false,
                warning: None,
            });
        };

        let would_exceed = budget.spent_usd + estimated > budget.limit_usd;
        let allowed = !(budget.hard_limit && would_exceed);
        let projected_fraction = if budget.limit_usd > 0.0 {
            (budget.spent_usd + estimated) / budget.limit_usd
        } else {
            1.0
        };

        let warning = if would_exceed {
            Some(format!(
                "estimated ${estimated:.4} would exceed the ${:.2} budget",
                budget.limit_usd
            ))
        } else if projected_fraction >= budget.alert_threshold {
            Some(format!(
                "projected spend at {:.0}% of budget",
                projected_fraction * 100.0
            ))
        } else {
            None
        };

        Ok(CostForecast {
            estimated,
            input_cost: cost.input_cost,
            output_cost: cost.output_cost,
            allowed,
            remaining: Some(budget.remaining()),
            would_exceed,
            warning,
        })
    }

    /// Enforce a forecast: a hard-limited tenant whose forecast would exceed
    /// the budget is blocked with an audited `budget_exceeded`.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Exceeded`] when blocked, or
    /// [`BudgetError::Store`] on store failure.
    pub fn check_before_execution(
        &self,
        tenant_id: &str,
        forecast: &CostForecast,
        trace_id: Option<&str>,
    ) -> Result<(), BudgetError> {
        if forecast.allowed {
            return Ok(());
        }
        let remaining = forecast.remaining.unwrap_or(0.0);
        let mut entry = NewAuditEntry::new(tenant_id, AuditEventType::BudgetExceeded).payload(json!({
            "estimated": forecast.estimated,
            "remaining": remaining,
            "phase": "forecast",
        }));
        if let Some(id) = trace_id {
            entry = entry.trace(id);
        }
        self.audit.record_or_log(&entry);
        Err(BudgetError::Exceeded {
            tenant_id: tenant_id.to_string(),
            estimated: forecast.estimated,
            remaining,
        })
    }

    /// Record actual spend after an execution. Spend is monotonic; negative
    /// amounts are ignored. Crossing the alert fraction or soft limit emits
    /// `budget_warning`; crossing the hard limit emits `budget_exceeded`.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Store`] on write failure.
    pub fn record_spend(
        &self,
        tenant_id: &str,
        amount: f64,
        trace_id: Option<&str>,
    ) -> Result<(), BudgetError> {
        if amount <= 0.0 {
            return Ok(());
        }
        let updated = self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE tenant_budgets SET spent_usd = spent_usd + ?2 WHERE tenant_id = ?1",
                rusqlite::params![tenant_id, amount],
            )?;
            Ok(())
        });
        updated?;

        let Some(budget) = self.get(tenant_id)? else {
            return Ok(());
        };

        let scope = |mut entry: NewAuditEntry| {
            if let Some(id) = trace_id {
                entry = entry.trace(id);
            }
            entry
        };

        if budget.spent_usd > budget.limit_usd {
            warn!(tenant = tenant_id, spent = budget.spent_usd, "budget hard threshold crossed");
            self.audit.record_or_log(&scope(
                NewAuditEntry::new(tenant_id, AuditEventType::BudgetExceeded).payload(json!({
                    "spent": budget.spent_usd,
                    "limit": budget.limit_usd,
                    "phase": "record",
                })),
            ));
        } else if over_soft_threshold(&budget) {
            self.audit.record_or_log(&scope(
                NewAuditEntry::new(tenant_id, AuditEventType::BudgetWarning).payload(json!({
                    "spent": budget.spent_usd,
                    "limit": budget.limit_usd,
                })),
            ));
        }
        Ok(())
    }

    /// Combined status + period-expiry policy.
    ///
    /// An expired period blocks hard-limited tenants; soft-limited tenants
    /// pass with a warning until the period is reset. Tenants without a
    /// budget are always allowed.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Store`] on query failure.
    pub fn check_budget(&self, tenant_id: &str) -> Result<BudgetCheck, BudgetError> {
        let Some(budget) = self.get(tenant_id)? else {
            return Ok(BudgetCheck {
                allowed: true,
                period_expired: false,
                warning: None,
            });
        };
        let now = Utc::now();
        if budget.period_expired(now) {
            return Ok(BudgetCheck {
                allowed: !budget.hard_limit,
                period_expired: true,
                warning: Some("budget period has expired".to_string()),
            });
        }
        let exceeded = budget.spent_usd >= budget.limit_usd;
        Ok(BudgetCheck {
            allowed: !(budget.hard_limit && exceeded),
            period_expired: false,
            warning: if exceeded {
                Some("budget limit reached".to_string())
            } else if over_soft_threshold(&budget) {
                Some("budget approaching its limit".to_string())
            } else {
                None
            },
        })
    }
}

fn over_soft_threshold(budget: &TenantBudget) -> bool {
    let over_alert =
        budget.limit_usd > 0.0 && budget.spent_usd / budget.limit_usd >= budget.alert_threshold;
    let over_soft = budget
        .soft_limit_usd
        .is_some_and(|soft| budget.spent_usd >= soft);
    over_alert || over_soft
}

/// The calendar month containing `now`: `[first of month, first of next)`.
#[must_use]
pub fn current_month(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (start, end)
}

fn row_to_budget(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantBudget> {
    let period_start: String = row.get(3)?;
    let period_end: String = row.get(4)?;
    Ok(TenantBudget {
        tenant_id: row.get(0)?,
        limit_usd: row.get(1)?,
        spent_usd: row.get(2)?,
        period_start: period_start
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        period_end: period_end
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        hard_limit: row.get::<_, i64>(5)? != 0,
        alert_threshold: row.get(6)?,
        soft_limit_usd: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_audit::AuditQuery;

    fn manager() -> (BudgetManager, AuditLog) {
        let store = Store::open_in_memory().unwrap();
        let audit = AuditLog::new(store.clone());
        (BudgetManager::new(store, audit.clone()), audit)
    }

    #[test]
    fn set_budget_defaults_to_calendar_month() {
        let (mgr, _) = manager();
        let budget = mgr.set_budget("t1", 10.0, true, None, None, None).unwrap();
        assert_eq!(budget.period_start.day(), 1);
        assert!(budget.period_end > budget.period_start);
        let days = (budget.period_end - budget.period_start).num_days();
        assert!((28..=31).contains(&days));
    }

    #[test]
    fn unbudgeted_tenant_is_unlimited() {
        let (mgr, _) = manager();
        let forecast = mgr.forecast("nobody", 1_000, 1_000, "gpt-4o-mini").unwrap();
        assert!(forecast.allowed);
        assert!(!forecast.would_exceed);
        assert!(forecast.remaining.is_none());
    }

    #[test]
    fn hard_limit_blocks_would_exceed() {
        let (mgr, audit) = manager();
        mgr.set_budget("t1", 1.0, true, None, None, None).unwrap();
        mgr.record_spend("t1", 0.99, None).unwrap();

        // ~330k prompt tokens of gpt-4o ≈ $0.83; comfortably over 1¢ left.
        let forecast = mgr.forecast("t1", 330_000, 1_000, "gpt-4o").unwrap();
        assert!(forecast.would_exceed);
        assert!(!forecast.allowed);

        let err = mgr.check_before_execution("t1", &forecast, Some("tr_x")).unwrap_err();
        assert!(matches!(err, BudgetError::Exceeded { .. }));

        let page = audit
            .query(&AuditQuery {
                tenant_id: Some("t1".into()),
                event_types: vec![AuditEventType::BudgetExceeded],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].trace_id.as_deref(), Some("tr_x"));
    }

    #[test]
    fn soft_limit_allows_but_warns() {
        let (mgr, _) = manager();
        mgr.set_budget("t1", 1.0, false, None, None, None).unwrap();
        mgr.record_spend("t1", 0.99, None).unwrap();

        let forecast = mgr.forecast("t1", 330_000, 1_000, "gpt-4o").unwrap();
        assert!(forecast.would_exceed);
        assert!(forecast.allowed, "soft limit never blocks");
        assert!(forecast.warning.is_some());
        assert!(mgr.check_before_execution("t1", &forecast, None).is_ok());
    }

    #[test]
    fn record_spend_is_monotonic() {
        let (mgr, _) = manager();
        mgr.set_budget("t1", 10.0, true, None, None, None).unwrap();
        mgr.record_spend("t1", 1.0, None).unwrap();
        mgr.record_spend("t1", -5.0, None).unwrap();
        mgr.record_spend("t1", 0.5, None).unwrap();
        let budget = mgr.get("t1").unwrap().unwrap();
        assert!((budget.spent_usd - 1.5).abs() < 1e-9);
    }

    #[test]
    fn crossing_alert_threshold_warns_once_per_record() {
        let (mgr, audit) = manager();
        mgr.set_budget("t1", 1.0, true, Some(0.8), None, None).unwrap();
        mgr.record_spend("t1", 0.85, Some("tr_1")).unwrap();

        let page = audit
            .query(&AuditQuery {
                event_types: vec![AuditEventType::BudgetWarning],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn crossing_hard_limit_audits_exceeded() {
        let (mgr, audit) = manager();
        mgr.set_budget("t1", 1.0, true, None, None, None).unwrap();
        mgr.record_spend("t1", 1.5, None).unwrap();

        let page = audit
            .query(&AuditQuery {
                event_types: vec![AuditEventType::BudgetExceeded],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn expired_period_blocks_hard_allows_soft() {
        let (mgr, _) = manager();
        let past = (
            Utc::now() - chrono::Duration::days(60),
            Utc::now() - chrono::Duration::days(30),
        );
        mgr.set_budget("hard", 1.0, true, None, None, Some(past)).unwrap();
        mgr.set_budget("soft", 1.0, false, None, None, Some(past)).unwrap();

        let hard = mgr.check_budget("hard").unwrap();
        assert!(hard.period_expired);
        assert!(!hard.allowed);

        let soft = mgr.check_budget("soft").unwrap();
        assert!(soft.period_expired);
        assert!(soft.allowed);
        assert!(soft.warning.is_some());
    }

    #[test]
    fn forecast_within_budget_has_no_warning() {
        let (mgr, _) = manager();
        mgr.set_budget("t1", 100.0, true, None, None, None).unwrap();
        let forecast = mgr.forecast("t1", 1_000, 500, "gpt-4o-mini").unwrap();
        assert!(forecast.allowed);
        assert!(!forecast.would_exceed);
        assert!(forecast.warning.is_none());
        assert!(forecast.estimated > 0.0);
    }

    #[test]
    fn current_month_spans_december() {
        let dec = Utc.with_ymd_and_hms(2026, 12, 15, 10, 0, 0).unwrap();
        let (start, end) = current_month(dec);
        assert_eq!((start.year(), start.month(), start.day()), (2026, 12, 1));
        assert_eq!((end.year(), end.month(), end.day()), (2027, 1, 1));
    }
}
