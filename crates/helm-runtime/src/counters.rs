// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-wide usage counters.
//!
//! Operational telemetry only; the traces table is the source of truth.

use helm_core::TokenUsage;
use serde::Serialize;
use std::sync::Mutex;

/// Snapshot of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageSnapshot {
    /// Executions served since startup.
    pub requests: u64,
    /// Executions that ended in a terminal error.
    pub failures: u64,
    /// Tokens consumed across all executions.
    pub total_tokens: u64,
    /// USD spent across all executions.
    pub total_cost: f64,
}

/// Mutex-guarded process accumulator.
#[derive(Debug, Default)]
pub struct UsageCounters {
    inner: Mutex<UsageSnapshot>,
}

impl UsageCounters {
    /// Fresh counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished execution.
    pub fn record(&self, usage: &TokenUsage, cost: f64, failed: bool) {
        let mut inner = self.inner.lock().expect("usage counters poisoned");
        inner.requests += 1;
        if failed {
            inner.failures += 1;
        }
        inner.total_tokens += usage.total_tokens;
        inner.total_cost += cost;
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> UsageSnapshot {
        *self.inner.lock().expect("usage counters poisoned")
    }

    /// Reset to zero (tests only, but harmless anywhere).
    pub fn reset(&self) {
        *self.inner.lock().expect("usage counters poisoned") = UsageSnapshot::default();
    }
}
