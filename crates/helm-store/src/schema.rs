// SPDX-License-Identifier: MIT OR Apache-2.0
//! Schema migrations, applied additively in order.
//!
//! Never edit an existing migration; append a new one. Timestamps are
//! RFC 3339 TEXT throughout; structured columns are JSON TEXT.

/// Ordered `(name, sql)` migration list.
pub const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_traces",
        "CREATE TABLE IF NOT EXISTS traces (
             id TEXT PRIMARY KEY,
             tenant_id TEXT NOT NULL,
             workspace_id TEXT NOT NULL,
             agent_role TEXT NOT NULL,
             started_at TEXT NOT NULL,
             completed_at TEXT,
             duration_ms INTEGER,
             workspace_hash TEXT,
             skill_versions TEXT NOT NULL DEFAULT '{}',
             model TEXT NOT NULL,
             provider TEXT NOT NULL,
             input_message TEXT NOT NULL,
             history_len INTEGER NOT NULL DEFAULT 0,
             steps TEXT NOT NULL DEFAULT '[]',
             output TEXT,
             prompt_tokens INTEGER NOT NULL DEFAULT 0,
             completion_tokens INTEGER NOT NULL DEFAULT 0,
             total_tokens INTEGER NOT NULL DEFAULT 0,
             cost REAL NOT NULL DEFAULT 0,
             redacted_prompt TEXT,
             error TEXT,
             labels TEXT NOT NULL DEFAULT '{}',
             task_id TEXT,
             document_id TEXT,
             message_id TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_traces_tenant_time
             ON traces (tenant_id, started_at);
         CREATE INDEX IF NOT EXISTS idx_traces_task
             ON traces (task_id) WHERE task_id IS NOT NULL;",
    ),
    (
        "0002_trace_annotations",
        "CREATE TABLE IF NOT EXISTS trace_annotations (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             trace_id TEXT NOT NULL,
             key TEXT NOT NULL,
             value TEXT NOT NULL,
             author TEXT NOT NULL,
             created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_annotations_trace
             ON trace_annotations (trace_id);",
    ),
    (
        "0003_audit_log",
        "CREATE TABLE IF NOT EXISTS audit_log (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             tenant_id TEXT NOT NULL,
             workspace_id TEXT,
             trace_id TEXT,
             user_id TEXT,
             event_type TEXT NOT NULL,
             created_at TEXT NOT NULL,
             payload TEXT NOT NULL DEFAULT '{}'
         );
         CREATE INDEX IF NOT EXISTS idx_audit_tenant_time
             ON audit_log (tenant_id, created_at);
         CREATE INDEX IF NOT EXISTS idx_audit_trace
             ON audit_log (trace_id) WHERE trace_id IS NOT NULL;",
    ),
    (
        "0004_skill_registry",
        "CREATE TABLE IF NOT EXISTS skill_registry (
             name TEXT NOT NULL,
             version TEXT NOT NULL,
             state TEXT NOT NULL DEFAULT 'draft',
             manifest TEXT NOT NULL,
             body TEXT NOT NULL,
             created_at TEXT NOT NULL,
             updated_at TEXT NOT NULL,
             PRIMARY KEY (name, version)
         );
         CREATE INDEX IF NOT EXISTS idx_skills_state
             ON skill_registry (state);",
    ),
    (
        "0005_tenant_budgets",
        "CREATE TABLE IF NOT EXISTS tenant_budgets (
             tenant_id TEXT PRIMARY KEY,
             limit_usd REAL NOT NULL,
             spent_usd REAL NOT NULL DEFAULT 0,
             period_start TEXT NOT NULL,
             period_end TEXT NOT NULL,
             hard_limit INTEGER NOT NULL DEFAULT 0,
             alert_threshold REAL NOT NULL DEFAULT 0.8,
             soft_limit_usd REAL
         );",
    ),
    (
        "0006_tenant_retention_policies",
        "CREATE TABLE IF NOT EXISTS tenant_retention_policies (
             tenant_id TEXT PRIMARY KEY,
             retention_days INTEGER NOT NULL,
             sampling TEXT NOT NULL DEFAULT 'full',
             storage_mode TEXT NOT NULL DEFAULT 'standard',
             updated_at TEXT NOT NULL
         );",
    ),
    (
        "0007_workspace_versions",
        "CREATE TABLE IF NOT EXISTS workspace_versions (
             hash TEXT PRIMARY KEY,
             workspace_id TEXT NOT NULL,
             message TEXT NOT NULL DEFAULT '',
             files TEXT NOT NULL,
             created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_versions_workspace
             ON workspace_versions (workspace_id, created_at);",
    ),
    (
        "0008_workspace_environments",
        "CREATE TABLE IF NOT EXISTS workspace_environments (
             workspace_id TEXT NOT NULL,
             name TEXT NOT NULL,
             description TEXT NOT NULL DEFAULT '',
             version_hash TEXT,
             is_default INTEGER NOT NULL DEFAULT 0,
             locked INTEGER NOT NULL DEFAULT 0,
             updated_at TEXT NOT NULL,
             PRIMARY KEY (workspace_id, name)
         );",
    ),
    (
        "0009_workspace_pins",
        "CREATE TABLE IF NOT EXISTS workspace_pins (
             workspace_id TEXT NOT NULL,
             environment TEXT NOT NULL,
             version_hash TEXT,
             skill_pins TEXT NOT NULL DEFAULT '{}',
             model TEXT,
             provider TEXT,
             updated_at TEXT NOT NULL,
             PRIMARY KEY (workspace_id, environment)
         );",
    ),
    (
        "0010_eval_results",
        "CREATE TABLE IF NOT EXISTS eval_results (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             skill_name TEXT NOT NULL,
             skill_version TEXT NOT NULL,
             passed INTEGER NOT NULL,
             total INTEGER NOT NULL,
             results TEXT NOT NULL,
             created_at TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_eval_skill
             ON eval_results (skill_name, skill_version);",
    ),
];
