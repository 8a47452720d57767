// SPDX-License-Identifier: MIT OR Apache-2.0
//! Closed audit event vocabulary.

use serde::{Deserialize, Serialize};

/// Every kind of event the runtime audits. Closed set; wire codes are
/// stable snake_case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// An execution was admitted and started.
    AgentExecutionStarted,
    /// An execution completed and sealed its trace.
    AgentExecutionCompleted,
    /// An execution terminated with an error.
    AgentExecutionFailed,
    /// A tool call was requested by the model.
    ToolCallRequested,
    /// A tool call completed successfully.
    ToolCallSucceeded,
    /// A tool call failed at the backend.
    ToolCallFailed,
    /// A tool call was denied by a permission gate.
    ToolPermissionDenied,
    /// A skill version was published.
    SkillPublished,
    /// A skill version's tests were run.
    SkillTested,
    /// A skill version changed lifecycle state.
    SkillStateChanged,
    /// A deprecated skill version was selected for execution.
    SkillDeprecatedUsed,
    /// Spend crossed the alert or soft-limit threshold.
    BudgetWarning,
    /// Spend crossed the hard limit, or a forecast would have.
    BudgetExceeded,
    /// Workspace files, environments, or pins changed.
    WorkspaceChange,
    /// A token validated successfully.
    AuthSuccess,
    /// A token was missing, malformed, or mismatched.
    AuthFailure,
    /// A request was rejected by rate limiting.
    RateLimited,
    /// Runtime configuration changed.
    ConfigChange,
    /// The runtime process started.
    SystemStartup,
    /// The runtime process shut down.
    SystemShutdown,
    /// A break-glass override was exercised.
    OverrideUsed,
}

impl AuditEventType {
    /// Stable wire code, e.g. `"agent_execution_started"`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentExecutionStarted => "agent_execution_started",
            Self::AgentExecutionCompleted => "agent_execution_completed",
            Self::AgentExecutionFailed => "agent_execution_failed",
            Self::ToolCallRequested => "tool_call_requested",
            Self::ToolCallSucceeded => "tool_call_succeeded",
            Self::ToolCallFailed => "tool_call_failed",
            Self::ToolPermissionDenied => "tool_permission_denied",
            Self::SkillPublished => "skill_published",
            Self::SkillTested => "skill_tested",
            Self::SkillStateChanged => "skill_state_changed",
            Self::SkillDeprecatedUsed => "skill_deprecated_used",
            Self::BudgetWarning => "budget_warning",
            Self::BudgetExceeded => "budget_exceeded",
            Self::WorkspaceChange => "workspace_change",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
            Self::RateLimited => "rate_limited",
            Self::ConfigChange => "config_change",
            Self::SystemStartup => "system_startup",
            Self::SystemShutdown => "system_shutdown",
            Self::OverrideUsed => "override_used",
        }
    }

    /// Parse a stable wire code back into the enum.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        ALL_EVENT_TYPES.iter().copied().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All event types, for exhaustive iteration.
pub const ALL_EVENT_TYPES: &[AuditEventType] = &[
    AuditEventType::AgentExecutionStarted,
    AuditEventType::AgentExecutionCompleted,
    AuditEventType::AgentExecutionFailed,
    AuditEventType::ToolCallRequested,
    AuditEventType::ToolCallSucceeded,
    AuditEventType::ToolCallFailed,
    AuditEventType::ToolPermissionDenied,
    AuditEventType::SkillPublished,
    AuditEventType::SkillTested,
    AuditEventType::SkillStateChanged,
    AuditEventType::SkillDeprecatedUsed,
    AuditEventType::BudgetWarning,
    AuditEventType::BudgetExceeded,
    AuditEventType::WorkspaceChange,
    AuditEventType::AuthSuccess,
    AuditEventType::AuthFailure,
    AuditEventType::RateLimited,
    AuditEventType::ConfigChange,
    AuditEventType::SystemStartup,
    AuditEventType::SystemShutdown,
    AuditEventType::OverrideUsed,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn wire_codes_are_unique() {
        let mut seen = HashSet::new();
        for t in ALL_EVENT_TYPES {
            assert!(seen.insert(t.as_str()), "duplicate code {}", t.as_str());
        }
    }

    #[test]
    fn parse_roundtrips_every_code() {
        for t in ALL_EVENT_TYPES {
            assert_eq!(AuditEventType::parse(t.as_str()), Some(*t));
        }
        assert_eq!(AuditEventType::parse("nope"), None);
    }

    #[test]
    fn serde_matches_as_str() {
        for t in ALL_EVENT_TYPES {
            let json = serde_json::to_string(t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }
}
