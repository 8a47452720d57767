// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operations Console roles and the static permission table.

use serde::{Deserialize, Serialize};

/// Console roles, strictly ordered by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpsRole {
    /// Read-only views.
    Viewer,
    /// Viewer plus trace curation (annotate/label/diff) and audit access.
    Operator,
    /// Operator plus workspace and skill promotion authority.
    ReleaseManager,
    /// Everything, including budget/retention mutation and break-glass.
    Admin,
}

impl OpsRole {
    /// Numeric rank: viewer 0 < operator 1 < release_manager 2 < admin 3.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Viewer => 0,
            Self::Operator => 1,
            Self::ReleaseManager => 2,
            Self::Admin => 3,
        }
    }

    /// Parse a role name as it appears in an identity-provider claim.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Self::Viewer),
            "operator" => Some(Self::Operator),
            "release_manager" => Some(Self::ReleaseManager),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Stable name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Operator => "operator",
            Self::ReleaseManager => "release_manager",
            Self::Admin => "admin",
        }
    }
}

/// Closed permission vocabulary for the ops read API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// View traces (projected per role).
    TraceView,
    /// Annotate traces.
    TraceAnnotate,
    /// Diff two traces.
    TraceDiff,
    /// Mutate trace labels.
    TraceLabel,
    /// View workspace versions, environments, pins.
    WorkspaceView,
    /// Promote between environments.
    WorkspacePromote,
    /// Roll a workspace back to a snapshot.
    WorkspaceRollback,
    /// Lock or unlock an environment.
    WorkspaceLock,
    /// View the skill registry.
    SkillView,
    /// Move skills through lifecycle states.
    SkillPromote,
    /// View tenant budgets.
    BudgetView,
    /// Mutate tenant budgets.
    BudgetModify,
    /// View retention policies.
    RetentionView,
    /// Mutate retention policies.
    RetentionModify,
    /// View dashboards.
    DashboardView,
    /// View the audit log.
    AuditView,
    /// Exercise break-glass overrides.
    OverrideUse,
}

impl Permission {
    /// Stable wire name, e.g. `"trace:view"`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TraceView => "trace:view",
            Self::TraceAnnotate => "trace:annotate",
            Self::TraceDiff => "trace:diff",
            Self::TraceLabel => "trace:label",
            Self::WorkspaceView => "workspace:view",
            Self::WorkspacePromote => "workspace:promote",
            Self::WorkspaceRollback => "workspace:rollback",
            Self::WorkspaceLock => "workspace:lock",
            Self::SkillView => "skill:view",
            Self::SkillPromote => "skill:promote",
            Self::BudgetView => "budget:view",
            Self::BudgetModify => "budget:modify",
            Self::RetentionView => "retention:view",
            Self::RetentionModify => "retention:modify",
            Self::DashboardView => "dashboard:view",
            Self::AuditView => "audit:view",
            Self::OverrideUse => "override:use",
        }
    }
}

/// Every permission, for projection into `/ops/api/me`.
pub const ALL_PERMISSIONS: &[Permission] = &[
    Permission::TraceView,
    Permission::TraceAnnotate,
    Permission::TraceDiff,
    Permission::TraceLabel,
    Permission::WorkspaceView,
    Permission::WorkspacePromote,
    Permission::WorkspaceRollback,
    Permission::WorkspaceLock,
    Permission::SkillView,
    Permission::SkillPromote,
    Permission::BudgetView,
    Permission::BudgetModify,
    Permission::RetentionView,
    Permission::RetentionModify,
    Permission::DashboardView,
    Permission::AuditView,
    Permission::OverrideUse,
];

/// Static role → permission table. A pure lookup, no policy evaluation.
#[must_use]
pub fn has_permission(role: OpsRole, permission: Permission) -> bool {
    use Permission as P;
    let minimum = match permission {
        P::TraceView
        | P::WorkspaceView
        | P::SkillView
        | P::BudgetView
        | P::RetentionView
        | P::DashboardView => OpsRole::Viewer,
        P::TraceAnnotate | P::TraceDiff | P::TraceLabel | P::AuditView => OpsRole::Operator,
        P::WorkspacePromote | P::WorkspaceRollback | P::WorkspaceLock | P::SkillPromote => {
            OpsRole::ReleaseManager
        }
        P::BudgetModify | P::RetentionModify | P::OverrideUse => OpsRole::Admin,
    };
    role.rank() >= minimum.rank()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_strictly_ordered() {
        assert!(OpsRole::Viewer < OpsRole::Operator);
        assert!(OpsRole::Operator < OpsRole::ReleaseManager);
        assert!(OpsRole::ReleaseManager < OpsRole::Admin);
    }

    #[test]
    fn viewer_gets_read_views_only() {
        assert!(has_permission(OpsRole::Viewer, Permission::TraceView));
        assert!(has_permission(OpsRole::Viewer, Permission::DashboardView));
        assert!(!has_permission(OpsRole::Viewer, Permission::TraceAnnotate));
        assert!(!has_permission(OpsRole::Viewer, Permission::AuditView));
        assert!(!has_permission(OpsRole::Viewer, Permission::OverrideUse));
    }

    #[test]
    fn operator_curates_but_does_not_promote() {
        assert!(has_permission(OpsRole::Operator, Permission::TraceLabel));
        assert!(has_permission(OpsRole::Operator, Permission::AuditView));
        assert!(!has_permission(OpsRole::Operator, Permission::WorkspacePromote));
        assert!(!has_permission(OpsRole::Operator, Permission::BudgetModify));
    }

    #[test]
    fn release_manager_promotes_but_no_break_glass() {
        assert!(has_permission(OpsRole::ReleaseManager, Permission::SkillPromote));
        assert!(has_permission(OpsRole::ReleaseManager, Permission::WorkspaceLock));
        assert!(!has_permission(OpsRole::ReleaseManager, Permission::OverrideUse));
    }

    #[test]
    fn admin_has_everything() {
        for p in ALL_PERMISSIONS {
            assert!(has_permission(OpsRole::Admin, *p), "admin missing {}", p.as_str());
        }
    }

    #[test]
    fn higher_rank_implies_superset() {
        let pairs = [
            (OpsRole::Viewer, OpsRole::Operator),
            (OpsRole::Operator, OpsRole::ReleaseManager),
            (OpsRole::ReleaseManager, OpsRole::Admin),
        ];
        for (lower, higher) in pairs {
            for p in ALL_PERMISSIONS {
                if has_permission(lower, *p) {
                    assert!(has_permission(higher, *p));
                }
            }
        }
    }

    #[test]
    fn role_parse_roundtrip() {
        for role in [OpsRole::Viewer, OpsRole::Operator, OpsRole::ReleaseManager, OpsRole::Admin] {
            assert_eq!(OpsRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(OpsRole::parse("superuser"), None);
    }

    #[test]
    fn permission_names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for p in ALL_PERMISSIONS {
            assert!(seen.insert(p.as_str()));
        }
    }
}
