// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tenant identity, capability set, and session keys.

use serde::{Deserialize, Serialize};

/// What a tenant is allowed to do, as resolved from its signed token.
///
/// The deny-list always wins; the allow-list restricts only when it is
/// non-empty. `None` for an allow-list means "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Tools the tenant may invoke. `None` = all tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    /// Tools the tenant may never invoke, regardless of the allow-list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denied_tools: Vec<String>,
    /// Models the tenant may run against. `None` = all models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,
    /// Skills the tenant may admit into a prompt. `None` = all skills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_skills: Option<Vec<String>>,
    /// Per-request token ceiling, if the tenant has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_request: Option<u64>,
}

impl Capabilities {
    /// Decide whether `tool` is admitted by this capability set.
    ///
    /// Deny-list wins; a non-empty allow-list restricts membership.
    #[must_use]
    pub fn permits_tool(&self, tool: &str) -> bool {
        if self.denied_tools.iter().any(|t| t == tool) {
            return false;
        }
        match &self.allowed_tools {
            Some(allowed) if !allowed.is_empty() => allowed.iter().any(|t| t == tool),
            _ => true,
        }
    }

    /// Decide whether `model` is admitted by this capability set.
    #[must_use]
    pub fn permits_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            Some(allowed) if !allowed.is_empty() => allowed.iter().any(|m| m == model),
            _ => true,
        }
    }

    /// Decide whether `skill` is admitted by this capability set.
    #[must_use]
    pub fn permits_skill(&self, skill: &str) -> bool {
        match &self.allowed_skills {
            Some(allowed) if !allowed.is_empty() => allowed.iter().any(|s| s == skill),
            _ => true,
        }
    }
}

/// Resolved identity of the tenant behind one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantIdentity {
    /// Opaque tenant identifier.
    pub tenant_id: String,
    /// User the request acts on behalf of.
    pub user_id: String,
    /// Agent role the request runs as (selects the persona).
    pub agent_role: String,
    /// Capability set derived from the token.
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Composite key identifying one logical conversation:
/// `user:<user_id>:<agent_role>`.
///
/// The kind field is fixed to `user`; the tenancy layer rejects any request
/// whose session-key user id disagrees with the signed token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// User id embedded in the key.
    pub user_id: String,
    /// Agent role embedded in the key.
    pub agent_role: String,
}

impl SessionKey {
    /// Parse a `user:<user_id>:<agent_role>` string.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message when the kind is not `user`, a field
    /// is empty, or the shape is not three colon-separated fields.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut parts = raw.splitn(3, ':');
        let kind = parts.next().unwrap_or_default();
        let user_id = parts.next().unwrap_or_default();
        let agent_role = parts.next().unwrap_or_default();

        if kind != "user" {
            return Err(format!("session key kind must be 'user', got '{kind}'"));
        }
        if user_id.is_empty() || agent_role.is_empty() {
            return Err("session key must be 'user:<user_id>:<agent_role>'".to_string());
        }

        Ok(Self {
            user_id: user_id.to_string(),
            agent_role: agent_role.to_string(),
        })
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user:{}:{}", self.user_id, self.agent_role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_roundtrip() {
        let key = SessionKey::parse("user:u1:assistant").unwrap();
        assert_eq!(key.user_id, "u1");
        assert_eq!(key.agent_role, "assistant");
        assert_eq!(key.to_string(), "user:u1:assistant");
    }

    #[test]
    fn session_key_rejects_wrong_kind() {
        assert!(SessionKey::parse("system:u1:assistant").is_err());
    }

    #[test]
    fn session_key_rejects_missing_fields() {
        assert!(SessionKey::parse("user:u1").is_err());
        assert!(SessionKey::parse("user::assistant").is_err());
        assert!(SessionKey::parse("user:u1:").is_err());
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let caps = Capabilities {
            allowed_tools: Some(vec!["search".into(), "delete_user".into()]),
            denied_tools: vec!["delete_user".into()],
            ..Capabilities::default()
        };
        assert!(caps.permits_tool("search"));
        assert!(!caps.permits_tool("delete_user"));
    }

    #[test]
    fn empty_allow_list_is_unrestricted() {
        let caps = Capabilities {
            allowed_tools: Some(vec![]),
            ..Capabilities::default()
        };
        assert!(caps.permits_tool("anything"));
    }

    #[test]
    fn allow_list_restricts_when_non_empty() {
        let caps = Capabilities {
            allowed_tools: Some(vec!["search".into()]),
            ..Capabilities::default()
        };
        assert!(caps.permits_tool("search"));
        assert!(!caps.permits_tool("write_file"));
    }

    #[test]
    fn default_capabilities_permit_everything() {
        let caps = Capabilities::default();
        assert!(caps.permits_tool("x"));
        assert!(caps.permits_model("gpt-4o"));
        assert!(caps.permits_skill("summarize"));
    }

    #[test]
    fn model_and_skill_allow_lists() {
        let caps = Capabilities {
            allowed_models: Some(vec!["gpt-4o-mini".into()]),
            allowed_skills: Some(vec!["triage".into()]),
            ..Capabilities::default()
        };
        assert!(caps.permits_model("gpt-4o-mini"));
        assert!(!caps.permits_model("gpt-4o"));
        assert!(caps.permits_skill("triage"));
        assert!(!caps.permits_skill("summarize"));
    }
}
