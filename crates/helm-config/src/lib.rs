// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-driven configuration for the agent-helm runtime.
//!
//! The runtime is configured entirely through environment variables (it is
//! deployed as a stateless container). [`HelmConfig::from_env`] reads every
//! knob with a sensible default, and [`HelmConfig::validate`] returns
//! advisory [`ConfigWarning`]s for settings that work but deserve attention.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Model tier names resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelTiers {
    /// Cheap tier used for compaction, skill tests, summaries.
    pub cheap: String,
    /// Default tier for ordinary executions.
    pub default: String,
    /// Best tier, selectable per request.
    pub best: String,
    /// Fallback `(provider/model)` tried after the primary is exhausted.
    pub fallback: String,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            cheap: "gpt-4o-mini".to_string(),
            default: "gpt-4o-mini".to_string(),
            best: "gpt-4o".to_string(),
            fallback: "anthropic/claude-3-5-haiku".to_string(),
        }
    }
}

/// Retry discipline for outbound model calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryConfig {
    /// Attempts against the primary before failing over.
    pub max_attempts: u32,
    /// Base delay for attempt 0.
    pub base_delay_ms: u64,
    /// Ceiling on the exponential delay.
    pub max_delay_ms: u64,
    /// Jitter applied to each delay, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            jitter: 0.2,
        }
    }
}

/// OIDC settings for the ops read API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OpsAuthConfig {
    /// Expected `iss` claim.
    pub issuer: Option<String>,
    /// Expected `aud` claim.
    pub audience: Option<String>,
    /// JWKS endpoint for signature keys.
    pub jwks_url: Option<String>,
    /// Claim carrying the caller's role(s).
    pub role_claim: String,
    /// Claim carrying the caller's tenant.
    pub tenant_claim: String,
    /// Claim carrying the caller's workspace scope.
    pub workspace_claim: String,
    /// Claim listing tenants an admin may read across.
    pub allowed_tenants_claim: String,
}

// ---------------------------------------------------------------------------
// HelmConfig
// ---------------------------------------------------------------------------

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HelmConfig {
    /// TCP port the daemon binds.
    pub port: u16,
    /// Base URL of the control plane.
    pub control_plane_url: String,
    /// Shared daemon key; when set, every agent request must carry it.
    #[serde(skip_serializing)]
    pub daemon_key: Option<String>,
    /// Symmetric secret for minting/validating agent identity tokens.
    #[serde(skip_serializing)]
    pub jwt_secret: Option<String>,
    /// Default provider when a model string has no `provider/` prefix.
    pub default_provider: String,
    /// Model tier names.
    pub model_tiers: ModelTiers,
    /// API keys per provider name.
    #[serde(skip_serializing)]
    pub provider_keys: BTreeMap<String, String>,
    /// Root of the on-disk workspace tree.
    pub workspace_path: String,
    /// Path of the embedded store file.
    pub store_path: String,
    /// Task title used when a request names none.
    pub default_task_title: String,
    /// Retry knobs.
    pub retry: RetryConfig,
    /// Warn when the prompt estimate exceeds this share of the model window
    /// (percentage, 0–100).
    pub context_warning_pct: u8,
    /// Per-file truncation cap for workspace files, in characters.
    pub workspace_file_char_limit: usize,
    /// Default timezone for the time-context block.
    pub default_timezone: String,
    /// Whether prompts get a current-time block at all.
    pub time_context_enabled: bool,
    /// Tool proxy deadline.
    pub tool_timeout: Duration,
    /// Cap on tool rounds within one execution.
    pub max_tool_rounds: u32,
    /// Redaction salt for the hash strategy.
    #[serde(skip_serializing)]
    pub redaction_salt: String,
    /// Ops read API auth settings.
    pub ops_auth: OpsAuthConfig,
}

impl Default for HelmConfig {
    fn default() -> Self {
        Self {
            port: 8170,
            control_plane_url: "http://127.0.0.1:3000".to_string(),
            daemon_key: None,
            jwt_secret: None,
            default_provider: "openai".to_string(),
            model_tiers: ModelTiers::default(),
            provider_keys: BTreeMap::new(),
            workspace_path: "./workspace".to_string(),
            store_path: "./data/helm.db".to_string(),
            default_task_title: "Agent chat".to_string(),
            retry: RetryConfig::default(),
            context_warning_pct: 80,
            workspace_file_char_limit: 20_000,
            default_timezone: "UTC".to_string(),
            time_context_enabled: true,
            tool_timeout: Duration::from_secs(30),
            max_tool_rounds: 5,
            redaction_salt: "helm".to_string(),
            ops_auth: OpsAuthConfig {
                role_claim: "roles".to_string(),
                tenant_claim: "tenant_id".to_string(),
                workspace_claim: "workspace_id".to_string(),
                allowed_tenants_claim: "allowed_tenants".to_string(),
                ..OpsAuthConfig::default()
            },
        }
    }
}

/// Advisory issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// No daemon key: agent endpoints accept unauthenticated traffic.
    DaemonKeyUnset,
    /// No JWT secret: agent tokens cannot be minted or validated.
    JwtSecretUnset,
    /// No API key for a provider named in the model tiers.
    ProviderKeyMissing {
        /// Provider lacking a key.
        provider: String,
    },
    /// Tool timeout is unusually large.
    LargeToolTimeout {
        /// Configured value in seconds.
        secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DaemonKeyUnset => write!(f, "HELM_DAEMON_KEY unset; agent endpoints are open"),
            Self::JwtSecretUnset => write!(f, "HELM_JWT_SECRET unset; agent tokens disabled"),
            Self::ProviderKeyMissing { provider } => {
                write!(f, "no API key configured for provider '{provider}'")
            }
            Self::LargeToolTimeout { secs } => {
                write!(f, "tool timeout is unusually large ({secs}s)")
            }
        }
    }
}

impl HelmConfig {
    /// Load configuration from the process environment.
    ///
    /// Every variable has a default; malformed numeric values fall back to
    /// the default rather than failing startup.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<u16>("HELM_PORT") {
            cfg.port = v;
        }
        if let Ok(v) = std::env::var("HELM_CONTROL_PLANE_URL") {
            cfg.control_plane_url = v.trim_end_matches('/').to_string();
        }
        cfg.daemon_key = std::env::var("HELM_DAEMON_KEY").ok().filter(|s| !s.is_empty());
        cfg.jwt_secret = std::env::var("HELM_JWT_SECRET").ok().filter(|s| !s.is_empty());
        if let Ok(v) = std::env::var("HELM_DEFAULT_PROVIDER") {
            cfg.default_provider = v;
        }
        if let Ok(v) = std::env::var("HELM_MODEL_CHEAP") {
            cfg.model_tiers.cheap = v;
        }
        if let Ok(v) = std::env::var("HELM_MODEL_DEFAULT") {
            cfg.model_tiers.default = v;
        }
        if let Ok(v) = std::env::var("HELM_MODEL_BEST") {
            cfg.model_tiers.best = v;
        }
        if let Ok(v) = std::env::var("HELM_MODEL_FALLBACK") {
            cfg.model_tiers.fallback = v;
        }
        for (provider, var) in [
            ("openai", "OPENAI_API_KEY"),
            ("anthropic", "ANTHROPIC_API_KEY"),
            ("openrouter", "OPENROUTER_API_KEY"),
        ] {
            if let Ok(key) = std::env::var(var)
                && !key.is_empty()
            {
                cfg.provider_keys.insert(provider.to_string(), key);
            }
        }
        if let Ok(v) = std::env::var("HELM_WORKSPACE_PATH") {
            cfg.workspace_path = v;
        }
        if let Ok(v) = std::env::var("HELM_STORE_PATH") {
            cfg.store_path = v;
        }
        if let Ok(v) = std::env::var("HELM_DEFAULT_TASK_TITLE") {
            cfg.default_task_title = v;
        }
        if let Some(v) = env_parse::<u32>("HELM_RETRY_ATTEMPTS") {
            cfg.retry.max_attempts = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("HELM_RETRY_BASE_MS") {
            cfg.retry.base_delay_ms = v;
        }
        if let Some(v) = env_parse::<u64>("HELM_RETRY_MAX_MS") {
            cfg.retry.max_delay_ms = v;
        }
        if let Some(v) = env_parse::<f64>("HELM_RETRY_JITTER") {
            cfg.retry.jitter = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse::<u8>("HELM_CONTEXT_WARNING_PCT") {
            cfg.context_warning_pct = v.min(100);
        }
        if let Some(v) = env_parse::<usize>("HELM_WORKSPACE_FILE_CHAR_LIMIT") {
            cfg.workspace_file_char_limit = v;
        }
        if let Ok(v) = std::env::var("HELM_DEFAULT_TIMEZONE") {
            cfg.default_timezone = v;
        }
        if let Ok(v) = std::env::var("HELM_TIME_CONTEXT") {
            cfg.time_context_enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = env_parse::<u64>("HELM_TOOL_TIMEOUT_MS") {
            cfg.tool_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("HELM_MAX_TOOL_ROUNDS") {
            cfg.max_tool_rounds = v.max(1);
        }
        if let Ok(v) = std::env::var("HELM_REDACTION_SALT") {
            cfg.redaction_salt = v;
        }

        cfg.ops_auth.issuer = std::env::var("HELM_OPS_ISSUER").ok();
        cfg.ops_auth.audience = std::env::var("HELM_OPS_AUDIENCE").ok();
        cfg.ops_auth.jwks_url = std::env::var("HELM_OPS_JWKS_URL").ok();
        if let Ok(v) = std::env::var("HELM_OPS_ROLE_CLAIM") {
            cfg.ops_auth.role_claim = v;
        }
        if let Ok(v) = std::env::var("HELM_OPS_TENANT_CLAIM") {
            cfg.ops_auth.tenant_claim = v;
        }
        if let Ok(v) = std::env::var("HELM_OPS_WORKSPACE_CLAIM") {
            cfg.ops_auth.workspace_claim = v;
        }
        if let Ok(v) = std::env::var("HELM_OPS_ALLOWED_TENANTS_CLAIM") {
            cfg.ops_auth.allowed_tenants_claim = v;
        }

        cfg
    }

    /// Validate the configuration, returning advisory warnings.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.daemon_key.is_none() {
            warnings.push(ConfigWarning::DaemonKeyUnset);
        }
        if self.jwt_secret.is_none() {
            warnings.push(ConfigWarning::JwtSecretUnset);
        }
        if !self.provider_keys.contains_key(&self.default_provider) {
            warnings.push(ConfigWarning::ProviderKeyMissing {
                provider: self.default_provider.clone(),
            });
        }
        if self.tool_timeout > Duration::from_secs(120) {
            warnings.push(ConfigWarning::LargeToolTimeout {
                secs: self.tool_timeout.as_secs(),
            });
        }
        warnings
    }

    /// API key for `provider`, if configured.
    #[must_use]
    pub fn provider_key(&self, provider: &str) -> Option<&str> {
        self.provider_keys.get(provider).map(String::as_str)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
