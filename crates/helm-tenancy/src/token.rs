// SPDX-License-Identifier: MIT OR Apache-2.0
//! Daemon service token and agent identity token.

use crate::TenancyError;
use chrono::Utc;
use helm_core::SessionKey;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Agent identity token lifetime: two hours.
const AGENT_TOKEN_TTL_SECS: i64 = 2 * 60 * 60;

/// Constant-time equality over the byte representations.
///
/// Length differences still return early; the secret comparison itself does
/// not short-circuit on the first mismatched byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check the `X-Agent-Daemon-Key` header value against the configured key.
///
/// When no key is configured the check is a no-op (open deployment). When a
/// key is configured, a missing header is `MissingToken` and a wrong header
/// is `InvalidToken`.
///
/// # Errors
///
/// Returns [`TenancyError`] on a missing or mismatched key.
pub fn verify_daemon_key(
    configured: Option<&str>,
    presented: Option<&str>,
) -> Result<(), TenancyError> {
    let Some(expected) = configured else {
        return Ok(());
    };
    let Some(given) = presented else {
        return Err(TenancyError::MissingToken(
            "daemon key required but not presented".to_string(),
        ));
    };
    if constant_time_eq(expected.as_bytes(), given.as_bytes()) {
        Ok(())
    } else {
        Err(TenancyError::InvalidToken("daemon key mismatch".to_string()))
    }
}

/// Claims carried by an agent identity token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentClaims {
    /// Fixed discriminator; anything but `"agent"` is rejected.
    #[serde(rename = "type")]
    pub typ: String,
    /// Tenant the token acts for.
    pub tenant_id: String,
    /// Agent role the token acts as.
    pub role: String,
    /// User the token acts on behalf of, when user-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Mints and validates agent identity tokens with a shared symmetric secret.
#[derive(Clone)]
pub struct AgentTokenService {
    secret: String,
}

impl std::fmt::Debug for AgentTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTokenService").finish_non_exhaustive()
    }
}

impl AgentTokenService {
    /// Build the service from the configured secret.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::ConfigError`] when the secret is absent -
    /// callers decide whether that is fatal for their route.
    pub fn new(secret: Option<&str>) -> Result<Self, TenancyError> {
        match secret {
            Some(s) if !s.is_empty() => Ok(Self {
                secret: s.to_string(),
            }),
            _ => Err(TenancyError::ConfigError(
                "agent token secret is not configured".to_string(),
            )),
        }
    }

    /// Mint a token for outbound control-plane calls (2-hour expiry).
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::ConfigError`] if signing fails.
    pub fn mint(
        &self,
        tenant_id: &str,
        role: &str,
        user_id: Option<&str>,
    ) -> Result<String, TenancyError> {
        let now = Utc::now().timestamp();
        let claims = AgentClaims {
            typ: "agent".to_string(),
            tenant_id: tenant_id.to_string(),
            role: role.to_string(),
            user_id: user_id.map(str::to_string),
            iat: now,
            exp: now + AGENT_TOKEN_TTL_SECS,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| TenancyError::ConfigError(format!("token signing failed: {e}")))
    }

    /// Validate an inbound token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::InvalidToken`] on a bad signature, expired
    /// token, or wrong `type` claim.
    pub fn validate(&self, token: &str) -> Result<AgentClaims, TenancyError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        let data = jsonwebtoken::decode::<AgentClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| TenancyError::InvalidToken(format!("token rejected: {e}")))?;

        if data.claims.typ != "agent" {
            return Err(TenancyError::InvalidToken(format!(
                "token type must be 'agent', got '{}'",
                data.claims.typ
            )));
        }
        Ok(data.claims)
    }

    /// Reject requests whose session key names a different user than the
    /// signed token.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::InvalidToken`] on a mismatch.
    pub fn ensure_session_matches(
        claims: &AgentClaims,
        session: &SessionKey,
    ) -> Result<(), TenancyError> {
        if let Some(token_user) = &claims.user_id
            && token_user != &session.user_id
        {
            return Err(TenancyError::InvalidToken(
                "session key user does not match token".to_string(),
            ));
        }
        Ok(())
    }
}
