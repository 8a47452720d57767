// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Token validation, minting, and RBAC for agent-helm."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Two parallel credential types guard the runtime:
//!
//! - the **daemon service token**: an optional shared secret on a fixed
//!   header; when configured, every agent request must carry it;
//! - the **agent identity token**: a symmetric-signed JWT (`type=agent`)
//!   that the runtime both validates on inbound traffic and mints for its
//!   own calls to the control plane.
//!
//! Operations Console callers present OIDC JWTs instead; those are projected
//! into an [`OpsIdentity`] and checked against the static role/permission
//! table in [`rbac`].

mod ops;
mod rbac;
mod token;

pub use ops::{ClaimNames, OpsIdentity, OpsVerifier};
pub use rbac::{ALL_PERMISSIONS, OpsRole, Permission, has_permission};
pub use token::{AgentClaims, AgentTokenService, verify_daemon_key};

/// Errors surfaced by the tenancy layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TenancyError {
    /// No credential was presented where one was required.
    #[error("missing token: {0}")]
    MissingToken(String),

    /// The credential failed signature, expiry, or shape validation.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The runtime lacks the secret needed to validate or mint.
    #[error("tenancy config error: {0}")]
    ConfigError(String),

    /// A required claim is absent from an otherwise valid token.
    #[error("missing claim: {0}")]
    MissingClaim(String),

    /// The caller is authenticated but not allowed to do this.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl TenancyError {
    /// Stable wire code for this failure (`missing_token`, `invalid_token`,
    /// `config_error`, `missing_claim`, `permission_denied`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken(_) => "missing_token",
            Self::InvalidToken(_) => "invalid_token",
            Self::ConfigError(_) => "config_error",
            Self::MissingClaim(_) => "missing_claim",
            Self::PermissionDenied(_) => "permission_denied",
        }
    }
}
