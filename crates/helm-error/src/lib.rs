// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable wire codes for agent-helm.
//!
//! Every runtime error carries an [`ErrorKind`] (a machine-readable, stable
//! snake_case tag that maps 1:1 onto an HTTP status), a human-readable
//! message, and arbitrary key-value details. Use the builder returned by
//! [`HelmError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable, stable error kind.
///
/// The serialized form is guaranteed not to change across patch releases;
/// clients switch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request body or parameters were malformed.
    Validation,
    /// No credential was presented where one was required.
    AuthMissing,
    /// A credential was presented but failed validation.
    AuthInvalid,
    /// The caller is authenticated but not allowed to do this.
    PermissionDenied,
    /// The referenced resource does not exist (in the caller's tenant).
    NotFound,
    /// An idempotency key was replayed with a different payload.
    IdempotencyConflict,
    /// The caller exceeded a rate limit.
    RateLimited,
    /// The tenant's budget blocks the operation.
    BudgetExceeded,
    /// The runtime is misconfigured (missing secret, bad key, …).
    ConfigError,
    /// An upstream dependency (model provider, control plane) is down.
    UpstreamUnavailable,
    /// An outbound call exceeded its deadline.
    Timeout,
    /// Catch-all for unexpected internal failures.
    Internal,
}

impl ErrorKind {
    /// Stable wire code, e.g. `"budget_exceeded"`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::AuthMissing => "auth_missing",
            Self::AuthInvalid => "auth_invalid",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::RateLimited => "rate_limited",
            Self::BudgetExceeded => "budget_exceeded",
            Self::ConfigError => "config_error",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    /// HTTP status this kind maps to.
    ///
    /// `budget_exceeded` maps to 402 so it stays distinguishable from rate
    /// limiting at the edge.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::AuthMissing | Self::AuthInvalid => 401,
            Self::BudgetExceeded => 402,
            Self::PermissionDenied => 403,
            Self::NotFound => 404,
            Self::IdempotencyConflict => 409,
            Self::RateLimited => 429,
            Self::ConfigError | Self::Internal => 500,
            Self::UpstreamUnavailable => 502,
            Self::Timeout => 504,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HelmError
// ---------------------------------------------------------------------------

/// Unified runtime error.
///
/// # Builder usage
///
/// ```
/// use helm_error::{ErrorKind, HelmError};
///
/// let err = HelmError::new(ErrorKind::Timeout, "tool call timed out after 30000ms")
///     .with_detail("tool", "search")
///     .with_detail("timeout_ms", 30_000);
/// assert_eq!(err.kind.http_status(), 504);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HelmError {
    /// Machine-readable kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Structured diagnostic details. Must never contain another tenant's
    /// identifiers.
    pub details: BTreeMap<String, serde_json::Value>,
    /// Trace id of the failed execution, when one exists.
    pub trace_id: Option<String>,
}

impl HelmError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: BTreeMap::new(),
            trace_id: None,
        }
    }

    /// Attach a key-value pair to the diagnostic details.
    ///
    /// Values that fail to serialize are silently skipped.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Attach the trace id of the failed execution.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// The JSON body served over the wire: `{error, code, details?}`.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        WireError {
            error: self.message.clone(),
            code: Some(self.kind.as_str().to_string()),
            details: if self.details.is_empty() {
                None
            } else {
                Some(self.details.clone())
            },
            trace_id: self.trace_id.clone(),
        }
    }

    // -- Convenience constructors ------------------------------------------

    /// 400; malformed request.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// 401; missing credential.
    pub fn auth_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthMissing, message)
    }

    /// 401; bad credential.
    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthInvalid, message)
    }

    /// 403; not allowed.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    /// 404; no such resource in the caller's tenant.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// 402; blocked by budget.
    pub fn budget_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BudgetExceeded, message)
    }

    /// 500; runtime misconfiguration.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigError, message)
    }

    /// 502; upstream dependency failed.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    /// 504; deadline exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// 500; unexpected internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for HelmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for HelmError {}

/// Result alias used across the runtime crates.
pub type HelmResult<T> = Result<T, HelmError>;

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

/// JSON error body served to clients: `{error, code?, details?, trace_id?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    /// Human-readable message.
    pub error: String,
    /// Stable machine code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, serde_json::Value>>,
    /// Trace id for ops inspection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}
