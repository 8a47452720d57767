// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Unified model gateway: complete, stream, task, compact."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Abstracts model providers behind four operations:
//!
//! 1. **complete**: one chat completion, with retry and provider failover;
//! 2. **stream**: an ordered event sequence (`start`, `chunk`*, then one
//!    terminal `done` or `error`);
//! 3. **task**: structured JSON output constrained by a caller-supplied
//!    schema, validated shallowly;
//! 4. **compact**: replace the head of a long history with one summary
//!    turn produced by the cheap tier.
//!
//! Providers are OpenAI-compatible chat endpoints registered by name; the
//! model string encoding is `provider/model`, or a bare model name under the
//! default provider. A missing API key is a configuration error, never a
//! silent fallthrough.

mod cancel;
mod client;
mod gateway;
mod retry;
mod schema;

pub use cancel::CancellationToken;
pub use client::{
    ChatRequest, OpenAiCompatClient, ProviderClient, RawCompletion, StreamEvent, default_base_url,
};
pub use gateway::{
    CompactResult, Completion, CompletionRequest, ModelGateway, TaskResult,
};
pub use retry::{backoff_delay, is_retryable};
pub use schema::validate_shallow;

/// Errors surfaced by the provider layer.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No API key is configured for the requested provider.
    #[error("no API key configured for provider '{0}'")]
    MissingKey(String),

    /// The provider name is not registered.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// The upstream call failed (transport or non-2xx).
    #[error("provider '{provider}' call failed: {message}")]
    Upstream {
        /// Provider that failed.
        provider: String,
        /// Failure description (status + body excerpt, or transport error).
        message: String,
    },

    /// The upstream call exceeded its deadline.
    #[error("provider '{provider}' timed out: {message}")]
    Timeout {
        /// Provider that timed out.
        provider: String,
        /// Timeout description with a UTC timestamp for forensics.
        message: String,
    },

    /// The request was cancelled before it finished.
    #[error("provider call cancelled")]
    Cancelled,

    /// The response body could not be decoded.
    #[error("provider '{provider}' returned an undecodable response: {message}")]
    BadResponse {
        /// Provider with the bad body.
        provider: String,
        /// Decode failure description.
        message: String,
    },
}

impl ProviderError {
    /// Whether the failure class is worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { message, .. } => retry::is_retryable(message),
            Self::Timeout { .. } => true,
            Self::MissingKey(_)
            | Self::UnknownProvider(_)
            | Self::Cancelled
            | Self::BadResponse { .. } => false,
        }
    }
}

/// A `provider/model` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    /// Provider name.
    pub provider: String,
    /// Model name as the provider knows it.
    pub model: String,
}

impl ModelRef {
    /// Parse `"provider/model"`, or a bare model under `default_provider`.
    #[must_use]
    pub fn parse(raw: &str, default_provider: &str) -> Self {
        match raw.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Self {
                provider: provider.to_string(),
                model: model.to_string(),
            },
            _ => Self {
                provider: default_provider.to_string(),
                model: raw.to_string(),
            },
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ref_parses_both_encodings() {
        let qualified = ModelRef::parse("anthropic/claude-3-5-haiku", "openai");
        assert_eq!(qualified.provider, "anthropic");
        assert_eq!(qualified.model, "claude-3-5-haiku");

        let bare = ModelRef::parse("gpt-4o-mini", "openai");
        assert_eq!(bare.provider, "openai");
        assert_eq!(bare.model, "gpt-4o-mini");
    }

    #[test]
    fn degenerate_slash_forms_fall_back() {
        assert_eq!(ModelRef::parse("/x", "openai").provider, "openai");
        assert_eq!(ModelRef::parse("x/", "openai").provider, "openai");
    }

    #[test]
    fn retryable_classification() {
        let upstream = ProviderError::Upstream {
            provider: "openai".into(),
            message: "HTTP 503 service unavailable".into(),
        };
        assert!(upstream.is_retryable());

        let auth = ProviderError::Upstream {
            provider: "openai".into(),
            message: "HTTP 401 unauthorized".into(),
        };
        assert!(!auth.is_retryable());

        assert!(!ProviderError::MissingKey("openai".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }
}
