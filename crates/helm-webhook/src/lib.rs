// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fire-and-forget signed webhooks.
//!
//! On completion or terminal error the orchestrator fires an optional
//! callback. The send is spawned off the request path; webhook latency or
//! failure never delays the client response; failures surface only in logs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use helm_core::{CostBreakdown, TokenUsage};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Webhook send deadline.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Signature header set when a secret is configured.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Caller-supplied webhook target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Callback URL.
    pub url: String,
    /// HMAC secret; when present the payload is signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Extra headers to attach.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// What happened, for the payload's `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    /// The execution completed.
    Completed,
    /// The execution failed terminally.
    Error,
}

impl WebhookEvent {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "agent.completed",
            Self::Error => "agent.error",
        }
    }
}

/// Build the JSON payload for a completion or error callback.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn build_payload(
    event: WebhookEvent,
    task_id: Option<&str>,
    user_id: Option<&str>,
    agent_role: Option<&str>,
    response: Option<&str>,
    error: Option<&str>,
    usage: Option<&TokenUsage>,
    cost: Option<&CostBreakdown>,
    metadata: Option<&Value>,
) -> Value {
    let mut payload = json!({
        "event": event.as_str(),
        "timestamp": Utc::now().to_rfc3339(),
    });
    let object = payload.as_object_mut().expect("payload is an object");
    if let Some(v) = task_id {
        object.insert("task_id".to_string(), json!(v));
    }
    if let Some(v) = user_id {
        object.insert("user_id".to_string(), json!(v));
    }
    if let Some(v) = agent_role {
        object.insert("agent_role".to_string(), json!(v));
    }
    if let Some(v) = response {
        object.insert("response".to_string(), json!(v));
    }
    if let Some(v) = error {
        object.insert("error".to_string(), json!(v));
    }
    if let Some(v) = usage {
        object.insert("usage".to_string(), json!(v));
    }
    if let Some(v) = cost {
        object.insert("cost".to_string(), json!(v));
    }
    if let Some(v) = metadata {
        object.insert("metadata".to_string(), v.clone());
    }
    payload
}

/// Hex HMAC-SHA256 of the serialized payload.
#[must_use]
pub fn sign(secret: &str, serialized: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(serialized.as_bytes());
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Send the payload now, within the 10-second deadline. Used by
/// [`fire_and_forget`]; exposed for tests.
///
/// # Errors
///
/// Returns the transport or HTTP failure as a string (log-only upstream).
pub async fn deliver(config: &WebhookConfig, payload: &Value) -> Result<(), String> {
    let serialized = payload.to_string();
    let client = reqwest::Client::builder()
        .timeout(WEBHOOK_TIMEOUT)
        .build()
        .unwrap_or_default();

    let mut request = client
        .post(&config.url)
        .header("Content-Type", "application/json");
    if let Some(secret) = &config.secret {
        request = request.header(SIGNATURE_HEADER, sign(secret, &serialized));
    }
    for (name, value) in &config.headers {
        request = request.header(name, value);
    }

    let response = request
        .body(serialized)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("webhook endpoint returned {status}"));
    }
    Ok(())
}

/// Spawn the delivery off the request path. Failures are logged and
/// swallowed.
pub fn fire_and_forget(config: WebhookConfig, payload: Value) {
    tokio::spawn(async move {
        match deliver(&config, &payload).await {
            Ok(()) => debug!(url = %config.url, "webhook delivered"),
            Err(error) => warn!(url = %config.url, %error, "webhook delivery failed"),
        }
    });
}
