// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Tool-call arbitration: parse, gate, validate, proxy, fan in."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! When a model turn carries tool calls, each one passes through:
//!
//! 1. **parsing**: both tool-call encodings models emit are accepted;
//! 2. **the skill gate**: some admitted skill must declare the tool;
//! 3. **the tenant gate**: the capability set must admit it (deny wins);
//! 4. **argument validation**: path traversal blocks the call, injection
//!    hints only warn;
//! 5. **the proxy**: the control plane executes; the runtime never does;
//! 6. **fan-in**: calls in one turn run concurrently and come back as
//!    role-`tool` messages for the next turn.
//!
//! Denials are audited and never reach the network.

mod parse;
mod validate;

pub use parse::parse_tool_calls;
pub use validate::{ValidationOutcome, validate_arguments};

use async_trait::async_trait;
use futures::future::join_all;
use helm_audit::{AuditLog, NewAuditEntry};
use helm_core::{AuditEventType, Capabilities, ChatMessage, ToolCall, ToolResult};
use helm_control::{ControlPlaneClient, ToolCallContext};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, warn};

/// The execution seam: something that can run one already-permitted tool
/// call. Implemented by the control-plane client; tests substitute fakes.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Execute one tool call, mapping every failure mode into a failed
    /// [`ToolResult`].
    async fn run_tool(
        &self,
        call: &ToolCall,
        context: &ToolCallContext,
        timeout: Duration,
    ) -> ToolResult;
}

#[async_trait]
impl ToolBackend for ControlPlaneClient {
    async fn run_tool(
        &self,
        call: &ToolCall,
        context: &ToolCallContext,
        timeout: Duration,
    ) -> ToolResult {
        let arguments = Value::Object(call.arguments.clone().into_iter().collect());
        self.call_tool(&call.id, &call.name, &arguments, context, timeout).await
    }
}

/// Why a call was denied, for the audit payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// No admitted skill declares the tool.
    Skill,
    /// The tenant's capability set refuses the tool.
    Tenant,
    /// Argument validation failed hard (path traversal).
    Arguments,
}

impl DenialReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Skill => "skill",
            Self::Tenant => "tenant",
            Self::Arguments => "arguments",
        }
    }
}

/// One arbitrated call: the decision trail plus the result.
#[derive(Debug, Clone)]
pub struct ArbitratedCall {
    /// The parsed call.
    pub call: ToolCall,
    /// Whether the call passed both permission gates and validation.
    pub permitted: bool,
    /// Why it was denied, when it was.
    pub denial: Option<DenialReason>,
    /// Advisory warnings (absolute paths, injection hints).
    pub warnings: Vec<String>,
    /// The result fed back to the model (failed for denied calls).
    pub result: ToolResult,
}

/// Arbitration policy inputs for one round.
#[derive(Debug, Clone)]
pub struct RoundPolicy<'a> {
    /// Tool names declared by the admitted skills (union).
    pub skill_permissions: &'a [String],
    /// The tenant's capability set.
    pub capabilities: &'a Capabilities,
    /// Sandbox roots for absolute-path warnings.
    pub sandbox_roots: &'a [String],
}

/// The arbiter itself.
pub struct ToolArbiter {
    backend: std::sync::Arc<dyn ToolBackend>,
    audit: AuditLog,
    timeout: Duration,
}

impl std::fmt::Debug for ToolArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolArbiter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ToolArbiter {
    /// Build an arbiter over an execution backend.
    #[must_use]
    pub fn new(
        backend: std::sync::Arc<dyn ToolBackend>,
        audit: AuditLog,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            audit,
            timeout,
        }
    }

    /// Arbitrate one model turn's calls: gate each, execute the permitted
    /// ones concurrently, and collect every result.
    ///
    /// Results arrive in completion order within the permitted set; each
    /// carries its own timestamps downstream, so consumers needing
    /// determinism sort by time, not index.
    pub async fn execute_round(
        &self,
        calls: Vec<ToolCall>,
        policy: &RoundPolicy<'_>,
        context: &ToolCallContext,
    ) -> Vec<ArbitratedCall> {
        let mut denied = Vec::new();
        let mut permitted = Vec::new();

        for call in calls {
            match self.gate(&call, policy, context) {
                Ok(warnings) => permitted.push((call, warnings)),
                Err((reason, message)) => {
                    denied.push(ArbitratedCall {
                        result: ToolResult::err(&call.id, message, 0),
                        permitted: false,
                        denial: Some(reason),
                        warnings: Vec::new(),
                        call,
                    });
                }
            }
        }

        let executed = join_all(permitted.into_iter().map(|(call, warnings)| {
            let backend = std::sync::Arc::clone(&self.backend);
            let context = context.clone();
            let timeout = self.timeout;
            async move {
                self.audit.record_or_log(
                    &NewAuditEntry::new(&context.tenant_id, AuditEventType::ToolCallRequested)
                        .trace(&context.trace_id)
                        .payload(json!({"tool": call.name, "call_id": call.id})),
                );
                let result = backend.run_tool(&call, &context, timeout).await;
                let event = if result.success {
                    AuditEventType::ToolCallSucceeded
                } else {
                    AuditEventType::ToolCallFailed
                };
                self.audit.record_or_log(
                    &NewAuditEntry::new(&context.tenant_id, event)
                        .trace(&context.trace_id)
                        .payload(json!({
                            "tool": call.name,
                            "call_id": call.id,
                            "duration_ms": result.duration_ms,
                        })),
                );
                ArbitratedCall {
                    permitted: true,
                    denial: None,
                    warnings,
                    result,
                    call,
                }
            }
        }))
        .await;

        let mut out = denied;
        out.extend(executed);
        info!(
            total = out.len(),
            denied = out.iter().filter(|c| !c.permitted).count(),
            trace = %context.trace_id,
            "tool round arbitrated"
        );
        out
    }

    /// Apply both permission gates and argument validation. Returns the
    /// advisory warnings on success.
    fn gate(
        &self,
        call: &ToolCall,
        policy: &RoundPolicy<'_>,
        context: &ToolCallContext,
    ) -> Result<Vec<String>, (DenialReason, String)> {
        // Gate 1: some admitted skill must declare the tool.
        if !policy.skill_permissions.iter().any(|t| t == &call.name) {
            self.audit_denial(call, context, DenialReason::Skill);
            return Err((
                DenialReason::Skill,
                format!("tool '{}' is not declared by any admitted skill", call.name),
            ));
        }

        // Gate 2: the tenant capability set. Deny-list wins.
        if !policy.capabilities.permits_tool(&call.name) {
            self.audit_denial(call, context, DenialReason::Tenant);
            return Err((
                DenialReason::Tenant,
                format!("tool '{}' is refused by tenant policy", call.name),
            ));
        }

        match validate_arguments(call, policy.sandbox_roots) {
            ValidationOutcome::Ok { warnings } => Ok(warnings),
            ValidationOutcome::Blocked { reason } => {
                warn!(tool = %call.name, %reason, "tool call blocked by argument validation");
                self.audit_denial(call, context, DenialReason::Arguments);
                Err((DenialReason::Arguments, reason))
            }
        }
    }

    fn audit_denial(&self, call: &ToolCall, context: &ToolCallContext, reason: DenialReason) {
        self.audit.record_or_log(
            &NewAuditEntry::new(&context.tenant_id, AuditEventType::ToolPermissionDenied)
                .trace(&context.trace_id)
                .payload(json!({
                    "tool": call.name,
                    "call_id": call.id,
                    "reason": reason.as_str(),
                })),
        );
    }
}

/// Format a round's results back into role-`tool` messages, one per call,
/// for the next model turn.
#[must_use]
pub fn results_as_messages(round: &[ArbitratedCall]) -> Vec<ChatMessage> {
    round
        .iter()
        .map(|arbitrated| {
            let body = if arbitrated.result.success {
                arbitrated
                    .result
                    .result
                    .clone()
                    .unwrap_or(Value::Null)
                    .to_string()
            } else {
                json!({
                    "error": arbitrated.result.error,
                    "permitted": arbitrated.permitted,
                })
                .to_string()
            };
            ChatMessage::tool_result(&arbitrated.call.id, body)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_audit::AuditQuery;
    use helm_store::Store;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ToolBackend for CountingBackend {
        async fn run_tool(
            &self,
            call: &ToolCall,
            _context: &ToolCallContext,
            _timeout: Duration,
        ) -> ToolResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolResult::ok(&call.id, json!({"echo": call.name}), 3)
        }
    }

    fn arbiter() -> (ToolArbiter, Arc<CountingBackend>, AuditLog) {
        let backend = Arc::new(CountingBackend {
            calls: AtomicU32::new(0),
        });
        let audit = AuditLog::new(Store::open_in_memory().unwrap());
        (
            ToolArbiter::new(
                Arc::clone(&backend) as Arc<dyn ToolBackend>,
                audit.clone(),
                Duration::from_secs(5),
            ),
            backend,
            audit,
        )
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: BTreeMap::new(),
        }
    }

    fn context() -> ToolCallContext {
        ToolCallContext {
            tenant_id: "t1".to_string(),
            workspace_id: "w1".to_string(),
            trace_id: "tr_1".to_string(),
            agent_token: "tok".to_string(),
        }
    }

    #[tokio::test]
    async fn skill_gate_blocks_without_network() {
        let (arbiter, backend, audit) = arbiter();
        let permissions = vec!["search".to_string()];
        let caps = Capabilities::default();
        let policy = RoundPolicy {
            skill_permissions: &permissions,
            capabilities: &caps,
            sandbox_roots: &[],
        };

        let round = arbiter
            .execute_round(vec![call("c1", "delete_user")], &policy, &context())
            .await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 0, "no proxy call");
        assert!(!round[0].permitted);
        assert_eq!(round[0].denial, Some(DenialReason::Skill));
        assert!(!round[0].result.success);

        let denials = audit
            .query(&AuditQuery {
                event_types: vec![AuditEventType::ToolPermissionDenied],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(denials.total, 1);
        assert_eq!(denials.entries[0].payload["reason"], "skill");
    }

    #[tokio::test]
    async fn tenant_gate_blocks_after_skill_gate_passes() {
        let (arbiter, backend, audit) = arbiter();
        let permissions = vec!["delete_user".to_string()];
        let caps = Capabilities {
            denied_tools: vec!["delete_user".to_string()],
            ..Capabilities::default()
        };
        let policy = RoundPolicy {
            skill_permissions: &permissions,
            capabilities: &caps,
            sandbox_roots: &[],
        };

        let round = arbiter
            .execute_round(vec![call("c1", "delete_user")], &policy, &context())
            .await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(round[0].denial, Some(DenialReason::Tenant));
        let denials = audit
            .query(&AuditQuery {
                event_types: vec![AuditEventType::ToolPermissionDenied],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(denials.entries[0].payload["reason"], "tenant");
    }

    #[tokio::test]
    async fn permitted_calls_run_concurrently_and_audit() {
        let (arbiter, backend, audit) = arbiter();
        let permissions = vec!["search".to_string(), "fetch".to_string()];
        let caps = Capabilities::default();
        let policy = RoundPolicy {
            skill_permissions: &permissions,
            capabilities: &caps,
            sandbox_roots: &[],
        };

        let round = arbiter
            .execute_round(
                vec![call("c1", "search"), call("c2", "fetch")],
                &policy,
                &context(),
            )
            .await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert!(round.iter().all(|c| c.permitted && c.result.success));

        let requested = audit
            .query(&AuditQuery {
                event_types: vec![AuditEventType::ToolCallRequested],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(requested.total, 2);
        let succeeded = audit
            .query(&AuditQuery {
                event_types: vec![AuditEventType::ToolCallSucceeded],
                ..AuditQuery::default()
            })
            .unwrap();
        assert_eq!(succeeded.total, 2);
    }

    #[tokio::test]
    async fn traversal_argument_blocks_pre_proxy() {
        let (arbiter, backend, _) = arbiter();
        let permissions = vec!["read_file".to_string()];
        let caps = Capabilities::default();
        let policy = RoundPolicy {
            skill_permissions: &permissions,
            capabilities: &caps,
            sandbox_roots: &[],
        };

        let mut bad = call("c1", "read_file");
        bad.arguments
            .insert("path".to_string(), json!("../../etc/passwd"));

        let round = arbiter.execute_round(vec![bad], &policy, &context()).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(round[0].denial, Some(DenialReason::Arguments));
    }

    #[tokio::test]
    async fn mixed_round_returns_every_result() {
        let (arbiter, _, _) = arbiter();
        let permissions = vec!["search".to_string()];
        let caps = Capabilities::default();
        let policy = RoundPolicy {
            skill_permissions: &permissions,
            capabilities: &caps,
            sandbox_roots: &[],
        };

        let round = arbiter
            .execute_round(
                vec![call("c1", "search"), call("c2", "unlisted")],
                &policy,
                &context(),
            )
            .await;
        assert_eq!(round.len(), 2);

        let messages = results_as_messages(&round);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.role == helm_core::Role::Tool));
        let denied_msg = messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c2"))
            .unwrap();
        assert!(denied_msg.content.contains("\"permitted\":false"));
    }
}
