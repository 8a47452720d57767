// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Shared domain types for the agent-helm execution runtime."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! This crate holds the contract types every other `helm-*` crate speaks:
//! tenant identity and capabilities, session keys, chat messages and token
//! usage, the model pricing table, tool calls and results, the execution
//! trace model, and the closed audit event vocabulary.
//!
//! Nothing here performs I/O. Types reference each other by id and hash,
//! never by pointer, so the graph stays acyclic and serializable.

mod audit;
mod identity;
mod message;
mod pricing;
mod tool;
mod trace;

pub use audit::AuditEventType;
pub use identity::{Capabilities, SessionKey, TenantIdentity};
pub use message::{ChatMessage, Role, TokenUsage, estimate_tokens};
pub use pricing::{CostBreakdown, ModelPrice, cost_for, price_for};
pub use tool::{ToolCall, ToolResult};
pub use trace::{
    EntityLinks, StepDetail, Trace, TraceOutput, TraceStep, ToolCallSummary, next_trace_id,
};
