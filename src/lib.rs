// SPDX-License-Identifier: MIT OR Apache-2.0
//! agent-helm; a governed, stateless agent execution runtime.
//!
//! The functional crates live under `crates/`:
//!
//! | crate | concern |
//! |---|---|
//! | `helm-core` | shared domain types |
//! | `helm-error` | closed error taxonomy |
//! | `helm-config` | environment-driven configuration |
//! | `helm-store` | embedded SQLite store (WAL) |
//! | `helm-tenancy` | tokens and RBAC |
//! | `helm-workspace` | bootstrap files, snapshots, environments, pins |
//! | `helm-skills` | skill manifests, registry, lifecycle, test runner |
//! | `helm-redact` | PII redaction |
//! | `helm-budget` | tenant budgets and forecasting |
//! | `helm-audit` | append-only audit log |
//! | `helm-trace` | trace building, diffing, retention |
//! | `helm-provider` | model gateway with retry and failover |
//! | `helm-arbiter` | tool-call gating and proxying |
//! | `helm-control` | control-plane client |
//! | `helm-webhook` | signed completion callbacks |
//! | `helm-runtime` | the per-request orchestrator |
//! | `helm-daemon` | the HTTP surface and ops read API |
//!
//! This root package only hosts the cross-crate integration tests under
//! `tests/`.

#![deny(unsafe_code)]
