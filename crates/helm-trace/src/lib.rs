// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Trace building, persistence, diffing, annotations, and retention."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The trace subsystem records one sealed [`helm_core::Trace`] per
//! execution. The [`TraceBuilder`] accumulates steps while the orchestrator
//! runs and seals exactly once (sealing consumes the builder). The
//! [`TraceStore`] persists sealed traces under a tenant scope; [`diff_traces`]
//! compares two sealed traces; annotations are append-only; and
//! [`RetentionManager`] drives sampling admission and age-based deletion.

mod builder;
mod diff;
mod retention;
mod store;

pub use builder::TraceBuilder;
pub use diff::{SkillVersionChange, ToolCallChange, TraceDiff, diff_traces};
pub use retention::{RetentionManager, RetentionPolicy, RetentionStats, SamplingStrategy};
pub use store::{Annotation, ReplayContext, TraceFilter, TracePage, TraceStore, TraceSummaryRow};
