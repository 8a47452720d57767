// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Workspace loading, prompt composition, versioning, and pins."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The workspace is a content-addressed collection of markdown bootstrap
//! files on disk (`AGENTS.md`, `SOUL.md`, `souls/<role>.md`, `IDENTITY.md`,
//! `TOOLS.md`, `HEARTBEAT.md`, `USER.md`, `MEMORY.md`, dated memory files,
//! and `skills/<name>/SKILL.md` folders). This crate owns:
//!
//! - the [`WorkspaceLoader`]: cached, truncating file reads and system
//!   prompt composition (full and minimal modes, memory and time context);
//! - versioning: immutable content-hashed snapshots, diffs, and rollback;
//! - environments and pins: named bindings (dev/staging/prod) from an
//!   environment to a snapshot hash plus skill/model pins, with locking and
//!   promotion;
//! - impact analysis: a structured "what would this diff break" report.

mod envs;
mod impact;
mod loader;
mod versioning;

pub use envs::{EnvironmentManager, Pin, WorkspaceEnvironment};
pub use impact::{
    FileBuckets, ImpactInput, ImpactReport, RiskLevel, SkillRef, analyze_impact,
};
pub use loader::{
    BootstrapFileStat, LoadedFile, MemoryContext, PromptMode, TimeContext, WorkspaceLoader, files,
};
pub use versioning::{
    FileChange, FileStatus, SnapshotFile, SnapshotInfo, VersionManager, WorkspaceDiff,
};

/// Errors surfaced by the workspace subsystem.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Filesystem failure under the workspace root.
    #[error("workspace io error at {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Store failure underneath versions/environments/pins.
    #[error(transparent)]
    Store(#[from] helm_store::StoreError),

    /// The referenced snapshot does not exist.
    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(String),

    /// The referenced environment does not exist.
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    /// A promotion precondition failed (locked target, empty source, or a
    /// forbidden source).
    #[error("promotion refused: {0}")]
    PromotionRefused(String),
}
