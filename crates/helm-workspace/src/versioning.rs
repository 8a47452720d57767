// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workspace snapshots, diffs, and rollback.
//!
//! A snapshot captures every workspace file with a per-file SHA-256 and a
//! roll-up hash over the sorted `path:hash` lines; the roll-up hash is the
//! snapshot id, so identical on-disk contents always yield the identical
//! snapshot. Snapshots are immutable once stored.

use crate::WorkspaceError;
use chrono::{DateTime, Utc};
use helm_audit::{AuditLog, NewAuditEntry};
use helm_core::AuditEventType;
use helm_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

/// Stored form of one snapshotted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// Hex SHA-256 of the content.
    pub sha256: String,
    /// Size in bytes.
    pub size: u64,
    /// Full content, retained so rollback can restore it.
    pub content: String,
}

/// Descriptor of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Roll-up hash (snapshot id).
    pub hash: String,
    /// Workspace the snapshot belongs to.
    pub workspace_id: String,
    /// Operator-supplied message.
    pub message: String,
    /// Number of captured files.
    pub file_count: usize,
    /// Sum of file sizes in bytes.
    pub total_size: u64,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// Per-file change classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Present only in the newer snapshot.
    Added,
    /// Present in both with different content.
    Modified,
    /// Present only in the older snapshot.
    Deleted,
    /// Present in both with identical content.
    Unchanged,
}

/// One file's diff entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the workspace root.
    pub path: PathBuf,
    /// Change classification.
    pub status: FileStatus,
    /// Size in the older snapshot, when present there.
    pub old_size: Option<u64>,
    /// Size in the newer snapshot, when present there.
    pub new_size: Option<u64>,
}

/// Result of comparing two snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkspaceDiff {
    /// Per-file entries, sorted by path.
    pub changes: Vec<FileChange>,
}

impl WorkspaceDiff {
    /// Entries with the given status.
    #[must_use]
    pub fn with_status(&self, status: FileStatus) -> Vec<&FileChange> {
        self.changes.iter().filter(|c| c.status == status).collect()
    }

    /// `true` when every entry is unchanged.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.changes.iter().all(|c| c.status == FileStatus::Unchanged)
    }
}

/// Snapshot repository + rollback over the shared store.
#[derive(Debug, Clone)]
pub struct VersionManager {
    store: Store,
    audit: AuditLog,
}

impl VersionManager {
    /// Wrap the shared store and audit log.
    #[must_use]
    pub fn new(store: Store, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Capture a snapshot of the workspace tree at `root`.
    ///
    /// Identical contents always produce the identical hash, and re-storing
    /// an existing snapshot is a no-op (snapshots are immutable).
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] on read or store failure.
    pub fn snapshot(
        &self,
        workspace_id: &str,
        root: &Path,
        message: &str,
    ) -> Result<SnapshotInfo, WorkspaceError> {
        let files = read_tree(root)?;
        let hash = rollup_hash(&files);
        let info = SnapshotInfo {
            hash: hash.clone(),
            workspace_id: workspace_id.to_string(),
            message: message.to_string(),
            file_count: files.len(),
            total_size: files.values().map(|f| f.size).sum(),
            created_at: Utc::now(),
        };

        let files_json = serde_json::to_string(&files).map_err(helm_store::StoreError::from)?;
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO workspace_versions
                     (hash, workspace_id, message, files, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    info.hash,
                    info.workspace_id,
                    info.message,
                    files_json,
                    info.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        info!(workspace = workspace_id, hash = %info.hash, files = info.file_count, "snapshot stored");
        Ok(info)
    }

    /// Load a snapshot's file map.
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::UnknownSnapshot`] when absent.
    pub fn files(&self, hash: &str) -> Result<BTreeMap<PathBuf, SnapshotFile>, WorkspaceError> {
        let raw: Option<String> = self.store.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT files FROM workspace_versions WHERE hash = ?1")?;
            let mut rows = stmt.query([hash])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })?;
        let raw = raw.ok_or_else(|| WorkspaceError::UnknownSnapshot(hash.to_string()))?;
        serde_json::from_str(&raw)
            .map_err(|e| WorkspaceError::Store(helm_store::StoreError::Json(e)))
    }

    /// Diff two snapshots: per-file status with old/new sizes.
    ///
    /// `diff(h, h)` is all-unchanged; swapping the arguments swaps
    /// added/deleted.
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::UnknownSnapshot`] when either hash is absent.
    pub fn diff(&self, old_hash: &str, new_hash: &str) -> Result<WorkspaceDiff, WorkspaceError> {
        let old = self.files(old_hash)?;
        let new = self.files(new_hash)?;

        let mut changes = Vec::new();
        for (path, old_file) in &old {
            match new.get(path) {
                None => changes.push(FileChange {
                    path: path.clone(),
                    status: FileStatus::Deleted,
                    old_size: Some(old_file.size),
                    new_size: None,
                }),
                Some(new_file) => changes.push(FileChange {
                    path: path.clone(),
                    status: if old_file.sha256 == new_file.sha256 {
                        FileStatus::Unchanged
                    } else {
                        FileStatus::Modified
                    },
                    old_size: Some(old_file.size),
                    new_size: Some(new_file.size),
                }),
            }
        }
        for (path, new_file) in &new {
            if !old.contains_key(path) {
                changes.push(FileChange {
                    path: path.clone(),
                    status: FileStatus::Added,
                    old_size: None,
                    new_size: Some(new_file.size),
                });
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(WorkspaceDiff { changes })
    }

    /// Overwrite the live workspace tree from a snapshot and audit the
    /// change. Files not present in the snapshot are left in place; callers
    /// invalidate any live [`crate::WorkspaceLoader`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] on an unknown snapshot or write failure.
    pub fn rollback(
        &self,
        workspace_id: &str,
        root: &Path,
        hash: &str,
    ) -> Result<usize, WorkspaceError> {
        let files = self.files(hash)?;
        for (path, file) in &files {
            let target = root.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|source| WorkspaceError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
            std::fs::write(&target, &file.content).map_err(|source| WorkspaceError::Io {
                path: target.display().to_string(),
                source,
            })?;
        }
        self.audit.record_or_log(
            &NewAuditEntry::new("system", AuditEventType::WorkspaceChange)
                .workspace(workspace_id)
                .payload(json!({
                    "action": "rollback",
                    "hash": hash,
                    "files": files.len(),
                })),
        );
        Ok(files.len())
    }

    /// Snapshots recorded for a workspace, newest first.
    ///
    /// # Errors
    ///
    /// Returns a store error on query failure.
    pub fn history(&self, workspace_id: &str) -> Result<Vec<SnapshotInfo>, WorkspaceError> {
        let rows = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT hash, workspace_id, message, files, created_at
                 FROM workspace_versions WHERE workspace_id = ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([workspace_id], |row| {
                let files_raw: String = row.get(3)?;
                let created: String = row.get(4)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    files_raw,
                    created,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut infos = Vec::new();
        for (hash, workspace_id, message, files_raw, created) in rows {
            let files: BTreeMap<PathBuf, SnapshotFile> =
                serde_json::from_str(&files_raw).unwrap_or_default();
            infos.push(SnapshotInfo {
                hash,
                workspace_id,
                message,
                file_count: files.len(),
                total_size: files.values().map(|f| f.size).sum(),
                created_at: created.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(infos)
    }
}

/// Read the workspace tree into a file map. Only regular files are captured;
/// hidden directories are skipped.
fn read_tree(root: &Path) -> Result<BTreeMap<PathBuf, SnapshotFile>, WorkspaceError> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
        !(e.depth() > 0
            && e.file_type().is_dir()
            && e.file_name().to_string_lossy().starts_with('.'))
    });

    for entry in walker {
        let entry = entry.map_err(|e| WorkspaceError::Io {
            path: root.display().to_string(),
            source: std::io::Error::other(e),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let abs = entry.path();
        let rel = abs.strip_prefix(root).unwrap_or(abs).to_path_buf();
        let content = std::fs::read_to_string(abs).map_err(|source| WorkspaceError::Io {
            path: abs.display().to_string(),
            source,
        })?;

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        files.insert(
            rel,
            SnapshotFile {
                sha256: format!("{:x}", hasher.finalize()),
                size: content.len() as u64,
                content,
            },
        );
    }
    Ok(files)
}

/// Roll-up hash over the sorted `path:hash` lines.
fn rollup_hash(files: &BTreeMap<PathBuf, SnapshotFile>) -> String {
    let mut hasher = Sha256::new();
    for (path, file) in files {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(b":");
        hasher.update(file.sha256.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
