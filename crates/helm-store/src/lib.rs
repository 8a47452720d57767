// SPDX-License-Identifier: MIT OR Apache-2.0
//! Embedded relational store for agent-helm.
//!
//! A single SQLite file in WAL mode (readers don't block the writer), with
//! idempotent schema initialization and additive migrations applied on open.
//! Repositories in the domain crates (`helm-audit`, `helm-trace`, …) run
//! their statements through [`Store::with_conn`] / [`Store::with_tx`]; every
//! multi-statement write that must be atomic goes through a transaction so
//! no partial write is ever committed.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod schema;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub use schema::MIGRATIONS;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure (I/O, constraint, busy, …).
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure while preparing the database path.
    #[error("store io error at {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// JSON (de)serialization failure for a stored column.
    #[error("store json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation violates a store-level invariant.
    #[error("invalid store operation: {0}")]
    Invalid(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the embedded store. Cheap to clone; all clones share one
/// connection serialized behind a mutex (SQLite's WAL journal serializes
/// writers anyway).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store at `path`, creating parent directories,
    /// enabling WAL mode, and applying pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory cannot be created, the file
    /// cannot be opened, or a migration fails. Callers treat this as fatal
    /// at startup.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.apply_migrations()?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Open an in-memory store with the full schema. Test-only convenience.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if schema initialization fails.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.apply_migrations()?;
        Ok(store)
    }

    /// Run `f` with the shared connection.
    ///
    /// # Errors
    ///
    /// Propagates whatever `f` returns.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn)
    }

    /// Run `f` inside an immediate transaction; commit on `Ok`, roll back on
    /// `Err`. Writes that span multiple statements must use this.
    ///
    /// # Errors
    ///
    /// Propagates `f`'s error after rolling back, or the commit failure.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Rollback happens on drop; surface the original error.
                Err(err)
            }
        }
    }

    // -- migrations --------------------------------------------------------

    /// Apply every migration that has not been recorded yet. Idempotent:
    /// re-opening an up-to-date store is a no-op.
    fn apply_migrations(&self) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS migrations (
                 name TEXT PRIMARY KEY,
                 applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
             );",
        )?;

        for (name, sql) in MIGRATIONS {
            let applied: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM migrations WHERE name = ?1",
                    [name],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n > 0)?;
            if applied {
                continue;
            }

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute_batch(sql)?;
            tx.execute("INSERT INTO migrations (name) VALUES (?1)", [name])?;
            tx.commit()?;
            debug!(migration = name, "migration applied");
        }
        Ok(())
    }

    /// Names of applied migrations, in application order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on query failure.
    pub fn applied_migrations(&self) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM migrations ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut names = Vec::new();
            for row in rows {
                names.push(row?);
            }
            Ok(names)
        })
    }
}
