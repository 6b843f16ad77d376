//! Stixgraph relational mirror
//!
//! Selected object fields are mirrored into SQLite tables so comparisons on
//! them can be answered without scanning a primary collection:
//!
//! ```text
//!   object ──► Optimizer("ipv4-addr:value")
//!                 │ strip(value)          │ insert(value, doc_ref, object_id)
//!                 ▼                       ▼
//!           primary store           ┌───────────────────────────────┐
//!           (value removed)         │ feed_1700000000_<suffix>      │
//!                                   │ value | doc_ref | object_id   │
//!                                   └───────────────────────────────┘
//!                 ▲                       │
//!                 └──── re-joined at query time ◄┘
//! ```
//!
//! The mirror is at-least-once: a row may outlive the primary document it
//! points at. [`Optimizer::reconcile`] removes such rows.

pub mod network;
pub mod optimizer;

#[cfg(test)]
mod tests;

pub use network::NetworkRange;
pub use optimizer::{ColumnKind, MirrorRow, Optimizer, OptimizerDescriptor, OPTIMIZER_CLASS};

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, DatabaseName};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Rows written before the open transaction is committed.
pub const DEFAULT_COMMIT_EVERY: usize = 1000;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// The object can not be mirrored by this optimizer; ingestion skips it.
    #[error("object can not be mirrored on `{field}`: {reason}")]
    InvalidObjectForOptimizer { field: String, reason: String },

    #[error("invalid optimizer field path `{0}`")]
    InvalidFieldPath(String),

    #[error("unknown optimizer class `{0}`")]
    UnknownOptimizerClass(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, MirrorError>;

pub(crate) struct MirrorInner {
    pub(crate) conn: Connection,
    in_transaction: bool,
}

impl MirrorInner {
    pub(crate) fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
        }
        Ok(())
    }
}

/// Shared handle to the mirror database.
///
/// Cloning is cheap; every clone talks to the same connection. Writes are
/// grouped into transactions that optimizers commit periodically.
#[derive(Clone)]
pub struct MirrorConnection {
    inner: Arc<Mutex<MirrorInner>>,
    commit_every: usize,
}

impl std::fmt::Debug for MirrorConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorConnection")
            .field("commit_every", &self.commit_every)
            .finish()
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl MirrorConnection {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA case_sensitive_like = ON;")?;
        Ok(Self {
            inner: Arc::new(Mutex::new(MirrorInner {
                conn,
                in_transaction: false,
            })),
            commit_every: DEFAULT_COMMIT_EVERY,
        })
    }

    pub fn with_commit_every(mut self, rows: usize) -> Self {
        self.commit_every = rows.max(1);
        self
    }

    pub fn commit_every(&self) -> usize {
        self.commit_every
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MirrorInner> {
        self.inner.lock()
    }

    /// Commits the open write transaction, if any.
    pub fn commit(&self) -> Result<()> {
        self.lock().commit()
    }

    /// Names of all mirror tables.
    pub fn tables(&self) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut stmt = inner
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn has_table(&self, name: &str) -> Result<bool> {
        let inner = self.lock();
        let count: i64 = inner.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Drops a table; `Ok(false)` if it did not exist.
    pub fn drop_table(&self, name: &str) -> Result<bool> {
        let existed = self.has_table(name)?;
        if existed {
            let mut inner = self.lock();
            inner.begin()?;
            inner
                .conn
                .execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
            inner.commit()?;
            tracing::debug!(table = %name, "dropped mirror table");
        }
        Ok(existed)
    }

    /// Drops every table whose name starts with `prefix`.
    pub fn drop_tables_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let doomed: Vec<String> = self
            .tables()?
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect();
        for name in &doomed {
            self.drop_table(name)?;
        }
        Ok(doomed)
    }

    /// Online backup of the whole mirror to `path`.
    pub fn backup_to(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock();
        inner.commit()?;
        inner.conn.backup(DatabaseName::Main, path, None)?;
        Ok(())
    }

    /// Replaces the mirror's contents with a backup taken by
    /// [`MirrorConnection::backup_to`].
    pub fn restore_from(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock();
        inner.commit()?;
        inner
            .conn
            .restore(DatabaseName::Main, path, None::<fn(rusqlite::backup::Progress)>)?;
        Ok(())
    }
}
