//! SQLite-backed entity store.
//!
//! `EngineDb` owns the connection and all SQL; it is split across one file
//! per component (workflows, pulses, sessions, costs, artifacts, reviews).
//! `DbHandle` is the async-safe wrapper used by the rest of the crate.

mod artifacts;
mod costs;
mod migrations;
mod pulses;
mod reviews;
mod sessions;
mod workflows;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use rusqlite::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{EngineError, EngineResult};

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> EngineResult<R>
    where
        F: FnOnce(&EngineDb) -> EngineResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| EngineError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used in contexts where
    /// blocking is acceptable: startup initialization and tests. Callers
    /// must ensure this is NOT called from a hot async path.
    pub fn lock_sync(&self) -> EngineResult<std::sync::MutexGuard<'_, EngineDb>> {
        self.inner.lock().map_err(|_| EngineError::LockPoisoned)
    }
}

/// Synchronous store over a single SQLite connection.
pub struct EngineDb {
    pub(crate) conn: Connection,
}

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and apply any
    /// unapplied migrations. A migration failure aborts the open.
    pub fn new(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> EngineResult<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> EngineResult<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        migrations::apply(&self.conn)?;
        Ok(())
    }

    /// Ids of migrations recorded in the ledger, in application order.
    pub fn applied_migrations(&self) -> EngineResult<Vec<String>> {
        migrations::applied(&self.conn).map_err(EngineError::from)
    }
}

/// Parse a JSON column into a typed value. Failures name the field so a
/// corrupt row is diagnosable, never silently coerced.
pub(crate) fn parse_json_field<T: DeserializeOwned>(
    field: &'static str,
    raw: &str,
) -> EngineResult<T> {
    serde_json::from_str(raw).map_err(|source| EngineError::SchemaValidation { field, source })
}

/// Serialize a value for a JSON column, naming the field on failure.
pub(crate) fn to_json_field<T: Serialize>(field: &'static str, value: &T) -> EngineResult<String> {
    serde_json::to_string(value).map_err(|source| EngineError::SchemaValidation { field, source })
}
