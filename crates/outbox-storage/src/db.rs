//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, Transaction};
use tracing::info;

use outbox_core::error::OutboxError;

use crate::migrations;

/// Thread-safe SQLite database wrapper.
///
/// Every statement runs under the mutex, so a single `UPDATE` issued through
/// `with_conn` is atomic with respect to every other caller in the process.
/// WAL mode plus `busy_timeout` covers other processes opening the same file.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL, a busy timeout, and runs
    /// all pending migrations.
    pub fn new(path: &Path) -> Result<Self, OutboxError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| OutboxError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| OutboxError::Storage(format!("Failed to set pragmas: {}", e)))?;

        info!("Database opened at {}", path.display());

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, OutboxError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| OutboxError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, OutboxError>
    where
        F: FnOnce(&Connection) -> Result<T, OutboxError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Execute a closure inside a transaction, committing on `Ok`.
    ///
    /// The transaction rolls back when dropped after an `Err`.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, OutboxError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, OutboxError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| OutboxError::Storage(format!("Failed to begin transaction: {}", e)))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| OutboxError::Storage(format!("Failed to commit transaction: {}", e)))?;
        Ok(value)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, OutboxError> {
        self.conn
            .lock()
            .map_err(|e| OutboxError::Storage(format!("Database lock poisoned: {}", e)))
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}
