//! Database schema migrations.
//!
//! Applies the outbox schema: the `actions` queue table with its dispatch
//! and per-entity indexes, plus the `schema_migrations` bookkeeping table.

use rusqlite::Connection;
use tracing::info;

use outbox_core::error::OutboxError;

/// Latest schema version known to this build.
pub const CURRENT_VERSION: i64 = 1;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), OutboxError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| OutboxError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version = schema_version(conn)?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: action_queue");
    }

    Ok(())
}

/// Highest applied migration version, 0 for a fresh database.
pub fn schema_version(conn: &Connection) -> Result<i64, OutboxError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| OutboxError::Storage(format!("Failed to query migration version: {}", e)))
}

/// Version 1: action queue.
fn apply_v1(conn: &Connection) -> Result<(), OutboxError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS actions (
            id                TEXT PRIMARY KEY NOT NULL,
            action_type       TEXT NOT NULL,
            payload           TEXT NOT NULL DEFAULT '{}',
            status            TEXT NOT NULL
                              CHECK (status IN ('pending', 'in_flight', 'failed', 'completed')),
            retry_count       INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            last_error        TEXT,
            idempotency_key   TEXT,
            created_at        INTEGER NOT NULL,
            updated_at        INTEGER NOT NULL,
            available_at      INTEGER NOT NULL,
            priority          INTEGER NOT NULL DEFAULT 0,
            target_entity_id  TEXT,
            CHECK (available_at >= created_at)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_actions_idempotency_key
            ON actions (idempotency_key)
            WHERE idempotency_key IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_actions_dispatch
            ON actions (status, available_at, priority);

        CREATE INDEX IF NOT EXISTS idx_actions_entity
            ON actions (target_entity_id, created_at)
            WHERE target_entity_id IS NOT NULL;

        INSERT INTO schema_migrations (version, name) VALUES (1, 'action_queue');
        ",
    )
    .map_err(|e| OutboxError::Storage(format!("Migration v1 failed: {}", e)))?;

    Ok(())
}
