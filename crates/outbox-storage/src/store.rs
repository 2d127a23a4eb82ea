//! SQLite-backed action store.
//!
//! The `actions` table is both the durable queue and the dispatch lock: a row
//! in `in_flight` is owned by whichever dispatcher pass claimed it, and the
//! claim itself is a single conditional `UPDATE`.

use std::sync::Arc;

use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;
use tracing::{debug, info};

use outbox_core::error::{OutboxError, Result};
use outbox_core::types::{Action, ActionStatus, NewAction, Timestamp, TimestampField};

use crate::db::Database;
use crate::observe::{EntityObserver, StoreChange};

const COLUMNS: &str = "id, action_type, payload, status, retry_count, last_error, \
                       idempotency_key, created_at, updated_at, available_at, priority, \
                       target_entity_id";

/// Capacity of the change-notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Number of actions per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub completed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.failed + self.completed
    }

    /// Actions not yet acknowledged by the remote.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_flight + self.failed
    }
}

/// Durable queue of outbox actions.
///
/// Cheap to clone; clones share the database and the change channel.
#[derive(Clone)]
pub struct ActionStore {
    db: Arc<Database>,
    changes: broadcast::Sender<StoreChange>,
}

impl ActionStore {
    pub fn new(db: Arc<Database>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { db, changes }
    }

    /// Insert or replace an action by id.
    ///
    /// Replacing keeps the original `created_at` so the action keeps its
    /// place in its entity's queue, and resets it to a fresh `pending` row.
    /// Fails with `Conflict` if the idempotency key belongs to another id and
    /// with `ActionInFlight` if the id is currently being dispatched.
    pub fn enqueue(&self, new: NewAction) -> Result<Action> {
        new.validate().map_err(OutboxError::InvalidAction)?;
        let payload = serde_json::to_string(&new.payload)?;
        let now = Timestamp::now();

        let action = self.db.with_tx(|tx| {
            if let Some(key) = &new.idempotency_key {
                if let Some(existing_id) = find_key_owner(tx, key, &new.id)? {
                    return Err(OutboxError::Conflict {
                        idempotency_key: key.clone(),
                        existing_id,
                    });
                }
            }

            let existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT status, created_at FROM actions WHERE id = ?1",
                    params![new.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| OutboxError::Storage(format!("Enqueue lookup: {}", e)))?;

            let created_at = match existing {
                Some((status, _)) if status == ActionStatus::InFlight.as_str() => {
                    return Err(OutboxError::ActionInFlight(new.id.clone()));
                }
                Some((_, created)) => Timestamp(created),
                None => new.created_at,
            };
            let available_at = new.available_at.max(created_at);
            let updated_at = now.max(created_at);

            let inserted = tx.execute(
                "INSERT INTO actions (id, action_type, payload, status, retry_count, last_error,
                                      idempotency_key, created_at, updated_at, available_at,
                                      priority, target_entity_id)
                 VALUES (?1, ?2, ?3, 'pending', 0, NULL, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                     action_type = excluded.action_type,
                     payload = excluded.payload,
                     status = 'pending',
                     retry_count = 0,
                     last_error = NULL,
                     idempotency_key = excluded.idempotency_key,
                     updated_at = excluded.updated_at,
                     available_at = excluded.available_at,
                     priority = excluded.priority,
                     target_entity_id = excluded.target_entity_id",
                params![
                    new.id,
                    new.action_type.as_str(),
                    payload,
                    new.idempotency_key,
                    created_at.0,
                    updated_at.0,
                    available_at.0,
                    new.priority,
                    new.target_entity_id,
                ],
            );

            if let Err(e) = inserted {
                if is_unique_violation(&e) {
                    if let Some(key) = &new.idempotency_key {
                        let existing_id = find_key_owner(tx, key, &new.id)?
                            .unwrap_or_else(|| "<unknown>".to_string());
                        return Err(OutboxError::Conflict {
                            idempotency_key: key.clone(),
                            existing_id,
                        });
                    }
                }
                return Err(OutboxError::Storage(format!("Failed to enqueue action: {}", e)));
            }

            get_in(tx, &new.id)?
                .ok_or_else(|| OutboxError::Storage(format!("Enqueued action {} vanished", new.id)))
        })?;

        debug!(
            action_id = %action.id,
            action_type = %action.action_type,
            entity = ?action.target_entity_id,
            priority = action.priority,
            "Action enqueued"
        );
        self.notify_action(&action.id, action.target_entity_id.clone());
        Ok(action)
    }

    /// Fetch a single action by id.
    pub fn get(&self, id: &str) -> Result<Option<Action>> {
        self.db.with_conn(|conn| get_in(conn, id))
    }

    /// Up to `limit` actions in one of `statuses` whose `available_at <= now`.
    ///
    /// Ordered by priority (high first), then `available_at`, then
    /// `created_at`, oldest first.
    pub fn fetch_due(
        &self,
        statuses: &[ActionStatus],
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<Action>> {
        if statuses.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let placeholders: Vec<String> = (0..statuses.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "SELECT {COLUMNS} FROM actions
             WHERE available_at <= ?1 AND status IN ({})
             ORDER BY priority DESC, available_at ASC, created_at ASC, rowid ASC
             LIMIT ?2",
            placeholders.join(", ")
        );

        let mut params_vec: Vec<Box<dyn ToSql>> = vec![Box::new(now.0), Box::new(limit as i64)];
        for status in statuses {
            params_vec.push(Box::new(status.as_str()));
        }
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        self.db
            .with_conn(|conn| query_actions(conn, &sql, params_refs.as_slice()))
    }

    /// Dispatch candidates: due `pending`/`failed` actions that are at the
    /// head of their entity's queue.
    ///
    /// An action is skipped while another action of the same entity is in
    /// flight, or while an older undelivered action of that entity exists.
    /// At most one action per entity is therefore ever returned.
    pub fn fetch_ready(&self, now: Timestamp, limit: u32) -> Result<Vec<Action>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COLUMNS} FROM actions AS a
             WHERE a.status IN ('pending', 'failed')
               AND a.available_at <= ?1
               AND (a.target_entity_id IS NULL OR NOT EXISTS (
                   SELECT 1 FROM actions AS o
                   WHERE o.target_entity_id = a.target_entity_id
                     AND o.id != a.id
                     AND (o.status = 'in_flight'
                          OR (o.status IN ('pending', 'failed')
                              AND (o.created_at < a.created_at
                                   OR (o.created_at = a.created_at AND o.rowid < a.rowid))))))
             ORDER BY a.priority DESC, a.available_at ASC, a.created_at ASC, a.rowid ASC
             LIMIT ?2"
        );
        self.db
            .with_conn(|conn| query_actions(conn, &sql, params![now.0, limit as i64]))
    }

    /// Atomically move a due `pending`/`failed` action to `in_flight`.
    ///
    /// Returns the claimed action, or `None` if another caller claimed it
    /// first, it is not yet due, or its entity already has an action in
    /// flight.
    pub fn claim(&self, id: &str, now: Timestamp) -> Result<Option<Action>> {
        let sql = format!(
            "UPDATE actions SET status = 'in_flight', updated_at = ?2
             WHERE id = ?1
               AND status IN ('pending', 'failed')
               AND available_at <= ?2
               AND (target_entity_id IS NULL OR NOT EXISTS (
                   SELECT 1 FROM actions AS o
                   WHERE o.target_entity_id = actions.target_entity_id
                     AND o.status = 'in_flight'))
             RETURNING {COLUMNS}"
        );
        let claimed = self.db.with_conn(|conn| {
            let row = conn
                .query_row(&sql, params![id, now.0], |row| Ok(row_to_action(row)))
                .optional()
                .map_err(|e| OutboxError::Storage(format!("Failed to claim action: {}", e)))?;
            row.transpose()
        })?;

        if let Some(action) = &claimed {
            self.notify_action(&action.id, action.target_entity_id.clone());
        }
        Ok(claimed)
    }

    /// Record the outcome of a dispatch attempt.
    ///
    /// `retry_count` never decreases and `available_at` never drops below
    /// `created_at`, whatever the caller passes.
    pub fn update_status(
        &self,
        id: &str,
        status: ActionStatus,
        retry_count: u32,
        last_error: Option<&str>,
        updated_at: Timestamp,
        available_at: Timestamp,
    ) -> Result<()> {
        let entity: Option<Option<String>> = self.db.with_conn(|conn| {
            conn.query_row(
                "UPDATE actions
                 SET status = ?2,
                     retry_count = MAX(retry_count, ?3),
                     last_error = ?4,
                     updated_at = ?5,
                     available_at = MAX(?6, created_at)
                 WHERE id = ?1
                 RETURNING target_entity_id",
                params![id, status.as_str(), retry_count, last_error, updated_at.0, available_at.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| OutboxError::Storage(format!("Failed to update action status: {}", e)))
        })?;

        match entity {
            Some(target_entity_id) => {
                self.notify_action(id, target_entity_id);
                Ok(())
            }
            None => Err(OutboxError::NotFound(id.to_string())),
        }
    }

    /// Live view of an entity's actions, excluding one status (normally
    /// `Completed`).
    pub fn observe_for_entity(
        &self,
        entity_id: impl Into<String>,
        excluding: ActionStatus,
    ) -> EntityObserver {
        EntityObserver::new(self.clone(), entity_id.into(), excluding, self.changes.subscribe())
    }

    /// An entity's actions in creation order, excluding one status.
    pub fn list_for_entity(&self, entity_id: &str, excluding: ActionStatus) -> Result<Vec<Action>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM actions
             WHERE target_entity_id = ?1 AND status != ?2
             ORDER BY created_at ASC, rowid ASC"
        );
        self.db.with_conn(|conn| {
            query_actions(conn, &sql, params![entity_id, excluding.as_str()])
        })
    }

    /// Most recently updated actions, optionally filtered by status.
    pub fn list(&self, status: Option<ActionStatus>, limit: u32) -> Result<Vec<Action>> {
        self.db.with_conn(|conn| match status {
            Some(s) => query_actions(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM actions WHERE status = ?1
                     ORDER BY updated_at DESC, rowid DESC LIMIT ?2"
                ),
                params![s.as_str(), limit as i64],
            ),
            None => query_actions(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM actions
                     ORDER BY updated_at DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            ),
        })
    }

    /// Count actions in each status.
    pub fn status_counts(&self) -> Result<StatusCounts> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM actions GROUP BY status")
                .map_err(|e| OutboxError::Storage(format!("Status count prepare: {}", e)))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| OutboxError::Storage(format!("Status count query: {}", e)))?;

            let mut counts = StatusCounts::default();
            for row in rows {
                let (status, count) = row.map_err(|e| OutboxError::Storage(e.to_string()))?;
                let count = count.max(0) as u64;
                match status.parse::<ActionStatus>() {
                    Ok(ActionStatus::Pending) => counts.pending = count,
                    Ok(ActionStatus::InFlight) => counts.in_flight = count,
                    Ok(ActionStatus::Failed) => counts.failed = count,
                    Ok(ActionStatus::Completed) => counts.completed = count,
                    Err(e) => return Err(OutboxError::Storage(e)),
                }
            }
            Ok(counts)
        })
    }

    /// Delete actions in `status` whose `by` timestamp is before `cutoff`.
    pub fn delete_older_than(
        &self,
        status: ActionStatus,
        cutoff: Timestamp,
        by: TimestampField,
    ) -> Result<usize> {
        let sql = format!(
            "DELETE FROM actions WHERE status = ?1 AND {} < ?2",
            by.column()
        );
        let deleted = self.db.with_conn(|conn| {
            conn.execute(&sql, params![status.as_str(), cutoff.0])
                .map_err(|e| OutboxError::Storage(format!("Failed to delete {} actions: {}", status, e)))
        })?;

        if deleted > 0 {
            self.notify(StoreChange::Bulk);
        }
        Ok(deleted)
    }

    /// Return `in_flight` actions claimed before `stale_before` to `pending`.
    ///
    /// Recovers rows left behind by a process that died mid-dispatch.
    pub fn reset_stale_in_flight(&self, stale_before: Timestamp, now: Timestamp) -> Result<usize> {
        let reset = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE actions SET status = 'pending', updated_at = ?2
                 WHERE status = 'in_flight' AND updated_at < ?1",
                params![stale_before.0, now.0],
            )
            .map_err(|e| OutboxError::Storage(format!("Failed to reset stale actions: {}", e)))
        })?;

        if reset > 0 {
            info!(count = reset, "Reverted stale in-flight actions to pending");
            self.notify(StoreChange::Bulk);
        }
        Ok(reset)
    }

    fn notify_action(&self, action_id: &str, target_entity_id: Option<String>) {
        self.notify(StoreChange::Action {
            action_id: action_id.to_string(),
            target_entity_id,
        });
    }

    fn notify(&self, change: StoreChange) {
        // No receivers is the normal case when nothing observes the queue.
        let _ = self.changes.send(change);
    }
}

impl std::fmt::Debug for ActionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionStore").finish()
    }
}

fn get_in(conn: &Connection, id: &str) -> Result<Option<Action>> {
    let sql = format!("SELECT {COLUMNS} FROM actions WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id], |row| Ok(row_to_action(row)))
        .optional()
        .map_err(|e| OutboxError::Storage(format!("Failed to load action: {}", e)))?;
    row.transpose()
}

fn find_key_owner(conn: &Connection, key: &str, except_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM actions WHERE idempotency_key = ?1 AND id != ?2",
        params![key, except_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| OutboxError::Storage(format!("Idempotency key lookup: {}", e)))
}

fn query_actions<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Action>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| OutboxError::Storage(format!("Action query prepare: {}", e)))?;
    let rows = stmt
        .query_map(params, |row| Ok(row_to_action(row)))
        .map_err(|e| OutboxError::Storage(format!("Action query: {}", e)))?;

    let mut actions = Vec::new();
    for row in rows {
        let action = row.map_err(|e| OutboxError::Storage(e.to_string()))??;
        actions.push(action);
    }
    Ok(actions)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn row_to_action(row: &Row) -> Result<Action> {
    let get_err = |e: rusqlite::Error| OutboxError::Storage(e.to_string());

    let action_type: String = row.get(1).map_err(get_err)?;
    let payload: String = row.get(2).map_err(get_err)?;
    let status: String = row.get(3).map_err(get_err)?;
    let retry_count: i64 = row.get(4).map_err(get_err)?;

    Ok(Action {
        id: row.get(0).map_err(get_err)?,
        action_type: action_type.parse().map_err(OutboxError::Storage)?,
        payload: serde_json::from_str(&payload)?,
        status: status.parse().map_err(OutboxError::Storage)?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        last_error: row.get(5).map_err(get_err)?,
        idempotency_key: row.get(6).map_err(get_err)?,
        created_at: Timestamp(row.get(7).map_err(get_err)?),
        updated_at: Timestamp(row.get(8).map_err(get_err)?),
        available_at: Timestamp(row.get(9).map_err(get_err)?),
        priority: row.get(10).map_err(get_err)?,
        target_entity_id: row.get(11).map_err(get_err)?,
    })
}
