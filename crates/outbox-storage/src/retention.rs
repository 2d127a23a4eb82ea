//! Retention sweeps for terminal actions.
//!
//! Completed actions are pruned by creation time. Failed actions are pruned
//! by last-touched time so a row that keeps retrying stays visible for
//! debugging until it has been quiet for the whole retention window.

use tracing::info;

use outbox_core::config::RetentionConfig;
use outbox_core::error::OutboxError;
use outbox_core::types::{ActionStatus, Timestamp, TimestampField};

use crate::store::ActionStore;

/// Result of a full retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionResult {
    pub completed_deleted: usize,
    pub failed_deleted: usize,
}

impl RetentionResult {
    pub fn total(&self) -> usize {
        self.completed_deleted + self.failed_deleted
    }
}

/// Applies the retention windows from `RetentionConfig`.
pub struct RetentionManager;

impl RetentionManager {
    /// Delete completed actions created before `now - completed_retention`.
    pub fn sweep_completed(
        store: &ActionStore,
        config: &RetentionConfig,
        now: Timestamp,
    ) -> Result<usize, OutboxError> {
        let cutoff = now.minus(config.completed_retention());
        let deleted =
            store.delete_older_than(ActionStatus::Completed, cutoff, TimestampField::CreatedAt)?;
        info!(deleted, cutoff = %cutoff, "Completed-action sweep finished");
        Ok(deleted)
    }

    /// Delete failed actions last updated before `now - failed_retention`.
    pub fn sweep_failed(
        store: &ActionStore,
        config: &RetentionConfig,
        now: Timestamp,
    ) -> Result<usize, OutboxError> {
        let cutoff = now.minus(config.failed_retention());
        let deleted =
            store.delete_older_than(ActionStatus::Failed, cutoff, TimestampField::UpdatedAt)?;
        info!(deleted, cutoff = %cutoff, "Failed-action sweep finished");
        Ok(deleted)
    }

    /// Run both sweeps once.
    pub fn run_sweep(
        store: &ActionStore,
        config: &RetentionConfig,
        now: Timestamp,
    ) -> Result<RetentionResult, OutboxError> {
        Ok(RetentionResult {
            completed_deleted: Self::sweep_completed(store, config, now)?,
            failed_deleted: Self::sweep_failed(store, config, now)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use outbox_core::types::{ActionType, NewAction};
    use serde_json::json;

    use crate::db::Database;

    const HOUR_MS: i64 = 3_600_000;

    fn store() -> ActionStore {
        ActionStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn config() -> RetentionConfig {
        RetentionConfig {
            completed_retention_hours: 24,
            failed_retention_hours: 48,
            ..RetentionConfig::default()
        }
    }

    fn insert(store: &ActionStore, id: &str, created: i64, status: ActionStatus, updated: i64) {
        store
            .enqueue(
                NewAction::new(ActionType::ReportEvent, json!({"name": "x"}))
                    .with_id(id)
                    .created_at(Timestamp(created)),
            )
            .unwrap();
        store
            .update_status(id, status, 0, None, Timestamp(updated), Timestamp(created))
            .unwrap();
    }

    #[test]
    fn test_sweep_empty_store() {
        let result = RetentionManager::run_sweep(&store(), &config(), Timestamp::now()).unwrap();
        assert_eq!(result, RetentionResult::default());
        assert_eq!(result.total(), 0);
    }

    #[test]
    fn test_completed_cutoff_by_created_at() {
        let store = store();
        let now = 100 * HOUR_MS;
        let cutoff = now - 24 * HOUR_MS;
        insert(&store, "before", cutoff - 1, ActionStatus::Completed, now);
        insert(&store, "at", cutoff, ActionStatus::Completed, now);
        insert(&store, "after", cutoff + 1, ActionStatus::Completed, now);

        let deleted = RetentionManager::sweep_completed(&store, &config(), Timestamp(now)).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("before").unwrap().is_none());
        assert!(store.get("at").unwrap().is_some());
        assert!(store.get("after").unwrap().is_some());
    }

    #[test]
    fn test_failed_cutoff_by_updated_at() {
        let store = store();
        let now = 100 * HOUR_MS;
        let cutoff = now - 48 * HOUR_MS;
        // Old creation but recently retried: kept.
        insert(&store, "retrying", 0, ActionStatus::Failed, cutoff + 1);
        // Recent creation, quiet since before the cutoff: removed.
        insert(&store, "quiet", cutoff - 10, ActionStatus::Failed, cutoff - 1);

        let deleted = RetentionManager::sweep_failed(&store, &config(), Timestamp(now)).unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("retrying").unwrap().is_some());
        assert!(store.get("quiet").unwrap().is_none());
    }

    #[test]
    fn test_sweep_never_touches_outstanding_work() {
        let store = store();
        let now = 1_000 * HOUR_MS;
        insert(&store, "pending", 0, ActionStatus::Pending, 0);
        insert(&store, "in_flight", 0, ActionStatus::InFlight, 0);

        let result = RetentionManager::run_sweep(&store, &config(), Timestamp(now)).unwrap();
        assert_eq!(result.total(), 0);
        assert_eq!(store.status_counts().unwrap().total(), 2);
    }
}
