//! Live per-entity views of the queue.
//!
//! Every store write publishes a `StoreChange` on a broadcast channel. An
//! `EntityObserver` filters that stream for its entity and re-reads the
//! entity's actions whenever something relevant changes, which is what
//! "pending sync" indicators need.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use outbox_core::error::Result;
use outbox_core::types::{Action, ActionStatus};

use crate::store::ActionStore;

/// A write to the action store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A single row was inserted or updated.
    Action {
        action_id: String,
        target_entity_id: Option<String>,
    },
    /// Many rows may have changed (retention sweep, stale reset).
    Bulk,
}

impl StoreChange {
    /// Whether observers of `entity_id` must refresh.
    pub fn touches(&self, entity_id: &str) -> bool {
        match self {
            StoreChange::Action {
                target_entity_id, ..
            } => target_entity_id.as_deref() == Some(entity_id),
            StoreChange::Bulk => true,
        }
    }
}

/// Live view of one entity's actions.
pub struct EntityObserver {
    store: ActionStore,
    entity_id: String,
    excluding: ActionStatus,
    changes: broadcast::Receiver<StoreChange>,
}

impl EntityObserver {
    pub(crate) fn new(
        store: ActionStore,
        entity_id: String,
        excluding: ActionStatus,
        changes: broadcast::Receiver<StoreChange>,
    ) -> Self {
        Self {
            store,
            entity_id,
            excluding,
            changes,
        }
    }

    /// The entity's current actions in creation order.
    pub fn snapshot(&self) -> Result<Vec<Action>> {
        self.store.list_for_entity(&self.entity_id, self.excluding)
    }

    /// Wait for the next change affecting this entity and return a fresh
    /// snapshot. Returns `None` once the store has been dropped.
    pub async fn changed(&mut self) -> Option<Result<Vec<Action>>> {
        loop {
            match self.changes.recv().await {
                Ok(change) if change.touches(&self.entity_id) => return Some(self.snapshot()),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    debug!(entity = %self.entity_id, missed, "Observer lagged, refreshing");
                    return Some(self.snapshot());
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Whether the entity still has actions that have not reached the remote.
    pub fn has_outstanding(&self) -> Result<bool> {
        Ok(self
            .snapshot()?
            .iter()
            .any(|a| a.status != ActionStatus::Completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use outbox_core::types::{ActionType, NewAction, Timestamp};
    use serde_json::json;

    use crate::db::Database;

    fn store() -> ActionStore {
        ActionStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_change_touches() {
        let change = StoreChange::Action {
            action_id: "a-1".into(),
            target_entity_id: Some("p-1".into()),
        };
        assert!(change.touches("p-1"));
        assert!(!change.touches("p-2"));
        assert!(StoreChange::Bulk.touches("anything"));

        let unscoped = StoreChange::Action {
            action_id: "a-2".into(),
            target_entity_id: None,
        };
        assert!(!unscoped.touches("p-1"));
    }

    #[tokio::test]
    async fn test_observer_sees_enqueue_and_completion() {
        let store = store();
        let mut observer = store.observe_for_entity("p-1", ActionStatus::Completed);
        assert!(observer.snapshot().unwrap().is_empty());

        store
            .enqueue(
                NewAction::new(ActionType::DeletePattern, json!({"entity_id": "p-1"}))
                    .with_id("a-1")
                    .for_entity("p-1"),
            )
            .unwrap();

        let actions = tokio::time::timeout(Duration::from_secs(2), observer.changed())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert!(observer.has_outstanding().unwrap());

        store
            .update_status("a-1", ActionStatus::Completed, 0, None, Timestamp::now(), Timestamp::now())
            .unwrap();

        let actions = tokio::time::timeout(Duration::from_secs(2), observer.changed())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(actions.is_empty());
        assert!(!observer.has_outstanding().unwrap());
    }

    #[tokio::test]
    async fn test_observer_ignores_other_entities() {
        let store = store();
        let mut observer = store.observe_for_entity("p-1", ActionStatus::Completed);

        store
            .enqueue(NewAction::new(ActionType::SendHug, json!({})).for_entity("p-2"))
            .unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(100), observer.changed()).await;
        assert!(waited.is_err(), "observer should not wake for another entity");
    }
}
