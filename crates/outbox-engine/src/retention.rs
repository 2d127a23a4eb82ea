//! Background retention sweeps.

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use outbox_core::config::RetentionConfig;
use outbox_core::types::Timestamp;
use outbox_storage::{ActionStore, RetentionManager};

/// Runs the completed and failed sweeps on their own intervals.
pub struct RetentionTask {
    store: ActionStore,
    config: RetentionConfig,
    shutdown: Notify,
}

impl RetentionTask {
    pub fn new(store: ActionStore, config: RetentionConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Notify::new(),
        }
    }

    /// Sweep both statuses immediately, then each on its own interval, until
    /// `shutdown()`.
    pub async fn run(&self) {
        info!(
            completed_every_mins = self.config.completed_sweep_interval_mins,
            failed_every_mins = self.config.failed_sweep_interval_mins,
            "Retention task started"
        );
        let mut completed = tokio::time::interval(self.config.completed_sweep_interval());
        let mut failed = tokio::time::interval(self.config.failed_sweep_interval());
        completed.set_missed_tick_behavior(MissedTickBehavior::Delay);
        failed.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Retention task shutting down");
                    return;
                }
                _ = completed.tick() => self.sweep_completed(Timestamp::now()),
                _ = failed.tick() => self.sweep_failed(Timestamp::now()),
            }
        }
    }

    fn sweep_completed(&self, now: Timestamp) {
        match RetentionManager::sweep_completed(&self.store, &self.config, now) {
            Ok(deleted) => debug!(deleted, "Completed sweep ran"),
            Err(e) => error!(error = %e, "Completed-action sweep failed"),
        }
    }

    fn sweep_failed(&self, now: Timestamp) {
        match RetentionManager::sweep_failed(&self.store, &self.config, now) {
            Ok(deleted) => debug!(deleted, "Failed sweep ran"),
            Err(e) => error!(error = %e, "Failed-action sweep failed"),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
