//! Dispatch loop.
//!
//! A pass picks ready actions, claims each one with a single atomic store
//! write and runs the claimed actions through their processors with bounded
//! concurrency. The persisted `in_flight` status is the only lock, so
//! overlapping passes from the timer, a connectivity callback or an explicit
//! "sync now" never dispatch the same action twice.
//!
//! Rows left `in_flight` by a dead process are returned to pending once, when
//! the background loop starts. A pass never touches another pass's claims.

use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use outbox_core::config::DispatchConfig;
use outbox_core::error::Result as StoreResult;
use outbox_core::types::{Action, ActionStatus, NewAction, Timestamp};
use outbox_storage::ActionStore;

use crate::backoff::Backoff;
use crate::error::{DispatchError, ProcessError};
use crate::processor::ProcessorRegistry;

/// What one dispatch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Candidates this pass moved to in-flight.
    pub claimed: usize,
    /// Candidates another pass claimed first.
    pub skipped: usize,
    pub completed: usize,
    pub already_satisfied: usize,
    /// Permanent failures, closed out as completed with the error kept.
    pub abandoned: usize,
    /// Transient failures scheduled for another attempt.
    pub retried: usize,
}

impl PassReport {
    pub fn processed(&self) -> usize {
        self.completed + self.already_satisfied + self.abandoned + self.retried
    }

    pub fn is_idle(&self) -> bool {
        self.claimed == 0 && self.skipped == 0
    }
}

/// Source of "now" for outcome timestamps.
#[derive(Debug, Clone, Copy)]
enum Clock {
    Live,
    Fixed(Timestamp),
}

impl Clock {
    fn now(&self) -> Timestamp {
        match self {
            Clock::Live => Timestamp::now(),
            Clock::Fixed(at) => *at,
        }
    }
}

/// Drains the action store through the processor registry.
pub struct Dispatcher {
    store: ActionStore,
    registry: Arc<ProcessorRegistry>,
    config: DispatchConfig,
    backoff: Backoff,
    limiter: Arc<Semaphore>,
    trigger: Notify,
    shutdown: Notify,
}

impl Dispatcher {
    pub fn new(store: ActionStore, registry: ProcessorRegistry, config: DispatchConfig) -> Self {
        let missing = registry.missing();
        if !missing.is_empty() {
            warn!(?missing, "Action types without a processor will never complete");
        }
        Self {
            store,
            registry: Arc::new(registry),
            backoff: Backoff::from_config(&config),
            limiter: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            trigger: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    pub fn store(&self) -> &ActionStore {
        &self.store
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Enqueue an action and wake the loop so it goes out promptly.
    pub fn enqueue(&self, new: NewAction) -> StoreResult<Action> {
        let action = self.store.enqueue(new)?;
        self.trigger();
        Ok(action)
    }

    /// Run one pass now. Safe to call concurrently with itself and with
    /// the background loop.
    pub async fn run_dispatch_pass(&self) -> Result<PassReport, DispatchError> {
        self.pass(Timestamp::now(), Clock::Live).await
    }

    /// Run one pass as if the current time were `now`. Every timestamp the
    /// pass writes is `now`.
    pub async fn run_dispatch_pass_at(&self, now: Timestamp) -> Result<PassReport, DispatchError> {
        self.pass(now, Clock::Fixed(now)).await
    }

    async fn pass(&self, now: Timestamp, clock: Clock) -> Result<PassReport, DispatchError> {
        let mut report = PassReport::default();
        let candidates = self.store.fetch_ready(now, self.config.batch_size)?;
        let mut tasks = JoinSet::new();
        let mut first_failure = None;

        for candidate in candidates {
            let action = match self.store.claim(&candidate.id, now) {
                Ok(Some(action)) => action,
                Ok(None) => {
                    debug!(action_id = %candidate.id, "Action claimed elsewhere, skipping");
                    report.skipped += 1;
                    continue;
                }
                // Stop claiming, but still settle what is already running.
                Err(e) => {
                    error!(action_id = %candidate.id, error = %e, "Failed to claim action");
                    first_failure = Some(DispatchError::from(e));
                    break;
                }
            };
            report.claimed += 1;
            debug!(
                action_id = %action.id,
                action_type = %action.action_type,
                attempt = action.retry_count + 1,
                "Dispatching action"
            );

            let processor = self.registry.get(action.action_type);
            let limiter = Arc::clone(&self.limiter);
            tasks.spawn(async move {
                let _permit = limiter.acquire_owned().await;
                let result = match processor {
                    Some(processor) => processor.process(&action).await,
                    None => Err(ProcessError::Transient(format!(
                        "No processor registered for {}",
                        action.action_type
                    ))),
                };
                (action, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((action, result)) => {
                    if let Err(e) = self.settle(&action, result, clock.now(), &mut report) {
                        error!(action_id = %action.id, error = %e, "Failed to record dispatch outcome");
                        first_failure.get_or_insert(e);
                    }
                }
                // The row stays in flight until the next startup reconciliation.
                Err(e) => {
                    error!(error = %e, "Processor task aborted");
                    first_failure.get_or_insert(DispatchError::Task(e.to_string()));
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Return in-flight rows older than the in-flight timeout to pending.
    /// Only safe while no pass of this store is running, i.e. at startup.
    pub fn reconcile(&self, now: Timestamp) -> Result<usize, DispatchError> {
        let stale_before = now.minus(self.config.in_flight_timeout());
        Ok(self.store.reset_stale_in_flight(stale_before, now)?)
    }

    fn settle(
        &self,
        action: &Action,
        result: Result<(), ProcessError>,
        at: Timestamp,
        report: &mut PassReport,
    ) -> Result<(), DispatchError> {
        match result {
            Ok(()) => {
                self.complete(action, None, at)?;
                debug!(action_id = %action.id, "Action completed");
                report.completed += 1;
            }
            Err(ProcessError::AlreadySatisfied(reason)) => {
                self.complete(action, None, at)?;
                info!(action_id = %action.id, reason = %reason, "Remote already in target state");
                report.already_satisfied += 1;
            }
            Err(ProcessError::Permanent(reason)) => {
                self.complete(action, Some(&reason), at)?;
                warn!(
                    action_id = %action.id,
                    action_type = %action.action_type,
                    reason = %reason,
                    "Action abandoned after permanent failure"
                );
                report.abandoned += 1;
            }
            Err(ProcessError::Transient(reason)) => {
                let delay = self.backoff.delay_for(action.retry_count);
                let retry_count = action.retry_count.saturating_add(1);
                let next_attempt = at.plus(delay);
                self.store.update_status(
                    &action.id,
                    ActionStatus::Failed,
                    retry_count,
                    Some(&reason),
                    at,
                    next_attempt,
                )?;
                warn!(
                    action_id = %action.id,
                    retry_count,
                    retry_in_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Transient failure, retry scheduled"
                );
                report.retried += 1;
            }
        }
        Ok(())
    }

    fn complete(&self, action: &Action, last_error: Option<&str>, at: Timestamp) -> StoreResult<()> {
        self.store.update_status(
            &action.id,
            ActionStatus::Completed,
            action.retry_count,
            last_error,
            at,
            action.available_at,
        )
    }

    /// Background loop: startup reconciliation, then a pass on start, on
    /// every poll tick and on every `trigger()`, until `shutdown()`.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "Dispatcher started"
        );
        match self.reconcile(Timestamp::now()) {
            Ok(0) => {}
            Ok(reclaimed) => info!(reclaimed, "Returned stale in-flight actions to pending"),
            Err(e) => error!(error = %e, "Startup reconciliation failed"),
        }
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Dispatcher shutting down");
                    return;
                }
                _ = self.trigger.notified() => debug!("Dispatch pass triggered"),
                _ = ticker.tick() => {}
            }

            match self.run_dispatch_pass().await {
                Ok(report) if !report.is_idle() => info!(
                    claimed = report.claimed,
                    completed = report.completed,
                    already_satisfied = report.already_satisfied,
                    abandoned = report.abandoned,
                    retried = report.retried,
                    "Dispatch pass finished"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Dispatch pass failed"),
            }
        }
    }

    /// Ask the loop for a pass as soon as possible. Triggers that arrive
    /// while a pass is running coalesce into one follow-up pass.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Signal the loop to stop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
