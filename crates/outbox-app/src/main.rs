//! Outbox application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Open the SQLite action store
//! 3. Build the processor registry against the HTTP remote
//! 4. Run the requested command: the long-running dispatcher and retention
//!    loops, or a one-shot maintenance task

mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use outbox_core::config::OutboxConfig;
use outbox_core::types::{Action, ActionStatus, ActionType, NewAction, Timestamp};
use outbox_engine::{
    Dispatcher, HttpRemote, MockRemote, PassReport, ProcessorRegistry, RemoteApi, RetentionTask,
};
use outbox_storage::{ActionStore, Database, RetentionManager};

use cli::{CliArgs, Command};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if data_dir.starts_with("~/") || data_dir.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&data_dir[2..])
    } else {
        PathBuf::from(data_dir)
    }
}

fn open_store(config: &OutboxConfig) -> AppResult<ActionStore> {
    let data_dir = resolve_data_dir(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }
    let db_path = data_dir.join("outbox.db");
    let db = Database::new(&db_path)?;
    tracing::info!(path = %db_path.display(), "Action store opened");
    Ok(ActionStore::new(Arc::new(db)))
}

fn http_registry(config: &OutboxConfig) -> AppResult<ProcessorRegistry> {
    let remote: Arc<dyn RemoteApi> = Arc::new(HttpRemote::new(&config.remote)?);
    tracing::info!(base_url = %config.remote.base_url, "Remote client ready");
    Ok(ProcessorRegistry::standard(remote))
}

fn format_action(action: &Action) -> String {
    let mut line = format!(
        "{}  {:<19} {:<9} retries={} prio={} next={}",
        action.id,
        action.action_type.as_str(),
        action.status.as_str(),
        action.retry_count,
        action.priority,
        action.available_at,
    );
    if let Some(entity) = &action.target_entity_id {
        line.push_str(&format!(" entity={}", entity));
    }
    if let Some(err) = &action.last_error {
        line.push_str(&format!(" error=\"{}\"", err));
    }
    line
}

fn print_report(report: &PassReport) {
    println!(
        "claimed={} skipped={} completed={} already_satisfied={} abandoned={} retried={}",
        report.claimed,
        report.skipped,
        report.completed,
        report.already_satisfied,
        report.abandoned,
        report.retried,
    );
}

// =============================================================================
// Commands
// =============================================================================

async fn run_daemon(config: &OutboxConfig, store: ActionStore) -> AppResult<()> {
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        http_registry(config)?,
        config.dispatch.clone(),
    ));
    let retention = Arc::new(RetentionTask::new(store, config.retention.clone()));

    let dispatch_loop = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run().await })
    };
    let retention_loop = {
        let retention = Arc::clone(&retention);
        tokio::spawn(async move { retention.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    dispatcher.shutdown();
    retention.shutdown();

    dispatch_loop.await?;
    retention_loop.await?;
    tracing::info!("Outbox stopped");
    Ok(())
}

async fn sync_once(config: &OutboxConfig, store: ActionStore) -> AppResult<()> {
    let dispatcher = Dispatcher::new(store, http_registry(config)?, config.dispatch.clone());
    let report = dispatcher.run_dispatch_pass().await?;
    print_report(&report);
    Ok(())
}

/// Replay the ready actions into a scratch in-memory store and dispatch
/// them against a scripted remote, printing every request that would go out.
async fn sync_dry_run(config: &OutboxConfig, store: ActionStore) -> AppResult<()> {
    let now = Timestamp::now();
    let scratch = ActionStore::new(Arc::new(Database::in_memory()?));
    for action in store.fetch_ready(now, config.dispatch.batch_size)? {
        scratch.enqueue(NewAction {
            id: action.id,
            action_type: action.action_type,
            payload: action.payload,
            idempotency_key: action.idempotency_key,
            priority: action.priority,
            target_entity_id: action.target_entity_id,
            created_at: action.created_at,
            available_at: action.available_at,
        })?;
    }

    let remote = Arc::new(MockRemote::new());
    let dispatcher = Dispatcher::new(
        scratch,
        ProcessorRegistry::standard(remote.clone()),
        config.dispatch.clone(),
    );
    let report = dispatcher.run_dispatch_pass_at(now).await?;

    for request in remote.requests() {
        println!(
            "{} {}  key={}",
            request.method,
            request.path(),
            request.idempotency_key.as_deref().unwrap_or("-")
        );
    }
    print_report(&report);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn enqueue(
    store: &ActionStore,
    action_type: ActionType,
    payload: &str,
    id: Option<String>,
    key: Option<String>,
    priority: i32,
    entity: Option<String>,
    delay_secs: Option<u64>,
) -> AppResult<()> {
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    let mut new = NewAction::new(action_type, payload).with_priority(priority);
    if let Some(id) = id {
        new = new.with_id(id);
    }
    if let Some(key) = key {
        new = new.with_idempotency_key(key);
    }
    if let Some(entity) = entity {
        new = new.for_entity(entity);
    }
    if let Some(secs) = delay_secs {
        let at = new.created_at.plus(Duration::from_secs(secs));
        new = new.available_at(at);
    }

    let action = store.enqueue(new)?;
    println!("{}", format_action(&action));
    Ok(())
}

fn status(
    store: &ActionStore,
    entity: Option<&str>,
    filter: Option<ActionStatus>,
    limit: u32,
) -> AppResult<()> {
    if let Some(entity) = entity {
        let actions = store.list_for_entity(entity, ActionStatus::Completed)?;
        if actions.is_empty() {
            println!("{}: in sync", entity);
        }
        for action in actions {
            println!("{}", format_action(&action));
        }
        return Ok(());
    }

    let counts = store.status_counts()?;
    println!(
        "pending={} in_flight={} failed={} completed={} (outstanding={})",
        counts.pending,
        counts.in_flight,
        counts.failed,
        counts.completed,
        counts.outstanding(),
    );
    for action in store.list(filter, limit)? {
        println!("{}", format_action(&action));
    }
    Ok(())
}

fn cleanup(config: &OutboxConfig, store: &ActionStore) -> AppResult<()> {
    let result = RetentionManager::run_sweep(store, &config.retention, Timestamp::now())?;
    println!(
        "completed_deleted={} failed_deleted={}",
        result.completed_deleted, result.failed_deleted
    );
    Ok(())
}

fn recover(config: &OutboxConfig, store: &ActionStore, all: bool) -> AppResult<()> {
    let now = Timestamp::now();
    let stale_before = if all {
        now.plus(Duration::from_millis(1))
    } else {
        now.minus(config.dispatch.in_flight_timeout())
    };
    let reset = store.reset_stale_in_flight(stale_before, now)?;
    println!("reset={}", reset);
    Ok(())
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let args = CliArgs::parse();

    // Config. Tracing is not up yet, so a load failure is reported below.
    let config_file = args.resolve_config_path();
    let (mut config, load_error) = match OutboxConfig::load(&config_file) {
        Ok(config) => (config, None),
        Err(e) => (OutboxConfig::default(), Some(e)),
    };
    if let Some(data_dir) = args.resolve_data_dir() {
        config.general.data_dir = data_dir;
    }
    let log_level = args.resolve_log_level(&config.general.log_level);

    // Tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    tracing::info!("Starting outbox v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => tracing::info!(path = %config_file.display(), "Configuration loaded"),
        Some(_) if !config_file.exists() => {
            tracing::info!(path = %config_file.display(), "No configuration file, using defaults")
        }
        Some(e) => tracing::warn!(
            path = %config_file.display(),
            error = %e,
            "Failed to load configuration, using defaults"
        ),
    }

    let store = open_store(&config)?;

    match args.command() {
        Command::Run => run_daemon(&config, store).await,
        Command::Sync { dry_run: false } => sync_once(&config, store).await,
        Command::Sync { dry_run: true } => sync_dry_run(&config, store).await,
        Command::Enqueue {
            action_type,
            payload,
            id,
            key,
            priority,
            entity,
            delay_secs,
        } => enqueue(&store, action_type, &payload, id, key, priority, entity, delay_secs),
        Command::Status {
            entity,
            status: filter,
            limit,
        } => status(&store, entity.as_deref(), filter, limit),
        Command::Cleanup => cleanup(&config, &store),
        Command::Recover { all } => recover(&config, &store, all),
    }
}
