//! CLI argument definitions for the outbox binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use outbox_core::types::{ActionStatus, ActionType};

/// Outbox: drains queued local mutations to the sync backend.
#[derive(Parser, Debug)]
#[command(name = "outbox", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the queue database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the dispatcher and retention sweeps until Ctrl-C.
    Run,

    /// Run a single dispatch pass and exit.
    Sync {
        /// Show what would be sent, against a scripted remote, without
        /// touching the queue.
        #[arg(long)]
        dry_run: bool,
    },

    /// Queue an action.
    Enqueue {
        /// Action type, e.g. `send_hug` or `delete_pattern`.
        action_type: ActionType,

        /// JSON payload.
        payload: String,

        /// Action id (defaults to a random UUID).
        #[arg(long)]
        id: Option<String>,

        /// Idempotency key forwarded to the remote.
        #[arg(long)]
        key: Option<String>,

        /// Higher goes first.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,

        /// Entity whose actions must be delivered in order.
        #[arg(long)]
        entity: Option<String>,

        /// Hold the action back for this many seconds.
        #[arg(long)]
        delay_secs: Option<u64>,
    },

    /// Show queue counts and recent actions, or one entity's pending actions.
    Status {
        #[arg(long)]
        entity: Option<String>,

        /// Only list actions in this status.
        #[arg(long)]
        status: Option<ActionStatus>,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Run both retention sweeps once.
    Cleanup,

    /// Return in-flight actions left by a dead process to pending.
    Recover {
        /// Ignore the in-flight timeout. Only safe when no dispatcher is running.
        #[arg(long)]
        all: bool,
    },
}

impl CliArgs {
    /// The subcommand to run; `run` when none is given.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > OUTBOX_CONFIG env var > platform default (~/.outbox/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("OUTBOX_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory path.
    ///
    /// Priority: --data-dir flag > config file value.
    /// Returns `None` if not overridden.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".outbox").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".outbox").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_run() {
        let args = CliArgs::try_parse_from(["outbox"]).unwrap();
        assert_eq!(args.command(), Command::Run);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            CliArgs::try_parse_from(["outbox", "sync", "--dry-run", "-c", "/tmp/o.toml"]).unwrap();
        assert_eq!(args.command(), Command::Sync { dry_run: true });
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/o.toml"));
    }

    #[test]
    fn test_enqueue_parses_type_and_options() {
        let args = CliArgs::try_parse_from([
            "outbox",
            "enqueue",
            "delete_pattern",
            r#"{"entity_id":"p-1"}"#,
            "--entity",
            "p-1",
            "--priority",
            "-5",
        ])
        .unwrap();
        match args.command() {
            Command::Enqueue {
                action_type,
                payload,
                entity,
                priority,
                id,
                ..
            } => {
                assert_eq!(action_type, ActionType::DeletePattern);
                assert_eq!(payload, r#"{"entity_id":"p-1"}"#);
                assert_eq!(entity.as_deref(), Some("p-1"));
                assert_eq!(priority, -5);
                assert!(id.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_enqueue_rejects_unknown_type() {
        assert!(CliArgs::try_parse_from(["outbox", "enqueue", "launch_rocket", "{}"]).is_err());
    }

    #[test]
    fn test_status_filter() {
        let args = CliArgs::try_parse_from(["outbox", "status", "--status", "in_flight"]).unwrap();
        assert_eq!(
            args.command(),
            Command::Status {
                entity: None,
                status: Some(ActionStatus::InFlight),
                limit: 20,
            }
        );
    }

    #[test]
    fn test_log_level_resolution() {
        let args = CliArgs::try_parse_from(["outbox", "-l", "debug", "cleanup"]).unwrap();
        assert_eq!(args.resolve_log_level("info"), "debug");
        let args = CliArgs::try_parse_from(["outbox", "cleanup"]).unwrap();
        assert_eq!(args.resolve_log_level("warn"), "warn");
        assert!(args.resolve_data_dir().is_none());
    }
}
