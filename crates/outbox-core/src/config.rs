use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OutboxError, Result};

/// Top-level configuration for the outbox.
///
/// Loaded from `~/.outbox/config.toml` by default. Every section falls back
/// to its defaults when missing from the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboxConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl OutboxConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OutboxConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Reject values that would stall or spin the dispatcher.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.batch_size == 0 {
            return Err(OutboxError::Config("dispatch.batch_size must be > 0".into()));
        }
        if d.max_concurrency == 0 {
            return Err(OutboxError::Config(
                "dispatch.max_concurrency must be > 0".into(),
            ));
        }
        if d.poll_interval_secs == 0 {
            return Err(OutboxError::Config(
                "dispatch.poll_interval_secs must be > 0".into(),
            ));
        }
        if d.base_backoff_ms == 0 || d.max_backoff_ms < d.base_backoff_ms {
            return Err(OutboxError::Config(
                "dispatch backoff requires 0 < base_backoff_ms <= max_backoff_ms".into(),
            ));
        }
        // A row younger than one request timeout may still have a live call.
        if d.in_flight_timeout_secs == 0
            || d.in_flight_timeout_secs <= self.remote.request_timeout_secs
        {
            return Err(OutboxError::Config(format!(
                "dispatch.in_flight_timeout_secs must exceed remote.request_timeout_secs ({})",
                self.remote.request_timeout_secs
            )));
        }
        let r = &self.retention;
        if r.completed_sweep_interval_mins == 0 || r.failed_sweep_interval_mins == 0 {
            return Err(OutboxError::Config(
                "retention sweep intervals must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the SQLite queue database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.outbox/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Remote backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL that processor paths are joined onto.
    pub base_url: String,
    /// Bearer token sent with every request, if set.
    pub auth_token: Option<String>,
    /// Transport-level timeout for a single request.
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            auth_token: None,
            request_timeout_secs: 30,
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Dispatcher scheduling and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Seconds between timer-driven dispatch passes.
    pub poll_interval_secs: u64,
    /// Maximum actions fetched per pass.
    pub batch_size: u32,
    /// Maximum processor calls running at once.
    pub max_concurrency: usize,
    /// Delay after the first transient failure.
    pub base_backoff_ms: u64,
    /// Upper bound on any retry delay.
    pub max_backoff_ms: u64,
    /// Age after which an `in_flight` row is considered abandoned by a dead process.
    pub in_flight_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            batch_size: 50,
            max_concurrency: 4,
            base_backoff_ms: 1_000,
            max_backoff_ms: 15 * 60 * 1_000,
            in_flight_timeout_secs: 10 * 60,
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn in_flight_timeout(&self) -> Duration {
        Duration::from_secs(self.in_flight_timeout_secs)
    }
}

/// Retention windows for terminal records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Completed actions older than this (by `created_at`) are deleted.
    pub completed_retention_hours: u64,
    /// Failed actions untouched for this long (by `updated_at`) are deleted.
    pub failed_retention_hours: u64,
    /// Minutes between completed-action sweeps.
    pub completed_sweep_interval_mins: u64,
    /// Minutes between failed-action sweeps.
    pub failed_sweep_interval_mins: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_retention_hours: 24,
            failed_retention_hours: 7 * 24,
            completed_sweep_interval_mins: 60,
            failed_sweep_interval_mins: 6 * 60,
        }
    }
}

impl RetentionConfig {
    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_hours * 3600)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_hours * 3600)
    }

    pub fn completed_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.completed_sweep_interval_mins * 60)
    }

    pub fn failed_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.failed_sweep_interval_mins * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OutboxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.batch_size, 50);
        assert_eq!(config.dispatch.base_backoff(), Duration::from_secs(1));
        assert_eq!(config.retention.failed_retention(), Duration::from_secs(7 * 86400));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_str = r#"
            [dispatch]
            batch_size = 10

            [remote]
            base_url = "https://sync.example.com"
        "#;
        let config: OutboxConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dispatch.batch_size, 10);
        assert_eq!(config.dispatch.max_concurrency, 4);
        assert_eq!(config.remote.base_url, "https://sync.example.com");
        assert_eq!(config.remote.request_timeout_secs, 30);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = OutboxConfig::default();
        config.dispatch.max_concurrency = 0;
        assert!(matches!(config.validate(), Err(OutboxError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = OutboxConfig::default();
        config.dispatch.base_backoff_ms = 10_000;
        config.dispatch.max_backoff_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_in_flight_timeout_within_request_timeout() {
        let mut config = OutboxConfig::default();
        config.dispatch.in_flight_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(OutboxError::Config(_))));

        config.dispatch.in_flight_timeout_secs = config.remote.request_timeout_secs;
        assert!(config.validate().is_err());

        config.dispatch.in_flight_timeout_secs = config.remote.request_timeout_secs + 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[remote]\nauth_token = \"secret\"\n\n[retention]\ncompleted_retention_hours = 2\n",
        )
        .unwrap();

        let loaded = OutboxConfig::load(&path).unwrap();
        assert_eq!(loaded.remote.auth_token.as_deref(), Some("secret"));
        assert_eq!(loaded.retention.completed_retention_hours, 2);
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OutboxConfig::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_load_rejects_zero_in_flight_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[dispatch]\nin_flight_timeout_secs = 0\n").unwrap();
        assert!(OutboxConfig::load(&path).is_err());
    }

    #[test]
    fn test_load_invalid_values_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[dispatch]\nbatch_size = 0\n").unwrap();
        assert!(OutboxConfig::load(&path).is_err());
    }
}
