use thiserror::Error;

/// Top-level error type for the outbox.
///
/// Storage, configuration and enqueue-time failures all surface through this
/// enum. Processor outcomes never do: those are recorded on the action row by
/// the dispatcher and observed through the queue's status field.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OutboxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Idempotency key {idempotency_key} already used by action {existing_id}")]
    Conflict {
        idempotency_key: String,
        existing_id: String,
    },

    #[error("Action not found: {0}")]
    NotFound(String),

    #[error("Action {0} is in flight and cannot be replaced")]
    ActionInFlight(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),
}

impl From<toml::de::Error> for OutboxError {
    fn from(err: toml::de::Error) -> Self {
        OutboxError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for OutboxError {
    fn from(err: toml::ser::Error) -> Self {
        OutboxError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        OutboxError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
