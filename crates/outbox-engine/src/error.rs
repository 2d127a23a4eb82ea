//! Error types for the dispatch engine.

use outbox_core::error::OutboxError;

/// Outcome of a failed processor call.
///
/// The dispatcher is the only consumer: it turns each variant into a status
/// transition on the action row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// Worth retrying later (network down, timeout, server overloaded).
    #[error("Transient failure: {0}")]
    Transient(String),
    /// Can never succeed as submitted (validation, malformed payload, conflict).
    #[error("Permanent failure: {0}")]
    Permanent(String),
    /// The remote is already in the state this action would produce.
    #[error("Already satisfied: {0}")]
    AlreadySatisfied(String),
}

impl ProcessError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessError::Transient(_))
    }
}

/// Transport-level failures talking to the remote backend.
///
/// HTTP error statuses are not errors at this layer; processors classify
/// them from the response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote unreachable: {0}")]
    Unreachable(String),
    #[error("Remote request timed out")]
    Timeout,
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<RemoteError> for ProcessError {
    fn from(err: RemoteError) -> Self {
        ProcessError::Transient(err.to_string())
    }
}

/// Errors from a dispatch pass or engine setup.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Storage error: {0}")]
    Storage(#[from] OutboxError),
    #[error("Remote client setup failed: {0}")]
    RemoteSetup(String),
    #[error("Dispatch task failed: {0}")]
    Task(String),
}
