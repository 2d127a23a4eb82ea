//! Core types for the outbox queue.
//!
//! Defines the persisted action record, its status and type enumerations,
//! and the millisecond timestamp used for scheduling.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Timestamp
// =============================================================================

/// Milliseconds since the Unix epoch.
///
/// Compared by value. Millisecond precision is needed because backoff delays
/// start well below one second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }

    /// This timestamp shifted forward, saturating at `i64::MAX`.
    pub fn plus(&self, delay: Duration) -> Self {
        let ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(ms))
    }

    /// This timestamp shifted backward, saturating at `i64::MIN`.
    pub fn minus(&self, delay: Duration) -> Self {
        let ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(ms))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle states of a queued action.
///
/// `Pending -> InFlight -> Completed | Failed`, with `Failed` becoming
/// eligible again once its `available_at` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InFlight,
    Failed,
    Completed,
}

impl ActionStatus {
    pub const ALL: [ActionStatus; 4] = [
        ActionStatus::Pending,
        ActionStatus::InFlight,
        ActionStatus::Failed,
        ActionStatus::Completed,
    ];

    /// Statuses the dispatcher may pick up.
    pub const DISPATCHABLE: [ActionStatus; 2] = [ActionStatus::Pending, ActionStatus::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InFlight => "in_flight",
            ActionStatus::Failed => "failed",
            ActionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "in_flight" => Ok(ActionStatus::InFlight),
            "failed" => Ok(ActionStatus::Failed),
            "completed" => Ok(ActionStatus::Completed),
            _ => Err(format!("Unknown action status: {}", s)),
        }
    }
}

/// Closed set of action kinds that domain code can enqueue.
///
/// Each kind is handled by exactly one registered processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreatePattern,
    UpdatePattern,
    DeletePattern,
    SharePattern,
    SendHug,
    RegisterDevice,
    UnregisterDevice,
    DeletePair,
    RequestPrivacyJob,
    ReportEvent,
}

impl ActionType {
    pub const ALL: [ActionType; 10] = [
        ActionType::CreatePattern,
        ActionType::UpdatePattern,
        ActionType::DeletePattern,
        ActionType::SharePattern,
        ActionType::SendHug,
        ActionType::RegisterDevice,
        ActionType::UnregisterDevice,
        ActionType::DeletePair,
        ActionType::RequestPrivacyJob,
        ActionType::ReportEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::CreatePattern => "create_pattern",
            ActionType::UpdatePattern => "update_pattern",
            ActionType::DeletePattern => "delete_pattern",
            ActionType::SharePattern => "share_pattern",
            ActionType::SendHug => "send_hug",
            ActionType::RegisterDevice => "register_device",
            ActionType::UnregisterDevice => "unregister_device",
            ActionType::DeletePair => "delete_pair",
            ActionType::RequestPrivacyJob => "request_privacy_job",
            ActionType::ReportEvent => "report_event",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown action type: {}", s))
    }
}

/// Which timestamp column a bulk delete filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampField {
    CreatedAt,
    UpdatedAt,
}

impl TimestampField {
    pub fn column(&self) -> &'static str {
        match self {
            TimestampField::CreatedAt => "created_at",
            TimestampField::UpdatedAt => "updated_at",
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A queued mutation waiting to reach the remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub action_type: ActionType,
    pub payload: serde_json::Value,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub available_at: Timestamp,
    pub priority: i32,
    pub target_entity_id: Option<String>,
}

/// An enqueue request.
///
/// Built by domain code and handed to the store, which turns it into a
/// fresh `Pending` action.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub id: String,
    pub action_type: ActionType,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub priority: i32,
    pub target_entity_id: Option<String>,
    pub created_at: Timestamp,
    pub available_at: Timestamp,
}

impl NewAction {
    /// A new action with a random id, priority 0, due immediately.
    pub fn new(action_type: ActionType, payload: serde_json::Value) -> Self {
        let now = Timestamp::now();
        Self {
            id: Uuid::new_v4().to_string(),
            action_type,
            payload,
            idempotency_key: None,
            priority: 0,
            target_entity_id: None,
            created_at: now,
            available_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.target_entity_id = Some(entity_id.into());
        self
    }

    /// Override the creation instant.
    ///
    /// An action that was not deferred stays due at its creation instant;
    /// a deferred one keeps its `available_at`, clamped to `at`.
    pub fn created_at(mut self, at: Timestamp) -> Self {
        let deferred = self.available_at > self.created_at;
        self.created_at = at;
        self.available_at = if deferred { self.available_at.max(at) } else { at };
        self
    }

    /// Defer the first dispatch. Clamped to `created_at`.
    pub fn available_at(mut self, at: Timestamp) -> Self {
        self.available_at = at.max(self.created_at);
        self
    }

    /// Reject requests the store could never dispatch sensibly.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("action id must not be empty".to_string());
        }
        if matches!(&self.idempotency_key, Some(k) if k.is_empty()) {
            return Err("idempotency key must not be empty when present".to_string());
        }
        if matches!(&self.target_entity_id, Some(e) if e.is_empty()) {
            return Err("target entity id must not be empty when present".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
