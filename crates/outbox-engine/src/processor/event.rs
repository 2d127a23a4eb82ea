//! Analytics and audit event delivery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use outbox_core::types::{Action, ActionType};

use crate::error::ProcessError;
use crate::processor::{decode_payload, send, EndpointShape, Processor, ResponseClass};
use crate::remote::{HttpMethod, RemoteApi, RemoteRequest};

const EVENTS_PATH: &str = "events";

/// Payload of a reported event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReport {
    pub name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// When the event happened on the device. Defaults to the action's
    /// creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
}

/// `POST /events`. The remote deduplicates on the idempotency key and
/// answers 409 for an event it already has.
pub struct EventProcessor {
    remote: Arc<dyn RemoteApi>,
}

impl EventProcessor {
    pub fn new(remote: Arc<dyn RemoteApi>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl Processor for EventProcessor {
    fn action_type(&self) -> ActionType {
        ActionType::ReportEvent
    }

    fn endpoint(&self) -> EndpointShape {
        EndpointShape::new(HttpMethod::Post, format!("/{}", EVENTS_PATH))
    }

    async fn process(&self, action: &Action) -> Result<(), ProcessError> {
        let mut report: EventReport = decode_payload(action)?;
        if report.name.trim().is_empty() {
            return Err(ProcessError::Permanent("event name must not be empty".into()));
        }
        if report.occurred_at.is_none() {
            report.occurred_at = Some(action.created_at.to_datetime());
        }

        let body = serde_json::to_value(&report)
            .map_err(|e| ProcessError::Permanent(format!("Failed to encode event: {}", e)))?;
        let request = RemoteRequest::new(HttpMethod::Post, EVENTS_PATH).with_body(body);
        let response = send(self.remote.as_ref(), action, request).await?;

        match ResponseClass::of(response.status) {
            ResponseClass::Success => Ok(()),
            ResponseClass::Conflict => Err(ProcessError::AlreadySatisfied(format!(
                "event {} already recorded",
                report.name
            ))),
            class => Err(class.failure(&response)),
        }
    }
}
