//! Processor trait and registry.
//!
//! A `Processor` performs one kind of action against the remote backend.
//! The registry maps every `ActionType` to exactly one processor so the
//! dispatcher never branches on the action kind itself.

pub mod entity;
pub mod event;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use outbox_core::types::{Action, ActionType};

use crate::error::ProcessError;
use crate::remote::{HttpMethod, RemoteApi, RemoteRequest, RemoteResponse};

pub use entity::{
    CreateProcessor, DeleteProcessor, EntityRef, EntityWrite, ShareProcessor, ShareRequest,
    UpdateProcessor,
};
pub use event::{EventProcessor, EventReport};

/// Performs a single action type against the remote.
///
/// Implementations must be safe to call more than once for the same action
/// and must not retry internally; retry timing belongs to the dispatcher.
#[async_trait]
pub trait Processor: Send + Sync {
    /// The action type this processor handles.
    fn action_type(&self) -> ActionType;

    /// The remote call this processor makes, for logs and diagnostics.
    fn endpoint(&self) -> EndpointShape;

    /// Deliver the action. Every outcome is returned, never panicked.
    async fn process(&self, action: &Action) -> Result<(), ProcessError>;
}

/// Logical remote endpoint an action type maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointShape {
    pub method: HttpMethod,
    /// Path template, e.g. `/patterns/{entity_id}`.
    pub path: String,
}

impl EndpointShape {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }
}

impl fmt::Display for EndpointShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Coarse meaning of an HTTP status for outcome mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    NotFound,
    Conflict,
    Transient,
    Permanent,
}

impl ResponseClass {
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => ResponseClass::Success,
            404 | 410 => ResponseClass::NotFound,
            409 => ResponseClass::Conflict,
            408 | 425 | 429 => ResponseClass::Transient,
            500..=599 => ResponseClass::Transient,
            _ => ResponseClass::Permanent,
        }
    }

    /// The default failure for this class: transient statuses retry,
    /// everything else is rejected for good.
    pub fn failure(self, response: &RemoteResponse) -> ProcessError {
        match self {
            ResponseClass::Transient => ProcessError::Transient(response.reason()),
            _ => ProcessError::Permanent(response.reason()),
        }
    }
}

/// Decode an action's payload; a payload that does not fit is permanent.
pub(crate) fn decode_payload<T: DeserializeOwned>(action: &Action) -> Result<T, ProcessError> {
    serde_json::from_value(action.payload.clone()).map_err(|e| {
        ProcessError::Permanent(format!("Malformed {} payload: {}", action.action_type, e))
    })
}

/// Key the remote deduplicates on. Falls back to the action id, which is
/// stable across retries.
pub(crate) fn idempotency_key(action: &Action) -> String {
    action
        .idempotency_key
        .clone()
        .unwrap_or_else(|| action.id.clone())
}

/// Send a request carrying the action's idempotency key.
pub(crate) async fn send(
    remote: &dyn RemoteApi,
    action: &Action,
    request: RemoteRequest,
) -> Result<RemoteResponse, ProcessError> {
    let request = request.with_idempotency_key(Some(idempotency_key(action)));
    Ok(remote.send(request).await?)
}

/// Registry of processors keyed by action type.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<ActionType, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one processor for every action type, all talking to
    /// `remote`.
    pub fn standard(remote: Arc<dyn RemoteApi>) -> Self {
        let mut registry = Self::new();
        let r = || Arc::clone(&remote);

        registry.register(Arc::new(CreateProcessor::new(ActionType::CreatePattern, "patterns", r())));
        registry.register(Arc::new(UpdateProcessor::new(ActionType::UpdatePattern, "patterns", r())));
        registry.register(Arc::new(DeleteProcessor::new(ActionType::DeletePattern, "patterns", r())));
        registry.register(Arc::new(ShareProcessor::new(ActionType::SharePattern, "patterns", r())));
        registry.register(Arc::new(CreateProcessor::new(ActionType::SendHug, "hugs", r())));
        registry.register(Arc::new(CreateProcessor::new(ActionType::RegisterDevice, "devices", r())));
        registry.register(Arc::new(DeleteProcessor::new(ActionType::UnregisterDevice, "devices", r())));
        registry.register(Arc::new(DeleteProcessor::new(ActionType::DeletePair, "pairs", r())));
        registry.register(Arc::new(CreateProcessor::new(
            ActionType::RequestPrivacyJob,
            "privacy-jobs",
            r(),
        )));
        registry.register(Arc::new(EventProcessor::new(r())));

        registry
    }

    /// Register a processor, returning the one it replaced.
    pub fn register(&mut self, processor: Arc<dyn Processor>) -> Option<Arc<dyn Processor>> {
        self.processors.insert(processor.action_type(), processor)
    }

    pub fn get(&self, action_type: ActionType) -> Option<Arc<dyn Processor>> {
        self.processors.get(&action_type).cloned()
    }

    pub fn endpoint(&self, action_type: ActionType) -> Option<EndpointShape> {
        self.processors.get(&action_type).map(|p| p.endpoint())
    }

    /// Action types with no registered processor.
    pub fn missing(&self) -> Vec<ActionType> {
        ActionType::ALL
            .iter()
            .copied()
            .filter(|t| !self.processors.contains_key(t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}
