//! Processors for entity writes: create, update, delete and share.
//!
//! All four address a REST resource collection such as `patterns` or
//! `devices`. They differ in verb, path and in which non-success statuses
//! mean the remote already holds the desired state.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use outbox_core::types::{Action, ActionType};

use crate::error::ProcessError;
use crate::processor::{decode_payload, send, EndpointShape, Processor, ResponseClass};
use crate::remote::{HttpMethod, RemoteApi, RemoteRequest, RemoteResponse};

/// Payload for creating or updating an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    pub entity_id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Local revision, forwarded so the remote can reject stale writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

/// Payload naming an entity, used by deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: String,
}

/// Payload for sharing an entity with other users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRequest {
    pub entity_id: String,
    pub recipient_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Check the payload's entity id is a single usable path segment and agrees
/// with the action's target entity.
fn checked_entity_id<'a>(action: &Action, entity_id: &'a str) -> Result<&'a str, ProcessError> {
    if entity_id.trim().is_empty() {
        return Err(ProcessError::Permanent("entity_id must not be empty".into()));
    }
    if entity_id.contains('/') || entity_id == "." || entity_id == ".." {
        return Err(ProcessError::Permanent(format!(
            "entity_id is not a valid path segment: {}",
            entity_id
        )));
    }
    if let Some(target) = &action.target_entity_id {
        if target != entity_id {
            return Err(ProcessError::Permanent(format!(
                "payload entity {} does not match target entity {}",
                entity_id, target
            )));
        }
    }
    Ok(entity_id)
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, ProcessError> {
    serde_json::to_value(value)
        .map_err(|e| ProcessError::Permanent(format!("Failed to encode request body: {}", e)))
}

/// A REST collection, the action type bound to it and the client to reach it.
struct Resource {
    action_type: ActionType,
    name: String,
    remote: Arc<dyn RemoteApi>,
}

impl Resource {
    fn new(action_type: ActionType, name: impl Into<String>, remote: Arc<dyn RemoteApi>) -> Self {
        Self {
            action_type,
            name: name.into(),
            remote,
        }
    }

    fn collection(&self, method: HttpMethod) -> RemoteRequest {
        RemoteRequest::new(method, &self.name)
    }

    fn member(&self, method: HttpMethod, entity_id: &str) -> RemoteRequest {
        self.collection(method).segment(entity_id)
    }

    fn shape(&self, method: HttpMethod, suffix: &str) -> EndpointShape {
        EndpointShape::new(method, format!("/{}{}", self.name, suffix))
    }

    async fn send(&self, action: &Action, request: RemoteRequest) -> Result<RemoteResponse, ProcessError> {
        send(self.remote.as_ref(), action, request).await
    }
}

// =============================================================================
// Create
// =============================================================================

/// `POST /{resource}`. A 409 means the entity already exists, which is what
/// a retried create would have produced.
pub struct CreateProcessor(Resource);

impl CreateProcessor {
    pub fn new(action_type: ActionType, resource: impl Into<String>, remote: Arc<dyn RemoteApi>) -> Self {
        Self(Resource::new(action_type, resource, remote))
    }
}

#[async_trait]
impl Processor for CreateProcessor {
    fn action_type(&self) -> ActionType {
        self.0.action_type
    }

    fn endpoint(&self) -> EndpointShape {
        self.0.shape(HttpMethod::Post, "")
    }

    async fn process(&self, action: &Action) -> Result<(), ProcessError> {
        let write: EntityWrite = decode_payload(action)?;
        checked_entity_id(action, &write.entity_id)?;

        let request = self.0.collection(HttpMethod::Post).with_body(to_body(&write)?);
        let response = self.0.send(action, request).await?;

        match ResponseClass::of(response.status) {
            ResponseClass::Success => {
                debug!(action_id = %action.id, entity = %write.entity_id, "Entity created");
                Ok(())
            }
            ResponseClass::Conflict => Err(ProcessError::AlreadySatisfied(format!(
                "{} {} already exists",
                self.0.name, write.entity_id
            ))),
            class => Err(class.failure(&response)),
        }
    }
}

// =============================================================================
// Update
// =============================================================================

/// `PUT /{resource}/{entity_id}`. Missing entities and version conflicts
/// cannot be fixed by retrying.
pub struct UpdateProcessor(Resource);

impl UpdateProcessor {
    pub fn new(action_type: ActionType, resource: impl Into<String>, remote: Arc<dyn RemoteApi>) -> Self {
        Self(Resource::new(action_type, resource, remote))
    }
}

#[async_trait]
impl Processor for UpdateProcessor {
    fn action_type(&self) -> ActionType {
        self.0.action_type
    }

    fn endpoint(&self) -> EndpointShape {
        self.0.shape(HttpMethod::Put, "/{entity_id}")
    }

    async fn process(&self, action: &Action) -> Result<(), ProcessError> {
        let write: EntityWrite = decode_payload(action)?;
        let entity_id = checked_entity_id(action, &write.entity_id)?;

        let request = self.0.member(HttpMethod::Put, entity_id).with_body(to_body(&write)?);
        let response = self.0.send(action, request).await?;

        match ResponseClass::of(response.status) {
            ResponseClass::Success => Ok(()),
            ResponseClass::NotFound => Err(ProcessError::Permanent(format!(
                "{} {} not found",
                self.0.name, entity_id
            ))),
            ResponseClass::Conflict => Err(ProcessError::Permanent(format!(
                "update of {} {} conflicts: {}",
                self.0.name,
                entity_id,
                response.reason()
            ))),
            class => Err(class.failure(&response)),
        }
    }
}

// =============================================================================
// Delete
// =============================================================================

/// `DELETE /{resource}/{entity_id}`. Deleting something already gone is a
/// success.
pub struct DeleteProcessor(Resource);

impl DeleteProcessor {
    pub fn new(action_type: ActionType, resource: impl Into<String>, remote: Arc<dyn RemoteApi>) -> Self {
        Self(Resource::new(action_type, resource, remote))
    }
}

#[async_trait]
impl Processor for DeleteProcessor {
    fn action_type(&self) -> ActionType {
        self.0.action_type
    }

    fn endpoint(&self) -> EndpointShape {
        self.0.shape(HttpMethod::Delete, "/{entity_id}")
    }

    async fn process(&self, action: &Action) -> Result<(), ProcessError> {
        let target: EntityRef = decode_payload(action)?;
        let entity_id = checked_entity_id(action, &target.entity_id)?;

        let request = self.0.member(HttpMethod::Delete, entity_id);
        let response = self.0.send(action, request).await?;

        match ResponseClass::of(response.status) {
            ResponseClass::Success => Ok(()),
            ResponseClass::NotFound => Err(ProcessError::AlreadySatisfied(format!(
                "{} {} already deleted",
                self.0.name, entity_id
            ))),
            class => Err(class.failure(&response)),
        }
    }
}

// =============================================================================
// Share
// =============================================================================

/// `POST /{resource}/{entity_id}/shares`. A 409 means the share already
/// exists.
pub struct ShareProcessor(Resource);

impl ShareProcessor {
    pub fn new(action_type: ActionType, resource: impl Into<String>, remote: Arc<dyn RemoteApi>) -> Self {
        Self(Resource::new(action_type, resource, remote))
    }
}

#[async_trait]
impl Processor for ShareProcessor {
    fn action_type(&self) -> ActionType {
        self.0.action_type
    }

    fn endpoint(&self) -> EndpointShape {
        self.0.shape(HttpMethod::Post, "/{entity_id}/shares")
    }

    async fn process(&self, action: &Action) -> Result<(), ProcessError> {
        let share: ShareRequest = decode_payload(action)?;
        let entity_id = checked_entity_id(action, &share.entity_id)?;
        if share.recipient_ids.is_empty() || share.recipient_ids.iter().any(|r| r.trim().is_empty()) {
            return Err(ProcessError::Permanent(
                "share needs at least one non-empty recipient".into(),
            ));
        }

        let request = self
            .0
            .member(HttpMethod::Post, entity_id)
            .segment("shares")
            .with_body(to_body(&share)?);
        let response = self.0.send(action, request).await?;

        match ResponseClass::of(response.status) {
            ResponseClass::Success => Ok(()),
            ResponseClass::Conflict => Err(ProcessError::AlreadySatisfied(format!(
                "{} {} already shared",
                self.0.name, entity_id
            ))),
            class => Err(class.failure(&response)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::processor::tests::action_from;
    use crate::remote::{MockRemote, RemoteResponse};
    use outbox_core::types::NewAction;
    use serde_json::json;

    fn mock() -> Arc<MockRemote> {
        Arc::new(MockRemote::new())
    }

    fn pattern_write(entity: &str) -> Action {
        action_from(
            NewAction::new(
                ActionType::CreatePattern,
                json!({"entity_id": entity, "fields": {"name": "Warm"}, "version": 2}),
            )
            .with_id("a-1")
            .for_entity(entity),
        )
    }

    // ---- create ----

    #[tokio::test]
    async fn test_create_posts_payload_with_key() {
        let remote = mock();
        let processor = CreateProcessor::new(ActionType::CreatePattern, "patterns", remote.clone());
        processor.process(&pattern_write("p-1")).await.unwrap();

        let requests = remote.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert_eq!(requests[0].path(), "patterns");
        assert_eq!(requests[0].idempotency_key.as_deref(), Some("a-1"));
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["entity_id"], "p-1");
        assert_eq!(body["fields"]["name"], "Warm");
        assert_eq!(body["version"], 2);
    }

    #[tokio::test]
    async fn test_create_conflict_is_already_satisfied() {
        let remote = mock();
        remote.respond(HttpMethod::Post, "patterns", Ok(RemoteResponse::new(409)));
        let processor = CreateProcessor::new(ActionType::CreatePattern, "patterns", remote);
        let err = processor.process(&pattern_write("p-1")).await.unwrap_err();
        assert!(matches!(err, ProcessError::AlreadySatisfied(_)));
    }

    #[tokio::test]
    async fn test_create_server_error_is_transient() {
        let remote = mock();
        remote.respond(HttpMethod::Post, "patterns", Ok(RemoteResponse::new(503)));
        let processor = CreateProcessor::new(ActionType::CreatePattern, "patterns", remote);
        let err = processor.process(&pattern_write("p-1")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_create_unreachable_is_transient() {
        let remote = mock();
        remote.respond(
            HttpMethod::Post,
            "patterns",
            Err(RemoteError::Unreachable("no route".into())),
        );
        let processor = CreateProcessor::new(ActionType::CreatePattern, "patterns", remote);
        let err = processor.process(&pattern_write("p-1")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_create_validation_error_is_permanent() {
        let remote = mock();
        remote.respond(
            HttpMethod::Post,
            "patterns",
            Ok(RemoteResponse::new(422).with_body(json!({"error": "name too long"}))),
        );
        let processor = CreateProcessor::new(ActionType::CreatePattern, "patterns", remote);
        let err = processor.process(&pattern_write("p-1")).await.unwrap_err();
        assert_eq!(err, ProcessError::Permanent("name too long".into()));
    }

    #[tokio::test]
    async fn test_malformed_payload_never_reaches_remote() {
        let remote = mock();
        let processor = CreateProcessor::new(ActionType::CreatePattern, "patterns", remote.clone());
        let action = action_from(NewAction::new(ActionType::CreatePattern, json!("not an object")));
        let err = processor.process(&action).await.unwrap_err();
        assert!(matches!(err, ProcessError::Permanent(_)));
        assert_eq!(remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_entity_mismatch_is_permanent() {
        let remote = mock();
        let processor = CreateProcessor::new(ActionType::CreatePattern, "patterns", remote.clone());
        let action = action_from(
            NewAction::new(ActionType::CreatePattern, json!({"entity_id": "p-1"})).for_entity("p-2"),
        );
        let err = processor.process(&action).await.unwrap_err();
        assert!(matches!(err, ProcessError::Permanent(ref m) if m.contains("does not match")));
        assert_eq!(remote.request_count(), 0);
    }

    // ---- update ----

    #[tokio::test]
    async fn test_update_puts_to_entity_path() {
        let remote = mock();
        let processor = UpdateProcessor::new(ActionType::UpdatePattern, "patterns", remote.clone());
        processor.process(&pattern_write("p-9")).await.unwrap();
        let requests = remote.requests();
        assert_eq!(requests[0].method, HttpMethod::Put);
        assert_eq!(requests[0].path(), "patterns/p-9");
    }

    #[tokio::test]
    async fn test_update_not_found_and_conflict_are_permanent() {
        let remote = mock();
        remote.push(HttpMethod::Put, "patterns/p-1", Ok(RemoteResponse::new(404)));
        remote.push(HttpMethod::Put, "patterns/p-1", Ok(RemoteResponse::new(409)));
        let processor = UpdateProcessor::new(ActionType::UpdatePattern, "patterns", remote);

        let err = processor.process(&pattern_write("p-1")).await.unwrap_err();
        assert!(matches!(err, ProcessError::Permanent(ref m) if m.contains("not found")));
        let err = processor.process(&pattern_write("p-1")).await.unwrap_err();
        assert!(matches!(err, ProcessError::Permanent(ref m) if m.contains("conflicts")));
    }

    #[tokio::test]
    async fn test_update_rate_limited_is_transient() {
        let remote = mock();
        remote.respond(HttpMethod::Put, "patterns/p-1", Ok(RemoteResponse::new(429)));
        let processor = UpdateProcessor::new(ActionType::UpdatePattern, "patterns", remote);
        assert!(processor.process(&pattern_write("p-1")).await.unwrap_err().is_transient());
    }

    // ---- delete ----

    fn delete_action(entity: &str) -> Action {
        action_from(
            NewAction::new(ActionType::DeletePair, json!({"entity_id": entity}))
                .with_idempotency_key(format!("delete-pair-{}", entity)),
        )
    }

    #[tokio::test]
    async fn test_delete_success() {
        let remote = mock();
        remote.respond(HttpMethod::Delete, "pairs/x-1", Ok(RemoteResponse::new(204)));
        let processor = DeleteProcessor::new(ActionType::DeletePair, "pairs", remote.clone());
        processor.process(&delete_action("x-1")).await.unwrap();
        assert_eq!(
            remote.requests()[0].idempotency_key.as_deref(),
            Some("delete-pair-x-1")
        );
        assert!(remote.requests()[0].body.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_entity_is_already_satisfied() {
        for status in [404, 410] {
            let remote = mock();
            remote.respond(HttpMethod::Delete, "pairs/x-1", Ok(RemoteResponse::new(status)));
            let processor = DeleteProcessor::new(ActionType::DeletePair, "pairs", remote);
            let err = processor.process(&delete_action("x-1")).await.unwrap_err();
            assert!(matches!(err, ProcessError::AlreadySatisfied(_)), "status {}", status);
        }
    }

    #[tokio::test]
    async fn test_delete_rejects_ids_that_are_not_one_segment() {
        let remote = mock();
        let processor = DeleteProcessor::new(ActionType::DeletePair, "pairs", remote.clone());
        for id in ["../users", "a/b", ".", "..", " "] {
            let err = processor.process(&delete_action(id)).await.unwrap_err();
            assert!(matches!(err, ProcessError::Permanent(_)), "id {:?}", id);
        }
        assert_eq!(remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_keeps_reserved_characters_in_one_segment() {
        let remote = mock();
        let processor = DeleteProcessor::new(ActionType::DeletePair, "pairs", remote.clone());
        processor.process(&delete_action("a#b")).await.unwrap();
        processor.process(&delete_action("a?force=1")).await.unwrap();

        let requests = remote.requests();
        assert_eq!(requests[0].segments, vec!["pairs", "a#b"]);
        assert_eq!(requests[1].segments, vec!["pairs", "a?force=1"]);
    }

    // ---- share ----

    #[tokio::test]
    async fn test_share_posts_recipients() {
        let remote = mock();
        let processor = ShareProcessor::new(ActionType::SharePattern, "patterns", remote.clone());
        let action = action_from(NewAction::new(
            ActionType::SharePattern,
            json!({"entity_id": "p-1", "recipient_ids": ["u-2", "u-3"], "message": "for you"}),
        ));
        processor.process(&action).await.unwrap();

        let request = &remote.requests()[0];
        assert_eq!(request.path(), "patterns/p-1/shares");
        assert_eq!(request.body.as_ref().unwrap()["recipient_ids"], json!(["u-2", "u-3"]));
    }

    #[tokio::test]
    async fn test_share_without_recipients_is_permanent() {
        let remote = mock();
        let processor = ShareProcessor::new(ActionType::SharePattern, "patterns", remote.clone());
        let action = action_from(NewAction::new(
            ActionType::SharePattern,
            json!({"entity_id": "p-1", "recipient_ids": []}),
        ));
        assert!(matches!(
            processor.process(&action).await,
            Err(ProcessError::Permanent(_))
        ));
        assert_eq!(remote.request_count(), 0);
    }

    #[tokio::test]
    async fn test_share_conflict_is_already_satisfied() {
        let remote = mock();
        remote.respond(HttpMethod::Post, "patterns/p-1/shares", Ok(RemoteResponse::new(409)));
        let processor = ShareProcessor::new(ActionType::SharePattern, "patterns", remote);
        let action = action_from(NewAction::new(
            ActionType::SharePattern,
            json!({"entity_id": "p-1", "recipient_ids": ["u-2"]}),
        ));
        assert!(matches!(
            processor.process(&action).await,
            Err(ProcessError::AlreadySatisfied(_))
        ));
    }
}
