//! Request and response shapes of the backbone API.
//!
//! These mirror what the backbone stores: relationship change contents are
//! opaque ciphertext here and only become [`RelationshipChange`]s after the
//! client decrypted and verified them.
//!
//! [`RelationshipChange`]: crate::RelationshipChange

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Address, DatawalletModificationUpload, DeviceId, ExternalEventResult, MessageId,
    RelationshipChangeId, RelationshipChangeStatus, RelationshipChangeType, RelationshipId,
    RelationshipTemplateId, SyncRunId, Timestamp,
};

/// Request or response half of a change, content still encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackboneChangeMessage {
    /// Creator address
    pub created_by: Address,
    /// Creator device
    pub created_by_device: DeviceId,
    /// Creation time
    pub created_at: Timestamp,
    /// Encrypted content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
}

/// A relationship change as the backbone returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackboneRelationshipChange {
    /// Change id
    pub id: RelationshipChangeId,
    /// Owning relationship
    pub relationship_id: RelationshipId,
    /// Change kind
    #[serde(rename = "type")]
    pub change_type: RelationshipChangeType,
    /// Status on the backbone
    pub status: RelationshipChangeStatus,
    /// Request half
    pub request: BackboneChangeMessage,
    /// Response half
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<BackboneChangeMessage>,
}

/// A relationship as the backbone returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackboneRelationship {
    /// Relationship id
    pub id: RelationshipId,
    /// Template the relationship was created from
    pub template_id: RelationshipTemplateId,
    /// Requester address
    pub from: Address,
    /// Templator address
    pub to: Address,
    /// Changes in creation order
    pub changes: Vec<BackboneRelationshipChange>,
}

/// A published relationship template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackboneRelationshipTemplate {
    /// Template id
    pub id: RelationshipTemplateId,
    /// Templator address
    pub created_by: Address,
    /// Templator device
    pub created_by_device: DeviceId,
    /// Publication time
    pub created_at: Timestamp,
    /// Expiry time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    /// Allocation limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_number_of_allocations: Option<u32>,
    /// Template cache document
    pub content: Value,
}

/// A message as the backbone returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackboneMessage {
    /// Message id
    pub id: MessageId,
    /// Sender address
    pub created_by: Address,
    /// Sender device
    pub created_by_device: DeviceId,
    /// Recipient addresses
    pub recipients: Vec<Address>,
    /// Send time
    pub created_at: Timestamp,
    /// Opaque content
    pub content: Value,
}

/// Cache content of one backbone object, used to hydrate local documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedObject {
    /// Object id
    pub id: String,
    /// Cache content
    pub cache: Value,
}

/// Status of a sync run start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRunStatus {
    /// A run was created and holds events
    Created,
    /// No events are waiting, no run was created
    NoNewEvents,
}

/// A backbone sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    /// Run id
    pub id: SyncRunId,
    /// Number of events assigned to the run
    pub event_count: u32,
}

/// Response to a sync run start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSyncRunResponse {
    /// Outcome
    pub status: SyncRunStatus,
    /// The run, when one was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_run: Option<SyncRun>,
}

/// Body of a sync run finalization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeSyncRunRequest {
    /// Locally queued modifications to push
    pub datawallet_modifications: Vec<DatawalletModificationUpload>,
    /// Per-event outcomes
    pub external_event_results: Vec<ExternalEventResult>,
}

/// Response to a sync run finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeSyncRunResponse {
    /// Highest modification index, when modifications were pushed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_index: Option<u64>,
}
