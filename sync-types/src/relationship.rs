//! Identities, relationships and their changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Address, DeviceId, Realm, RelationshipChangeId, RelationshipId, RelationshipSecretId,
    RelationshipTemplateId, Timestamp,
};

/// Public view of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable address
    pub address: Address,
    /// Public signature key (Ed25519, 32 bytes)
    pub public_key: Vec<u8>,
    /// Realm tag
    pub realm: Realm,
}

impl Identity {
    /// Build an identity whose address is derived from its key.
    pub fn from_public_key(realm: Realm, public_key: Vec<u8>) -> Self {
        Self {
            address: Address::from_public_key(&realm, &public_key),
            public_key,
            realm,
        }
    }
}

/// Lifecycle status of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipStatus {
    /// Creation change sent, no response yet
    Pending,
    /// Templator accepted the creation change
    Active,
    /// Templator rejected the creation change
    Rejected,
    /// Requester withdrew the creation change
    Revoked,
}

impl RelationshipStatus {
    /// Whether no further status transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Kind of a relationship change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipChangeType {
    /// Handshake that brings a relationship out of Pending
    Creation,
    /// Request to end an active relationship
    Termination,
    /// Withdrawal of a termination request
    TerminationCancellation,
}

/// Status of a relationship change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipChangeStatus {
    /// Waiting for a response
    Pending,
    /// Accepted by the counterparty
    Accepted,
    /// Rejected by the counterparty
    Rejected,
    /// Withdrawn by its creator
    Revoked,
}

/// Request or response half of a relationship change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipChangeMessage {
    /// Address of the identity that created this half
    pub created_by: Address,
    /// Device that created this half
    pub created_by_device: DeviceId,
    /// Creation time
    pub created_at: Timestamp,
    /// Decrypted content, if any was attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// A change of a relationship, as held in the local relationship cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipChange {
    /// Change id
    pub id: RelationshipChangeId,
    /// Owning relationship
    pub relationship_id: RelationshipId,
    /// Change kind
    #[serde(rename = "type")]
    pub change_type: RelationshipChangeType,
    /// Current status
    pub status: RelationshipChangeStatus,
    /// Request half
    pub request: RelationshipChangeMessage,
    /// Response half, set exactly once together with the status transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RelationshipChangeMessage>,
}

/// Decrypted cache of a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipCache {
    /// Template the relationship was created from
    pub template: RelationshipTemplateId,
    /// Changes in creation order
    pub changes: Vec<RelationshipChange>,
}

/// A pairwise relationship between the account's identity and a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    /// Relationship id
    pub id: RelationshipId,
    /// Handle of the handshake secret in the secret store
    pub relationship_secret_id: RelationshipSecretId,
    /// The other party
    pub peer: Identity,
    /// Current status
    pub status: RelationshipStatus,
    /// Decrypted cache, absent until hydrated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<RelationshipCache>,
    /// Free-form local metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Last time the metadata was modified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_modified_at: Option<Timestamp>,
}

impl Relationship {
    /// A new Pending relationship.
    pub fn new_pending(
        id: RelationshipId,
        relationship_secret_id: RelationshipSecretId,
        peer: Identity,
        cache: RelationshipCache,
    ) -> Self {
        Self {
            id,
            relationship_secret_id,
            peer,
            status: RelationshipStatus::Pending,
            cache: Some(cache),
            metadata: None,
            metadata_modified_at: None,
        }
    }

    /// Find a cached change by id.
    pub fn change(&self, change_id: &RelationshipChangeId) -> Option<&RelationshipChange> {
        self.cache
            .as_ref()
            .and_then(|cache| cache.changes.iter().find(|c| &c.id == change_id))
    }

    /// The creation change, if the cache is hydrated.
    pub fn creation_change(&self) -> Option<&RelationshipChange> {
        self.cache.as_ref().and_then(|cache| {
            cache
                .changes
                .iter()
                .find(|c| c.change_type == RelationshipChangeType::Creation)
        })
    }
}
