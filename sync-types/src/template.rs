//! Relationship templates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Address, DeviceId, Identity, RelationshipTemplateId, TemplateKeyId, Timestamp};

/// Public half of a template's exchange keypair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatePublicKey {
    /// Key id, used by the templator to find the private half
    pub id: TemplateKeyId,
    /// X25519 public key (32 bytes)
    pub public_key: Vec<u8>,
}

/// Decrypted content of a published template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateCache {
    /// Identity of the templator
    pub identity: Identity,
    /// Exchange key a requester derives its request key from
    pub template_key: TemplatePublicKey,
    /// Application content shown to the requester
    pub content: Value,
    /// After this time the template can no longer be used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    /// Upper bound on relationships created from this template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_number_of_allocations: Option<u32>,
}

impl TemplateCache {
    /// Whether the template has expired at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// A relationship template as stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipTemplate {
    /// Template id
    pub id: RelationshipTemplateId,
    /// Whether this account published the template
    pub is_own: bool,
    /// Templator address
    pub created_by: Address,
    /// Templator device
    pub created_by_device: DeviceId,
    /// Publication time
    pub created_at: Timestamp,
    /// Decrypted content, absent until hydrated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<TemplateCache>,
}
