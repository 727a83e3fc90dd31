//! Datawallet modification records.
//!
//! A [`DatawalletModification`] describes one mutation of a synchronized
//! document. Devices of the same identity exchange them through the
//! backbone as [`RemoteDatawalletModification`]s whose payload is encrypted
//! and whose `index` is assigned by the backbone.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::{DeviceId, ModificationId, TypesError};

/// Synchronized document collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    /// File metadata
    Files,
    /// Messages
    Messages,
    /// Relationships
    Relationships,
    /// Relationship templates
    Templates,
    /// Tokens
    Tokens,
    /// Devices of the identity
    Devices,
    /// Sealed relationship secrets and template keys
    RelationshipSecrets,
}

impl Collection {
    /// Every collection, in declaration order.
    pub const ALL: [Collection; 7] = [
        Self::Files,
        Self::Messages,
        Self::Relationships,
        Self::Templates,
        Self::Tokens,
        Self::Devices,
        Self::RelationshipSecrets,
    ];

    /// Stable wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Files => "Files",
            Self::Messages => "Messages",
            Self::Relationships => "Relationships",
            Self::Templates => "Templates",
            Self::Tokens => "Tokens",
            Self::Devices => "Devices",
            Self::RelationshipSecrets => "RelationshipSecrets",
        }
    }

    /// Whether documents of this collection carry a cache filled from the backbone.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Self::Devices | Self::RelationshipSecrets)
    }
}

impl std::str::FromStr for Collection {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| TypesError::UnknownCollection(s.to_string()))
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a datawallet modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationType {
    /// A document was created (possibly split over payload categories)
    Create,
    /// A document's payload changed
    Update,
    /// A document was deleted
    Delete,
    /// A document's backbone cache must be refreshed
    CacheChanged,
}

/// Part of a document a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadCategory {
    /// Fields needed to reference the object on the backbone
    Technical,
    /// Fields the user entered
    Userdata,
    /// Local bookkeeping such as metadata
    Metadata,
}

/// A decrypted datawallet modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatawalletModification {
    /// Local id, the outbox key
    pub local_id: ModificationId,
    /// Id of the affected document
    pub object_identifier: String,
    /// Collection of the affected document
    pub collection: Collection,
    /// Modification kind
    #[serde(rename = "type")]
    pub modification_type: ModificationType,
    /// Part of the document the payload belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_category: Option<PayloadCategory>,
    /// Document fields (JSON object)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Backbone index once pushed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

impl DatawalletModification {
    /// A new, not yet pushed modification.
    pub fn new(
        object_identifier: impl Into<String>,
        collection: Collection,
        modification_type: ModificationType,
        payload_category: Option<PayloadCategory>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            local_id: ModificationId::generate(),
            object_identifier: object_identifier.into(),
            collection,
            modification_type,
            payload_category,
            payload,
            index: None,
        }
    }
}

/// Encrypted modification as uploaded to the backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatawalletModificationUpload {
    /// Id of the affected document
    pub object_identifier: String,
    /// Collection wire name
    pub collection: String,
    /// Modification kind
    #[serde(rename = "type")]
    pub modification_type: ModificationType,
    /// Part of the document the payload belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_category: Option<PayloadCategory>,
    /// Sealed payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<Vec<u8>>,
}

/// Encrypted modification as returned by the backbone.
///
/// The collection stays a string here; mapping it onto [`Collection`]
/// happens when the record is decrypted, so an unknown name surfaces as a
/// processing error instead of a page that cannot be read at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDatawalletModification {
    /// Backbone-assigned, strictly increasing index
    pub index: u64,
    /// Device that pushed the modification
    pub created_by_device: DeviceId,
    /// Id of the affected document
    pub object_identifier: String,
    /// Collection wire name
    pub collection: String,
    /// Modification kind
    #[serde(rename = "type")]
    pub modification_type: ModificationType,
    /// Part of the document the payload belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_category: Option<PayloadCategory>,
    /// Sealed payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<Vec<u8>>,
}

/// Backbone response to a push of modifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedDatawalletModifications {
    /// Highest index after the push
    pub new_index: u64,
}

/// Backbone-side datawallet descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datawallet {
    /// Schema version of the stored modifications
    pub version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_roundtrip() {
        for collection in Collection::ALL {
            let parsed: Collection = collection.name().parse().unwrap();
            assert_eq!(parsed, collection);
        }
    }

    #[test]
    fn unknown_collection_fails() {
        let err = "Spaceships".parse::<Collection>().unwrap_err();
        assert!(matches!(err, TypesError::UnknownCollection(name) if name == "Spaceships"));
    }

    #[test]
    fn bookkeeping_collections_are_not_cacheable() {
        assert!(!Collection::Devices.is_cacheable());
        assert!(!Collection::RelationshipSecrets.is_cacheable());
        assert!(Collection::Relationships.is_cacheable());
        assert!(Collection::Files.is_cacheable());
    }

    #[test]
    fn new_modification_has_no_index() {
        let m = DatawalletModification::new(
            "REL00000000000000000",
            Collection::Relationships,
            ModificationType::CacheChanged,
            None,
            None,
        );
        assert!(m.index.is_none());
        assert!(m.local_id.as_str().starts_with("DWM"));
    }

    #[test]
    fn remote_modification_uses_type_key() {
        let json = serde_json::json!({
            "index": 4,
            "createdByDevice": DeviceId::generate(),
            "objectIdentifier": "FIL00000000000000000",
            "collection": "Files",
            "type": "Update",
            "payloadCategory": "Userdata",
        });
        let remote: RemoteDatawalletModification = serde_json::from_value(json).unwrap();
        assert_eq!(remote.modification_type, ModificationType::Update);
        assert_eq!(remote.payload_category, Some(PayloadCategory::Userdata));
        assert!(remote.encrypted_payload.is_none());
    }
}
