//! Relationship handshake payloads.
//!
//! A creation change carries a [`RequestCipher`] as its request content and a
//! [`ResponseCipher`] as its response content. Both wrap a [`SignedContent`]
//! whose `serialized` bytes are the MessagePack encoding of a
//! [`RequestContent`] or [`ResponseContent`]; signatures are computed over
//! exactly those bytes.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{Identity, RelationshipId, RelationshipTemplateId, TypesError};

/// MessagePack encoding for handshake payloads.
///
/// Structs are encoded as maps so optional fields survive a roundtrip.
pub trait WireEncode: Serialize + DeserializeOwned {
    /// Serialize to MessagePack bytes.
    fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        rmp_serde::to_vec_named(self).map_err(TypesError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        rmp_serde::from_slice(bytes).map_err(TypesError::Deserialization)
    }
}

/// Public keys a requester sends along with its request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicRequestMaterial {
    /// Requester's long-term exchange key for this relationship (X25519)
    pub exchange_key: Vec<u8>,
    /// Requester's ephemeral key, combined with the template key (X25519)
    pub ephemeral_key: Vec<u8>,
    /// Requester's relationship signature key (Ed25519)
    pub signature_key: Vec<u8>,
}

/// Public keys the templator sends along with its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicResponseMaterial {
    /// Templator's exchange key for this relationship (X25519)
    pub exchange_key: Vec<u8>,
    /// Templator's relationship signature key (Ed25519)
    pub signature_key: Vec<u8>,
}

/// Plain content of a creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContent {
    /// Application content
    pub content: Value,
    /// Who sends the request
    pub requester_identity: Identity,
    /// Template the request answers
    pub template_id: RelationshipTemplateId,
}

/// Plain content of a creation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseContent {
    /// Relationship the response belongs to
    pub relationship_id: RelationshipId,
    /// Application content
    pub content: Value,
}

/// Signature of a device, with the identity's certificate for that device.
///
/// The certificate is the identity key's signature over the device public
/// key, so a receiver holding only the identity public key can check both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSignature {
    /// Device public key (Ed25519)
    pub device_key: Vec<u8>,
    /// Identity signature over `device_key`
    pub certificate: Vec<u8>,
    /// Device signature over the content
    pub signature: Vec<u8>,
}

/// Serialized content with its two signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedContent {
    /// MessagePack bytes of the signed content
    pub serialized: Vec<u8>,
    /// Signature of the sending device
    pub device_signature: DeviceSignature,
    /// Signature of the relationship secret
    pub relationship_signature: Vec<u8>,
}

/// Request content as sent to the backbone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCipher {
    /// Keys the templator needs to derive its secrets
    pub public_request: PublicRequestMaterial,
    /// Sealed [`SignedContent`]
    pub cipher: Vec<u8>,
}

/// Key phase a response was sealed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherPhase {
    /// Request key, used when the requester revokes
    Request,
    /// Duplex key, used when the templator accepts or rejects
    Full,
}

/// Response content as sent to the backbone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCipher {
    /// Templator's public keys, absent on revocation
    pub public_response: Option<PublicResponseMaterial>,
    /// Key phase of `cipher`
    pub phase: CipherPhase,
    /// Sealed [`SignedContent`]
    pub cipher: Vec<u8>,
}

impl WireEncode for RequestContent {}
impl WireEncode for ResponseContent {}
impl WireEncode for SignedContent {}
impl WireEncode for RequestCipher {}
impl WireEncode for ResponseCipher {}

/// Decode a wire payload, for callers that only know the target type.
pub fn decode<T: WireEncode>(bytes: &[u8]) -> Result<T, TypesError> {
    T::from_bytes(bytes)
}
