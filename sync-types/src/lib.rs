//! # sync-types
//!
//! Data model and backbone wire shapes for the Tether sync engine.
//!
//! This crate provides the types shared by every Tether crate:
//! - [`RelationshipId`], [`Address`], [`Timestamp`] and friends - identifiers and time
//! - [`Relationship`], [`RelationshipChange`], [`RelationshipTemplate`] - relationship model
//! - [`DatawalletModification`], [`Collection`] - datawallet records
//! - [`ExternalEvent`] - server-pushed events
//! - [`RequestCipher`], [`ResponseCipher`] - handshake payloads
//! - [`TypesError`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backbone;
mod datawallet;
mod error;
mod events;
mod handshake;
mod ids;
mod message;
mod relationship;
mod sync;
mod template;

pub use backbone::{
    BackboneChangeMessage, BackboneMessage, BackboneRelationship, BackboneRelationshipChange,
    BackboneRelationshipTemplate, CachedObject, FinalizeSyncRunRequest, FinalizeSyncRunResponse,
    StartSyncRunResponse, SyncRun, SyncRunStatus,
};
pub use datawallet::{
    Collection, CreatedDatawalletModifications, Datawallet, DatawalletModification,
    DatawalletModificationUpload, ModificationType, PayloadCategory, RemoteDatawalletModification,
};
pub use error::TypesError;
pub use events::{ExternalEvent, ExternalEventResult, RawExternalEvent};
pub use handshake::{
    decode, CipherPhase, DeviceSignature, PublicRequestMaterial, PublicResponseMaterial,
    RequestCipher, RequestContent, ResponseCipher, ResponseContent, SignedContent, WireEncode,
};
pub use ids::{
    Address, DeviceId, ExternalEventId, MessageId, ModificationId, Realm, RelationshipChangeId,
    RelationshipId, RelationshipSecretId, RelationshipTemplateId, SyncRunId, TemplateKeyId,
    Timestamp,
};
pub use message::Message;
pub use relationship::{
    Identity, Relationship, RelationshipCache, RelationshipChange, RelationshipChangeMessage,
    RelationshipChangeStatus, RelationshipChangeType, RelationshipStatus,
};
pub use sync::{ChangedItems, SyncScope};
pub use template::{RelationshipTemplate, TemplateCache, TemplatePublicKey};
