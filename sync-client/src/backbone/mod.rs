//! Backbone abstraction for Tether.
//!
//! The backbone is the remote service every device of an identity talks to.
//! This module defines the request/response contract the sync engine and the
//! relationship handshake rely on; the HTTP mechanics (TLS, retries, paging
//! cursors, authentication) belong to an implementation of [`Backbone`].
//!
//! # Design
//!
//! One [`Backbone`] value is bound to one identity and one device, so calls
//! never carry the caller's address. Remote rejections come back as a
//! [`BackboneError`] carrying the backbone's error code; this crate never
//! retries on its own.
//!
//! # Example
//!
//! ```ignore
//! let backbone = MockBackbone::new();
//! let session = backbone.session(identity.address.clone(), device_id);
//! let run = session.start_sync_run().await?;
//! ```

mod mock;

pub use mock::{MockBackbone, MockBackboneSession};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tether_sync_types::{
    Address, BackboneMessage, BackboneRelationship, BackboneRelationshipChange,
    BackboneRelationshipTemplate, CachedObject, Collection, CreatedDatawalletModifications,
    Datawallet, DatawalletModificationUpload, FinalizeSyncRunRequest, FinalizeSyncRunResponse,
    MessageId, RawExternalEvent, RelationshipChangeId, RelationshipId, RelationshipTemplateId,
    RemoteDatawalletModification, StartSyncRunResponse, SyncRunId, Timestamp,
};

/// Error code the backbone returns when the datawallet must be migrated first.
pub const DATAWALLET_VERSION_OUTDATED: &str = "error.platform.datawallet.versionOutdated";

/// Backbone errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackboneError {
    /// The backbone rejected the request.
    #[error("request rejected ({code}): {message}")]
    Rejected {
        /// Backbone error code
        code: String,
        /// Human-readable reason
        message: String,
    },

    /// The request conflicts with another device's session or a newer index.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request timed out.
    #[error("request timeout")]
    Timeout,

    /// The backbone could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),
}

impl BackboneError {
    /// Shorthand for a rejection.
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable error code.
    pub fn code(&self) -> String {
        match self {
            Self::Rejected { code, .. } => code.clone(),
            Self::Conflict(_) => "error.transport.request.conflict".to_string(),
            Self::NotFound(_) => "error.transport.request.notFound".to_string(),
            Self::Timeout => "error.transport.request.timeout".to_string(),
            Self::Connection(_) => "error.transport.request.connection".to_string(),
        }
    }

    /// Whether the backbone asked for a datawallet migration.
    pub fn is_datawallet_outdated(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if code == DATAWALLET_VERSION_OUTDATED)
    }
}

/// Remote operations consumed by the Tether client.
///
/// Implementations are bound to one identity and device.
#[async_trait]
pub trait Backbone: Send + Sync {
    // -- sync runs --

    /// Open a sync run for the external events queued for this identity.
    async fn start_sync_run(&self) -> Result<StartSyncRunResponse, BackboneError>;

    /// One page of the run's external events, in delivery order.
    async fn get_external_events_of_sync_run(
        &self,
        sync_run_id: &SyncRunId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawExternalEvent>, BackboneError>;

    /// Push modifications and event results and close the run.
    async fn finalize_sync_run(
        &self,
        sync_run_id: &SyncRunId,
        request: FinalizeSyncRunRequest,
    ) -> Result<FinalizeSyncRunResponse, BackboneError>;

    // -- datawallet --

    /// Up to `limit` modifications with an index above `local_index`, ascending.
    async fn get_datawallet_modifications(
        &self,
        local_index: u64,
        limit: usize,
    ) -> Result<Vec<RemoteDatawalletModification>, BackboneError>;

    /// Push modifications recorded on top of `local_index`.
    async fn create_datawallet_modifications(
        &self,
        local_index: u64,
        modifications: Vec<DatawalletModificationUpload>,
    ) -> Result<CreatedDatawalletModifications, BackboneError>;

    /// Current datawallet version.
    async fn get_datawallet(&self) -> Result<Datawallet, BackboneError>;

    /// Record that the datawallet was migrated to `version`.
    async fn upgrade_datawallet(&self, version: u32) -> Result<Datawallet, BackboneError>;

    // -- relationships --

    /// Create a relationship against a template; `content` is the request cipher.
    async fn create_relationship(
        &self,
        template_id: &RelationshipTemplateId,
        content: Vec<u8>,
    ) -> Result<BackboneRelationship, BackboneError>;

    /// Fetch a relationship with all its changes.
    async fn get_relationship(
        &self,
        relationship_id: &RelationshipId,
    ) -> Result<BackboneRelationship, BackboneError>;

    /// Fetch a single change.
    async fn get_relationship_change(
        &self,
        change_id: &RelationshipChangeId,
    ) -> Result<BackboneRelationshipChange, BackboneError>;

    /// Accept a pending change (templator only).
    async fn accept_relationship_change(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Option<Vec<u8>>,
    ) -> Result<BackboneRelationship, BackboneError>;

    /// Reject a pending change (templator only).
    async fn reject_relationship_change(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Option<Vec<u8>>,
    ) -> Result<BackboneRelationship, BackboneError>;

    /// Revoke a pending change (requester only).
    async fn revoke_relationship_change(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
        content: Option<Vec<u8>>,
    ) -> Result<BackboneRelationship, BackboneError>;

    // -- templates --

    /// Publish a relationship template.
    async fn create_relationship_template(
        &self,
        content: Value,
        expires_at: Option<Timestamp>,
        max_number_of_allocations: Option<u32>,
    ) -> Result<BackboneRelationshipTemplate, BackboneError>;

    /// Fetch a template.
    async fn get_relationship_template(
        &self,
        template_id: &RelationshipTemplateId,
    ) -> Result<BackboneRelationshipTemplate, BackboneError>;

    // -- messages --

    /// Send a message with opaque content.
    async fn send_message(
        &self,
        recipients: Vec<Address>,
        content: Value,
    ) -> Result<BackboneMessage, BackboneError>;

    /// Fetch a message.
    async fn get_message(&self, message_id: &MessageId) -> Result<BackboneMessage, BackboneError>;

    // -- cache hydration --

    /// Cache contents of opaque objects (files, tokens, templates).
    async fn get_cached_objects(
        &self,
        collection: Collection,
        ids: &[String],
    ) -> Result<Vec<CachedObject>, BackboneError>;
}
