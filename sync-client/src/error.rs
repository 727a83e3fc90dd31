//! Client errors.
//!
//! [`ClientError`] is the error of every public operation in this crate.
//! It is `Clone` so a sync run's outcome can be handed to every caller that
//! joined the run.

use thiserror::Error;
use tether_sync_core::{IndexError, TemplateError, TransitionError};
use tether_sync_types::{
    RelationshipChangeId, RelationshipChangeStatus, RelationshipChangeType, RelationshipSecretId,
    TypesError,
};

use crate::backbone::BackboneError;
use crate::crypto::CryptoError;

/// Client errors.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Malformed input, rejected before any state change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A handshake signature did not verify.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    /// A local record is missing.
    #[error("{kind} {id} not found")]
    RecordNotFound {
        /// Record type
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// A local record has not been hydrated.
    #[error("{kind} {id} has no cache")]
    CacheEmpty {
        /// Record type
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// The relationship secret is in the wrong handshake phase.
    #[error("relationship secret {id} is not a {expected} secret")]
    WrongSecretType {
        /// The secret
        id: RelationshipSecretId,
        /// Phase the operation needs
        expected: &'static str,
    },

    /// The change was already completed.
    #[error("change {change_id} is {status:?}, expected Pending")]
    WrongChangeStatus {
        /// The change
        change_id: RelationshipChangeId,
        /// Its current status
        status: RelationshipChangeStatus,
    },

    /// The operation does not apply to this change type.
    #[error("change {change_id} has unsupported type {change_type:?}")]
    WrongChangeType {
        /// The change
        change_id: RelationshipChangeId,
        /// Its type
        change_type: RelationshipChangeType,
    },

    /// The operation exists in the protocol but this client does not support it.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Key material handed to the secret controller is malformed.
    #[error("secret derivation failed: {0}")]
    SecretDerivation(String),

    /// The backbone rejected or failed a request.
    #[error("request failed: {0}")]
    Request(#[from] BackboneError),

    /// Encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Encoding or decoding a payload failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A datawallet record names a collection this client does not know.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// The backbone requires a datawallet version no migration reaches.
    #[error("no datawallet migration from version {from} to {to}")]
    MissingMigration {
        /// Current version
        from: u32,
        /// Required version
        to: u32,
    },

    /// A sync run completed but some external events failed.
    #[error("{} external event(s) failed: {}", codes.len(), codes.join(", "))]
    ExternalEventsFailed {
        /// Error code of every failed event, in event order
        codes: Vec<String>,
    },

    /// The local store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ClientError {
    /// Stable dotted error code, reported in external event results.
    pub fn code(&self) -> String {
        let code = match self {
            Self::Validation(_) => "error.transport.validation",
            Self::SignatureInvalid(_) => "error.transport.signatureInvalid",
            Self::RecordNotFound { .. } => "error.transport.recordNotFound",
            Self::CacheEmpty { .. } => "error.transport.cacheEmpty",
            Self::WrongSecretType { .. } => "error.transport.secrets.wrongSecretType",
            Self::WrongChangeStatus { .. } => "error.transport.relationships.wrongChangeStatus",
            Self::WrongChangeType { .. } => "error.transport.relationships.wrongChangeType",
            Self::NotImplemented(_) => "error.transport.notImplemented",
            Self::SecretDerivation(_) => "error.transport.secrets.derivationFailed",
            Self::Request(e) => return e.code(),
            Self::Crypto(_) => "error.transport.crypto",
            Self::Serialization(_) => "error.transport.serialization",
            Self::UnknownCollection(_) => "error.transport.datawallet.unknownCollection",
            Self::MissingMigration { .. } => "error.transport.datawallet.missingMigration",
            Self::ExternalEventsFailed { .. } => "error.transport.sync.externalEventsFailed",
            Self::Storage(_) => "error.transport.storage",
        };
        code.to_string()
    }

    /// Shorthand for a missing record.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::RecordNotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for a record without cache.
    pub fn cache_empty(kind: &'static str, id: impl ToString) -> Self {
        Self::CacheEmpty {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<CryptoError> for ClientError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::SignatureInvalid => Self::SignatureInvalid(e.to_string()),
            other => Self::Crypto(other),
        }
    }
}

impl From<TypesError> for ClientError {
    fn from(e: TypesError) -> Self {
        match e {
            TypesError::UnknownCollection(name) => Self::UnknownCollection(name),
            TypesError::Serialization(_)
            | TypesError::Deserialization(_)
            | TypesError::Document(_) => Self::Serialization(e.to_string()),
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<TransitionError> for ClientError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::CacheEmpty { relationship_id } => {
                Self::cache_empty("Relationship", relationship_id)
            }
            TransitionError::ChangeNotFound { change_id, .. } => {
                Self::not_found("RelationshipChange", change_id)
            }
            TransitionError::WrongChangeStatus { change_id, status } => {
                Self::WrongChangeStatus { change_id, status }
            }
            TransitionError::WrongChangeType {
                change_id,
                change_type,
            } => Self::WrongChangeType {
                change_id,
                change_type,
            },
            other @ TransitionError::WrongRelationshipStatus { .. } => {
                Self::Validation(other.to_string())
            }
        }
    }
}

impl From<TemplateError> for ClientError {
    fn from(e: TemplateError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<IndexError> for ClientError {
    fn from(e: IndexError) -> Self {
        Self::Validation(e.to_string())
    }
}
