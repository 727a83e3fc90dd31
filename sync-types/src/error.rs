//! Error types for the Tether data model.

use thiserror::Error;

/// Errors raised while constructing or decoding data-model values.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Identifier does not carry the expected prefix or length
    #[error("invalid {kind}: {value:?}")]
    InvalidId {
        /// Name of the identifier type
        kind: &'static str,
        /// The rejected input
        value: String,
    },

    /// Address is empty or contains characters outside the address alphabet
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    /// Collection name is not one the datawallet knows
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// External event type string is not one this client understands
    #[error("unknown external event type: {0}")]
    UnknownEventType(String),

    /// External event payload does not match its declared type
    #[error("invalid payload for {event_type} event: {reason}")]
    InvalidEventPayload {
        /// Declared event type
        event_type: String,
        /// Why the payload was rejected
        reason: String,
    },

    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// JSON document conversion failed
    #[error("document conversion failed: {0}")]
    Document(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TypesError::UnknownCollection("Spaceships".into());
        assert_eq!(err.to_string(), "unknown collection: Spaceships");
    }

    #[test]
    fn invalid_id_display_quotes_value() {
        let err = TypesError::InvalidId {
            kind: "RelationshipId",
            value: "XYZ".into(),
        };
        assert_eq!(err.to_string(), "invalid RelationshipId: \"XYZ\"");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TypesError>();
    }
}
