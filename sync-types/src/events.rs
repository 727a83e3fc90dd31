//! External events pushed by the backbone.
//!
//! The backbone delivers events as [`RawExternalEvent`]s with a type string
//! and a JSON payload. [`ExternalEvent::try_from`] turns them into a closed
//! enum; an unknown type only fails that one event.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ExternalEventId, MessageId, RelationshipChangeId, RelationshipId, Timestamp, TypesError,
};

/// External event as delivered by the backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExternalEvent {
    /// Event id
    pub id: ExternalEventId,
    /// Event type string
    #[serde(rename = "type")]
    pub event_type: String,
    /// Type-specific payload
    #[serde(default)]
    pub payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    id: MessageId,
    #[serde(default)]
    delivered_at: Option<Timestamp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelationshipChangePayload {
    change_id: RelationshipChangeId,
    relationship_id: RelationshipId,
}

/// A typed external event.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalEvent {
    /// A message addressed to this identity arrived
    MessageReceived {
        /// Event id
        id: ExternalEventId,
        /// The new message
        message_id: MessageId,
    },
    /// A message sent by this identity was delivered
    MessageDelivered {
        /// Event id
        id: ExternalEventId,
        /// The delivered message
        message_id: MessageId,
        /// Delivery time reported by the backbone
        delivered_at: Option<Timestamp>,
    },
    /// A peer created a change of a relationship
    RelationshipChangeCreated {
        /// Event id
        id: ExternalEventId,
        /// The new change
        change_id: RelationshipChangeId,
        /// Owning relationship
        relationship_id: RelationshipId,
    },
    /// A peer answered a change of a relationship
    RelationshipChangeCompleted {
        /// Event id
        id: ExternalEventId,
        /// The completed change
        change_id: RelationshipChangeId,
        /// Owning relationship
        relationship_id: RelationshipId,
    },
}

impl ExternalEvent {
    /// Id of the event, regardless of its type.
    pub fn id(&self) -> &ExternalEventId {
        match self {
            Self::MessageReceived { id, .. }
            | Self::MessageDelivered { id, .. }
            | Self::RelationshipChangeCreated { id, .. }
            | Self::RelationshipChangeCompleted { id, .. } => id,
        }
    }
}

fn payload<T: DeserializeOwned>(raw: &RawExternalEvent) -> Result<T, TypesError> {
    serde_json::from_value(raw.payload.clone()).map_err(|e| TypesError::InvalidEventPayload {
        event_type: raw.event_type.clone(),
        reason: e.to_string(),
    })
}

impl TryFrom<&RawExternalEvent> for ExternalEvent {
    type Error = TypesError;

    fn try_from(raw: &RawExternalEvent) -> Result<Self, Self::Error> {
        let id = raw.id.clone();
        match raw.event_type.as_str() {
            "MessageReceived" => {
                let p: MessagePayload = payload(raw)?;
                Ok(Self::MessageReceived {
                    id,
                    message_id: p.id,
                })
            }
            "MessageDelivered" => {
                let p: MessagePayload = payload(raw)?;
                Ok(Self::MessageDelivered {
                    id,
                    message_id: p.id,
                    delivered_at: p.delivered_at,
                })
            }
            "RelationshipChangeCreated" => {
                let p: RelationshipChangePayload = payload(raw)?;
                Ok(Self::RelationshipChangeCreated {
                    id,
                    change_id: p.change_id,
                    relationship_id: p.relationship_id,
                })
            }
            "RelationshipChangeCompleted" => {
                let p: RelationshipChangePayload = payload(raw)?;
                Ok(Self::RelationshipChangeCompleted {
                    id,
                    change_id: p.change_id,
                    relationship_id: p.relationship_id,
                })
            }
            other => Err(TypesError::UnknownEventType(other.to_string())),
        }
    }
}

/// Outcome of applying one external event, reported back on finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEventResult {
    /// The processed event
    pub external_event_id: ExternalEventId,
    /// Error code when applying the event failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ExternalEventResult {
    /// Successful application.
    pub fn success(external_event_id: ExternalEventId) -> Self {
        Self {
            external_event_id,
            error_code: None,
        }
    }

    /// Failed application.
    pub fn failure(external_event_id: ExternalEventId, error_code: impl Into<String>) -> Self {
        Self {
            external_event_id,
            error_code: Some(error_code.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str, payload: Value) -> RawExternalEvent {
        RawExternalEvent {
            id: ExternalEventId::generate(),
            event_type: event_type.to_string(),
            payload,
        }
    }

    #[test]
    fn parses_relationship_change_created() {
        let change_id = RelationshipChangeId::generate();
        let relationship_id = RelationshipId::generate();
        let event = ExternalEvent::try_from(&raw(
            "RelationshipChangeCreated",
            json!({"changeId": change_id, "relationshipId": relationship_id}),
        ))
        .unwrap();
        assert!(matches!(
            event,
            ExternalEvent::RelationshipChangeCreated { change_id: c, relationship_id: r, .. }
                if c == change_id && r == relationship_id
        ));
    }

    #[test]
    fn parses_message_delivered_with_time() {
        let message_id = MessageId::generate();
        let event = ExternalEvent::try_from(&raw(
            "MessageDelivered",
            json!({"id": message_id, "deliveredAt": 42}),
        ))
        .unwrap();
        assert!(matches!(
            event,
            ExternalEvent::MessageDelivered { delivered_at: Some(t), .. } if t.as_millis() == 42
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = ExternalEvent::try_from(&raw("PeerDeleted", json!({}))).unwrap_err();
        assert!(matches!(err, TypesError::UnknownEventType(t) if t == "PeerDeleted"));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = ExternalEvent::try_from(&raw("MessageReceived", json!({"id": "bogus"})))
            .unwrap_err();
        assert!(matches!(err, TypesError::InvalidEventPayload { .. }));
    }

    #[test]
    fn event_id_accessor() {
        let r = raw("MessageReceived", json!({"id": MessageId::generate()}));
        let event = ExternalEvent::try_from(&r).unwrap();
        assert_eq!(event.id(), &r.id);
    }

    #[test]
    fn result_omits_missing_error_code() {
        let result = ExternalEventResult::success(ExternalEventId::generate());
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("errorCode").is_none());
    }
}
