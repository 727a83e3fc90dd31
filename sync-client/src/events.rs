//! Processing the external events of a sync run.
//!
//! Events are applied one by one in delivery order. A failing event does
//! not stop the run: its error code is reported back to the backbone with
//! the finalize call and the remaining events are still applied.

use async_trait::async_trait;
use std::sync::Arc;
use tether_sync_types::{
    ChangedItems, ExternalEvent, ExternalEventResult, Message, MessageId, RawExternalEvent,
    Relationship, RelationshipChangeId, RelationshipId, Timestamp,
};

use crate::error::ClientError;

/// Applies relationship change events.
#[async_trait]
pub trait RelationshipChangeHandler: Send + Sync {
    /// Fetch a change and apply it to the local relationship.
    ///
    /// Returns the relationship if it changed.
    async fn apply_change_by_id(
        &self,
        relationship_id: &RelationshipId,
        change_id: &RelationshipChangeId,
    ) -> Result<Option<Relationship>, ClientError>;
}

/// Applies message events.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// A message addressed to this identity arrived.
    async fn message_received(&self, message_id: &MessageId) -> Result<Message, ClientError>;

    /// A message sent by this identity was delivered.
    async fn message_delivered(
        &self,
        message_id: &MessageId,
        delivered_at: Option<Timestamp>,
    ) -> Result<Message, ClientError>;
}

/// Result of processing a run's events.
#[derive(Debug, Clone, Default)]
pub struct EventProcessingOutcome {
    /// One result per event, in input order
    pub results: Vec<ExternalEventResult>,
    /// Objects changed by successful events
    pub changed: ChangedItems,
}

impl EventProcessingOutcome {
    /// Error codes of the failed events.
    pub fn failed_codes(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| r.error_code.clone())
            .collect()
    }
}

enum Applied {
    Relationship(Option<Relationship>),
    Message(Message),
}

/// Dispatches external events to their handlers.
pub struct ExternalEventProcessor {
    relationships: Arc<dyn RelationshipChangeHandler>,
    messages: Arc<dyn MessageHandler>,
}

impl ExternalEventProcessor {
    /// Processor dispatching to the given handlers.
    pub fn new(
        relationships: Arc<dyn RelationshipChangeHandler>,
        messages: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            relationships,
            messages,
        }
    }

    async fn apply(&self, raw: &RawExternalEvent) -> Result<Applied, ClientError> {
        let event = ExternalEvent::try_from(raw)?;
        match event {
            ExternalEvent::MessageReceived { message_id, .. } => Ok(Applied::Message(
                self.messages.message_received(&message_id).await?,
            )),
            ExternalEvent::MessageDelivered {
                message_id,
                delivered_at,
                ..
            } => Ok(Applied::Message(
                self.messages
                    .message_delivered(&message_id, delivered_at)
                    .await?,
            )),
            ExternalEvent::RelationshipChangeCreated {
                change_id,
                relationship_id,
                ..
            }
            | ExternalEvent::RelationshipChangeCompleted {
                change_id,
                relationship_id,
                ..
            } => Ok(Applied::Relationship(
                self.relationships
                    .apply_change_by_id(&relationship_id, &change_id)
                    .await?,
            )),
        }
    }

    /// Apply `events` sequentially, collecting one result per event.
    pub async fn execute(&self, events: &[RawExternalEvent]) -> EventProcessingOutcome {
        let mut outcome = EventProcessingOutcome::default();

        for raw in events {
            match self.apply(raw).await {
                Ok(applied) => {
                    match applied {
                        Applied::Relationship(Some(relationship)) => {
                            outcome.changed.add_relationship(relationship)
                        }
                        Applied::Relationship(None) => {}
                        Applied::Message(message) => outcome.changed.add_message(message),
                    }
                    outcome
                        .results
                        .push(ExternalEventResult::success(raw.id.clone()));
                }
                Err(e) => {
                    tracing::warn!(
                        "External event {} ({}) failed: {}",
                        raw.id,
                        raw.event_type,
                        e
                    );
                    outcome
                        .results
                        .push(ExternalEventResult::failure(raw.id.clone(), e.code()));
                }
            }
        }

        outcome
    }
}

impl std::fmt::Debug for ExternalEventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalEventProcessor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tether_sync_types::{Address, DeviceId, ExternalEventId};

    #[derive(Default)]
    struct Handlers {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RelationshipChangeHandler for Handlers {
        async fn apply_change_by_id(
            &self,
            _relationship_id: &RelationshipId,
            change_id: &RelationshipChangeId,
        ) -> Result<Option<Relationship>, ClientError> {
            self.applied.lock().unwrap().push(change_id.to_string());
            Err(ClientError::not_found("RelationshipChange", change_id))
        }
    }

    #[async_trait]
    impl MessageHandler for Handlers {
        async fn message_received(&self, message_id: &MessageId) -> Result<Message, ClientError> {
            self.applied.lock().unwrap().push(message_id.to_string());
            Ok(message(message_id, None))
        }

        async fn message_delivered(
            &self,
            message_id: &MessageId,
            delivered_at: Option<Timestamp>,
        ) -> Result<Message, ClientError> {
            self.applied.lock().unwrap().push(message_id.to_string());
            Ok(message(message_id, delivered_at))
        }
    }

    fn message(id: &MessageId, delivered_at: Option<Timestamp>) -> Message {
        Message {
            id: id.clone(),
            created_by: Address::parse("id1sender").unwrap(),
            created_by_device: DeviceId::generate(),
            recipients: vec![Address::parse("id1recipient").unwrap()],
            created_at: Timestamp::from_millis(1),
            delivered_at,
            content: json!({}),
        }
    }

    fn raw(event_type: &str, payload: serde_json::Value) -> RawExternalEvent {
        RawExternalEvent {
            id: ExternalEventId::generate(),
            event_type: event_type.to_string(),
            payload,
        }
    }

    fn processor(handlers: Arc<Handlers>) -> ExternalEventProcessor {
        ExternalEventProcessor::new(handlers.clone(), handlers)
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_run() {
        let handlers = Arc::new(Handlers::default());
        let first = MessageId::generate();
        let last = MessageId::generate();
        let events = vec![
            raw("MessageReceived", json!({"id": first})),
            raw(
                "RelationshipChangeCreated",
                json!({
                    "changeId": RelationshipChangeId::generate(),
                    "relationshipId": RelationshipId::generate()
                }),
            ),
            raw("MessageReceived", json!({"id": last})),
        ];

        let outcome = processor(handlers.clone()).execute(&events).await;

        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results[0].error_code.is_none());
        assert_eq!(
            outcome.results[1].error_code.as_deref(),
            Some("error.transport.recordNotFound")
        );
        assert!(outcome.results[2].error_code.is_none());
        assert_eq!(outcome.changed.messages.len(), 2);
        assert_eq!(handlers.applied.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_event_type_is_a_per_event_failure() {
        let handlers = Arc::new(Handlers::default());
        let events = vec![raw("PeerDeletionStarted", json!({}))];

        let outcome = processor(handlers).execute(&events).await;

        assert_eq!(outcome.failed_codes(), vec!["error.transport.validation".to_string()]);
        assert_eq!(outcome.results[0].external_event_id, events[0].id);
    }

    #[tokio::test]
    async fn delivered_events_carry_the_delivery_time() {
        let handlers = Arc::new(Handlers::default());
        let id = MessageId::generate();
        let events = vec![raw(
            "MessageDelivered",
            json!({"id": id, "deliveredAt": 77}),
        )];

        let outcome = processor(handlers).execute(&events).await;

        assert!(outcome.failed_codes().is_empty());
        assert_eq!(
            outcome.changed.messages[0].delivered_at,
            Some(Timestamp::from_millis(77))
        );
    }

    #[tokio::test]
    async fn empty_run_has_no_results() {
        let outcome = processor(Arc::new(Handlers::default())).execute(&[]).await;
        assert!(outcome.results.is_empty());
        assert!(outcome.changed.is_empty());
    }
}
