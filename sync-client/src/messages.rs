//! Messages between related identities.
//!
//! Message content is an opaque JSON payload here. A message may only be
//! sent to identities this account has an Active relationship with.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tether_sync_types::{Address, BackboneMessage, Message, MessageId, Timestamp};

use crate::account::AccountContext;
use crate::error::ClientError;
use crate::events::MessageHandler;
use crate::modifications::CacheHydrator;
use crate::relationships::RelationshipsController;
use crate::store::{list_as, read_as, to_document, SynchronizedCollection};

fn message_from_backbone(remote: BackboneMessage, delivered_at: Option<Timestamp>) -> Message {
    Message {
        id: remote.id,
        created_by: remote.created_by,
        created_by_device: remote.created_by_device,
        recipients: remote.recipients,
        created_at: remote.created_at,
        delivered_at,
        content: remote.content,
    }
}

/// Sends, receives and stores messages.
pub struct MessagesController {
    context: AccountContext,
    relationships: Arc<RelationshipsController>,
    messages: SynchronizedCollection,
}

impl MessagesController {
    /// Controller writing to the synchronized Messages collection.
    pub fn new(
        context: AccountContext,
        relationships: Arc<RelationshipsController>,
        messages: SynchronizedCollection,
    ) -> Self {
        Self {
            context,
            relationships,
            messages,
        }
    }

    /// Send `content` to every recipient.
    pub async fn send_message(
        &self,
        recipients: Vec<Address>,
        content: Value,
    ) -> Result<Message, ClientError> {
        if recipients.is_empty() {
            return Err(ClientError::Validation("a message needs a recipient".into()));
        }
        for recipient in &recipients {
            if self
                .relationships
                .get_active_relationship_to_identity(recipient)
                .await?
                .is_none()
            {
                return Err(ClientError::Validation(format!(
                    "no active relationship to {}",
                    recipient
                )));
            }
        }

        let remote = self.context.backbone.send_message(recipients, content).await?;
        let message = message_from_backbone(remote, None);
        self.messages
            .create(message.id.as_str(), to_document(&message)?)
            .await?;

        tracing::info!(
            "Sent message {} to {} recipient(s)",
            message.id,
            message.recipients.len()
        );
        Ok(message)
    }

    /// Fetch a message from the backbone and store it if it is new.
    pub async fn load_peer_message(&self, id: &MessageId) -> Result<Message, ClientError> {
        if let Some(existing) = self.get_message(id).await? {
            return Ok(existing);
        }
        let remote = self.context.backbone.get_message(id).await?;
        let message = message_from_backbone(remote, None);
        self.messages
            .create(id.as_str(), to_document(&message)?)
            .await?;
        tracing::debug!("Received message {} from {}", id, message.created_by);
        Ok(message)
    }

    /// Record that an own message was delivered.
    pub async fn mark_delivered(
        &self,
        id: &MessageId,
        delivered_at: Timestamp,
    ) -> Result<Message, ClientError> {
        let mut message = self.load_peer_message(id).await?;
        if message.delivered_at.is_none() {
            message.delivered_at = Some(delivered_at);
            self.messages
                .update(id.as_str(), to_document(&message)?)
                .await?;
        }
        Ok(message)
    }

    /// A locally stored message.
    pub async fn get_message(&self, id: &MessageId) -> Result<Option<Message>, ClientError> {
        read_as(self.messages.raw().as_ref(), id.as_str()).await
    }

    /// Every locally stored message.
    pub async fn get_messages(&self) -> Result<Vec<Message>, ClientError> {
        list_as(self.messages.raw().as_ref()).await
    }
}

#[async_trait]
impl MessageHandler for MessagesController {
    async fn message_received(&self, message_id: &MessageId) -> Result<Message, ClientError> {
        self.load_peer_message(message_id).await
    }

    async fn message_delivered(
        &self,
        message_id: &MessageId,
        delivered_at: Option<Timestamp>,
    ) -> Result<Message, ClientError> {
        self.mark_delivered(message_id, delivered_at.unwrap_or_else(Timestamp::now))
            .await
    }
}

#[async_trait]
impl CacheHydrator for MessagesController {
    async fn hydrate(&self, ids: &[String]) -> Result<(), ClientError> {
        let raw = self.messages.raw();
        for id in ids {
            let message_id = MessageId::parse(id)?;
            let remote = self.context.backbone.get_message(&message_id).await?;
            let local: Option<Message> = read_as(raw.as_ref(), id).await?;
            let delivered_at = local.as_ref().and_then(|m| m.delivered_at);
            let message = message_from_backbone(remote, delivered_at);
            match local {
                Some(_) => raw.update(id, to_document(&message)?).await?,
                None => raw.create(id, to_document(&message)?).await?,
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessagesController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagesController")
            .field("identity", &self.context.identity.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::testing::{account, related};
    use crate::backbone::MockBackbone;
    use serde_json::json;
    use tether_sync_types::SyncScope;

    #[tokio::test]
    async fn message_requires_an_active_relationship() {
        let backbone = MockBackbone::new();
        let alice = account(&backbone).await;
        let bob = account(&backbone).await;

        let err = alice
            .messages()
            .send_message(vec![bob.identity().address.clone()], json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(backbone.call_count(&alice.identity().address, "send_message"), 0);
    }

    #[tokio::test]
    async fn message_is_received_and_delivery_reported() {
        let backbone = MockBackbone::new();
        let (alice, bob) = related(&backbone).await;

        let sent = alice
            .messages()
            .send_message(vec![bob.identity().address.clone()], json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(!sent.is_delivered());

        let changed = bob.sync(SyncScope::Everything).await.unwrap();
        assert_eq!(changed.messages.len(), 1);
        assert_eq!(changed.messages[0].content, json!({"text": "hi"}));
        assert_eq!(bob.messages().get_messages().await.unwrap().len(), 1);

        let changed = alice.sync(SyncScope::Everything).await.unwrap();
        assert_eq!(changed.messages.len(), 1);
        assert!(changed.messages[0].is_delivered());
        let stored = alice.messages().get_message(&sent.id).await.unwrap().unwrap();
        assert!(stored.is_delivered());
    }

    #[tokio::test]
    async fn received_message_is_stored_once() {
        let backbone = MockBackbone::new();
        let (alice, bob) = related(&backbone).await;
        let sent = alice
            .messages()
            .send_message(vec![bob.identity().address.clone()], json!({}))
            .await
            .unwrap();

        let first = bob.messages().message_received(&sent.id).await.unwrap();
        let second = bob.messages().message_received(&sent.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(bob.messages().get_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_message_fails_with_backbone_code() {
        let backbone = MockBackbone::new();
        let alice = account(&backbone).await;
        let err = alice
            .messages()
            .message_received(&MessageId::generate())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "error.transport.request.notFound");
    }
}
