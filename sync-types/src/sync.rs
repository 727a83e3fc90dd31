//! Sync scopes and sync results.

use serde::{Deserialize, Serialize};

use crate::{Message, Relationship};

/// What a sync run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncScope {
    /// Datawallet modifications and external events
    Everything,
    /// Datawallet modifications only
    OnlyDatawallet,
}

impl SyncScope {
    /// Whether a run of this scope does everything a run of `other` would.
    pub fn covers(&self, other: SyncScope) -> bool {
        match self {
            Self::Everything => true,
            Self::OnlyDatawallet => other == Self::OnlyDatawallet,
        }
    }
}

/// Domain objects changed by a sync run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangedItems {
    /// Created or updated relationships
    pub relationships: Vec<Relationship>,
    /// Received or updated messages
    pub messages: Vec<Message>,
}

impl ChangedItems {
    /// No changes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty() && self.messages.is_empty()
    }

    /// Record a changed relationship, replacing an older version of it.
    pub fn add_relationship(&mut self, relationship: Relationship) {
        self.relationships.retain(|r| r.id != relationship.id);
        self.relationships.push(relationship);
    }

    /// Record a changed message, replacing an older version of it.
    pub fn add_message(&mut self, message: Message) {
        self.messages.retain(|m| m.id != message.id);
        self.messages.push(message);
    }

    /// Fold another set of changes into this one. Later versions win.
    pub fn merge(&mut self, other: ChangedItems) {
        for relationship in other.relationships {
            self.add_relationship(relationship);
        }
        for message in other.messages {
            self.add_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, DeviceId, MessageId, Timestamp};

    fn message(id: &MessageId, delivered: bool) -> Message {
        Message {
            id: id.clone(),
            created_by: Address::parse("id1sender").unwrap(),
            created_by_device: DeviceId::generate(),
            recipients: vec![],
            created_at: Timestamp::from_millis(1),
            delivered_at: delivered.then(|| Timestamp::from_millis(2)),
            content: serde_json::Value::Null,
        }
    }

    #[test]
    fn everything_covers_both() {
        assert!(SyncScope::Everything.covers(SyncScope::Everything));
        assert!(SyncScope::Everything.covers(SyncScope::OnlyDatawallet));
    }

    #[test]
    fn datawallet_covers_only_itself() {
        assert!(SyncScope::OnlyDatawallet.covers(SyncScope::OnlyDatawallet));
        assert!(!SyncScope::OnlyDatawallet.covers(SyncScope::Everything));
    }

    #[test]
    fn merge_keeps_latest_version() {
        let id = MessageId::generate();
        let mut items = ChangedItems::new();
        items.add_message(message(&id, false));

        let mut later = ChangedItems::new();
        later.add_message(message(&id, true));
        items.merge(later);

        assert_eq!(items.messages.len(), 1);
        assert!(items.messages[0].is_delivered());
    }

    #[test]
    fn empty_by_default() {
        assert!(ChangedItems::default().is_empty());
    }
}
