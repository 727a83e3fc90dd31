//! Messages exchanged between related identities.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Address, DeviceId, MessageId, Timestamp};

/// A message as stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message id
    pub id: MessageId,
    /// Sender address
    pub created_by: Address,
    /// Sender device
    pub created_by_device: DeviceId,
    /// Recipient addresses
    pub recipients: Vec<Address>,
    /// Send time
    pub created_at: Timestamp,
    /// Delivery time, once the backbone confirmed delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<Timestamp>,
    /// Opaque content
    pub content: Value,
}

impl Message {
    /// Whether the backbone confirmed delivery.
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}
