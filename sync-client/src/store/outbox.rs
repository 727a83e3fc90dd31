//! Persisted outbox of unpushed datawallet modifications.

use std::sync::Arc;
use tether_sync_core::{Outbox, QueuedModification};
use tether_sync_types::DatawalletModification;
use tokio::sync::Mutex;

use super::{list_as, to_document, DocumentCollection};
use crate::error::ClientError;

/// [`Outbox`] mirrored into a document collection keyed by local id.
///
/// A record stays persisted until the backbone acknowledged it, so
/// modifications survive a failed push and a restart.
pub struct DatawalletOutbox {
    collection: Arc<dyn DocumentCollection>,
    queue: Mutex<Outbox>,
}

impl DatawalletOutbox {
    /// Restore the outbox from `collection`.
    pub async fn load(collection: Arc<dyn DocumentCollection>) -> Result<Self, ClientError> {
        let records: Vec<QueuedModification> = list_as(collection.as_ref()).await?;
        Ok(Self {
            collection,
            queue: Mutex::new(Outbox::restore(records)),
        })
    }

    /// Queue and persist a modification.
    pub async fn record(&self, modification: DatawalletModification) -> Result<(), ClientError> {
        let mut queue = self.queue.lock().await;
        let record = queue.enqueue(modification);
        self.collection
            .create(record.local_id().as_str(), to_document(&record)?)
            .await
    }

    /// Hand out everything queued for a push.
    pub async fn take_batch(&self) -> Vec<QueuedModification> {
        self.queue.lock().await.take_batch(None)
    }

    /// Forget a batch the backbone accepted.
    pub async fn ack(&self, batch: &[QueuedModification]) -> Result<(), ClientError> {
        let ids: Vec<_> = batch.iter().map(|r| r.local_id().clone()).collect();
        self.queue.lock().await.ack(&ids);
        for id in &ids {
            self.collection.delete(id.as_str()).await?;
        }
        Ok(())
    }

    /// Requeue every handed-out record after a failed push.
    pub async fn nack_all(&self) {
        self.queue.lock().await.nack_all();
    }

    /// Whether nothing is queued or in flight.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Number of queued records.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

impl std::fmt::Debug for DatawalletOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatawalletOutbox")
            .field("collection", &self.collection.name())
            .finish_non_exhaustive()
    }
}
