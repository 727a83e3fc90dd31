//! Collection wrapper that records datawallet modifications.

use serde_json::{Map, Value};
use std::sync::Arc;
use tether_sync_types::{Collection, DatawalletModification, ModificationType, PayloadCategory};

use super::{DatawalletOutbox, DocumentCollection};
use crate::error::ClientError;

const CACHE_FIELD: &str = "cache";

fn split_cache(document: &Value) -> (Value, Option<Value>) {
    match document {
        Value::Object(fields) => {
            let mut without_cache: Map<String, Value> = fields.clone();
            let cache = without_cache.remove(CACHE_FIELD).filter(|c| !c.is_null());
            (Value::Object(without_cache), cache)
        }
        other => (other.clone(), None),
    }
}

/// A collection whose writes are mirrored into the datawallet outbox.
///
/// The cache part of a document is never uploaded. A changed cache is
/// announced with a `CacheChanged` record and every device refetches it
/// from the backbone.
#[derive(Clone)]
pub struct SynchronizedCollection {
    collection: Collection,
    inner: Arc<dyn DocumentCollection>,
    outbox: Arc<DatawalletOutbox>,
}

impl SynchronizedCollection {
    /// Wrap the raw collection for `collection`.
    pub fn new(
        collection: Collection,
        inner: Arc<dyn DocumentCollection>,
        outbox: Arc<DatawalletOutbox>,
    ) -> Self {
        Self {
            collection,
            inner,
            outbox,
        }
    }

    /// The wrapped collection, for reads and unrecorded writes.
    pub fn raw(&self) -> &Arc<dyn DocumentCollection> {
        &self.inner
    }

    async fn record(
        &self,
        id: &str,
        modification_type: ModificationType,
        payload_category: Option<PayloadCategory>,
        payload: Option<Value>,
    ) -> Result<(), ClientError> {
        self.outbox
            .record(DatawalletModification::new(
                id,
                self.collection,
                modification_type,
                payload_category,
                payload,
            ))
            .await
    }

    /// Read a document.
    pub async fn read(&self, id: &str) -> Result<Option<Value>, ClientError> {
        self.inner.read(id).await
    }

    /// Create a document and record it.
    pub async fn create(&self, id: &str, document: Value) -> Result<(), ClientError> {
        let (fields, cache) = split_cache(&document);
        self.inner.create(id, document).await?;

        self.record(
            id,
            ModificationType::Create,
            Some(PayloadCategory::Technical),
            Some(fields),
        )
        .await?;
        if cache.is_some() {
            self.record(id, ModificationType::CacheChanged, None, None)
                .await?;
        }
        Ok(())
    }

    /// Replace a document and record what changed.
    pub async fn update(&self, id: &str, document: Value) -> Result<(), ClientError> {
        let previous = self.inner.read(id).await?.ok_or_else(|| {
            ClientError::not_found("Document", format!("{}/{}", self.collection, id))
        })?;
        let (old_fields, old_cache) = split_cache(&previous);
        let (new_fields, new_cache) = split_cache(&document);
        self.inner.update(id, document).await?;

        if old_fields != new_fields {
            self.record(
                id,
                ModificationType::Update,
                Some(PayloadCategory::Userdata),
                Some(new_fields),
            )
            .await?;
        }
        if new_cache.is_some() && old_cache != new_cache {
            self.record(id, ModificationType::CacheChanged, None, None)
                .await?;
        }
        Ok(())
    }

    /// Delete a document and record it if it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, ClientError> {
        let existed = self.inner.delete(id).await?;
        if existed {
            self.record(id, ModificationType::Delete, None, None).await?;
        }
        Ok(existed)
    }
}

impl std::fmt::Debug for SynchronizedCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizedCollection")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCollection;
    use serde_json::json;

    async fn synchronized() -> (SynchronizedCollection, Arc<DatawalletOutbox>) {
        let outbox = Arc::new(
            DatawalletOutbox::load(Arc::new(MemoryCollection::new("Outbox")))
                .await
                .unwrap(),
        );
        let collection = SynchronizedCollection::new(
            Collection::Files,
            Arc::new(MemoryCollection::new("Files")),
            outbox.clone(),
        );
        (collection, outbox)
    }

    fn kinds(batch: &[tether_sync_core::QueuedModification]) -> Vec<ModificationType> {
        batch
            .iter()
            .map(|r| r.modification.modification_type)
            .collect()
    }

    // ===========================================
    // Create
    // ===========================================

    #[tokio::test]
    async fn create_records_payload_without_cache() {
        let (files, outbox) = synchronized().await;
        files
            .create("F1", json!({"id": "F1", "title": "a", "cache": {"size": 3}}))
            .await
            .unwrap();

        let batch = outbox.take_batch().await;
        assert_eq!(
            kinds(&batch),
            vec![ModificationType::Create, ModificationType::CacheChanged]
        );
        assert_eq!(
            batch[0].modification.payload,
            Some(json!({"id": "F1", "title": "a"}))
        );
        assert_eq!(batch[1].modification.payload, None);
    }

    #[tokio::test]
    async fn create_without_cache_records_only_create() {
        let (files, outbox) = synchronized().await;
        files.create("F1", json!({"id": "F1"})).await.unwrap();
        assert_eq!(kinds(&outbox.take_batch().await), vec![ModificationType::Create]);
    }

    // ===========================================
    // Update and delete
    // ===========================================

    #[tokio::test]
    async fn update_records_only_what_changed() {
        let (files, outbox) = synchronized().await;
        files
            .create("F1", json!({"id": "F1", "title": "a", "cache": {"v": 1}}))
            .await
            .unwrap();
        let created = outbox.take_batch().await;
        outbox.ack(&created).await.unwrap();

        files
            .update("F1", json!({"id": "F1", "title": "a", "cache": {"v": 2}}))
            .await
            .unwrap();
        let batch = outbox.take_batch().await;
        assert_eq!(kinds(&batch), vec![ModificationType::CacheChanged]);
        outbox.ack(&batch).await.unwrap();

        files
            .update("F1", json!({"id": "F1", "title": "b", "cache": {"v": 2}}))
            .await
            .unwrap();
        let batch = outbox.take_batch().await;
        assert_eq!(kinds(&batch), vec![ModificationType::Update]);
        assert_eq!(
            batch[0].modification.payload,
            Some(json!({"id": "F1", "title": "b"}))
        );
    }

    #[tokio::test]
    async fn update_of_unknown_document_fails() {
        let (files, outbox) = synchronized().await;
        assert!(matches!(
            files.update("F1", json!({})).await,
            Err(ClientError::RecordNotFound { .. })
        ));
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn delete_records_only_existing_documents() {
        let (files, outbox) = synchronized().await;
        assert!(!files.delete("F1").await.unwrap());
        assert!(outbox.is_empty().await);

        files.create("F1", json!({"id": "F1"})).await.unwrap();
        assert!(files.delete("F1").await.unwrap());
        assert_eq!(
            kinds(&outbox.take_batch().await),
            vec![ModificationType::Create, ModificationType::Delete]
        );
    }
}
