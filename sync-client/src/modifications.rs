//! Applying pulled datawallet modifications.
//!
//! A batch is applied in the order fixed by [`ModificationPlan`]:
//! merged creates, updates, deletes, then cache refreshes. Refreshes of
//! different collections run concurrently; relationships are refreshed
//! last because rebuilding their cache reads templates.
//!
//! Every write here goes to the raw collections. Remote modifications
//! must never be recorded into this device's outbox again.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tether_sync_core::{merge_shallow, ModificationPlan};
use tether_sync_types::{Collection, DatawalletModification};

use crate::backbone::Backbone;
use crate::error::ClientError;
use crate::store::{Database, DocumentCollection};

/// Refills the cache of documents from the backbone.
#[async_trait]
pub trait CacheHydrator: Send + Sync {
    /// Refetch and store the cache of every listed document.
    async fn hydrate(&self, ids: &[String]) -> Result<(), ClientError>;
}

/// Hydrator for collections whose cache is stored as fetched.
pub struct BackboneCacheHydrator {
    collection: Collection,
    documents: Arc<dyn DocumentCollection>,
    backbone: Arc<dyn Backbone>,
}

impl BackboneCacheHydrator {
    /// Hydrator for `collection`, writing into `documents`.
    pub fn new(
        collection: Collection,
        documents: Arc<dyn DocumentCollection>,
        backbone: Arc<dyn Backbone>,
    ) -> Self {
        Self {
            collection,
            documents,
            backbone,
        }
    }
}

#[async_trait]
impl CacheHydrator for BackboneCacheHydrator {
    async fn hydrate(&self, ids: &[String]) -> Result<(), ClientError> {
        let objects = self.backbone.get_cached_objects(self.collection, ids).await?;
        for object in objects {
            match self.documents.read(&object.id).await? {
                Some(Value::Object(mut document)) => {
                    document.insert("cache".into(), object.cache);
                    self.documents
                        .update(&object.id, Value::Object(document))
                        .await?;
                }
                Some(_) => {
                    return Err(ClientError::Validation(format!(
                        "{} document {} is not an object",
                        self.collection, object.id
                    )))
                }
                None => {
                    let mut document = Map::new();
                    document.insert("id".into(), Value::String(object.id.clone()));
                    document.insert("cache".into(), object.cache);
                    self.documents
                        .create(&object.id, Value::Object(document))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// Applies batches of decrypted datawallet modifications.
pub struct DatawalletModificationProcessor {
    database: Arc<Database>,
    hydrators: HashMap<Collection, Arc<dyn CacheHydrator>>,
}

impl DatawalletModificationProcessor {
    /// A processor without hydrators.
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            hydrators: HashMap::new(),
        }
    }

    /// Register the hydrator for a collection.
    pub fn register_hydrator(&mut self, collection: Collection, hydrator: Arc<dyn CacheHydrator>) {
        self.hydrators.insert(collection, hydrator);
    }

    fn hydrator(&self, collection: Collection) -> Result<&Arc<dyn CacheHydrator>, ClientError> {
        if !collection.is_cacheable() {
            return Err(ClientError::Validation(format!(
                "collection {} has no cache",
                collection
            )));
        }
        self.hydrators.get(&collection).ok_or_else(|| {
            ClientError::Validation(format!("no cache hydrator for collection {}", collection))
        })
    }

    /// Apply a batch. Applying the same batch twice leaves the same state.
    pub async fn execute(
        &self,
        modifications: Vec<DatawalletModification>,
    ) -> Result<(), ClientError> {
        let plan = ModificationPlan::build(modifications);
        if plan.is_empty() {
            return Ok(());
        }

        // Fail before the first write if a refresh cannot be served.
        for refresh in &plan.cache_refreshes {
            self.hydrator(refresh.collection)?;
        }
        if !plan.relationship_refreshes.is_empty() {
            self.hydrator(Collection::Relationships)?;
        }

        for create in plan.creates {
            let documents = self.database.collection(create.collection);
            let id = create.object_identifier;
            match documents.read(&id).await? {
                Some(Value::Object(mut existing)) => {
                    merge_shallow(&mut existing, &Value::Object(create.payload));
                    documents.update(&id, Value::Object(existing)).await?;
                }
                _ => {
                    documents.delete(&id).await?;
                    documents.create(&id, Value::Object(create.payload)).await?;
                }
            }
        }

        for update in plan.updates {
            let documents = self.database.collection(update.collection);
            let id = &update.object_identifier;
            let mut existing = match documents.read(id).await? {
                Some(Value::Object(existing)) => existing,
                _ => {
                    return Err(ClientError::not_found(
                        update.collection.name(),
                        id,
                    ))
                }
            };
            if let Some(payload) = &update.payload {
                merge_shallow(&mut existing, payload);
            }
            documents.update(id, Value::Object(existing)).await?;
        }

        for delete in plan.deletes {
            self.database
                .collection(delete.collection)
                .delete(&delete.object_identifier)
                .await?;
        }

        let refreshes = plan
            .cache_refreshes
            .iter()
            .map(|refresh| -> Result<_, ClientError> {
                Ok(self
                    .hydrator(refresh.collection)?
                    .hydrate(&refresh.object_identifiers))
            })
            .collect::<Result<Vec<_>, _>>()?;
        try_join_all(refreshes).await?;

        if !plan.relationship_refreshes.is_empty() {
            self.hydrator(Collection::Relationships)?
                .hydrate(&plan.relationship_refreshes)
                .await?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for DatawalletModificationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatawalletModificationProcessor")
            .field("hydrators", &self.hydrators.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::{MockBackbone, MockBackboneSession};
    use serde_json::json;
    use std::sync::Mutex;
    use tether_sync_types::{Address, DeviceId, ModificationType, PayloadCategory};

    /// Records the order in which collections were hydrated.
    #[derive(Clone, Default)]
    struct RecordingHydrator {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, Vec<String>)>>>,
    }

    #[async_trait]
    impl CacheHydrator for RecordingHydrator {
        async fn hydrate(&self, ids: &[String]) -> Result<(), ClientError> {
            tokio::task::yield_now().await;
            self.log.lock().unwrap().push((self.name, ids.to_vec()));
            Ok(())
        }
    }

    fn modification(
        id: &str,
        collection: Collection,
        modification_type: ModificationType,
        payload: Option<Value>,
    ) -> DatawalletModification {
        let category = payload.as_ref().map(|_| PayloadCategory::Technical);
        DatawalletModification::new(id, collection, modification_type, category, payload)
    }

    fn owner_session(backbone: &MockBackbone) -> Arc<MockBackboneSession> {
        let owner = Address::parse("id1owner").unwrap();
        Arc::new(backbone.session(owner, DeviceId::generate()))
    }

    fn create(id: &str, collection: Collection, payload: Value) -> DatawalletModification {
        modification(id, collection, ModificationType::Create, Some(payload))
    }

    fn update(id: &str, collection: Collection, payload: Value) -> DatawalletModification {
        modification(id, collection, ModificationType::Update, Some(payload))
    }

    fn delete(id: &str, collection: Collection) -> DatawalletModification {
        modification(id, collection, ModificationType::Delete, None)
    }

    fn cache_changed(id: &str, collection: Collection) -> DatawalletModification {
        modification(id, collection, ModificationType::CacheChanged, None)
    }

    fn processor_with_log() -> (
        DatawalletModificationProcessor,
        Arc<Database>,
        Arc<Mutex<Vec<(&'static str, Vec<String>)>>>,
    ) {
        let database = Arc::new(Database::in_memory());
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut processor = DatawalletModificationProcessor::new(database.clone());
        for (collection, name) in [
            (Collection::Files, "files"),
            (Collection::Templates, "templates"),
            (Collection::Relationships, "relationships"),
        ] {
            processor.register_hydrator(
                collection,
                Arc::new(RecordingHydrator {
                    name,
                    log: log.clone(),
                }),
            );
        }
        (processor, database, log)
    }

    // ===========================================
    // Document phases
    // ===========================================

    #[tokio::test]
    async fn creates_are_merged_then_updated_then_deleted() {
        let (processor, database, _) = processor_with_log();
        processor
            .execute(vec![
                create("F1", Collection::Files, json!({"id": "F1", "a": 1})),
                update("F1", Collection::Files, json!({"a": 2})),
                create("F1", Collection::Files, json!({"b": 1})),
                create("F2", Collection::Files, json!({"id": "F2"})),
                delete("F2", Collection::Files),
            ])
            .await
            .unwrap();

        let files = database.collection(Collection::Files);
        assert_eq!(
            files.read("F1").await.unwrap(),
            Some(json!({"id": "F1", "a": 2, "b": 1}))
        );
        assert_eq!(files.read("F2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn applying_a_batch_twice_is_idempotent() {
        let (processor, database, _) = processor_with_log();
        let batch = vec![
            create("T1", Collection::Tokens, json!({"id": "T1", "v": 1})),
            update("T1", Collection::Tokens, json!({"v": 2})),
            delete("T2", Collection::Tokens),
        ];

        processor.execute(batch.clone()).await.unwrap();
        let first = database.collection(Collection::Tokens).list().await.unwrap();
        processor.execute(batch).await.unwrap();
        let second = database.collection(Collection::Tokens).list().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second, vec![json!({"id": "T1", "v": 2})]);
    }

    #[tokio::test]
    async fn create_keeps_an_existing_cache() {
        let (processor, database, _) = processor_with_log();
        let files = database.collection(Collection::Files);
        files
            .create("F1", json!({"id": "F1", "cache": {"size": 1}}))
            .await
            .unwrap();

        processor
            .execute(vec![create("F1", Collection::Files, json!({"id": "F1", "title": "x"}))])
            .await
            .unwrap();

        assert_eq!(
            files.read("F1").await.unwrap(),
            Some(json!({"id": "F1", "title": "x", "cache": {"size": 1}}))
        );
    }

    #[tokio::test]
    async fn update_of_missing_document_fails() {
        let (processor, _, _) = processor_with_log();
        let err = processor
            .execute(vec![update("nope", Collection::Files, json!({"a": 1}))])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RecordNotFound { .. }));
    }

    // ===========================================
    // Cache refreshes
    // ===========================================

    #[tokio::test]
    async fn relationships_are_hydrated_last() {
        let (processor, _, log) = processor_with_log();
        processor
            .execute(vec![
                cache_changed("R1", Collection::Relationships),
                cache_changed("F1", Collection::Files),
                cache_changed("T1", Collection::Templates),
                cache_changed("F1", Collection::Files),
            ])
            .await
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2], ("relationships", vec!["R1".to_string()]));
        assert!(log.contains(&("files", vec!["F1".to_string()])));
    }

    #[tokio::test]
    async fn missing_hydrator_fails_before_any_write() {
        let (processor, database, _) = processor_with_log();
        let err = processor
            .execute(vec![
                create("M1", Collection::Messages, json!({"id": "M1"})),
                cache_changed("M1", Collection::Messages),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Validation(_)));
        assert!(database
            .collection(Collection::Messages)
            .read("M1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cache_change_on_devices_is_rejected() {
        let (processor, _, _) = processor_with_log();
        let err = processor
            .execute(vec![cache_changed("D1", Collection::Devices)])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
    }

    #[tokio::test]
    async fn backbone_hydrator_stores_fetched_cache() {
        let backbone = MockBackbone::new();
        backbone.put_cached_object(Collection::Files, "F1", json!({"size": 42}));
        let session = owner_session(&backbone);
        let database = Database::in_memory();
        let files = database.collection(Collection::Files);
        files.create("F1", json!({"id": "F1", "title": "x"})).await.unwrap();

        let hydrator = BackboneCacheHydrator::new(Collection::Files, files.clone(), session);
        hydrator.hydrate(&["F1".to_string()]).await.unwrap();

        assert_eq!(
            files.read("F1").await.unwrap(),
            Some(json!({"id": "F1", "title": "x", "cache": {"size": 42}}))
        );
    }

    #[tokio::test]
    async fn backbone_hydrator_fails_for_unknown_objects() {
        let backbone = MockBackbone::new();
        let session = owner_session(&backbone);
        let database = Database::in_memory();
        let hydrator = BackboneCacheHydrator::new(
            Collection::Tokens,
            database.collection(Collection::Tokens),
            session,
        );

        let err = hydrator.hydrate(&["T1".to_string()]).await.unwrap_err();
        assert_eq!(err.code(), "error.transport.request.notFound");
    }
}
