//! Local document storage.
//!
//! Every datawallet collection is a [`DocumentCollection`] of JSON documents
//! addressed by id. [`Database`] hands out one collection per
//! [`Collection`] plus the two bookkeeping collections the sync engine
//! needs (sync info and the outbox).
//!
//! Writes made by the account itself go through a [`SynchronizedCollection`],
//! which records a datawallet modification for every change. Writes that
//! apply remote modifications go to the raw collection, so they are never
//! echoed back to the backbone.

mod memory;
mod outbox;
mod sync_info;
mod synchronized;

pub use memory::MemoryCollection;
pub use outbox::DatawalletOutbox;
pub use sync_info::SyncInfoStore;
pub use synchronized::SynchronizedCollection;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tether_sync_types::Collection;

use crate::error::ClientError;

/// A collection of JSON documents addressed by id.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Read a document.
    async fn read(&self, id: &str) -> Result<Option<Value>, ClientError>;

    /// Store a new document. Fails if the id is taken.
    async fn create(&self, id: &str, document: Value) -> Result<(), ClientError>;

    /// Replace an existing document. Fails if the id is unknown.
    async fn update(&self, id: &str, document: Value) -> Result<(), ClientError>;

    /// Remove a document. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, ClientError>;

    /// All documents, ordered by id.
    async fn list(&self) -> Result<Vec<Value>, ClientError>;
}

/// Read a document and deserialize it.
pub async fn read_as<T: DeserializeOwned>(
    collection: &dyn DocumentCollection,
    id: &str,
) -> Result<Option<T>, ClientError> {
    match collection.read(id).await? {
        Some(document) => Ok(Some(serde_json::from_value(document)?)),
        None => Ok(None),
    }
}

/// Deserialize every document of a collection.
pub async fn list_as<T: DeserializeOwned>(
    collection: &dyn DocumentCollection,
) -> Result<Vec<T>, ClientError> {
    collection
        .list()
        .await?
        .into_iter()
        .map(|document| serde_json::from_value(document).map_err(ClientError::from))
        .collect()
}

/// Serialize a value into a document.
pub fn to_document<T: Serialize>(value: &T) -> Result<Value, ClientError> {
    Ok(serde_json::to_value(value)?)
}

/// The account's local database.
pub struct Database {
    collections: HashMap<Collection, Arc<dyn DocumentCollection>>,
    sync_info: Arc<dyn DocumentCollection>,
    outbox: Arc<dyn DocumentCollection>,
}

impl Database {
    /// A database held entirely in memory.
    pub fn in_memory() -> Self {
        let collections = Collection::ALL
            .into_iter()
            .map(|c| {
                let collection: Arc<dyn DocumentCollection> =
                    Arc::new(MemoryCollection::new(c.name()));
                (c, collection)
            })
            .collect();
        Self {
            collections,
            sync_info: Arc::new(MemoryCollection::new("SyncInfo")),
            outbox: Arc::new(MemoryCollection::new("DatawalletModifications")),
        }
    }

    /// Build a database from existing collections.
    pub fn from_collections(
        collections: HashMap<Collection, Arc<dyn DocumentCollection>>,
        sync_info: Arc<dyn DocumentCollection>,
        outbox: Arc<dyn DocumentCollection>,
    ) -> Result<Self, ClientError> {
        if let Some(missing) = Collection::ALL
            .into_iter()
            .find(|c| !collections.contains_key(c))
        {
            return Err(ClientError::Storage(format!(
                "no store for collection {}",
                missing
            )));
        }
        Ok(Self {
            collections,
            sync_info,
            outbox,
        })
    }

    /// Raw collection for `collection`.
    pub fn collection(&self, collection: Collection) -> Arc<dyn DocumentCollection> {
        // Every collection is present, see the constructors.
        self.collections[&collection].clone()
    }

    /// Collection holding sync bookkeeping.
    pub fn sync_info(&self) -> Arc<dyn DocumentCollection> {
        self.sync_info.clone()
    }

    /// Collection holding unpushed modifications.
    pub fn outbox(&self) -> Arc<dyn DocumentCollection> {
        self.outbox.clone()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("collections", &self.collections.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        text: String,
    }

    #[tokio::test]
    async fn in_memory_database_has_every_collection() {
        let database = Database::in_memory();
        for collection in Collection::ALL {
            assert_eq!(database.collection(collection).name(), collection.name());
        }
        assert_eq!(database.sync_info().name(), "SyncInfo");
    }

    #[tokio::test]
    async fn collections_are_shared_handles() {
        let database = Database::in_memory();
        database
            .collection(Collection::Files)
            .create("F1", json!({"id": "F1"}))
            .await
            .unwrap();
        assert!(database
            .collection(Collection::Files)
            .read("F1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn typed_helpers_roundtrip() {
        let collection = MemoryCollection::new("Notes");
        let note = Note {
            id: "N1".into(),
            text: "hello".into(),
        };
        collection
            .create("N1", to_document(&note).unwrap())
            .await
            .unwrap();

        let read: Option<Note> = read_as(&collection, "N1").await.unwrap();
        assert_eq!(read, Some(note));
        let all: Vec<Note> = list_as(&collection).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn from_collections_requires_all_collections() {
        let err = Database::from_collections(
            HashMap::new(),
            Arc::new(MemoryCollection::new("SyncInfo")),
            Arc::new(MemoryCollection::new("Outbox")),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::Storage(_)));
    }
}
