//! In-memory document collection.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::DocumentCollection;
use crate::error::ClientError;

/// [`DocumentCollection`] backed by an ordered map.
#[derive(Debug)]
pub struct MemoryCollection {
    name: String,
    documents: Mutex<BTreeMap<String, Value>>,
}

impl MemoryCollection {
    /// An empty collection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of documents.
    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    /// Whether the collection is empty.
    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, id: &str) -> Result<Option<Value>, ClientError> {
        Ok(self.documents.lock().await.get(id).cloned())
    }

    async fn create(&self, id: &str, document: Value) -> Result<(), ClientError> {
        let mut documents = self.documents.lock().await;
        if documents.contains_key(id) {
            return Err(ClientError::Storage(format!(
                "document {} already exists in {}",
                id, self.name
            )));
        }
        documents.insert(id.to_string(), document);
        Ok(())
    }

    async fn update(&self, id: &str, document: Value) -> Result<(), ClientError> {
        let mut documents = self.documents.lock().await;
        match documents.get_mut(id) {
            Some(existing) => {
                *existing = document;
                Ok(())
            }
            None => Err(ClientError::RecordNotFound {
                kind: "Document",
                id: format!("{}/{}", self.name, id),
            }),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, ClientError> {
        Ok(self.documents.lock().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<Value>, ClientError> {
        Ok(self.documents.lock().await.values().cloned().collect())
    }
}
