//! Sync bookkeeping.

use serde_json::{json, Value};
use std::sync::Arc;
use tether_sync_types::{SyncScope, Timestamp};

use super::DocumentCollection;
use crate::error::ClientError;

const LOCAL_INDEX_KEY: &str = "localDatawalletModificationIndex";

fn sync_time_key(scope: SyncScope) -> &'static str {
    match scope {
        SyncScope::Everything => "SyncTime-Everything",
        SyncScope::OnlyDatawallet => "SyncTime-Datawallet",
    }
}

/// Key-value view over the sync info collection.
#[derive(Clone)]
pub struct SyncInfoStore {
    collection: Arc<dyn DocumentCollection>,
}

impl SyncInfoStore {
    /// Wrap `collection`.
    pub fn new(collection: Arc<dyn DocumentCollection>) -> Self {
        Self { collection }
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, ClientError> {
        Ok(self
            .collection
            .read(key)
            .await?
            .and_then(|document| document.get("value").cloned()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ClientError> {
        let document = json!({"id": key, "value": value});
        if self.collection.read(key).await?.is_some() {
            self.collection.update(key, document).await
        } else {
            self.collection.create(key, document).await
        }
    }

    /// Highest modification index applied on this device (0 when none).
    pub async fn local_index(&self) -> Result<u64, ClientError> {
        Ok(self
            .get(LOCAL_INDEX_KEY)
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    /// Store the local modification index.
    pub async fn set_local_index(&self, index: u64) -> Result<(), ClientError> {
        self.set(LOCAL_INDEX_KEY, json!(index)).await
    }

    /// When a run of `scope` last completed.
    pub async fn sync_time(&self, scope: SyncScope) -> Result<Option<Timestamp>, ClientError> {
        Ok(self
            .get(sync_time_key(scope))
            .await?
            .and_then(|v| v.as_u64())
            .map(Timestamp::from_millis))
    }

    /// Record that a run of `scope` completed at `at`.
    pub async fn set_sync_time(&self, scope: SyncScope, at: Timestamp) -> Result<(), ClientError> {
        self.set(sync_time_key(scope), json!(at.as_millis())).await
    }
}

impl std::fmt::Debug for SyncInfoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncInfoStore")
            .field("collection", &self.collection.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCollection;

    fn store() -> SyncInfoStore {
        SyncInfoStore::new(Arc::new(MemoryCollection::new("SyncInfo")))
    }

    #[tokio::test]
    async fn local_index_defaults_to_zero() {
        assert_eq!(store().local_index().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn local_index_is_overwritten() {
        let info = store();
        info.set_local_index(3).await.unwrap();
        info.set_local_index(9).await.unwrap();
        assert_eq!(info.local_index().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn sync_times_are_kept_per_scope() {
        let info = store();
        info.set_sync_time(SyncScope::Everything, Timestamp::from_millis(10))
            .await
            .unwrap();

        assert_eq!(
            info.sync_time(SyncScope::Everything).await.unwrap(),
            Some(Timestamp::from_millis(10))
        );
        assert_eq!(info.sync_time(SyncScope::OnlyDatawallet).await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_match_the_persisted_names() {
        let collection = Arc::new(MemoryCollection::new("SyncInfo"));
        let info = SyncInfoStore::new(collection.clone());
        info.set_local_index(1).await.unwrap();
        info.set_sync_time(SyncScope::OnlyDatawallet, Timestamp::from_millis(1))
            .await
            .unwrap();

        assert!(collection.read("localDatawalletModificationIndex").await.unwrap().is_some());
        assert!(collection.read("SyncTime-Datawallet").await.unwrap().is_some());
    }
}
