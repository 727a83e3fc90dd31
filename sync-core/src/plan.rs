//! Batch planning for datawallet modifications.
//!
//! A pulled batch is applied in four phases: creates, updates, deletes and
//! finally cache refreshes. [`ModificationPlan::build`] sorts a batch into
//! those phases without touching any store, so the ordering rules can be
//! tested without I/O:
//!
//! - creates for the same object are merged into one document
//! - updates and deletes keep their batch order
//! - cache refreshes are grouped per collection, relationships last

use serde_json::{Map, Value};
use tether_sync_types::{Collection, DatawalletModification, ModificationType};

/// One document to create, assembled from every create record for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCreate {
    /// Target collection
    pub collection: Collection,
    /// Document id
    pub object_identifier: String,
    /// Merged fields
    pub payload: Map<String, Value>,
}

/// Cache refreshes for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRefresh {
    /// Target collection
    pub collection: Collection,
    /// Documents whose cache changed, without duplicates
    pub object_identifiers: Vec<String>,
}

/// A batch of modifications sorted into application phases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModificationPlan {
    /// Documents to create, in first-seen order
    pub creates: Vec<MergedCreate>,
    /// Updates, in batch order
    pub updates: Vec<DatawalletModification>,
    /// Deletes, in batch order
    pub deletes: Vec<DatawalletModification>,
    /// Cache refreshes of every collection except relationships
    pub cache_refreshes: Vec<CacheRefresh>,
    /// Relationship cache refreshes, run after all others
    pub relationship_refreshes: Vec<String>,
}

impl ModificationPlan {
    /// Sort a batch into phases.
    pub fn build(modifications: impl IntoIterator<Item = DatawalletModification>) -> Self {
        let mut plan = Self::default();

        for modification in modifications {
            match modification.modification_type {
                ModificationType::Create => plan.add_create(modification),
                ModificationType::Update => plan.updates.push(modification),
                ModificationType::Delete => plan.deletes.push(modification),
                ModificationType::CacheChanged => plan.add_cache_refresh(modification),
            }
        }

        plan
    }

    /// Whether the batch contained nothing.
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.cache_refreshes.is_empty()
            && self.relationship_refreshes.is_empty()
    }

    fn add_create(&mut self, modification: DatawalletModification) {
        let position = self.creates.iter().position(|c| {
            c.collection == modification.collection
                && c.object_identifier == modification.object_identifier
        });

        let index = match position {
            Some(index) => index,
            None => {
                self.creates.push(MergedCreate {
                    collection: modification.collection,
                    object_identifier: modification.object_identifier.clone(),
                    payload: Map::new(),
                });
                self.creates.len() - 1
            }
        };

        if let Some(payload) = &modification.payload {
            merge_shallow(&mut self.creates[index].payload, payload);
        }
    }

    fn add_cache_refresh(&mut self, modification: DatawalletModification) {
        let id = modification.object_identifier;

        if modification.collection == Collection::Relationships {
            if !self.relationship_refreshes.contains(&id) {
                self.relationship_refreshes.push(id);
            }
            return;
        }

        match self
            .cache_refreshes
            .iter_mut()
            .find(|r| r.collection == modification.collection)
        {
            Some(refresh) => {
                if !refresh.object_identifiers.contains(&id) {
                    refresh.object_identifiers.push(id);
                }
            }
            None => self.cache_refreshes.push(CacheRefresh {
                collection: modification.collection,
                object_identifiers: vec![id],
            }),
        }
    }
}

/// Copy the top-level fields of `source` onto `target`.
///
/// Later values replace earlier ones. A non-object `source` contributes
/// nothing.
pub fn merge_shallow(target: &mut Map<String, Value>, source: &Value) {
    if let Value::Object(fields) = source {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}
