use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pkg_types::lock::{AcquireScript, LockDocument, OwnerFilter};
use tracing::debug;

use crate::store::{DocumentStore, StoreError, UpsertResult};

/// In-memory document store keyed by `(collection, id)`.
///
/// Atomicity comes from the shard lock DashMap holds for the lifetime of an
/// entry, so evaluate-and-write cannot interleave with another writer on the
/// same key.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: DashMap<(String, String), LockDocument>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents across all collections.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn conditional_upsert(
        &self,
        collection: &str,
        id: &str,
        script: &AcquireScript,
    ) -> Result<UpsertResult, StoreError> {
        let key = (collection.to_string(), id.to_string());
        let result = match self.docs.entry(key) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().clone();
                let result = UpsertResult::from_decision(script.evaluate(Some(&current)), Some(current));
                if result.outcome.is_write()
                    && let Some(doc) = &result.document
                {
                    entry.insert(doc.clone());
                }
                result
            }
            Entry::Vacant(entry) => {
                let result = UpsertResult::from_decision(script.evaluate(None), None);
                if let Some(doc) = &result.document {
                    entry.insert(doc.clone());
                }
                result
            }
        };
        debug!(
            "upsert {}/{} by {}: {:?}",
            collection, id, script.owner, result.outcome
        );
        Ok(result)
    }

    async fn conditional_delete(
        &self,
        collection: &str,
        filter: &OwnerFilter,
    ) -> Result<u64, StoreError> {
        let key = (collection.to_string(), filter.id.clone());
        let removed = self
            .docs
            .remove_if(&key, |(_, id), doc| filter.matches(id, doc))
            .is_some();
        debug!(
            "delete {}/{} by {}: removed={}",
            collection, filter.id, filter.owner, removed
        );
        Ok(u64::from(removed))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<LockDocument>, StoreError> {
        let key = (collection.to_string(), id.to_string());
        Ok(self.docs.get(&key).map(|doc| doc.value().clone()))
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, LockDocument)>, StoreError> {
        let mut docs: Vec<(String, LockDocument)> = self
            .docs
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(docs)
    }
}
