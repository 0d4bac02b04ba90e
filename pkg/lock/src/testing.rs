use async_trait::async_trait;
use pkg_state::{DocumentStore, MemoryDocumentStore, StoreError, UpsertResult};
use pkg_types::lock::{AcquireScript, LockDocument, OwnerFilter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Memory store that can be told to fail, report conflicts or stall
/// upserts, and counts upsert attempts.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryDocumentStore,
    failing: AtomicBool,
    conflicting: AtomicBool,
    fenced: AtomicBool,
    upserts: AtomicUsize,
    upsert_delay_ms: AtomicU64,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_conflicting(&self, conflicting: bool) {
        self.conflicting.store(conflicting, Ordering::SeqCst);
    }

    pub fn set_fenced(&self, fenced: bool) {
        self.fenced.store(fenced, Ordering::SeqCst);
    }

    /// Hold every later upsert for `delay` before it reaches the store.
    pub fn set_upsert_delay(&self, delay: Duration) {
        self.upsert_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn check(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        if self.fenced.load(Ordering::SeqCst) {
            return Err(StoreError::Fenced("detected newer DB client".to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection refused".to_string()));
        }
        if self.conflicting.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn conditional_upsert(
        &self,
        collection: &str,
        id: &str,
        script: &AcquireScript,
    ) -> Result<UpsertResult, StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let delay = self.upsert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check(collection, id)?;
        self.inner.conditional_upsert(collection, id, script).await
    }

    async fn conditional_delete(
        &self,
        collection: &str,
        filter: &OwnerFilter,
    ) -> Result<u64, StoreError> {
        self.check(collection, &filter.id)?;
        self.inner.conditional_delete(collection, filter).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<LockDocument>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, LockDocument)>, StoreError> {
        self.inner.list(collection).await
    }
}
