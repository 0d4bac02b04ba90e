use chrono::{DateTime, Utc};
use pkg_constants::lock::DEFAULT_COLLECTION;
use pkg_state::{DocumentStore, StoreError, UpsertOutcome};
use pkg_types::lock::{AcquireScript, LockDocument, OwnerFilter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::LockError;
use crate::keepalive::RenewalTask;
use crate::state::LockState;

/// A named lease on a shared document store.
///
/// Cloning is cheap; clones share the same local state and renewal chain.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

struct LockInner {
    store: Arc<dyn DocumentStore>,
    id: String,
    state: Mutex<LockState>,
    /// Serializes store submissions so two calls from this process never
    /// send conflicting intents for the same lock.
    submit: tokio::sync::Mutex<()>,
}

impl Lock {
    /// Create a lock `id` held on behalf of `owner`, in the default collection.
    pub fn new(store: Arc<dyn DocumentStore>, id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                store,
                id: id.into(),
                state: Mutex::new(LockState::new(owner.into(), DEFAULT_COLLECTION.to_string())),
                submit: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Override the owner. Meant for use before the first acquire.
    pub fn with_owner(self, owner: impl Into<String>) -> Self {
        self.state().owner = owner.into();
        self
    }

    /// Override the collection the lock document lives in.
    pub fn with_collection(self, collection: impl Into<String>) -> Self {
        self.state().collection = collection.into();
        self
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, LockState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn owner(&self) -> String {
        self.state().owner.clone()
    }

    pub fn collection(&self) -> String {
        self.state().collection.clone()
    }

    /// When ownership last changed hands, as far as this instance knows.
    pub fn acquired_at(&self) -> Option<DateTime<Utc>> {
        self.state().acquired
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.state().expires
    }

    /// TTL of the most recent successful acquire.
    pub fn last_ttl(&self) -> Duration {
        self.state().last_ttl
    }

    pub fn keep_alive_active(&self) -> bool {
        self.state().renewal.is_some()
    }

    /// Acquired and not expired. Answered from local state only.
    pub fn is_acquired(&self) -> bool {
        self.state().is_acquired_at(Utc::now())
    }

    /// Released manually or expired. Answered from local state only.
    pub fn is_released(&self) -> bool {
        self.state().is_released_at(Utc::now())
    }

    /// Try to acquire (or renew) the lease for `ttl`.
    ///
    /// Succeeds when the document is missing, already ours, or held by
    /// someone whose lease has expired. Fails with
    /// [`LockError::HeldByOther`] while another owner's lease is live.
    pub async fn acquire(&self, ttl: Duration) -> Result<(), LockError> {
        let _submit = self.inner.submit.lock().await;
        self.submit_acquire(ttl).await
    }

    /// Renewal entry point for the keep-alive chain. Returns `Ok(false)`
    /// without touching the store when the lock was released meanwhile.
    pub(crate) async fn renew(&self) -> Result<bool, LockError> {
        let _submit = self.inner.submit.lock().await;
        let ttl = {
            let state = self.state();
            if state.is_released {
                return Ok(false);
            }
            state.last_ttl
        };
        self.submit_acquire(ttl).await.map(|()| true)
    }

    async fn submit_acquire(&self, ttl: Duration) -> Result<(), LockError> {
        let (collection, script) = {
            let state = self.state();
            (
                state.collection.clone(),
                AcquireScript::new(state.owner.clone(), Utc::now(), ttl),
            )
        };

        let result = match self
            .inner
            .store
            .conditional_upsert(&collection, &self.inner.id, &script)
            .await
        {
            Ok(result) => result,
            Err(StoreError::Conflict { .. }) => {
                debug!("Write conflict acquiring lock {}", self.inner.id);
                return Err(self.held_by_other());
            }
            Err(e) => return Err(e.into()),
        };

        if result.outcome == UpsertOutcome::Noop {
            debug!(
                "Lock {} held by {}",
                self.inner.id,
                result.document.as_ref().map_or("?", |doc| doc.owner.as_str())
            );
            return Err(self.held_by_other());
        }

        let doc = result.document.unwrap_or_else(|| LockDocument {
            owner: script.owner.clone(),
            acquired: script.acquired,
            expires: script.expires,
        });
        self.state().commit_acquire(ttl, &doc);

        match result.outcome {
            UpsertOutcome::Renewed => debug!(
                "Lock {} renewed by {} until {}",
                self.inner.id, doc.owner, doc.expires
            ),
            UpsertOutcome::TakenOver => info!(
                "Lock {} taken over by {} (expired lease)",
                self.inner.id, doc.owner
            ),
            _ => info!("Lock {} acquired by {}", self.inner.id, doc.owner),
        }
        Ok(())
    }

    fn held_by_other(&self) -> LockError {
        LockError::HeldByOther {
            id: self.inner.id.clone(),
        }
    }

    /// Release the lock if this owner still holds it. Releasing a lock that
    /// is gone, taken over, or already released is not an error.
    pub async fn release(&self) -> Result<(), LockError> {
        self.release_inner(false).await
    }

    /// Like [`release`](Self::release), but fails with
    /// [`LockError::AlreadyReleased`] unless a held lock was actually removed.
    pub async fn must_release(&self) -> Result<(), LockError> {
        self.release_inner(true).await
    }

    async fn release_inner(&self, strict: bool) -> Result<(), LockError> {
        let _submit = self.inner.submit.lock().await;
        let (collection, filter) = {
            let state = self.state();
            if state.is_released {
                return if strict {
                    Err(self.already_released())
                } else {
                    Ok(())
                };
            }
            (
                state.collection.clone(),
                OwnerFilter::new(self.inner.id.clone(), state.owner.clone()),
            )
        };

        let deleted = match self.inner.store.conditional_delete(&collection, &filter).await {
            Ok(n) => n,
            // Someone else rewrote the document mid-delete, so it is not ours
            Err(StoreError::Conflict { .. }) => 0,
            Err(e) => return Err(e.into()),
        };
        self.state().mark_released();

        if deleted == 0 {
            if strict {
                warn!(
                    "Lock {} was not held by {} at release",
                    self.inner.id, filter.owner
                );
                return Err(self.already_released());
            }
            debug!("Lock {} had nothing to release", self.inner.id);
            return Ok(());
        }
        info!("Lock {} released by {}", self.inner.id, filter.owner);
        Ok(())
    }

    fn already_released(&self) -> LockError {
        LockError::AlreadyReleased {
            id: self.inner.id.clone(),
        }
    }

    /// Renew the lease automatically `before_expiry` ahead of each expiry,
    /// until [`release`](Self::release), [`stop_keep_alive`](Self::stop_keep_alive)
    /// or process exit.
    ///
    /// Returns immediately. Calling it while a chain is running is a no-op.
    /// Renewal failures are logged and the chain keeps trying on its normal
    /// cadence; they are never reported back to the caller. Don't use with
    /// very short TTLs.
    pub fn keep_alive(&self, before_expiry: Duration) -> Result<(), LockError> {
        let mut state = self.state();
        if !state.is_acquired {
            return Err(LockError::NotAcquired {
                id: self.inner.id.clone(),
            });
        }
        if before_expiry >= state.last_ttl {
            return Err(LockError::InvalidWindow {
                before_expiry,
                ttl: state.last_ttl,
            });
        }
        if state.renewal.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| LockError::NoRuntime)?;
        let (generation, cancelled) = state.start_renewal();
        drop(state);

        runtime.spawn(RenewalTask::new(self.clone(), before_expiry, generation, cancelled).run());
        Ok(())
    }

    /// Stop the renewal chain without releasing. The lease then lapses at
    /// its current expiry unless renewed by hand. Returns whether a chain
    /// was running.
    pub fn stop_keep_alive(&self) -> bool {
        match self.state().renewal.take() {
            Some(renewal) => {
                debug!("Keep-alive for lock {} stopped", self.inner.id);
                renewal.cancel();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Lock")
            .field("id", &self.inner.id)
            .field("owner", &state.owner)
            .field("collection", &state.collection)
            .field("expires", &state.expires)
            .field("is_acquired", &state.is_acquired)
            .field("is_released", &state.is_released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyStore;
    use pkg_state::MemoryDocumentStore;

    fn memory() -> Arc<MemoryDocumentStore> {
        Arc::new(MemoryDocumentStore::new())
    }

    #[tokio::test]
    async fn test_acquire_and_must_release() {
        let store = memory();
        let lock = Lock::new(store.clone(), "indexing-simple", "client0");

        lock.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(lock.is_acquired());
        assert!(!lock.is_released());
        assert_eq!(lock.last_ttl(), Duration::from_secs(1));

        lock.must_release().await.unwrap();
        assert!(!lock.is_acquired());
        assert!(lock.is_released());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_lock() {
        let store = memory();
        let ttl = Duration::from_millis(500);
        let a = Lock::new(store.clone(), "L", "client0");
        a.acquire(ttl).await.unwrap();
        let first = store.get(DEFAULT_COLLECTION, "L").await.unwrap().unwrap();

        let b = Lock::new(store.clone(), "L", "client1");
        let err = b.acquire(ttl).await.unwrap_err();
        assert!(matches!(err, LockError::HeldByOther { .. }));
        assert_eq!(err.to_string(), "lock 'L' held by other client");
        assert!(!b.is_acquired());
        assert!(b.acquired_at().is_none());

        // Wait for the first lease to expire and retry
        tokio::time::sleep(ttl).await;
        b.acquire(ttl).await.unwrap();
        assert!(b.is_acquired());

        let taken = store.get(DEFAULT_COLLECTION, "L").await.unwrap().unwrap();
        assert_eq!(taken.owner, "client1");
        assert!(taken.acquired > first.acquired);
        assert!(taken.expires > first.expires);

        // Releasing the first lock now deletes nothing, so strict release errors
        let err = a.must_release().await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyReleased { .. }));
        assert_eq!(
            store.get(DEFAULT_COLLECTION, "L").await.unwrap().unwrap().owner,
            "client1"
        );

        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_does_not_delete_new_owner() {
        let store = memory();
        let ttl = Duration::from_millis(200);
        let a = Lock::new(store.clone(), "L", "client0");
        a.acquire(ttl).await.unwrap();

        tokio::time::sleep(ttl).await;
        let b = Lock::new(store.clone(), "L", "client1");
        b.acquire(ttl).await.unwrap();

        a.release().await.unwrap();
        assert!(a.is_released());
        let doc = store.get(DEFAULT_COLLECTION, "L").await.unwrap().unwrap();
        assert_eq!(doc.owner, "client1");

        b.must_release().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_renewal_keeps_acquired() {
        let store = memory();
        let lock = Lock::new(store.clone(), "L", "client0");
        lock.acquire(Duration::from_secs(10)).await.unwrap();
        let acquired = lock.acquired_at().unwrap();
        let expires = lock.expires_at().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.acquire(Duration::from_secs(10)).await.unwrap();

        assert_eq!(lock.acquired_at().unwrap(), acquired);
        assert!(lock.expires_at().unwrap() > expires);
        let doc = store.get(DEFAULT_COLLECTION, "L").await.unwrap().unwrap();
        assert_eq!(doc.acquired, acquired);
        assert_eq!(doc.expires, lock.expires_at().unwrap());
    }

    #[tokio::test]
    async fn test_expires_is_acquire_time_plus_ttl() {
        let lock = Lock::new(memory(), "L", "client0");
        lock.acquire(Duration::from_millis(750)).await.unwrap();

        let acquired = lock.acquired_at().unwrap();
        let expires = lock.expires_at().unwrap();
        assert_eq!(expires - acquired, chrono::Duration::milliseconds(750));
    }

    #[tokio::test]
    async fn test_release_twice_is_idempotent() {
        let lock = Lock::new(memory(), "L", "client0");
        lock.acquire(Duration::from_secs(1)).await.unwrap();

        lock.release().await.unwrap();
        lock.release().await.unwrap();
        assert!(!lock.is_acquired());
        assert!(lock.is_released());

        let err = lock.must_release().await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyReleased { .. }));
    }

    #[tokio::test]
    async fn test_status_before_acquire() {
        let lock = Lock::new(memory(), "L", "client0");
        assert!(!lock.is_acquired());
        assert!(!lock.is_released());
        assert!(lock.expires_at().is_none());

        // Nothing stored yet: tolerant release succeeds, strict does not
        lock.release().await.unwrap();
        let other = Lock::new(memory(), "L", "client0");
        assert!(matches!(
            other.must_release().await.unwrap_err(),
            LockError::AlreadyReleased { .. }
        ));
    }

    #[tokio::test]
    async fn test_passive_expiry() {
        let lock = Lock::new(memory(), "L", "client0");
        lock.acquire(Duration::from_millis(100)).await.unwrap();
        assert!(lock.is_acquired());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!lock.is_acquired());
        assert!(lock.is_released());
    }

    #[tokio::test]
    async fn test_reacquire_after_release() {
        let lock = Lock::new(memory(), "L", "client0");
        lock.acquire(Duration::from_secs(1)).await.unwrap();
        lock.release().await.unwrap();

        lock.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(lock.is_acquired());
        assert!(!lock.is_released());
    }

    #[tokio::test]
    async fn test_store_error_leaves_state_untouched() {
        let store = Arc::new(FlakyStore::new());
        let lock = Lock::new(store.clone(), "L", "client0");

        store.set_failing(true);
        let err = lock.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LockError::Store(StoreError::Backend(_))));
        assert!(lock.acquired_at().is_none());
        assert_eq!(lock.last_ttl(), Duration::ZERO);
        assert!(!lock.is_acquired());

        store.set_failing(false);
        lock.acquire(Duration::from_secs(1)).await.unwrap();
        let expires = lock.expires_at();

        store.set_failing(true);
        assert!(lock.acquire(Duration::from_secs(30)).await.is_err());
        assert_eq!(lock.expires_at(), expires);
        assert_eq!(lock.last_ttl(), Duration::from_secs(1));
        assert!(lock.is_acquired());

        // A failed delete keeps the lock marked as held
        assert!(matches!(
            lock.release().await.unwrap_err(),
            LockError::Store(_)
        ));
        assert!(!lock.is_released());
    }

    #[tokio::test]
    async fn test_conflict_maps_to_held_by_other() {
        let store = Arc::new(FlakyStore::new());
        store.set_conflicting(true);
        let lock = Lock::new(store.clone(), "L", "client0");

        let err = lock.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LockError::HeldByOther { .. }));
    }

    #[tokio::test]
    async fn test_conflict_on_release_counts_as_nothing_deleted() {
        let store = Arc::new(FlakyStore::new());
        let lock = Lock::new(store.clone(), "L", "client0");
        lock.acquire(Duration::from_secs(5)).await.unwrap();

        store.set_conflicting(true);
        lock.release().await.unwrap();
        assert!(lock.is_released());
        assert!(!lock.is_acquired());

        store.set_conflicting(false);
        let strict = Lock::new(store.clone(), "M", "client0");
        strict.acquire(Duration::from_secs(5)).await.unwrap();

        store.set_conflicting(true);
        let err = strict.must_release().await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyReleased { .. }));
        assert!(strict.is_released());
        assert!(!strict.is_acquired());

        // Marked released, so a retry does not reach the store again
        store.set_conflicting(false);
        assert!(matches!(
            strict.must_release().await.unwrap_err(),
            LockError::AlreadyReleased { .. }
        ));
        assert!(store.get(DEFAULT_COLLECTION, "M").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_with_owner_and_collection() {
        let store = memory();
        let lock = Lock::new(store.clone(), "L", "default")
            .with_owner("client7")
            .with_collection("indexing");
        assert_eq!(lock.owner(), "client7");
        assert_eq!(lock.collection(), "indexing");

        lock.acquire(Duration::from_secs(1)).await.unwrap();
        let doc = store.get("indexing", "L").await.unwrap().unwrap();
        assert_eq!(doc.owner, "client7");
        assert!(store.get(DEFAULT_COLLECTION, "L").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_owners_single_winner() {
        let store = memory();
        let mut handles = Vec::new();
        for i in 0..8 {
            let lock = Lock::new(store.clone(), "race", format!("client{}", i));
            handles.push(tokio::spawn(async move {
                lock.acquire(Duration::from_secs(5)).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let lock = Lock::new(memory(), "L", "client0");
        let clone = lock.clone();
        lock.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(clone.is_acquired());
        clone.release().await.unwrap();
        assert!(lock.is_released());
    }
}
