use chrono::{DateTime, Utc};
use pkg_types::lock::LockDocument;
use std::time::Duration;
use tokio::sync::watch;

/// Cancellation handle for the running renewal task.
pub(crate) struct Renewal {
    pub generation: u64,
    pub cancel: watch::Sender<bool>,
}

impl Renewal {
    pub fn cancel(self) {
        // The task may already be gone; nothing to do then
        let _ = self.cancel.send(true);
    }
}

/// Locally cached view of one lock. Every field is read and written under
/// the owning `Lock`'s state mutex; store round-trips never happen while
/// that mutex is held.
pub(crate) struct LockState {
    pub owner: String,
    pub collection: String,
    pub acquired: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub last_ttl: Duration,
    pub is_acquired: bool,
    pub is_released: bool,
    pub renewal: Option<Renewal>,
    pub next_generation: u64,
}

impl LockState {
    pub fn new(owner: String, collection: String) -> Self {
        Self {
            owner,
            collection,
            acquired: None,
            expires: None,
            last_ttl: Duration::ZERO,
            is_acquired: false,
            is_released: false,
            renewal: None,
            next_generation: 0,
        }
    }

    /// Acquired and not yet expired at `now`.
    pub fn is_acquired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_acquired && self.expires.is_some_and(|expires| expires > now)
    }

    /// Released explicitly, or expired at `now`. A lock that was never
    /// acquired is neither acquired nor released.
    pub fn is_released_at(&self, now: DateTime<Utc>) -> bool {
        self.is_released || self.expires.is_some_and(|expires| expires <= now)
    }

    /// Record a successful acquire or renewal. `doc` is what the store holds now.
    pub fn commit_acquire(&mut self, ttl: Duration, doc: &LockDocument) {
        self.last_ttl = ttl;
        self.acquired = Some(doc.acquired);
        self.expires = Some(doc.expires);
        self.is_acquired = true;
        self.is_released = false;
    }

    /// Record a release and stop any renewal chain.
    pub fn mark_released(&mut self) {
        self.is_released = true;
        self.is_acquired = false;
        if let Some(renewal) = self.renewal.take() {
            renewal.cancel();
        }
    }

    /// Register a new renewal chain and hand back its generation and
    /// cancellation receiver.
    pub fn start_renewal(&mut self) -> (u64, watch::Receiver<bool>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let (cancel, cancelled) = watch::channel(false);
        self.renewal = Some(Renewal { generation, cancel });
        (generation, cancelled)
    }

    /// Forget the renewal chain `generation` if it is still the registered one.
    pub fn finish_renewal(&mut self, generation: u64) {
        if self
            .renewal
            .as_ref()
            .is_some_and(|renewal| renewal.generation == generation)
        {
            self.renewal = None;
        }
    }
}
