use pkg_state::StoreError;
use std::time::Duration;

/// Errors returned by [`Lock`](crate::Lock) operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another owner's lease is still valid, or the store reported a write
    /// conflict during the attempt.
    #[error("lock '{id}' held by other client")]
    HeldByOther { id: String },

    /// Strict release found nothing of ours to delete.
    #[error("lock '{id}' already released")]
    AlreadyReleased { id: String },

    #[error("acquire lock '{id}' before keep alive")]
    NotAcquired { id: String },

    #[error("keep alive's before_expiry ({before_expiry:?}) should be smaller than lock's TTL ({ttl:?})")]
    InvalidWindow { before_expiry: Duration, ttl: Duration },

    #[error("keep alive needs a running Tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Store(#[from] StoreError),
}
