use async_trait::async_trait;
use pkg_types::lock::{AcquireScript, Decision, LockDocument, OwnerFilter};

/// Failures reported by a [`DocumentStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A concurrent writer touched the document while the conditional
    /// update was being applied.
    #[error("write conflict on {collection}/{id}")]
    Conflict { collection: String, id: String },

    /// Another writer opened the same database and this handle was shut
    /// out. Nothing written through this handle will succeed again.
    #[error("store handle fenced by a newer writer: {0}")]
    Fenced(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// What a conditional upsert did to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Renewed,
    TakenOver,
    /// The script rejected the write; nothing changed.
    Noop,
}

impl UpsertOutcome {
    /// True for every outcome that wrote the document.
    pub fn is_write(self) -> bool {
        !matches!(self, UpsertOutcome::Noop)
    }
}

/// Result of [`DocumentStore::conditional_upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertResult {
    pub outcome: UpsertOutcome,
    /// The document as it stands after the operation.
    pub document: Option<LockDocument>,
}

impl UpsertResult {
    /// Turn an evaluated decision into a result. `current` is what the store
    /// held before; it is reported back unchanged on `Reject`.
    pub fn from_decision(decision: Decision, current: Option<LockDocument>) -> Self {
        let (outcome, document) = match decision {
            Decision::Create(doc) => (UpsertOutcome::Created, Some(doc)),
            Decision::Renew(doc) => (UpsertOutcome::Renewed, Some(doc)),
            Decision::TakeOver(doc) => (UpsertOutcome::TakenOver, Some(doc)),
            Decision::Reject => (UpsertOutcome::Noop, current),
        };
        Self { outcome, document }
    }
}

/// A keyed document store with atomic per-document conditional writes.
///
/// Implementations must evaluate [`AcquireScript::evaluate`] and apply its
/// decision as one atomic step; a separate read followed by a write from
/// the caller would reopen the race the lock exists to close.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create, renew or take over the document for `id` as the script decides.
    async fn conditional_upsert(
        &self,
        collection: &str,
        id: &str,
        script: &AcquireScript,
    ) -> Result<UpsertResult, StoreError>;

    /// Delete the document only while `filter.owner` holds `filter.id`.
    /// Returns the number of deleted documents.
    async fn conditional_delete(
        &self,
        collection: &str,
        filter: &OwnerFilter,
    ) -> Result<u64, StoreError>;

    /// Read a document. Diagnostics only; the acquire path never reads first.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<LockDocument>, StoreError>;

    /// All documents in a collection as `(id, document)`, sorted by id.
    async fn list(&self, collection: &str) -> Result<Vec<(String, LockDocument)>, StoreError>;
}
