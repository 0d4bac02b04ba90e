use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A lease document as persisted in the document store.
/// Stored at `/locks/<collection>/<lock-id>`; the id is the key, not a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDocument {
    /// Identity of the current holder
    pub owner: String,
    /// When ownership last changed hands (not touched by renewals)
    pub acquired: DateTime<Utc>,
    /// When the lease stops being valid
    pub expires: DateTime<Utc>,
}

impl LockDocument {
    /// Check whether the lease is still valid at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }

    /// Check whether the lease is still valid right now.
    pub fn is_live(&self) -> bool {
        self.is_live_at(Utc::now())
    }
}

/// Compute `now + ttl`, saturating instead of overflowing.
pub fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Parameters of one acquire attempt, evaluated by the store against the
/// current document in a single atomic step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireScript {
    /// Reference instant for the expiry comparison
    pub now: DateTime<Utc>,
    /// Owner requesting the lease
    pub owner: String,
    /// `acquired` to record if ownership changes
    pub acquired: DateTime<Utc>,
    /// New expiry on success
    pub expires: DateTime<Utc>,
}

/// What the store must do with the document after evaluating an [`AcquireScript`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No document existed: insert this one.
    Create(LockDocument),
    /// Same owner: only `expires` moves.
    Renew(LockDocument),
    /// Different owner whose lease lapsed: replace it.
    TakeOver(LockDocument),
    /// Different owner still holds a live lease: leave the document alone.
    Reject,
}

impl Decision {
    /// The document to write, if any.
    pub fn document(&self) -> Option<&LockDocument> {
        match self {
            Decision::Create(doc) | Decision::Renew(doc) | Decision::TakeOver(doc) => Some(doc),
            Decision::Reject => None,
        }
    }
}

impl AcquireScript {
    /// Build the script for `owner` asking for a lease of `ttl` starting at `now`.
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            now,
            owner: owner.into(),
            acquired: now,
            expires: lease_expiry(now, ttl),
        }
    }

    /// Decide the outcome against the document currently stored under the key.
    pub fn evaluate(&self, current: Option<&LockDocument>) -> Decision {
        match current {
            None => Decision::Create(LockDocument {
                owner: self.owner.clone(),
                acquired: self.acquired,
                expires: self.expires,
            }),
            Some(doc) if doc.owner == self.owner => Decision::Renew(LockDocument {
                owner: doc.owner.clone(),
                acquired: doc.acquired,
                expires: self.expires,
            }),
            Some(doc) if doc.is_live_at(self.now) => Decision::Reject,
            Some(_) => Decision::TakeOver(LockDocument {
                owner: self.owner.clone(),
                acquired: self.acquired,
                expires: self.expires,
            }),
        }
    }
}

/// Guard for a release: delete only while `owner` still holds `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerFilter {
    pub id: String,
    pub owner: String,
}

impl OwnerFilter {
    pub fn new(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
        }
    }

    pub fn matches(&self, id: &str, doc: &LockDocument) -> bool {
        self.id == id && self.owner == doc.owner
    }
}
