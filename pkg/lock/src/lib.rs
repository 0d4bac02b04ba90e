//! Best-effort, lease-based mutual exclusion over a shared document store.
//!
//! A [`Lock`] is a lease recorded as `owner` + `expires` on one document.
//! Acquiring creates, renews or takes over that document through a single
//! atomic conditional upsert; releasing deletes it only while this owner
//! still holds it; [`Lock::keep_alive`] renews it in the background.
//!
//! This coordinates work, it does not guarantee correctness: clock skew and
//! races outside the store's atomic update can yield two holders. Guard the
//! shared data itself with the store's optimistic concurrency control.
//!
//! Failures inside the background renewal are logged and absorbed; no caller
//! ever sees them. Check [`Lock::is_acquired`] before relying on the lease.

mod client;
mod error;
mod keepalive;
mod lock;
mod state;

#[cfg(test)]
mod testing;

pub use client::{LockClient, generate_owner};
pub use error::LockError;
pub use lock::Lock;
