//! Document store collaborators for the lease lock.
//!
//! [`DocumentStore`] is the narrow interface the lock protocol consumes;
//! [`MemoryDocumentStore`] and [`StateStore`] (SlateDB) implement it;
//! [`StateReader`] is a read-only SlateDB view for inspection.

pub mod client;
pub mod memory;
pub mod store;

pub use client::{StateReader, StateStore};
pub use memory::MemoryDocumentStore;
pub use store::{DocumentStore, StoreError, UpsertOutcome, UpsertResult};
