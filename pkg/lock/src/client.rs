use pkg_constants::lock::DEFAULT_COLLECTION;
use pkg_state::DocumentStore;
use std::sync::Arc;
use uuid::Uuid;

use crate::lock::Lock;

/// Generate a random owner identity.
pub fn generate_owner() -> String {
    Uuid::new_v4().to_string()
}

/// Hands out [`Lock`]s that share one store, owner identity and collection.
///
/// Create one per process (or per logical worker) and keep it: the owner it
/// generates is what lets this process renew its own leases.
#[derive(Clone)]
pub struct LockClient {
    store: Arc<dyn DocumentStore>,
    owner: String,
    collection: String,
}

impl LockClient {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            owner: generate_owner(),
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// A new lock handle for `id` bound to this client's owner and collection.
    pub fn lock(&self, id: impl Into<String>) -> Lock {
        Lock::new(self.store.clone(), id, self.owner.clone()).with_collection(self.collection.clone())
    }
}
