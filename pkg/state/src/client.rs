use async_trait::async_trait;
use pkg_constants::state::{KEY_SEPARATOR, LOCK_KEY_PREFIX};
use pkg_types::lock::{AcquireScript, LockDocument, OwnerFilter};
use pkg_types::validate::validate_name;
use slatedb::config::DbReaderOptions;
use slatedb::object_store::ObjectStore;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use slatedb::{CloseReason, Db, DbIterator, DbReader, ErrorKind};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::store::{DocumentStore, StoreError, UpsertResult};

/// Persistent lock document store backed by SlateDB on a local filesystem.
/// In production this would use S3/R2/MinIO via the `object_store` crate.
///
/// SlateDB admits one writer per database, so conditional operations are made
/// atomic by holding `write_lock` across read, evaluate and write. Clones
/// share the lock.
///
/// Opening a second `StateStore` on the same directory fences this one:
/// every later write through it fails with [`StoreError::Fenced`]. Readers
/// that only inspect documents should use [`StateReader`].
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    write_lock: Arc<Mutex<()>>,
}

/// Read-only view of a state store directory.
///
/// Backed by a SlateDB `DbReader`, which never claims the writer epoch, so
/// it can be opened while a `StateStore` on the same directory is live.
pub struct StateReader {
    reader: DbReader,
}

fn backend(op: &str, e: slatedb::Error) -> StoreError {
    if e.kind() == ErrorKind::Closed(CloseReason::Fenced) {
        return StoreError::Fenced(format!("SlateDB {} failed: {}", op, e));
    }
    StoreError::Backend(format!("SlateDB {} failed: {}", op, e))
}

/// Store key for a lock document: `/locks/<collection>/<id>`.
pub fn document_key(collection: &str, id: &str) -> Result<String, StoreError> {
    validate_name(collection).map_err(|e| StoreError::InvalidKey(e.to_string()))?;
    validate_name(id).map_err(|e| StoreError::InvalidKey(e.to_string()))?;
    Ok(format!(
        "{}{}{}{}",
        LOCK_KEY_PREFIX, collection, KEY_SEPARATOR, id
    ))
}

fn collection_prefix(collection: &str) -> Result<String, StoreError> {
    validate_name(collection).map_err(|e| StoreError::InvalidKey(e.to_string()))?;
    Ok(format!("{}{}{}", LOCK_KEY_PREFIX, collection, KEY_SEPARATOR))
}

fn local_object_store(path: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
    let store: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new_with_prefix(path).map_err(|e| {
        StoreError::Backend(format!("SlateDB local object store failed: {}", e))
    })?);
    Ok(store)
}

fn decode_document(bytes: &[u8]) -> Result<LockDocument, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Drain a prefix scan into `(id, document)` pairs sorted by id.
async fn collect_documents(
    prefix: &str,
    mut iter: DbIterator,
) -> Result<Vec<(String, LockDocument)>, StoreError> {
    let mut docs = Vec::new();
    while let Some(kv) = iter.next().await.map_err(|e| backend("scan_prefix", e))? {
        let key = String::from_utf8_lossy(&kv.key);
        let id = key.trim_start_matches(prefix).to_string();
        docs.push((id, decode_document(&kv.value)?));
    }
    docs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(docs)
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        info!("Opening SlateDB state store at {}", path);

        // Ensure the data directory exists before opening the object store
        std::fs::create_dir_all(path)
            .map_err(|e| StoreError::Backend(format!("Failed to create data directory {}: {}", path, e)))?;

        let db = Db::open(Path::from("/"), local_object_store(path)?)
            .await
            .map_err(|e| backend("open", e))?;
        Ok(Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn read_document(&self, key: &str) -> Result<Option<LockDocument>, StoreError> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(decode_document(&bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(backend("get", e)),
        }
    }

    async fn write_document(&self, key: &str, doc: &LockDocument) -> Result<(), StoreError> {
        let data = serde_json::to_vec(doc)?;
        self.db
            .put(key.as_bytes(), &data)
            .await
            .map_err(|e| backend("put", e))?;
        Ok(())
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> Result<(), StoreError> {
        info!("Closing SlateDB state store");
        self.db.close().await.map_err(|e| backend("close", e))
    }
}

impl StateReader {
    /// Open a read-only view of the store at `path`. The directory must
    /// already hold a database written by a [`StateStore`].
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        info!("Opening SlateDB state reader at {}", path);
        if !std::path::Path::new(path).is_dir() {
            return Err(StoreError::Backend(format!(
                "data directory {} does not exist",
                path
            )));
        }

        let reader = DbReader::open(
            Path::from("/"),
            local_object_store(path)?,
            None,
            DbReaderOptions::default(),
        )
        .await
        .map_err(|e| backend("open reader", e))?;
        Ok(Self { reader })
    }

    /// Read one lock document.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<LockDocument>, StoreError> {
        let key = document_key(collection, id)?;
        match self.reader.get(key.as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(decode_document(&bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(backend("get", e)),
        }
    }

    /// All documents in a collection as `(id, document)`, sorted by id.
    pub async fn list(&self, collection: &str) -> Result<Vec<(String, LockDocument)>, StoreError> {
        let prefix = collection_prefix(collection)?;
        let iter = self
            .reader
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| backend("scan_prefix", e))?;
        collect_documents(&prefix, iter).await
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.reader.close().await.map_err(|e| backend("close reader", e))
    }
}

#[async_trait]
impl DocumentStore for StateStore {
    async fn conditional_upsert(
        &self,
        collection: &str,
        id: &str,
        script: &AcquireScript,
    ) -> Result<UpsertResult, StoreError> {
        let key = document_key(collection, id)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read_document(&key).await?;
        let result = UpsertResult::from_decision(script.evaluate(current.as_ref()), current);
        if result.outcome.is_write()
            && let Some(doc) = &result.document
        {
            self.write_document(&key, doc).await?;
        }
        debug!("upsert {} by {}: {:?}", key, script.owner, result.outcome);
        Ok(result)
    }

    async fn conditional_delete(
        &self,
        collection: &str,
        filter: &OwnerFilter,
    ) -> Result<u64, StoreError> {
        let key = document_key(collection, &filter.id)?;
        let _guard = self.write_lock.lock().await;

        match self.read_document(&key).await? {
            Some(doc) if filter.matches(&filter.id, &doc) => {
                self.db
                    .delete(key.as_bytes())
                    .await
                    .map_err(|e| backend("delete", e))?;
                debug!("deleted {} for {}", key, filter.owner);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<LockDocument>, StoreError> {
        let key = document_key(collection, id)?;
        self.read_document(&key).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, LockDocument)>, StoreError> {
        let prefix = collection_prefix(collection)?;
        let iter = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| backend("scan_prefix", e))?;
        collect_documents(&prefix, iter).await
    }
}
