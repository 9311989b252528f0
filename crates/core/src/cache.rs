//! Local entity cache populated by priming.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::errors::{Error, Result};
use crate::store::{CollectionPath, Document};

/// Keyed by (collection, id). Writes overwrite; nothing accumulates.
#[async_trait]
pub trait EntityCache: Send + Sync {
    /// Upserts `docs` into `collection` and returns how many were written.
    async fn put_all(&self, collection: &CollectionPath, docs: Vec<Document>) -> Result<usize>;

    fn get(&self, collection: &CollectionPath, id: &str) -> Result<Option<Document>>;

    fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>>;

    fn count(&self, collection: &CollectionPath) -> Result<usize> {
        Ok(self.list(collection)?.len())
    }

    /// Incremented by every non-empty write batch.
    fn version(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct InMemoryEntityCache {
    entries: RwLock<HashMap<CollectionPath, BTreeMap<String, Document>>>,
    version: AtomicU64,
}

impl InMemoryEntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every cached collection with its documents, for content comparison.
    pub fn dump(&self) -> Result<BTreeMap<String, Vec<Document>>> {
        let entries = self.read()?;
        Ok(entries
            .iter()
            .map(|(path, docs)| (path.to_string(), docs.values().cloned().collect()))
            .collect())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<CollectionPath, BTreeMap<String, Document>>>>
    {
        self.entries
            .read()
            .map_err(|_| Error::internal("Entity cache lock is poisoned"))
    }
}

#[async_trait]
impl EntityCache for InMemoryEntityCache {
    async fn put_all(&self, collection: &CollectionPath, docs: Vec<Document>) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let written = docs.len();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| Error::internal("Entity cache lock is poisoned"))?;
        let bucket = entries.entry(collection.clone()).or_default();
        for doc in docs {
            bucket.insert(doc.id.clone(), doc);
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    fn get(&self, collection: &CollectionPath, id: &str) -> Result<Option<Document>> {
        Ok(self
            .read()?
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>> {
        Ok(self
            .read()?
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
