//! In-process document store.
//!
//! Behaves like the remote backend for the query shapes the engine issues:
//! it enforces the inclusion cardinality ceiling, pushes a full snapshot to
//! every matching subscriber on each write, and can be told to fail specific
//! collection paths.

use async_trait::async_trait;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use super::{CollectionPath, Document, DocumentStore, Query, Subscription, SubscriptionFeed};
use crate::config::DEFAULT_INCLUSION_LIMIT;
use crate::errors::{Error, Result, StoreError};

type Collections = BTreeMap<CollectionPath, BTreeMap<String, Document>>;

pub struct InMemoryDocumentStore {
    collections: RwLock<Collections>,
    subscribers: Mutex<Vec<(Query, SubscriptionFeed)>>,
    failures: Mutex<HashMap<CollectionPath, StoreError>>,
    issued: Mutex<Vec<Query>>,
    available: AtomicBool,
    inclusion_limit: usize,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new(DEFAULT_INCLUSION_LIMIT)
    }
}

fn poisoned(what: &str) -> Error {
    Error::internal(format!("In-memory document store {} lock is poisoned", what))
}

impl InMemoryDocumentStore {
    pub fn new(inclusion_limit: usize) -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            issued: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            inclusion_limit,
        }
    }

    /// Inserts or replaces a document and notifies subscribers of its collection.
    pub fn upsert(&self, path: &CollectionPath, doc: Document) -> Result<()> {
        {
            let mut collections = self.collections.write().map_err(|_| poisoned("data"))?;
            collections
                .entry(path.clone())
                .or_default()
                .insert(doc.id.clone(), doc);
        }
        self.notify(path)
    }

    pub fn upsert_json(&self, path: &CollectionPath, id: &str, body: serde_json::Value) -> Result<()> {
        self.upsert(path, Document::from_json(id, body))
    }

    pub fn remove(&self, path: &CollectionPath, id: &str) -> Result<()> {
        {
            let mut collections = self.collections.write().map_err(|_| poisoned("data"))?;
            if let Some(docs) = collections.get_mut(path) {
                docs.remove(id);
            }
        }
        self.notify(path)
    }

    /// Makes every query against `path` fail with `error` until cleared.
    pub fn fail_path(&self, path: CollectionPath, error: StoreError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(path, error);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    /// Simulates losing (or regaining) the backend entirely.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Queries issued so far, in issue order.
    pub fn issued_queries(&self) -> Vec<Query> {
        self.issued
            .lock()
            .map(|issued| issued.clone())
            .unwrap_or_default()
    }

    pub fn query_count(&self) -> usize {
        self.issued.lock().map(|issued| issued.len()).unwrap_or(0)
    }

    pub fn reset_query_log(&self) {
        if let Ok(mut issued) = self.issued.lock() {
            issued.clear();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|mut subscribers| {
                subscribers.retain_mut(|(_, feed)| !feed.is_closed());
                subscribers.len()
            })
            .unwrap_or(0)
    }

    fn evaluate(&self, query: &Query) -> Result<Vec<Document>> {
        let collections = self.collections.read().map_err(|_| poisoned("data"))?;
        Ok(collections
            .get(&query.collection)
            .map(|docs| query.apply(docs.values()))
            .unwrap_or_default())
    }

    fn notify(&self, path: &CollectionPath) -> Result<()> {
        let mut subscribers = self.subscribers.lock().map_err(|_| poisoned("subscriber"))?;
        subscribers.retain_mut(|(_, feed)| !feed.is_closed());
        for (query, feed) in subscribers.iter() {
            if &query.collection != path {
                continue;
            }
            let snapshot = self.evaluate(query)?;
            feed.publish(snapshot);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        // Let concurrently issued fetches interleave the way remote calls do.
        tokio::task::yield_now().await;

        if let Ok(mut issued) = self.issued.lock() {
            issued.push(query.clone());
        }

        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("backend is offline").into());
        }
        if let Some(err) = self
            .failures
            .lock()
            .map_err(|_| poisoned("failure"))?
            .get(&query.collection)
            .cloned()
        {
            debug!("[DocumentStore] Injected failure for {}", query.collection);
            return Err(err.into());
        }
        let inclusion = query.max_inclusion_len();
        if inclusion > self.inclusion_limit {
            return Err(StoreError::invalid_query(format!(
                "inclusion predicate carries {} values (limit {})",
                inclusion, self.inclusion_limit
            ))
            .into());
        }

        self.evaluate(query)
    }

    fn subscribe(&self, query: Query) -> Result<Subscription> {
        let initial = self.evaluate(&query)?;
        let (feed, subscription) = Subscription::channel();
        feed.publish(initial);
        self.subscribers
            .lock()
            .map_err(|_| poisoned("subscriber"))?
            .push((query, feed));
        Ok(subscription)
    }
}
