//! Document store collaborator contract: one-shot queries and change feeds.

mod memory;
mod query;

pub use memory::InMemoryDocumentStore;
pub use query::{compare_values, CollectionPath, Document, Predicate, Query, SortDirection};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::errors::Result;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Executes a one-shot query and returns the current matching documents.
    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Opens a change feed. Every change delivers the full current match set.
    fn subscribe(&self, query: Query) -> Result<Subscription>;
}

/// Live change feed. Dropping it (or calling [`Subscription::unsubscribe`])
/// cancels the feed.
#[derive(Debug)]
pub struct Subscription {
    snapshots: mpsc::UnboundedReceiver<Vec<Document>>,
    cancel: Option<oneshot::Sender<()>>,
}

/// Producer half handed to the store implementation.
#[derive(Debug)]
pub struct SubscriptionFeed {
    snapshots: mpsc::UnboundedSender<Vec<Document>>,
    cancelled: oneshot::Receiver<()>,
}

impl Subscription {
    pub fn channel() -> (SubscriptionFeed, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        (
            SubscriptionFeed {
                snapshots: tx,
                cancelled: cancel_rx,
            },
            Subscription {
                snapshots: rx,
                cancel: Some(cancel_tx),
            },
        )
    }

    /// Waits for the next snapshot; `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<Vec<Document>> {
        self.snapshots.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.cancel_feed();
    }

    fn cancel_feed(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.snapshots.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_feed();
    }
}

impl SubscriptionFeed {
    /// Delivers a snapshot. Returns `false` once the subscriber is gone.
    pub fn publish(&self, snapshot: Vec<Document>) -> bool {
        self.snapshots.send(snapshot).is_ok()
    }

    pub fn is_closed(&mut self) -> bool {
        if self.snapshots.is_closed() {
            return true;
        }
        !matches!(
            self.cancelled.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }

    /// Resolves when the subscriber cancels or drops the feed.
    pub async fn closed(&mut self) {
        if self.is_closed() {
            return;
        }
        tokio::select! {
            _ = &mut self.cancelled => {}
            _ = self.snapshots.closed() => {}
        }
    }
}
