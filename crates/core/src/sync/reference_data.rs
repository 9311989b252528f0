//! Live reference data and the campaign-derived priming scope.
//!
//! Reactions to snapshots are pure functions ([`evaluate_active_campaign`],
//! [`evaluate_campaign_fields`]); the driver task only wires subscriptions
//! to them and runs priming when the scope changes.

use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::model::*;
use crate::context::SyncContext;
use crate::errors::{Error, Result};
use crate::fetch::chunk_ids;
use crate::security::{Principal, ScopedPredicates, SecurityScopeBuilder};
use crate::store::{CollectionPath, Document, Predicate, Query, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignTransition {
    Switched(String),
    Cleared,
    Unchanged,
}

pub fn evaluate_active_campaign(current: Option<&str>, snapshot: &[Document]) -> CampaignTransition {
    match (current, snapshot.first()) {
        (Some(current), Some(doc)) if doc.id == current => CampaignTransition::Unchanged,
        (_, Some(doc)) => CampaignTransition::Switched(doc.id.clone()),
        (Some(_), None) => CampaignTransition::Cleared,
        (None, None) => CampaignTransition::Unchanged,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeTransition {
    /// A new scope to prime.
    Changed(Scope),
    Unchanged,
    /// Nothing visible to this principal; priming does not apply.
    Empty,
}

/// Derives the scope from a campaign-field membership snapshot.
pub fn evaluate_campaign_fields(
    previous: Option<&Scope>,
    campaign_id: &str,
    snapshot: &[Document],
    principal: &Principal,
) -> ScopeTransition {
    let members: BTreeSet<String> = snapshot
        .iter()
        .filter(|doc| doc.get_str(CAMPAIGN_ID).map_or(true, |id| id == campaign_id))
        .filter_map(|doc| doc.get_str(FIELD_ID))
        .map(String::from)
        .collect();
    let field_ids = principal.restrict_fields(&members);
    if field_ids.is_empty() {
        return ScopeTransition::Empty;
    }

    let scope = Scope {
        campaign_id: campaign_id.to_string(),
        field_ids,
    };
    if previous == Some(&scope) {
        ScopeTransition::Unchanged
    } else {
        ScopeTransition::Changed(scope)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDataSnapshot {
    pub reference: BTreeMap<ReferenceCollection, Vec<Document>>,
    pub active_campaign: Option<Document>,
    pub scope: Option<Scope>,
    /// True until the reference collections have loaded and the first prime
    /// (or the decision that none applies) has resolved.
    pub loading: bool,
    pub last_prime: Option<PrimingMetrics>,
    pub last_error: Option<String>,
}

impl Default for ReferenceDataSnapshot {
    fn default() -> Self {
        Self {
            reference: BTreeMap::new(),
            active_campaign: None,
            scope: None,
            loading: true,
            last_prime: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FeedSource {
    Reference(ReferenceCollection),
    ActiveCampaign,
    /// One chunk of the campaign-field membership feed. `generation` changes
    /// whenever the feed set is reopened.
    CampaignFields {
        campaign_id: String,
        generation: u64,
        chunk: usize,
    },
}

#[derive(Debug)]
struct FeedEvent {
    source: FeedSource,
    docs: Vec<Document>,
}

/// Forwarder task; aborted (and its subscription cancelled) on drop.
struct FeedTask(JoinHandle<()>);

impl Drop for FeedTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn forward(
    source: FeedSource,
    mut subscription: Subscription,
    events: mpsc::UnboundedSender<FeedEvent>,
) -> FeedTask {
    FeedTask(tokio::spawn(async move {
        while let Some(docs) = subscription.next().await {
            let event = FeedEvent {
                source: source.clone(),
                docs,
            };
            if events.send(event).is_err() {
                break;
            }
        }
    }))
}

pub struct ReferenceDataStore {
    context: Arc<SyncContext>,
}

impl ReferenceDataStore {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self { context }
    }

    /// Opens the reference and active-campaign feeds for `principal` and
    /// starts the driver. Everything stops when the handle is stopped or dropped.
    pub fn start(&self, principal: Principal) -> Result<ReferenceDataHandle> {
        let store = self.context.store();
        let builder = SecurityScopeBuilder::for_principal(&principal);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut feeds = Vec::with_capacity(ReferenceCollection::ALL.len() + 1);
        for collection in ReferenceCollection::ALL {
            let query = builder.tenant_query(CollectionPath::root(collection.collection_name()));
            feeds.push(forward(
                FeedSource::Reference(collection),
                store.subscribe(query)?,
                events_tx.clone(),
            ));
        }
        let campaign_query = builder
            .tenant_query(CollectionPath::root(CAMPAIGNS))
            .with(Predicate::eq(ACTIVE, true))
            .with(Predicate::limit(1));
        feeds.push(forward(
            FeedSource::ActiveCampaign,
            store.subscribe(campaign_query)?,
            events_tx.clone(),
        ));

        let (snapshot_tx, snapshot_rx) = watch::channel(ReferenceDataSnapshot::default());
        let driver = Driver {
            context: Arc::clone(&self.context),
            principal,
            events_tx,
            snapshot: snapshot_tx,
            _feeds: feeds,
            fields_feeds: Vec::new(),
            fields_generation: 0,
            field_chunks: BTreeMap::new(),
            field_chunk_count: 0,
            campaign_id: None,
            scope: None,
            primed_scope: None,
            reference_seen: BTreeSet::new(),
            campaign_known: false,
            scope_settled: false,
        };
        let task = tokio::spawn(driver.run(events_rx));

        Ok(ReferenceDataHandle {
            task,
            snapshots: snapshot_rx,
        })
    }
}

pub struct ReferenceDataHandle {
    task: JoinHandle<()>,
    snapshots: watch::Receiver<ReferenceDataSnapshot>,
}

impl ReferenceDataHandle {
    pub fn snapshot(&self) -> ReferenceDataSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReferenceDataSnapshot> {
        self.snapshots.clone()
    }

    pub async fn wait_until_loaded(&mut self) -> Result<ReferenceDataSnapshot> {
        self.wait_for(|snapshot| !snapshot.loading).await
    }

    /// Waits until `predicate` holds for the current snapshot.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&ReferenceDataSnapshot) -> bool,
    ) -> Result<ReferenceDataSnapshot> {
        self.snapshots
            .wait_for(predicate)
            .await
            .map(|snapshot| snapshot.clone())
            .map_err(|_| Error::SubscriptionClosed("reference data".to_string()))
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ReferenceDataHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Driver {
    context: Arc<SyncContext>,
    principal: Principal,
    events_tx: mpsc::UnboundedSender<FeedEvent>,
    snapshot: watch::Sender<ReferenceDataSnapshot>,
    _feeds: Vec<FeedTask>,
    fields_feeds: Vec<FeedTask>,
    fields_generation: u64,
    /// Latest snapshot per membership chunk.
    field_chunks: BTreeMap<usize, Vec<Document>>,
    field_chunk_count: usize,
    campaign_id: Option<String>,
    /// Scope published to readers.
    scope: Option<Scope>,
    /// Scope of the last successful prime; a failed prime is retried on the
    /// next membership snapshot.
    primed_scope: Option<Scope>,
    reference_seen: BTreeSet<ReferenceCollection>,
    campaign_known: bool,
    scope_settled: bool,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<FeedEvent>) {
        while let Some(event) = events.recv().await {
            match event.source {
                FeedSource::Reference(collection) => {
                    self.on_reference(collection, event.docs).await
                }
                FeedSource::ActiveCampaign => self.on_active_campaign(event.docs).await,
                FeedSource::CampaignFields {
                    campaign_id,
                    generation,
                    chunk,
                } => {
                    if generation != self.fields_generation {
                        debug!(
                            "[ReferenceData] Dropping stale membership snapshot for campaign {}",
                            campaign_id
                        );
                        continue;
                    }
                    self.on_campaign_fields(campaign_id, chunk, event.docs).await;
                }
            }
            self.publish_loading();
        }
    }

    async fn cache_snapshot(&self, collection: &str, docs: &[Document]) {
        if let Err(err) = self
            .context
            .cache()
            .put_all(&CollectionPath::root(collection), docs.to_vec())
            .await
        {
            warn!("[ReferenceData] Failed to cache {} snapshot: {}", collection, err);
        }
    }

    async fn on_reference(&mut self, collection: ReferenceCollection, docs: Vec<Document>) {
        self.cache_snapshot(collection.collection_name(), &docs).await;
        self.reference_seen.insert(collection);
        self.snapshot.send_modify(|snapshot| {
            snapshot.reference.insert(collection, docs);
        });
    }

    async fn on_active_campaign(&mut self, docs: Vec<Document>) {
        self.campaign_known = true;
        self.cache_snapshot(CAMPAIGNS, &docs).await;
        let transition = evaluate_active_campaign(self.campaign_id.as_deref(), &docs);
        self.snapshot.send_modify(|snapshot| {
            snapshot.active_campaign = docs.first().cloned();
        });

        match transition {
            CampaignTransition::Switched(campaign_id) => {
                info!(
                    "[ReferenceData] Active campaign is now {} for tenant {}",
                    campaign_id, self.principal.tenant_id
                );
                self.campaign_id = Some(campaign_id.clone());
                self.set_scope(None);
                self.primed_scope = None;
                self.scope_settled = false;
                self.open_fields_feeds(campaign_id);
            }
            CampaignTransition::Cleared => {
                info!(
                    "[ReferenceData] No active campaign for tenant {}",
                    self.principal.tenant_id
                );
                self.campaign_id = None;
                self.close_fields_feeds();
                self.set_scope(None);
                self.primed_scope = None;
                self.scope_settled = true;
            }
            CampaignTransition::Unchanged => {
                if self.campaign_id.is_none() {
                    // No campaign at all: priming is inapplicable.
                    self.scope_settled = true;
                }
            }
        }
    }

    fn close_fields_feeds(&mut self) {
        self.fields_feeds.clear();
        self.field_chunks.clear();
        self.field_chunk_count = 0;
        self.fields_generation += 1;
    }

    /// Membership queries for `campaign_id`, scoped like the priming scope
    /// phase. An accessible set over the inclusion ceiling is split into
    /// `scope_chunk_size` chunks, one feed each.
    fn fields_queries(&self, campaign_id: &str) -> Option<Vec<Query>> {
        let collection = CollectionPath::root(CAMPAIGN_FIELDS);
        let campaign_filter = Predicate::eq(CAMPAIGN_ID, campaign_id);
        let builder = SecurityScopeBuilder::for_principal(&self.principal);
        let config = self.context.config();

        let oversized = !self.principal.is_unrestricted()
            && self.principal.accessible_field_ids.len() > config.inclusion_limit;
        if oversized {
            let accessible: Vec<String> =
                self.principal.accessible_field_ids.iter().cloned().collect();
            let tenant = builder.tenant_predicate();
            let queries = chunk_ids(&accessible, config.scope_chunk_size)
                .into_iter()
                .map(|chunk| {
                    Query::new(
                        collection.clone(),
                        vec![
                            tenant.clone(),
                            campaign_filter.clone(),
                            Predicate::in_values(FIELD_ID, chunk),
                        ],
                    )
                })
                .collect();
            return Some(queries);
        }

        match builder.with_field_access(FIELD_ID).build() {
            ScopedPredicates::Query(predicates) => {
                Some(vec![Query::new(collection, predicates).with(campaign_filter)])
            }
            ScopedPredicates::NoAccess => None,
        }
    }

    fn open_fields_feeds(&mut self, campaign_id: String) {
        self.close_fields_feeds();
        let Some(queries) = self.fields_queries(&campaign_id) else {
            debug!("[ReferenceData] Principal has no accessible fields; not priming");
            self.scope_settled = true;
            return;
        };

        let store = self.context.store();
        self.field_chunk_count = queries.len();
        for (chunk, query) in queries.into_iter().enumerate() {
            let source = FeedSource::CampaignFields {
                campaign_id: campaign_id.clone(),
                generation: self.fields_generation,
                chunk,
            };
            match store.subscribe(query) {
                Ok(subscription) => {
                    self.fields_feeds
                        .push(forward(source, subscription, self.events_tx.clone()));
                }
                Err(err) => {
                    warn!(
                        "[ReferenceData] Failed to subscribe to campaign fields of {}: {}",
                        campaign_id, err
                    );
                    self.close_fields_feeds();
                    self.scope_settled = true;
                    self.snapshot.send_modify(|snapshot| {
                        snapshot.last_error = Some(err.to_string());
                    });
                    return;
                }
            }
        }
    }

    async fn on_campaign_fields(
        &mut self,
        campaign_id: String,
        chunk: usize,
        docs: Vec<Document>,
    ) {
        self.field_chunks.insert(chunk, docs);
        if self.field_chunks.len() < self.field_chunk_count {
            // A partial membership set would prime a partial scope.
            return;
        }

        let principal = &self.principal;
        let docs: Vec<Document> = self
            .field_chunks
            .values()
            .flatten()
            .filter(|doc| doc.get_str(FIELD_ID).is_some_and(|f| principal.can_access_field(f)))
            .cloned()
            .collect();
        self.cache_snapshot(CAMPAIGN_FIELDS, &docs).await;

        match evaluate_campaign_fields(
            self.primed_scope.as_ref(),
            &campaign_id,
            &docs,
            &self.principal,
        ) {
            ScopeTransition::Changed(scope) => {
                debug!(
                    "[ReferenceData] Scope changed to {} field(s) for campaign {}",
                    scope.field_ids.len(),
                    campaign_id
                );
                self.set_scope(Some(scope.clone()));
                self.prime(scope).await;
            }
            ScopeTransition::Unchanged => {
                if self.scope != self.primed_scope {
                    self.set_scope(self.primed_scope.clone());
                }
            }
            ScopeTransition::Empty => {
                self.set_scope(None);
                self.primed_scope = None;
                self.scope_settled = true;
            }
        }
    }

    fn set_scope(&mut self, scope: Option<Scope>) {
        self.scope = scope.clone();
        self.snapshot.send_modify(|snapshot| snapshot.scope = scope);
    }

    async fn prime(&mut self, scope: Scope) {
        let lock = self.context.sync_lock();
        // Queue behind any in-flight sync so the new scope is never dropped.
        let permit = lock.acquire().await;
        let result = self
            .context
            .priming()
            .prime_scope(&permit, &self.principal, &scope)
            .await;
        drop(permit);

        self.scope_settled = true;
        match result {
            Ok(metrics) => {
                self.primed_scope = Some(scope);
                self.snapshot.send_modify(|snapshot| {
                    snapshot.last_prime = Some(metrics);
                    snapshot.last_error = None;
                });
            }
            Err(err) => {
                warn!("[ReferenceData] Scoped priming failed: {}", err);
                self.snapshot.send_modify(|snapshot| {
                    snapshot.last_error = Some(err.to_string());
                });
            }
        }
    }

    fn publish_loading(&self) {
        let loading = self.reference_seen.len() < ReferenceCollection::ALL.len()
            || !self.campaign_known
            || !self.scope_settled;
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.loading == loading {
                return false;
            }
            snapshot.loading = loading;
            true
        });
    }
}
