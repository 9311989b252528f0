//! Multi-phase incremental cache priming.
//!
//! Phases run strictly in order because each needs ids resolved by the
//! previous one; fetches inside a phase fan out concurrently:
//!
//! 1. checkpoint read (bootstrap vs incremental)
//! 2. reference collections + active campaign
//! 3. campaign-field membership -> working field set
//! 4. field-chunked operational entities
//! 5. bounded recent history per session / silo bag (best effort)
//! 6. checkpoint commit
//!
//! Phases 2-4 abort the run on failure and leave the checkpoint untouched.

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::try_join_all;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use super::lock::SyncPermit;
use super::model::*;
use crate::cache::EntityCache;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::errors::{Error, Result};
use crate::fetch::{fetch_chunked, fetch_each_best_effort, BestEffortBatch};
use crate::persistence::{advance_checkpoint, read_checkpoint, SyncStateKeys, SyncStateStore};
use crate::security::{Principal, ScopedPredicates, SecurityScopeBuilder};
use crate::store::{CollectionPath, Document, DocumentStore, Predicate, Query, SortDirection};

/// Incremental filter: documents touched after `checkpoint`.
pub fn updated_after(checkpoint: DateTime<Utc>) -> Predicate {
    Predicate::gt(
        UPDATED_AT,
        checkpoint.to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

/// Status equality filters, one query each. Incremental runs issue a single
/// unfiltered query instead.
fn status_filters(incremental: bool, statuses: &[&str]) -> Vec<Option<Predicate>> {
    if incremental {
        return vec![None];
    }
    statuses
        .iter()
        .map(|status| Some(Predicate::eq(STATUS, *status)))
        .collect()
}

/// Mutable progress of one run.
struct PrimingRun<'a> {
    principal: &'a Principal,
    started: Instant,
    /// Start of the phase entered last.
    phase_started: Instant,
    metrics: PrimingMetrics,
}

impl PrimingRun<'_> {
    fn enter(&mut self, stage: PrimingStage) {
        self.metrics.stage_reached = stage;
        self.phase_started = Instant::now();
    }

    fn record_failure(&mut self, stage: PrimingStage, message: &str) {
        self.record(
            stage,
            PhaseOutcome::Failed(message.to_string()),
            0,
            self.phase_started,
        );
        self.metrics.errors.push(message.to_string());
    }

    fn record(&mut self, stage: PrimingStage, outcome: PhaseOutcome, fetched: usize, since: Instant) {
        self.metrics.phases.push(PhaseReport {
            stage,
            outcome,
            fetched,
            duration_ms: since.elapsed().as_millis() as i64,
        });
    }
}

/// Ids resolved by the operational phase that own history subcollections.
#[derive(Debug, Default)]
struct HistoryParents {
    session_ids: Vec<String>,
    silo_bag_ids: Vec<String>,
}

pub struct PrimingService {
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn EntityCache>,
    state: Arc<dyn SyncStateStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl PrimingService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn EntityCache>,
        state: Arc<dyn SyncStateStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            cache,
            state,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Full-tenant run: resolves the active campaign and field set itself.
    pub async fn prime_tenant(
        &self,
        _permit: &SyncPermit,
        principal: &Principal,
    ) -> Result<PrimingMetrics> {
        let mut run = self.begin(principal, PrimingVariant::FullTenant);
        let checkpoint = self.read_checkpoint_phase(&mut run);

        let campaign_id = match self.reference_phase(&mut run, checkpoint).await {
            Ok(value) => value,
            Err(err) => return Err(self.fail(run, PrimingStage::Reference, err)),
        };
        let Some(campaign_id) = campaign_id else {
            debug!(
                "[Priming] No active campaign for tenant {}; nothing scoped to fetch",
                principal.tenant_id
            );
            return self
                .commit(run, None, PrimingEndReason::NoActiveCampaign)
                .await;
        };
        run.metrics.campaign_id = Some(campaign_id.clone());

        let field_ids = match self.scope_phase(&mut run, &campaign_id).await {
            Ok(value) => value,
            Err(err) => return Err(self.fail(run, PrimingStage::ScopeResolution, err)),
        };
        if field_ids.is_empty() {
            debug!(
                "[Priming] Campaign {} has no fields visible to tenant {} role {}",
                campaign_id, principal.tenant_id, principal.role
            );
            return self
                .commit(run, None, PrimingEndReason::NoAccessibleFields)
                .await;
        }

        let scope = Scope {
            campaign_id,
            field_ids,
        };
        self.prime_operational(run, scope, checkpoint).await
    }

    /// Scoped run for a scope already derived from live campaign-field data.
    /// Skips the reference and scope-resolution phases.
    pub async fn prime_scope(
        &self,
        _permit: &SyncPermit,
        principal: &Principal,
        scope: &Scope,
    ) -> Result<PrimingMetrics> {
        let mut run = self.begin(principal, PrimingVariant::Scoped);
        let checkpoint = self.read_checkpoint_phase(&mut run);
        run.metrics.campaign_id = Some(scope.campaign_id.clone());

        let field_ids = principal.restrict_fields(&scope.field_ids);
        if field_ids.is_empty() {
            return self
                .commit(run, None, PrimingEndReason::NoAccessibleFields)
                .await;
        }

        let scope = Scope {
            campaign_id: scope.campaign_id.clone(),
            field_ids,
        };
        self.prime_operational(run, scope, checkpoint).await
    }

    fn begin<'a>(&self, principal: &'a Principal, variant: PrimingVariant) -> PrimingRun<'a> {
        let now = Instant::now();
        PrimingRun {
            principal,
            started: now,
            phase_started: now,
            metrics: PrimingMetrics::new(principal.tenant_id.clone(), variant, self.clock.now()),
        }
    }

    async fn prime_operational(
        &self,
        mut run: PrimingRun<'_>,
        scope: Scope,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<PrimingMetrics> {
        run.metrics.field_count = scope.field_ids.len();
        let since = self.operational_filter(&mut run, &scope, checkpoint);

        let parents = match self.operational_phase(&mut run, &scope, since).await {
            Ok(value) => value,
            Err(err) => return Err(self.fail(run, PrimingStage::ScopedOperational, err)),
        };
        if let Err(err) = self.history_phase(&mut run, &parents).await {
            return Err(self.fail(run, PrimingStage::RecentHistory, err));
        }

        self.commit(run, Some(&scope), PrimingEndReason::Completed)
            .await
    }

    fn read_checkpoint_phase(&self, run: &mut PrimingRun<'_>) -> Option<DateTime<Utc>> {
        let started = Instant::now();
        run.enter(PrimingStage::CheckpointRead);
        match read_checkpoint(self.state.as_ref(), &run.principal.tenant_id) {
            Ok(checkpoint) => {
                run.metrics.mode = if checkpoint.is_some() {
                    PrimingMode::Incremental
                } else {
                    PrimingMode::Bootstrap
                };
                run.record(PrimingStage::CheckpointRead, PhaseOutcome::Complete, 0, started);
                checkpoint
            }
            Err(err) => {
                // A full fetch is always safe; fall back to bootstrap.
                warn!(
                    "[Priming] Checkpoint read failed for tenant {}: {}. Running in bootstrap mode.",
                    run.principal.tenant_id, err
                );
                run.metrics.errors.push(err.to_string());
                run.metrics.mode = PrimingMode::Bootstrap;
                run.record(
                    PrimingStage::CheckpointRead,
                    PhaseOutcome::Failed(err.to_string()),
                    0,
                    started,
                );
                None
            }
        }
    }

    /// Incremental filter for operational entities. Only applies when the
    /// checkpoint was committed for this same scope; otherwise entities of
    /// newly visible fields would never be fetched.
    fn operational_filter(
        &self,
        run: &mut PrimingRun<'_>,
        scope: &Scope,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Option<Predicate> {
        let checkpoint = checkpoint?;
        let key = SyncStateKeys::scope_fingerprint(&run.principal.tenant_id);
        match self.state.get(&key) {
            Ok(Some(previous)) if previous == scope.fingerprint() => Some(updated_after(checkpoint)),
            Ok(_) => {
                debug!(
                    "[Priming] Scope changed since last checkpoint for tenant {}; fetching operational entities in full",
                    run.principal.tenant_id
                );
                None
            }
            Err(err) => {
                warn!("[Priming] Scope fingerprint read failed: {}", err);
                run.metrics.errors.push(err.to_string());
                None
            }
        }
    }

    async fn run_query(&self, query: Query) -> Result<Vec<Document>> {
        self.store.query(&query).await
    }

    async fn reference_phase(
        &self,
        run: &mut PrimingRun<'_>,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        let started = Instant::now();
        run.enter(PrimingStage::Reference);
        let builder = SecurityScopeBuilder::for_principal(run.principal);
        let since = checkpoint.map(updated_after);

        let reference_fetches = ReferenceCollection::ALL.into_iter().map(|collection| {
            let query = builder
                .tenant_query(CollectionPath::root(collection.collection_name()))
                .with_all(since.clone());
            async move {
                let docs = self.run_query(query).await?;
                Ok::<_, Error>((collection, docs))
            }
        });
        // The campaign lookup is never incremental: scope must always resolve.
        let campaign_query = builder
            .tenant_query(CollectionPath::root(CAMPAIGNS))
            .with(Predicate::eq(ACTIVE, true))
            .with(Predicate::limit(1));

        let (reference, campaigns) = futures::try_join!(
            try_join_all(reference_fetches),
            self.run_query(campaign_query)
        )?;

        let mut fetched = 0;
        for (collection, docs) in reference {
            let written = self
                .cache
                .put_all(&CollectionPath::root(collection.collection_name()), docs)
                .await?;
            run.metrics
                .reference_counts
                .insert(collection.collection_name().to_string(), written);
            fetched += written;
        }

        let campaign = campaigns.into_iter().next();
        if let Some(doc) = &campaign {
            fetched += self
                .cache
                .put_all(&CollectionPath::root(CAMPAIGNS), vec![doc.clone()])
                .await?;
        }

        run.record(PrimingStage::Reference, PhaseOutcome::Complete, fetched, started);
        Ok(campaign.map(|doc| doc.id))
    }

    async fn scope_phase(
        &self,
        run: &mut PrimingRun<'_>,
        campaign_id: &str,
    ) -> Result<BTreeSet<String>> {
        let started = Instant::now();
        run.enter(PrimingStage::ScopeResolution);
        let principal = run.principal;
        let builder = SecurityScopeBuilder::for_principal(principal).with_field_access(FIELD_ID);
        let collection = CollectionPath::root(CAMPAIGN_FIELDS);
        let campaign_filter = Predicate::eq(CAMPAIGN_ID, campaign_id);

        let oversized = !principal.is_unrestricted()
            && principal.accessible_field_ids.len() > self.config.inclusion_limit;
        let memberships = if oversized {
            // The builder does not chunk; split the accessible set here.
            let accessible: Vec<String> = principal.accessible_field_ids.iter().cloned().collect();
            let tenant = builder.tenant_predicate();
            fetch_chunked(&accessible, self.config.scope_chunk_size, |chunk| {
                self.run_query(Query::new(
                    collection.clone(),
                    vec![
                        tenant.clone(),
                        campaign_filter.clone(),
                        Predicate::in_values(FIELD_ID, chunk),
                    ],
                ))
            })
            .await?
        } else {
            match builder.build() {
                ScopedPredicates::Query(predicates) => {
                    self.run_query(
                        Query::new(collection.clone(), predicates).with(campaign_filter.clone()),
                    )
                    .await?
                }
                ScopedPredicates::NoAccess => Vec::new(),
            }
        };

        let resolved: BTreeSet<String> = memberships
            .iter()
            .filter_map(|doc| doc.get_str(FIELD_ID))
            .map(String::from)
            .collect();
        let field_ids = principal.restrict_fields(&resolved);

        let written = self.cache.put_all(&collection, memberships).await?;
        run.record(PrimingStage::ScopeResolution, PhaseOutcome::Complete, written, started);
        Ok(field_ids)
    }

    async fn operational_phase(
        &self,
        run: &mut PrimingRun<'_>,
        scope: &Scope,
        since: Option<Predicate>,
    ) -> Result<HistoryParents> {
        let started = Instant::now();
        run.enter(PrimingStage::ScopedOperational);
        let principal = run.principal;
        let tenant = SecurityScopeBuilder::for_principal(principal).tenant_predicate();
        let field_ids: Vec<String> = scope.field_ids.iter().cloned().collect();
        let chunk_size = self.config.field_chunk_size;
        let campaign = Predicate::eq(CAMPAIGN_ID, scope.campaign_id.as_str());
        let today = self.clock.today().format("%Y-%m-%d").to_string();

        let plots = fetch_chunked(&field_ids, chunk_size, |chunk| {
            self.run_query(
                Query::new(
                    CollectionPath::root(PLOTS),
                    vec![tenant.clone(), Predicate::in_values(FIELD_ID, chunk)],
                )
                .with_all(since.clone()),
            )
        });

        // Incremental runs drop status filters: a document that left the
        // active statuses since the checkpoint must still overwrite its
        // cached copy.
        let incremental = since.is_some();
        let silo_bag_statuses = status_filters(incremental, &[SILO_BAG_ACTIVE_STATUS]);
        let session_statuses = status_filters(incremental, &OPEN_SESSION_STATUSES);
        let order_statuses = status_filters(incremental, &ACTIVE_LOGISTICS_STATUSES);

        // One query per status keeps a single inclusion predicate per query.
        let per_status = |base: Query, statuses: &[Option<Predicate>], extra: Option<Predicate>| {
            let queries: Vec<Query> = statuses
                .iter()
                .map(|status| {
                    base.clone()
                        .with_all(status.clone())
                        .with_all(extra.clone())
                        .with_all(since.clone())
                })
                .collect();
            async move {
                let groups = try_join_all(queries.into_iter().map(|q| self.run_query(q))).await?;
                Ok::<Vec<Document>, Error>(groups.into_iter().flatten().collect())
            }
        };

        let silo_bags = fetch_chunked(&field_ids, chunk_size, |chunk| {
            per_status(
                Query::new(
                    CollectionPath::root(SILO_BAGS),
                    vec![tenant.clone(), campaign.clone()],
                ),
                &silo_bag_statuses,
                Some(Predicate::in_values(FIELD_ID, chunk)),
            )
        });

        let sessions = fetch_chunked(&field_ids, chunk_size, |chunk| {
            per_status(
                Query::new(
                    CollectionPath::root(HARVEST_SESSIONS),
                    vec![tenant.clone(), campaign.clone()],
                ),
                &session_statuses,
                Some(Predicate::in_values(FIELD_ID, chunk)),
            )
        });

        let orders_today = Query::new(
            CollectionPath::root(LOGISTICS_ORDERS),
            vec![tenant.clone(), Predicate::eq(DATE, today.as_str())],
        );
        let logistics = async {
            if principal.is_unrestricted() {
                per_status(orders_today.clone(), &order_statuses, None).await
            } else {
                fetch_chunked(&field_ids, chunk_size, |chunk| {
                    per_status(
                        orders_today.clone(),
                        &order_statuses,
                        Some(Predicate::in_values(FIELD_ID, chunk)),
                    )
                })
                .await
            }
        };

        let (plots, silo_bags, sessions, orders) =
            futures::try_join!(plots, silo_bags, sessions, logistics)?;

        let mut parents = HistoryParents {
            session_ids: sessions.iter().map(|doc| doc.id.clone()).collect(),
            silo_bag_ids: silo_bags.iter().map(|doc| doc.id.clone()).collect(),
        };

        let mut fetched = 0;
        for (name, docs) in [
            (PLOTS, plots),
            (SILO_BAGS, silo_bags),
            (HARVEST_SESSIONS, sessions),
            (LOGISTICS_ORDERS, orders),
        ] {
            let written = self.cache.put_all(&CollectionPath::root(name), docs).await?;
            run.metrics.operational_counts.insert(name.to_string(), written);
            fetched += written;
        }

        if incremental {
            // The cache now holds every parent's current status, including
            // unchanged parents whose history still moves.
            parents.session_ids =
                self.cached_parents(HARVEST_SESSIONS, scope, &OPEN_SESSION_STATUSES)?;
            parents.silo_bag_ids =
                self.cached_parents(SILO_BAGS, scope, &[SILO_BAG_ACTIVE_STATUS])?;
        }

        run.record(PrimingStage::ScopedOperational, PhaseOutcome::Complete, fetched, started);
        Ok(parents)
    }

    /// Cached documents of `collection` that belong to `scope` and currently
    /// have one of `statuses`.
    fn cached_parents(
        &self,
        collection: &str,
        scope: &Scope,
        statuses: &[&str],
    ) -> Result<Vec<String>> {
        let cached = self.cache.list(&CollectionPath::root(collection))?;
        let ids: BTreeSet<String> = cached
            .into_iter()
            .filter(|doc| doc.get_str(CAMPAIGN_ID) == Some(scope.campaign_id.as_str()))
            .filter(|doc| {
                doc.get_str(FIELD_ID)
                    .is_some_and(|field| scope.field_ids.contains(field))
            })
            .filter(|doc| doc.get_str(STATUS).is_some_and(|status| statuses.contains(&status)))
            .map(|doc| doc.id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn history_phase(&self, run: &mut PrimingRun<'_>, parents: &HistoryParents) -> Result<()> {
        let started = Instant::now();
        run.enter(PrimingStage::RecentHistory);
        let tenant = SecurityScopeBuilder::for_principal(run.principal).tenant_predicate();
        let limit = self.config.history_limit;

        let history_query = |parent: &str, parent_id: String, name: &str, order_field: &str| {
            Query::new(
                CollectionPath::nested(parent, parent_id, name),
                vec![
                    tenant.clone(),
                    Predicate::order_by(order_field, SortDirection::Descending),
                    Predicate::limit(limit),
                ],
            )
        };

        let registers = fetch_each_best_effort(&parents.session_ids, |session_id| {
            self.run_query(history_query(
                HARVEST_SESSIONS,
                session_id,
                SESSION_REGISTERS,
                CREATED_AT,
            ))
        });
        let movements = fetch_each_best_effort(&parents.silo_bag_ids, |bag_id| {
            self.run_query(history_query(SILO_BAGS, bag_id, SILO_BAG_MOVEMENTS, DATE))
        });
        let (registers, movements): (BestEffortBatch<Document>, BestEffortBatch<Document>) =
            futures::join!(registers, movements);

        let mut skipped = Vec::new();
        let mut fetched = 0;
        for (parent, name, batch) in [
            (HARVEST_SESSIONS, SESSION_REGISTERS, registers),
            (SILO_BAGS, SILO_BAG_MOVEMENTS, movements),
        ] {
            let mut count = 0;
            for (parent_id, docs) in batch.results {
                count += self
                    .cache
                    .put_all(&CollectionPath::nested(parent, parent_id, name), docs)
                    .await?;
            }
            skipped.extend(
                batch
                    .skipped
                    .into_iter()
                    .map(|id| CollectionPath::nested(parent, id, name).to_string()),
            );
            run.metrics.history_counts.insert(name.to_string(), count);
            fetched += count;
        }

        let outcome = if skipped.is_empty() {
            PhaseOutcome::Complete
        } else {
            debug!(
                "[Priming] Recent history skipped for {} parent(s): {}",
                skipped.len(),
                skipped.join(", ")
            );
            PhaseOutcome::PartialWithSkips(skipped)
        };
        run.record(PrimingStage::RecentHistory, outcome, fetched, started);
        Ok(())
    }

    async fn commit(
        &self,
        mut run: PrimingRun<'_>,
        scope: Option<&Scope>,
        reason: PrimingEndReason,
    ) -> Result<PrimingMetrics> {
        let started = Instant::now();
        run.enter(PrimingStage::CheckpointCommit);
        let tenant_id = run.principal.tenant_id.clone();

        let fingerprint = scope.map(Scope::fingerprint).unwrap_or_default();
        if let Err(err) = self
            .state
            .set(&SyncStateKeys::scope_fingerprint(&tenant_id), fingerprint)
            .await
        {
            return Err(self.fail(run, PrimingStage::CheckpointCommit, err));
        }

        // The run's start instant: anything written while the run was in
        // flight is picked up again next time.
        let checkpoint =
            match advance_checkpoint(self.state.as_ref(), &tenant_id, run.metrics.started_at).await
            {
                Ok(value) => value,
                Err(err) => return Err(self.fail(run, PrimingStage::CheckpointCommit, err)),
            };

        run.record(PrimingStage::CheckpointCommit, PhaseOutcome::Complete, 0, started);
        run.metrics.checkpoint = Some(checkpoint);
        run.metrics.end_reason = Some(reason);
        run.metrics.duration_ms = run.started.elapsed().as_millis() as i64;

        info!(
            "[Priming] Completed tenant={} variant={:?} mode={:?} reason={:?} fields={} reference={} operational={} history={} skipped={} duration_ms={}",
            tenant_id,
            run.metrics.variant,
            run.metrics.mode,
            reason,
            run.metrics.field_count,
            run.metrics.reference_counts.values().sum::<usize>(),
            run.metrics.operational_total(),
            run.metrics.history_total(),
            run.metrics.skipped_history().len(),
            run.metrics.duration_ms
        );
        Ok(run.metrics)
    }

    fn fail(&self, mut run: PrimingRun<'_>, stage: PrimingStage, err: Error) -> Error {
        let message = err.to_string();
        run.record_failure(stage, &message);
        warn!(
            "[Priming] Run aborted during {} for tenant {} after {}ms: {}",
            stage,
            run.principal.tenant_id,
            run.started.elapsed().as_millis(),
            message
        );
        Error::Priming { stage, message }
    }
}
