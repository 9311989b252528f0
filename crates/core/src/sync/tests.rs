use super::*;
use crate::cache::{EntityCache, InMemoryEntityCache};
use crate::clock::ManualClock;
use crate::config::SyncConfig;
use crate::context::SyncContext;
use crate::errors::{Error, StoreError};
use crate::persistence::{read_checkpoint, InMemorySyncStateStore, SyncStateKeys, SyncStateStore};
use crate::security::{Principal, PrincipalProvider, Role, StaticPrincipalProvider, TENANT_FIELD};
use crate::store::{CollectionPath, InMemoryDocumentStore, Predicate, Query};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

const TENANT: &str = "T1";

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
}

struct Harness {
    store: Arc<InMemoryDocumentStore>,
    cache: Arc<InMemoryEntityCache>,
    state: Arc<InMemorySyncStateStore>,
    principals: Arc<StaticPrincipalProvider>,
    clock: Arc<ManualClock>,
    context: Arc<SyncContext>,
}

impl Harness {
    fn new(principal: Option<Principal>) -> Self {
        Self::with_config(principal, SyncConfig::default())
    }

    fn with_config(principal: Option<Principal>, config: SyncConfig) -> Self {
        let store = Arc::new(InMemoryDocumentStore::new(config.inclusion_limit));
        let cache = Arc::new(InMemoryEntityCache::new());
        let state = Arc::new(InMemorySyncStateStore::new());
        let principals = Arc::new(StaticPrincipalProvider::new(principal));
        let clock = Arc::new(ManualClock::new(start_time()));
        let context = Arc::new(SyncContext::new(
            config,
            store.clone(),
            cache.clone(),
            state.clone(),
            principals.clone(),
            clock.clone(),
        ));
        Self {
            store,
            cache,
            state,
            principals,
            clock,
            context,
        }
    }

    fn put(&self, path: &CollectionPath, id: &str, mut body: Value) {
        if let Value::Object(map) = &mut body {
            map.entry(TENANT_FIELD)
                .or_insert_with(|| Value::String(TENANT.to_string()));
        }
        self.store.upsert_json(path, id, body).expect("seed");
    }

    fn seed_root(&self, collection: &str, id: &str, body: Value) {
        self.put(&CollectionPath::root(collection), id, body);
    }

    /// Tenant T1 with active campaign C1 over fields F1 and F2, plus a
    /// foreign tenant's crop that must never be fetched.
    fn seed_tenant(&self) {
        let old = "2026-10-01T08:00:00.000Z";
        for collection in ReferenceCollection::ALL {
            self.seed_root(
                collection.collection_name(),
                &format!("{}-1", collection.collection_name()),
                json!({"name": "ref", "updatedAt": old}),
            );
        }
        self.seed_root("crops", "foreign", json!({"tenantId": "T2", "updatedAt": old}));

        self.seed_root(CAMPAIGNS, "C1", json!({"active": true, "updatedAt": old}));
        self.seed_root(CAMPAIGNS, "C0", json!({"active": false, "updatedAt": old}));
        self.seed_root(CAMPAIGN_FIELDS, "m1", json!({"campaignId": "C1", "fieldId": "F1"}));
        self.seed_root(CAMPAIGN_FIELDS, "m2", json!({"campaignId": "C1", "fieldId": "F2"}));

        self.seed_root(PLOTS, "P1", json!({"fieldId": "F1", "updatedAt": old}));
        self.seed_root(PLOTS, "P2", json!({"fieldId": "F2", "updatedAt": old}));
        self.seed_root(
            SILO_BAGS,
            "B1",
            json!({"campaignId": "C1", "fieldId": "F1", "status": "active", "updatedAt": old}),
        );
        self.seed_root(
            SILO_BAGS,
            "B2",
            json!({"campaignId": "C1", "fieldId": "F2", "status": "active", "updatedAt": old}),
        );
        self.seed_root(
            SILO_BAGS,
            "B9",
            json!({"campaignId": "C1", "fieldId": "F1", "status": "closed", "updatedAt": old}),
        );
        for (id, field, status) in [
            ("S1", "F1", "open"),
            ("S7", "F1", "in_progress"),
            ("S2", "F2", "open"),
            ("S3", "F1", "closed"),
        ] {
            self.seed_root(
                HARVEST_SESSIONS,
                id,
                json!({"campaignId": "C1", "fieldId": field, "status": status, "updatedAt": old}),
            );
        }
        self.seed_root(
            LOGISTICS_ORDERS,
            "L1",
            json!({"fieldId": "F1", "date": "2026-10-19", "status": "pending", "updatedAt": old}),
        );
        self.seed_root(
            LOGISTICS_ORDERS,
            "L2",
            json!({"fieldId": "F2", "date": "2026-10-18", "status": "pending", "updatedAt": old}),
        );

        for session in ["S1", "S7", "S2"] {
            for n in 0..3 {
                self.put(
                    &CollectionPath::nested(HARVEST_SESSIONS, session, SESSION_REGISTERS),
                    &format!("{session}-r{n}"),
                    json!({"createdAt": format!("2026-10-1{n}T10:00:00Z")}),
                );
            }
        }
        self.put(
            &CollectionPath::nested(SILO_BAGS, "B1", SILO_BAG_MOVEMENTS),
            "B1-m0",
            json!({"date": "2026-10-18"}),
        );
    }

    async fn prime(&self) -> crate::Result<PrimingMetrics> {
        let principal = self.principals.current_principal().expect("principal");
        let permit = self.context.sync_lock().try_acquire().expect("permit");
        self.context
            .priming()
            .prime_tenant(&permit, &principal)
            .await
    }

    fn checkpoint(&self) -> Option<DateTime<Utc>> {
        read_checkpoint(self.state.as_ref(), TENANT).expect("checkpoint")
    }

    fn queries_for(&self, collection: &str) -> Vec<Query> {
        self.store
            .issued_queries()
            .into_iter()
            .filter(|q| q.collection == CollectionPath::root(collection))
            .collect()
    }

    fn cached_ids(&self, path: &CollectionPath) -> BTreeSet<String> {
        self.cache
            .list(path)
            .expect("list")
            .into_iter()
            .map(|doc| doc.id)
            .collect()
    }
}

fn admin() -> Principal {
    Principal::new(TENANT, Role::parse("super-admin"), Vec::<String>::new())
}

fn restricted(fields: &[&str]) -> Principal {
    Principal::new(TENANT, Role::Operator, fields.iter().copied())
}

fn inclusion_values(query: &Query) -> Vec<BTreeSet<String>> {
    query
        .predicates
        .iter()
        .filter_map(|p| match p {
            Predicate::In { values, .. } => Some(
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn ids(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test]
async fn restricted_principal_only_ever_queries_accessible_fields() {
    let h = Harness::new(Some(restricted(&["F1"])));
    h.seed_tenant();

    let metrics = h.prime().await.expect("prime");
    assert_eq!(metrics.end_reason, Some(PrimingEndReason::Completed));
    assert_eq!(metrics.field_count, 1);

    for collection in [PLOTS, SILO_BAGS, HARVEST_SESSIONS, LOGISTICS_ORDERS] {
        let queries = h.queries_for(collection);
        assert!(!queries.is_empty(), "{collection} was never queried");
        for query in queries {
            let inclusions = inclusion_values(&query);
            assert_eq!(inclusions.len(), 1, "{collection}: {query:?}");
            assert_eq!(inclusions[0], ids(&["F1"]), "{collection}");
        }
    }

    assert_eq!(h.cached_ids(&CollectionPath::root(PLOTS)), ids(&["P1"]));
    assert_eq!(h.cached_ids(&CollectionPath::root(SILO_BAGS)), ids(&["B1"]));
    assert_eq!(
        h.cached_ids(&CollectionPath::root(HARVEST_SESSIONS)),
        ids(&["S1", "S7"])
    );
    assert_eq!(h.cached_ids(&CollectionPath::root(LOGISTICS_ORDERS)), ids(&["L1"]));
}

#[tokio::test]
async fn unrestricted_principal_sees_every_campaign_field() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();

    let metrics = h.prime().await.expect("prime");
    assert_eq!(metrics.field_count, 2);
    assert_eq!(metrics.operational_counts.get(PLOTS), Some(&2));
    assert_eq!(metrics.operational_counts.get(HARVEST_SESSIONS), Some(&3));
    // Logistics for admins is tenant-wide: only today's pending order.
    assert_eq!(h.cached_ids(&CollectionPath::root(LOGISTICS_ORDERS)), ids(&["L1"]));
    for query in h.queries_for(LOGISTICS_ORDERS) {
        assert!(inclusion_values(&query).is_empty());
    }
    // Scope resolution for admins carries no field inclusion.
    for query in h.queries_for(CAMPAIGN_FIELDS) {
        assert!(inclusion_values(&query).is_empty());
    }
}

#[tokio::test]
async fn every_issued_query_carries_exactly_one_tenant_predicate() {
    for principal in [admin(), restricted(&["F1", "F2"])] {
        let h = Harness::new(Some(principal));
        h.seed_tenant();
        h.prime().await.expect("prime");

        let issued = h.store.issued_queries();
        assert!(issued.len() > 10);
        for query in issued {
            let tenant: Vec<&Predicate> = query
                .predicates
                .iter()
                .filter(|p| matches!(p, Predicate::Eq { field, .. } if field == TENANT_FIELD))
                .collect();
            assert_eq!(tenant, vec![&Predicate::eq(TENANT_FIELD, TENANT)], "{query:?}");
        }
        assert!(h
            .cache
            .get(&CollectionPath::root("crops"), "foreign")
            .expect("get")
            .is_none());
    }
}

#[tokio::test]
async fn no_active_campaign_completes_without_scoped_fetches() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    h.seed_root(CAMPAIGNS, "C1", json!({"active": false}));

    let metrics = h.prime().await.expect("prime");
    assert_eq!(metrics.end_reason, Some(PrimingEndReason::NoActiveCampaign));
    assert_eq!(metrics.operational_total(), 0);
    assert_eq!(metrics.history_total(), 0);
    assert!(metrics.errors.is_empty());
    assert!(metrics.phase(PrimingStage::ScopedOperational).is_none());
    assert!(metrics.phase(PrimingStage::RecentHistory).is_none());
    for collection in [CAMPAIGN_FIELDS, PLOTS, SILO_BAGS, HARVEST_SESSIONS, LOGISTICS_ORDERS] {
        assert!(h.queries_for(collection).is_empty(), "{collection}");
    }
    assert_eq!(h.checkpoint(), Some(start_time()));
    assert_eq!(metrics.reference_counts.get("crops"), Some(&1));
}

#[tokio::test]
async fn restricted_principal_outside_campaign_fields_ends_early() {
    let h = Harness::new(Some(restricted(&["F9"])));
    h.seed_tenant();

    let metrics = h.prime().await.expect("prime");
    assert_eq!(metrics.end_reason, Some(PrimingEndReason::NoAccessibleFields));
    assert_eq!(metrics.field_count, 0);
    assert!(h.queries_for(PLOTS).is_empty());
    assert!(h.checkpoint().is_some());
}

#[tokio::test]
async fn failed_register_history_is_skipped_and_checkpoint_still_commits() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let s7_registers = CollectionPath::nested(HARVEST_SESSIONS, "S7", SESSION_REGISTERS);
    h.store
        .fail_path(s7_registers.clone(), StoreError::unavailable("register history offline"));

    let metrics = h.prime().await.expect("prime");
    assert_eq!(metrics.end_reason, Some(PrimingEndReason::Completed));
    assert_eq!(metrics.skipped_history(), vec![s7_registers.to_string()]);
    assert_eq!(metrics.checkpoint, Some(start_time()));
    assert_eq!(h.checkpoint(), Some(start_time()));

    assert!(h.cached_ids(&s7_registers).is_empty());
    assert_eq!(
        h.cached_ids(&CollectionPath::nested(HARVEST_SESSIONS, "S1", SESSION_REGISTERS))
            .len(),
        3
    );
    assert_eq!(
        h.cached_ids(&CollectionPath::nested(SILO_BAGS, "B1", SILO_BAG_MOVEMENTS)),
        ids(&["B1-m0"])
    );
}

#[tokio::test]
async fn recent_history_is_bounded_and_newest_first() {
    let config = SyncConfig {
        history_limit: 2,
        ..SyncConfig::default()
    };
    let h = Harness::with_config(Some(admin()), config);
    h.seed_tenant();

    h.prime().await.expect("prime");
    let cached = h.cached_ids(&CollectionPath::nested(HARVEST_SESSIONS, "S1", SESSION_REGISTERS));
    assert_eq!(cached, ids(&["S1-r1", "S1-r2"]));
}

#[tokio::test]
async fn re_priming_without_remote_changes_leaves_cache_identical() {
    let h = Harness::new(Some(restricted(&["F1", "F2"])));
    h.seed_tenant();

    h.prime().await.expect("first prime");
    let first = h.cache.dump().expect("dump");
    h.clock.advance(Duration::minutes(30));
    let second = h.prime().await.expect("second prime");

    assert_eq!(second.mode, PrimingMode::Incremental);
    assert_eq!(h.cache.dump().expect("dump"), first);
}

#[tokio::test]
async fn incremental_run_fetches_only_changed_entities() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    h.prime().await.expect("bootstrap");

    h.clock.advance(Duration::hours(1));
    h.seed_root(
        PLOTS,
        "P2",
        json!({"fieldId": "F2", "name": "renamed", "updatedAt": "2026-10-19T12:30:00.000Z"}),
    );
    h.store.reset_query_log();

    let metrics = h.prime().await.expect("incremental");
    assert_eq!(metrics.mode, PrimingMode::Incremental);
    assert_eq!(metrics.operational_counts.get(PLOTS), Some(&1));
    for query in h.queries_for(PLOTS) {
        assert!(query
            .predicates
            .contains(&Predicate::gt(UPDATED_AT, "2026-10-19T12:00:00.000Z")));
    }
    // Scope resolution is never incremental.
    for query in h.queries_for(CAMPAIGN_FIELDS) {
        assert!(!query.predicates.iter().any(|p| matches!(p, Predicate::Gt { .. })));
    }
    let plot = h
        .cache
        .get(&CollectionPath::root(PLOTS), "P2")
        .expect("get")
        .expect("cached");
    assert_eq!(plot.get_str("name"), Some("renamed"));
}

#[tokio::test]
async fn widened_scope_refetches_operational_entities_in_full() {
    let h = Harness::new(Some(restricted(&["F1"])));
    h.seed_tenant();
    h.prime().await.expect("first");
    assert_eq!(h.cached_ids(&CollectionPath::root(PLOTS)), ids(&["P1"]));

    h.principals.set(Some(restricted(&["F1", "F2"])));
    h.clock.advance(Duration::hours(1));
    h.store.reset_query_log();

    let metrics = h.prime().await.expect("second");
    assert_eq!(metrics.mode, PrimingMode::Incremental);
    for query in h.queries_for(PLOTS) {
        assert!(!query.predicates.iter().any(|p| matches!(p, Predicate::Gt { .. })));
    }
    assert_eq!(h.cached_ids(&CollectionPath::root(PLOTS)), ids(&["P1", "P2"]));
    assert_eq!(
        h.state
            .get(&SyncStateKeys::scope_fingerprint(TENANT))
            .expect("fingerprint")
            .as_deref(),
        Some("C1|F1,F2")
    );
}

#[tokio::test]
async fn checkpoint_advances_on_success_and_is_untouched_on_failure() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();

    h.prime().await.expect("first");
    let first = h.checkpoint().expect("checkpoint");

    h.clock.advance(Duration::hours(1));
    h.store
        .fail_path(CollectionPath::root(PLOTS), StoreError::api(503, "busy"));
    let err = h.prime().await.expect_err("operational failure");
    assert!(matches!(
        err,
        Error::Priming {
            stage: PrimingStage::ScopedOperational,
            ..
        }
    ));
    assert_eq!(h.checkpoint(), Some(first));

    h.store.clear_failures();
    h.store
        .fail_path(CollectionPath::root("crops"), StoreError::unavailable("offline"));
    let err = h.prime().await.expect_err("reference failure");
    assert!(matches!(
        err,
        Error::Priming {
            stage: PrimingStage::Reference,
            ..
        }
    ));
    assert_eq!(h.checkpoint(), Some(first));

    h.store.clear_failures();
    h.prime().await.expect("recovered");
    let second = h.checkpoint().expect("checkpoint");
    assert!(second >= first);
    assert_eq!(second, start_time() + Duration::hours(1));
}

#[tokio::test]
async fn checkpoint_never_moves_backwards_when_clock_does() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    h.prime().await.expect("first");

    h.clock.set(start_time() - Duration::days(1));
    let metrics = h.prime().await.expect("second");
    assert_eq!(metrics.checkpoint, Some(start_time()));
    assert_eq!(h.checkpoint(), Some(start_time()));
}

#[tokio::test]
async fn oversized_accessible_set_is_chunked_for_scope_resolution() {
    let mut fields: Vec<String> = (0..45).map(|i| format!("X{i}")).collect();
    fields.push("F1".to_string());
    let principal = Principal::new(TENANT, Role::Manager, fields);
    let h = Harness::new(Some(principal));
    h.seed_tenant();

    let metrics = h.prime().await.expect("prime");
    assert_eq!(metrics.field_count, 1);
    let scope_queries = h.queries_for(CAMPAIGN_FIELDS);
    assert_eq!(scope_queries.len(), 2);
    for query in &scope_queries {
        assert!(query.max_inclusion_len() <= 30);
    }
    for query in h.store.issued_queries() {
        assert!(query.max_inclusion_len() <= 30);
    }
}

#[tokio::test]
async fn prime_scope_skips_reference_and_scope_phases() {
    let h = Harness::new(Some(restricted(&["F1"])));
    h.seed_tenant();
    let principal = restricted(&["F1"]);
    let permit = h.context.sync_lock().try_acquire().expect("permit");

    let metrics = h
        .context
        .priming()
        .prime_scope(&permit, &principal, &Scope::new("C1", ["F1", "F2"]))
        .await
        .expect("prime");
    assert_eq!(metrics.variant, PrimingVariant::Scoped);
    assert_eq!(metrics.field_count, 1);
    assert!(h.queries_for("crops").is_empty());
    assert!(h.queries_for(CAMPAIGN_FIELDS).is_empty());
    assert_eq!(h.cached_ids(&CollectionPath::root(PLOTS)), ids(&["P1"]));
}

// Scheduler

#[derive(Default)]
struct RecordingNotices(Mutex<Vec<SyncNotice>>);

impl RecordingNotices {
    fn take(&self) -> Vec<SyncNotice> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl SyncNoticeSink for RecordingNotices {
    fn notify(&self, notice: SyncNotice) {
        self.0.lock().unwrap().push(notice);
    }
}

fn scheduler(h: &Harness) -> (Arc<SyncScheduler>, Arc<RecordingNotices>) {
    let notices = Arc::new(RecordingNotices::default());
    let scheduler = SyncScheduler::new(h.context.clone()).with_notice_sink(notices.clone());
    (Arc::new(scheduler), notices)
}

#[tokio::test]
async fn manual_sync_is_rate_limited_for_an_hour() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let (scheduler, notices) = scheduler(&h);

    assert!(scheduler.request_manual_sync().await.is_completed());
    assert_eq!(notices.take(), vec![SyncNotice::Completed]);
    assert!(h
        .state
        .get(&SyncStateKeys::last_manual_attempt(TENANT))
        .expect("get")
        .is_some());

    h.clock.advance(Duration::minutes(10));
    h.store.reset_query_log();
    let retry_at = start_time() + Duration::minutes(60);
    assert_eq!(
        scheduler.request_manual_sync().await,
        SyncOutcome::RateLimited { retry_at }
    );
    assert_eq!(h.store.query_count(), 0);
    assert_eq!(notices.take(), vec![SyncNotice::RateLimited { retry_at }]);

    // Automatic syncs in between do not reopen the window.
    h.clock.advance(Duration::minutes(20));
    assert_eq!(
        scheduler.on_visibility_change(false).await,
        SyncOutcome::Skipped(SkipReason::NoTransition)
    );
    assert!(scheduler.on_visibility_change(true).await.is_completed());
    assert!(matches!(
        scheduler.request_manual_sync().await,
        SyncOutcome::RateLimited { .. }
    ));

    h.clock.set(start_time() + Duration::minutes(60));
    assert!(scheduler.request_manual_sync().await.is_completed());
}

#[tokio::test]
async fn manual_rate_limit_survives_a_scheduler_restart() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let (first, _) = scheduler(&h);
    assert!(first.request_manual_sync().await.is_completed());
    drop(first);

    h.clock.advance(Duration::minutes(5));
    let (second, _) = scheduler(&h);
    assert!(matches!(
        second.request_manual_sync().await,
        SyncOutcome::RateLimited { .. }
    ));
}

#[tokio::test]
async fn reconnect_and_visibility_respect_staleness_threshold() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let (scheduler, notices) = scheduler(&h);
    assert!(scheduler.on_app_start().await.is_completed());

    h.clock.advance(Duration::minutes(5));
    assert_eq!(
        scheduler.on_connectivity_change(false).await,
        SyncOutcome::Skipped(SkipReason::Offline)
    );
    assert_eq!(
        scheduler.on_connectivity_change(true).await,
        SyncOutcome::Skipped(SkipReason::NotStale)
    );
    scheduler.on_visibility_change(false).await;
    assert_eq!(
        scheduler.on_visibility_change(true).await,
        SyncOutcome::Skipped(SkipReason::NotStale)
    );

    h.clock.set(start_time() + Duration::minutes(20));
    scheduler.on_connectivity_change(false).await;
    assert!(scheduler.on_connectivity_change(true).await.is_completed());
    assert_eq!(
        scheduler.status().last_sync,
        Some(start_time() + Duration::minutes(20))
    );

    h.clock.advance(Duration::minutes(20));
    scheduler.on_visibility_change(false).await;
    assert!(scheduler.on_visibility_change(true).await.is_completed());

    // Automatic triggers never notify.
    assert!(notices.take().is_empty());
}

#[tokio::test]
async fn repeated_online_signal_is_not_a_reconnect() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let (scheduler, _) = scheduler(&h);
    assert_eq!(
        scheduler.on_connectivity_change(true).await,
        SyncOutcome::Skipped(SkipReason::NoTransition)
    );
    assert_eq!(h.store.query_count(), 0);
}

#[tokio::test]
async fn app_start_syncs_once_per_day() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let (scheduler, _) = scheduler(&h);

    assert!(scheduler.on_app_start().await.is_completed());
    h.clock.advance(Duration::hours(2));
    assert_eq!(
        scheduler.on_app_start().await,
        SyncOutcome::Skipped(SkipReason::AlreadySyncedToday)
    );
    h.clock.advance(Duration::days(1));
    assert!(scheduler.on_app_start().await.is_completed());
    assert_eq!(
        h.state
            .get(&SyncStateKeys::last_sync_date(TENANT))
            .expect("get")
            .as_deref(),
        Some("2026-10-20")
    );
}

#[tokio::test]
async fn triggers_are_no_ops_offline_without_principal_or_while_syncing() {
    let h = Harness::new(None);
    h.seed_tenant();
    let (scheduler, notices) = scheduler(&h);

    assert_eq!(
        scheduler.on_app_start().await,
        SyncOutcome::Skipped(SkipReason::NoPrincipal)
    );

    h.principals.set(Some(admin()));
    let permit = h.context.sync_lock().try_acquire().expect("permit");
    assert!(scheduler.status().is_syncing);
    assert_eq!(
        scheduler.request_manual_sync().await,
        SyncOutcome::Skipped(SkipReason::AlreadySyncing)
    );
    drop(permit);

    scheduler.on_connectivity_change(false).await;
    assert_eq!(
        scheduler.request_manual_sync().await,
        SyncOutcome::Skipped(SkipReason::Offline)
    );
    assert_eq!(notices.take(), vec![SyncNotice::Offline]);
    assert_eq!(h.store.query_count(), 0);
}

#[tokio::test]
async fn failed_sync_sets_error_and_keeps_last_sync() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let (scheduler, notices) = scheduler(&h);
    assert!(scheduler.on_app_start().await.is_completed());
    let last_sync = scheduler.status().last_sync;

    h.clock.advance(Duration::days(1));
    h.store.set_available(false);
    let outcome = scheduler.request_manual_sync().await;
    assert!(matches!(outcome, SyncOutcome::Failed(_)));
    let status = scheduler.status();
    assert!(status.sync_error.is_some());
    assert_eq!(status.last_sync, last_sync);
    assert!(matches!(notices.take().as_slice(), [SyncNotice::Failed { .. }]));

    // A failed manual attempt does not consume the rate-limit window.
    h.store.set_available(true);
    assert!(scheduler.request_manual_sync().await.is_completed());
    assert!(scheduler.status().sync_error.is_none());
}

#[tokio::test]
async fn background_loop_reacts_to_signals() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let (scheduler, _) = scheduler(&h);
    let (signals, rx) = tokio::sync::mpsc::unbounded_channel();

    scheduler.ensure_background_started(rx).await;
    assert!(scheduler.is_background_running().await);
    signals.send(SyncSignal::Connectivity(false)).unwrap();
    signals.send(SyncSignal::Connectivity(true)).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while scheduler.status().last_sync.is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reconnect sync ran");

    scheduler.ensure_background_stopped().await;
    assert!(!scheduler.is_background_running().await);
}

// Reference data

#[tokio::test]
async fn reference_store_primes_the_derived_scope_and_reacts_to_membership_changes() {
    let h = Harness::new(Some(restricted(&["F1", "F3"])));
    h.seed_tenant();
    let store = ReferenceDataStore::new(h.context.clone());
    let mut handle = store.start(restricted(&["F1", "F3"])).expect("start");

    let loaded = handle.wait_until_loaded().await.expect("loaded");
    assert_eq!(loaded.scope, Some(Scope::new("C1", ["F1"])));
    assert_eq!(loaded.reference.len(), ReferenceCollection::ALL.len());
    assert_eq!(loaded.active_campaign.map(|doc| doc.id).as_deref(), Some("C1"));
    let first = loaded.last_prime.expect("primed");
    assert_eq!(first.variant, PrimingVariant::Scoped);
    assert_eq!(h.cached_ids(&CollectionPath::root(PLOTS)), ids(&["P1"]));

    h.seed_root(CAMPAIGN_FIELDS, "m3", json!({"campaignId": "C1", "fieldId": "F3"}));
    h.seed_root(PLOTS, "P3", json!({"fieldId": "F3", "updatedAt": "2026-10-01T08:00:00.000Z"}));
    let widened = handle
        .wait_for(|snapshot| {
            snapshot
                .last_prime
                .as_ref()
                .is_some_and(|metrics| metrics.field_count == 2)
        })
        .await
        .expect("re-primed");
    assert_eq!(widened.scope, Some(Scope::new("C1", ["F1", "F3"])));
    assert!(widened.last_error.is_none());
    assert_eq!(h.cached_ids(&CollectionPath::root(PLOTS)), ids(&["P1", "P3"]));

    handle.stop();
}

#[tokio::test]
async fn reference_store_finishes_loading_without_a_campaign() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    h.seed_root(CAMPAIGNS, "C1", json!({"active": false}));
    let store = ReferenceDataStore::new(h.context.clone());
    let mut handle = store.start(admin()).expect("start");

    let loaded = handle.wait_until_loaded().await.expect("loaded");
    assert!(loaded.active_campaign.is_none());
    assert!(loaded.scope.is_none());
    assert!(loaded.last_prime.is_none());
    assert!(h.queries_for(PLOTS).is_empty());
    assert_eq!(
        h.cache
            .count(&CollectionPath::root("crops"))
            .expect("count"),
        1
    );
}

#[tokio::test]
async fn reference_store_reports_failed_prime_and_still_finishes_loading() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    h.store
        .fail_path(CollectionPath::root(PLOTS), StoreError::unavailable("offline"));
    let store = ReferenceDataStore::new(h.context.clone());
    let mut handle = store.start(admin()).expect("start");

    let loaded = handle.wait_until_loaded().await.expect("loaded");
    assert!(loaded.last_prime.is_none());
    assert!(loaded
        .last_error
        .as_deref()
        .is_some_and(|message| message.contains("scoped_operational")));
    assert!(h.checkpoint().is_none());
}

#[tokio::test]
async fn incremental_run_picks_up_closed_parents_and_stops_their_history() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    h.prime().await.expect("bootstrap");

    h.clock.advance(Duration::hours(1));
    let changed = "2026-10-19T12:30:00.000Z";
    h.seed_root(
        HARVEST_SESSIONS,
        "S1",
        json!({"campaignId": "C1", "fieldId": "F1", "status": "closed", "updatedAt": changed}),
    );
    h.seed_root(
        SILO_BAGS,
        "B1",
        json!({"campaignId": "C1", "fieldId": "F1", "status": "closed", "updatedAt": changed}),
    );
    h.store.reset_query_log();

    let metrics = h.prime().await.expect("incremental");
    assert_eq!(metrics.mode, PrimingMode::Incremental);

    for collection in [HARVEST_SESSIONS, SILO_BAGS] {
        for query in h.queries_for(collection) {
            assert!(
                !query
                    .predicates
                    .iter()
                    .any(|p| matches!(p, Predicate::Eq { field, .. } if field == STATUS)),
                "{query:?}"
            );
            assert_eq!(inclusion_values(&query).len(), 1);
        }
    }
    for (collection, id) in [(HARVEST_SESSIONS, "S1"), (SILO_BAGS, "B1")] {
        let cached = h
            .cache
            .get(&CollectionPath::root(collection), id)
            .expect("get")
            .expect("cached");
        assert_eq!(cached.get_str(STATUS), Some("closed"));
    }

    let history_queries = |path: CollectionPath| {
        h.store
            .issued_queries()
            .into_iter()
            .filter(|q| q.collection == path)
            .count()
    };
    assert_eq!(
        history_queries(CollectionPath::nested(HARVEST_SESSIONS, "S1", SESSION_REGISTERS)),
        0
    );
    assert_eq!(
        history_queries(CollectionPath::nested(HARVEST_SESSIONS, "S7", SESSION_REGISTERS)),
        1
    );
    assert_eq!(
        history_queries(CollectionPath::nested(SILO_BAGS, "B1", SILO_BAG_MOVEMENTS)),
        0
    );
    assert_eq!(
        history_queries(CollectionPath::nested(SILO_BAGS, "B2", SILO_BAG_MOVEMENTS)),
        1
    );
}

#[tokio::test]
async fn scheduler_staleness_follows_checkpoints_of_scoped_runs() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let (scheduler, _) = scheduler(&h);
    assert!(scheduler.on_app_start().await.is_completed());

    h.clock.set(start_time() + Duration::minutes(20));
    {
        let permit = h.context.sync_lock().try_acquire().expect("permit");
        h.context
            .priming()
            .prime_scope(&permit, &admin(), &Scope::new("C1", ["F1", "F2"]))
            .await
            .expect("scoped prime");
    }
    assert_eq!(h.checkpoint(), Some(start_time() + Duration::minutes(20)));

    h.clock.set(start_time() + Duration::minutes(25));
    h.store.reset_query_log();
    scheduler.on_connectivity_change(false).await;
    assert_eq!(
        scheduler.on_connectivity_change(true).await,
        SyncOutcome::Skipped(SkipReason::NotStale)
    );
    assert_eq!(h.store.query_count(), 0);
    assert_eq!(
        scheduler.status().last_sync,
        Some(start_time() + Duration::minutes(20))
    );
}

#[tokio::test]
async fn reference_store_keeps_oversized_membership_feed_field_scoped() {
    let config = SyncConfig {
        inclusion_limit: 2,
        field_chunk_size: 2,
        scope_chunk_size: 2,
        ..SyncConfig::default()
    }
    .validated()
    .expect("config");
    let principal = restricted(&["F1", "F3", "F4"]);
    let h = Harness::with_config(Some(principal.clone()), config);
    h.seed_tenant();
    let store = ReferenceDataStore::new(h.context.clone());
    let mut handle = store.start(principal).expect("start");

    let loaded = handle.wait_until_loaded().await.expect("loaded");
    assert_eq!(loaded.scope, Some(Scope::new("C1", ["F1"])));
    assert_eq!(h.cached_ids(&CollectionPath::root(CAMPAIGN_FIELDS)), ids(&["m1"]));
    // Reference feeds, the active campaign, and two membership chunks.
    assert_eq!(
        h.store.subscriber_count(),
        ReferenceCollection::ALL.len() + 1 + 2
    );

    // Memberships from both chunks merge into one scope.
    h.seed_root(CAMPAIGN_FIELDS, "m4", json!({"campaignId": "C1", "fieldId": "F4"}));
    let widened = handle
        .wait_for(|snapshot| {
            snapshot
                .last_prime
                .as_ref()
                .is_some_and(|metrics| metrics.field_count == 2)
        })
        .await
        .expect("re-primed");
    assert_eq!(widened.scope, Some(Scope::new("C1", ["F1", "F4"])));
    assert_eq!(
        h.cached_ids(&CollectionPath::root(CAMPAIGN_FIELDS)),
        ids(&["m1", "m4"])
    );
    for query in h.store.issued_queries() {
        assert!(query.max_inclusion_len() <= 2, "{query:?}");
    }

    handle.stop();
}

#[tokio::test]
async fn reference_store_retries_a_failed_scoped_prime_on_the_next_snapshot() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    h.store
        .fail_path(CollectionPath::root(PLOTS), StoreError::unavailable("offline"));
    let store = ReferenceDataStore::new(h.context.clone());
    let mut handle = store.start(admin()).expect("start");

    let loaded = handle.wait_until_loaded().await.expect("loaded");
    assert!(loaded.last_error.is_some());
    assert!(h.checkpoint().is_none());

    h.store.clear_failures();
    h.seed_root(CAMPAIGN_FIELDS, "m1", json!({"campaignId": "C1", "fieldId": "F1"}));
    let recovered = handle
        .wait_for(|snapshot| snapshot.last_prime.is_some())
        .await
        .expect("retried");
    assert!(recovered.last_error.is_none());
    assert_eq!(recovered.scope, Some(Scope::new("C1", ["F1", "F2"])));
    assert!(h.checkpoint().is_some());

    handle.stop();
}

#[tokio::test]
async fn reference_store_waits_for_an_in_flight_sync_before_priming() {
    let h = Harness::new(Some(admin()));
    h.seed_tenant();
    let store = ReferenceDataStore::new(h.context.clone());
    let mut handle = store.start(admin()).expect("start");
    handle.wait_until_loaded().await.expect("loaded");

    let permit = h.context.sync_lock().try_acquire().expect("permit");
    h.store.reset_query_log();
    h.seed_root(CAMPAIGN_FIELDS, "m3", json!({"campaignId": "C1", "fieldId": "F3"}));

    handle
        .wait_for(|snapshot| snapshot.scope == Some(Scope::new("C1", ["F1", "F2", "F3"])))
        .await
        .expect("scope changed");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(h.queries_for(PLOTS).is_empty());
    assert_eq!(
        handle.snapshot().last_prime.map(|metrics| metrics.field_count),
        Some(2)
    );

    drop(permit);
    handle
        .wait_for(|snapshot| {
            snapshot
                .last_prime
                .as_ref()
                .is_some_and(|metrics| metrics.field_count == 3)
        })
        .await
        .expect("primed after release");
    assert!(!h.queries_for(PLOTS).is_empty());

    handle.stop();
}
