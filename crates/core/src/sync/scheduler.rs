//! Decides when a full-tenant priming run happens.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::model::PrimingMetrics;
use crate::context::SyncContext;
use crate::persistence::{
    read_checkpoint, read_date, read_timestamp, write_date, write_timestamp, SyncStateKeys,
};
use crate::security::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    DailyBoundary,
    Reconnect,
    VisibilityRegain,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    NoPrincipal,
    AlreadySyncing,
    NotStale,
    AlreadySyncedToday,
    /// The signal did not change state (e.g. online -> online).
    NoTransition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(Box<PrimingMetrics>),
    Failed(String),
    Skipped(SkipReason),
    /// Manual request declined; a new one is accepted from `retry_at`.
    RateLimited { retry_at: DateTime<Utc> },
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// User-facing messages. Only manual triggers produce them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncNotice {
    Completed,
    Failed { message: String },
    RateLimited { retry_at: DateTime<Utc> },
    Offline,
}

pub trait SyncNoticeSink: Send + Sync {
    fn notify(&self, notice: SyncNotice);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSyncNoticeSink;

impl SyncNoticeSink for NoOpSyncNoticeSink {
    fn notify(&self, _notice: SyncNotice) {}
}

/// Host signals consumed by the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    Connectivity(bool),
    Visibility(bool),
    ManualRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_syncing: bool,
    pub online: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_manual_attempt: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
}

#[derive(Debug)]
struct SchedulerState {
    online: bool,
    visible: bool,
    last_sync: Option<DateTime<Utc>>,
    last_manual_attempt: Option<DateTime<Utc>>,
    sync_error: Option<String>,
    /// Tenant whose persisted timestamps are mirrored above.
    loaded_for: Option<String>,
}

/// `true` when more than `threshold` has passed since `last_sync`, or when
/// there has never been a sync.
pub fn is_stale(
    last_sync: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> bool {
    match last_sync {
        Some(last) => now - last > threshold,
        None => true,
    }
}

/// When the next manual sync is allowed, if the window is still closed.
pub fn manual_retry_at(
    last_attempt: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Option<DateTime<Utc>> {
    let retry_at = last_attempt? + window;
    (now < retry_at).then_some(retry_at)
}

pub struct SyncScheduler {
    context: Arc<SyncContext>,
    notices: Arc<dyn SyncNoticeSink>,
    state: Mutex<SchedulerState>,
    background_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(context: Arc<SyncContext>) -> Self {
        Self {
            context,
            notices: Arc::new(NoOpSyncNoticeSink),
            state: Mutex::new(SchedulerState {
                online: true,
                visible: true,
                last_sync: None,
                last_manual_attempt: None,
                sync_error: None,
                loaded_for: None,
            }),
            background_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_notice_sink(mut self, notices: Arc<dyn SyncNoticeSink>) -> Self {
        self.notices = notices;
        self
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let is_syncing = self.context.sync_lock().is_syncing();
        if let Some(principal) = self.context.principals().current_principal() {
            if self.state().loaded_for.as_deref() == Some(principal.tenant_id.as_str()) {
                self.refresh_last_sync(&principal);
            }
        }
        let state = self.state();
        SchedulerStatus {
            is_syncing,
            online: state.online,
            last_sync: state.last_sync,
            last_manual_attempt: state.last_manual_attempt,
            sync_error: state.sync_error.clone(),
        }
    }

    /// Mirrors the persisted timestamps of `principal`'s tenant, once per tenant.
    fn ensure_loaded(&self, principal: &Principal) {
        if self.state().loaded_for.as_deref() == Some(principal.tenant_id.as_str()) {
            return;
        }
        let store = self.context.state();
        let tenant_id = &principal.tenant_id;
        let last_sync = read_checkpoint(store.as_ref(), tenant_id).unwrap_or_else(|err| {
            warn!("[SyncScheduler] Failed to read checkpoint: {}", err);
            None
        });
        let last_manual_attempt =
            read_timestamp(store.as_ref(), &SyncStateKeys::last_manual_attempt(tenant_id))
                .unwrap_or_else(|err| {
                    warn!("[SyncScheduler] Failed to read last manual attempt: {}", err);
                    None
                });

        let mut state = self.state();
        state.last_sync = last_sync;
        state.last_manual_attempt = last_manual_attempt;
        state.sync_error = None;
        state.loaded_for = Some(tenant_id.clone());
    }

    /// Pulls the persisted checkpoint into `last_sync`. Scoped runs started by
    /// the reference data store advance it without going through here.
    fn refresh_last_sync(&self, principal: &Principal) -> Option<DateTime<Utc>> {
        match read_checkpoint(self.context.state().as_ref(), &principal.tenant_id) {
            Ok(checkpoint) => {
                let mut state = self.state();
                if checkpoint > state.last_sync {
                    state.last_sync = checkpoint;
                }
                state.last_sync
            }
            Err(err) => {
                warn!("[SyncScheduler] Failed to read checkpoint: {}", err);
                self.state().last_sync
            }
        }
    }

    /// Common gates: online and signed in.
    fn ready_principal(&self) -> Result<Principal, SkipReason> {
        if !self.state().online {
            return Err(SkipReason::Offline);
        }
        let principal = self
            .context
            .principals()
            .current_principal()
            .ok_or(SkipReason::NoPrincipal)?;
        self.ensure_loaded(&principal);
        Ok(principal)
    }

    /// Daily boundary: syncs when today differs from the recorded last sync date.
    pub async fn on_app_start(&self) -> SyncOutcome {
        let principal = match self.ready_principal() {
            Ok(principal) => principal,
            Err(reason) => return SyncOutcome::Skipped(reason),
        };
        let today = self.context.clock().today();
        let key = SyncStateKeys::last_sync_date(&principal.tenant_id);
        let last_date = read_date(self.context.state().as_ref(), &key).unwrap_or_else(|err| {
            warn!("[SyncScheduler] Failed to read last sync date: {}", err);
            None
        });
        if last_date == Some(today) {
            debug!("[SyncScheduler] Already synced today ({})", today);
            return SyncOutcome::Skipped(SkipReason::AlreadySyncedToday);
        }
        self.run(SyncTrigger::DailyBoundary, principal).await
    }

    pub async fn on_connectivity_change(&self, online: bool) -> SyncOutcome {
        let was_online = std::mem::replace(&mut self.state().online, online);
        if !online {
            return SyncOutcome::Skipped(SkipReason::Offline);
        }
        if was_online {
            return SyncOutcome::Skipped(SkipReason::NoTransition);
        }
        self.run_if_stale(SyncTrigger::Reconnect).await
    }

    pub async fn on_visibility_change(&self, visible: bool) -> SyncOutcome {
        let was_visible = std::mem::replace(&mut self.state().visible, visible);
        if !visible || was_visible {
            return SyncOutcome::Skipped(SkipReason::NoTransition);
        }
        self.run_if_stale(SyncTrigger::VisibilityRegain).await
    }

    async fn run_if_stale(&self, trigger: SyncTrigger) -> SyncOutcome {
        let principal = match self.ready_principal() {
            Ok(principal) => principal,
            Err(reason) => return SyncOutcome::Skipped(reason),
        };
        let last_sync = self.refresh_last_sync(&principal);
        let now = self.context.clock().now();
        if !is_stale(last_sync, now, self.context.config().staleness_threshold()) {
            debug!(
                "[SyncScheduler] {:?} ignored: last sync at {:?} is fresh",
                trigger, last_sync
            );
            return SyncOutcome::Skipped(SkipReason::NotStale);
        }
        self.run(trigger, principal).await
    }

    /// User-invoked sync, rate limited independently of the staleness gate.
    pub async fn request_manual_sync(&self) -> SyncOutcome {
        let principal = match self.ready_principal() {
            Ok(principal) => principal,
            Err(SkipReason::Offline) => {
                self.notices.notify(SyncNotice::Offline);
                return SyncOutcome::Skipped(SkipReason::Offline);
            }
            Err(reason) => return SyncOutcome::Skipped(reason),
        };

        let now = self.context.clock().now();
        let last_attempt = self.state().last_manual_attempt;
        if let Some(retry_at) =
            manual_retry_at(last_attempt, now, self.context.config().manual_rate_limit())
        {
            info!(
                "[SyncScheduler] Manual sync declined; next allowed at {}",
                retry_at
            );
            self.notices.notify(SyncNotice::RateLimited { retry_at });
            return SyncOutcome::RateLimited { retry_at };
        }

        self.run(SyncTrigger::Manual, principal).await
    }

    async fn run(&self, trigger: SyncTrigger, principal: Principal) -> SyncOutcome {
        let Some(permit) = self.context.sync_lock().try_acquire() else {
            debug!("[SyncScheduler] {:?} ignored: sync already in flight", trigger);
            return SyncOutcome::Skipped(SkipReason::AlreadySyncing);
        };
        let attempted_at = self.context.clock().now();
        debug!(
            "[SyncScheduler] Starting {:?} sync for tenant {}",
            trigger, principal.tenant_id
        );

        let result = self
            .context
            .priming()
            .prime_tenant(&permit, &principal)
            .await;

        match result {
            Ok(metrics) => {
                self.record_success(trigger, &principal, attempted_at, metrics.checkpoint)
                    .await;
                drop(permit);
                if trigger == SyncTrigger::Manual {
                    self.notices.notify(SyncNotice::Completed);
                }
                SyncOutcome::Completed(Box::new(metrics))
            }
            Err(err) => {
                drop(permit);
                let message = err.to_string();
                warn!("[SyncScheduler] {:?} sync failed: {}", trigger, message);
                self.state().sync_error = Some(message.clone());
                if trigger == SyncTrigger::Manual {
                    self.notices.notify(SyncNotice::Failed {
                        message: message.clone(),
                    });
                }
                SyncOutcome::Failed(message)
            }
        }
    }

    async fn record_success(
        &self,
        trigger: SyncTrigger,
        principal: &Principal,
        attempted_at: DateTime<Utc>,
        checkpoint: Option<DateTime<Utc>>,
    ) {
        let store = self.context.state();
        let tenant_id = &principal.tenant_id;
        let today = self.context.clock().today();

        if let Err(err) =
            write_date(store.as_ref(), &SyncStateKeys::last_sync_date(tenant_id), today).await
        {
            warn!("[SyncScheduler] Failed to persist last sync date: {}", err);
        }
        if trigger == SyncTrigger::Manual {
            if let Err(err) = write_timestamp(
                store.as_ref(),
                &SyncStateKeys::last_manual_attempt(tenant_id),
                attempted_at,
            )
            .await
            {
                warn!("[SyncScheduler] Failed to persist manual attempt: {}", err);
            }
        }

        let mut state = self.state();
        if checkpoint.is_some() {
            state.last_sync = checkpoint;
        }
        if trigger == SyncTrigger::Manual {
            state.last_manual_attempt = Some(attempted_at);
        }
        state.sync_error = None;
    }

    pub async fn handle_signal(&self, signal: SyncSignal) -> SyncOutcome {
        match signal {
            SyncSignal::Connectivity(online) => self.on_connectivity_change(online).await,
            SyncSignal::Visibility(visible) => self.on_visibility_change(visible).await,
            SyncSignal::ManualRequest => self.request_manual_sync().await,
        }
    }

    /// Spawns the signal loop unless one is already running. The loop ends
    /// when every sender of `signals` is dropped.
    pub async fn ensure_background_started(
        self: &Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<SyncSignal>,
    ) {
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
            guard.take();
        }

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let outcome = scheduler.handle_signal(signal).await;
                debug!("[SyncScheduler] {:?} -> {:?}", signal, outcome);
            }
            debug!("[SyncScheduler] Signal channel closed; background loop exiting");
        });
        *guard = Some(handle);
    }

    pub async fn ensure_background_stopped(&self) {
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    pub async fn is_background_running(&self) -> bool {
        self.background_task
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}
