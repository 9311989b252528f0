//! Collaborators shared by the scheduler and the reference data store.

use std::sync::Arc;

use crate::cache::EntityCache;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::persistence::SyncStateStore;
use crate::security::PrincipalProvider;
use crate::store::DocumentStore;
use crate::sync::{PrimingService, SyncLock};

pub struct SyncContext {
    config: SyncConfig,
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn EntityCache>,
    state: Arc<dyn SyncStateStore>,
    principals: Arc<dyn PrincipalProvider>,
    clock: Arc<dyn Clock>,
    sync_lock: Arc<SyncLock>,
    priming: Arc<PrimingService>,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn EntityCache>,
        state: Arc<dyn SyncStateStore>,
        principals: Arc<dyn PrincipalProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let priming = Arc::new(PrimingService::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&state),
            Arc::clone(&clock),
            config.clone(),
        ));
        Self {
            config,
            store,
            cache,
            state,
            principals,
            clock,
            sync_lock: Arc::new(SyncLock::new()),
            priming,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    pub fn cache(&self) -> Arc<dyn EntityCache> {
        Arc::clone(&self.cache)
    }

    pub fn state(&self) -> Arc<dyn SyncStateStore> {
        Arc::clone(&self.state)
    }

    pub fn principals(&self) -> Arc<dyn PrincipalProvider> {
        Arc::clone(&self.principals)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// The one lock every priming run holds.
    pub fn sync_lock(&self) -> Arc<SyncLock> {
        Arc::clone(&self.sync_lock)
    }

    pub fn priming(&self) -> Arc<PrimingService> {
        Arc::clone(&self.priming)
    }
}
