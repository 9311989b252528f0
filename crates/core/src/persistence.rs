//! Local key-value persistence for sync checkpoints and scheduler state.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::warn;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::errors::{Error, Result};

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Resolves once the value is durably written.
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

/// Keys are namespaced per tenant so switching tenants never reuses a
/// checkpoint from another tenant's data.
pub struct SyncStateKeys;

impl SyncStateKeys {
    pub fn checkpoint(tenant_id: &str) -> String {
        format!("priming.checkpoint.{}", tenant_id)
    }

    /// Scope the checkpoint was committed for; a different scope forces a
    /// full operational fetch.
    pub fn scope_fingerprint(tenant_id: &str) -> String {
        format!("priming.scope.{}", tenant_id)
    }

    pub fn last_sync_date(tenant_id: &str) -> String {
        format!("scheduler.last_sync_date.{}", tenant_id)
    }

    pub fn last_manual_attempt(tenant_id: &str) -> String {
        format!("scheduler.last_manual_attempt.{}", tenant_id)
    }
}

/// Reads an RFC 3339 timestamp. Unparseable values are treated as absent.
pub fn read_timestamp(store: &dyn SyncStateStore, key: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(parsed) => Ok(Some(parsed.with_timezone(&Utc))),
        Err(err) => {
            warn!("[SyncState] Ignoring unparseable timestamp at {}: {}", key, err);
            Ok(None)
        }
    }
}

pub async fn write_timestamp(
    store: &dyn SyncStateStore,
    key: &str,
    value: DateTime<Utc>,
) -> Result<()> {
    store.set(key, value.to_rfc3339()).await
}

pub fn read_date(store: &dyn SyncStateStore, key: &str) -> Result<Option<NaiveDate>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    Ok(NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok())
}

pub async fn write_date(store: &dyn SyncStateStore, key: &str, value: NaiveDate) -> Result<()> {
    store.set(key, value.format("%Y-%m-%d").to_string()).await
}

/// Last successful priming completion for a tenant.
pub fn read_checkpoint(store: &dyn SyncStateStore, tenant_id: &str) -> Result<Option<DateTime<Utc>>> {
    read_timestamp(store, &SyncStateKeys::checkpoint(tenant_id))
}

/// Advances the checkpoint; never moves it backwards. Returns the stored value.
pub async fn advance_checkpoint(
    store: &dyn SyncStateStore,
    tenant_id: &str,
    candidate: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let next = match read_checkpoint(store, tenant_id)? {
        Some(previous) if previous > candidate => previous,
        _ => candidate,
    };
    write_timestamp(store, &SyncStateKeys::checkpoint(tenant_id), next).await?;
    Ok(next)
}

#[derive(Debug, Default)]
pub struct InMemorySyncStateStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .read()
            .map_err(|_| Error::internal("Sync state lock is poisoned"))?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::internal("Sync state lock is poisoned"))?;
        values.insert(key.to_string(), value);
        Ok(())
    }
}
