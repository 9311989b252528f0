//! Tunables for priming and scheduling.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Error, Result};

/// Reconnect / visibility staleness gate (15 minutes).
pub const DEFAULT_STALENESS_THRESHOLD_SECS: u64 = 15 * 60;

/// Minimum spacing between accepted manual syncs (60 minutes).
pub const DEFAULT_MANUAL_RATE_LIMIT_SECS: u64 = 60 * 60;

/// Backend ceiling on the number of values in one inclusion predicate.
pub const DEFAULT_INCLUSION_LIMIT: usize = 30;

/// Chunk size for field-scoped operational queries.
pub const DEFAULT_FIELD_CHUNK_SIZE: usize = 10;

/// Chunk size for scope resolution over large accessible-field sets.
pub const DEFAULT_SCOPE_CHUNK_SIZE: usize = 30;

/// Tail length fetched per subcollection in the recent-history phase.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Polling cadence for change feeds served over plain request/response.
pub const DEFAULT_SUBSCRIPTION_POLL_INTERVAL_SECS: u64 = 15;

/// Upper bound for the staleness and manual rate-limit windows (one year).
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub staleness_threshold_secs: u64,
    pub manual_rate_limit_secs: u64,
    pub inclusion_limit: usize,
    pub field_chunk_size: usize,
    pub scope_chunk_size: usize,
    pub history_limit: usize,
    pub subscription_poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: DEFAULT_STALENESS_THRESHOLD_SECS,
            manual_rate_limit_secs: DEFAULT_MANUAL_RATE_LIMIT_SECS,
            inclusion_limit: DEFAULT_INCLUSION_LIMIT,
            field_chunk_size: DEFAULT_FIELD_CHUNK_SIZE,
            scope_chunk_size: DEFAULT_SCOPE_CHUNK_SIZE,
            history_limit: DEFAULT_HISTORY_LIMIT,
            subscription_poll_interval_secs: DEFAULT_SUBSCRIPTION_POLL_INTERVAL_SECS,
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<T>()
                .map(Some)
                .map_err(|_| Error::Config(format!("{} must be a number, got '{}'", key, raw)))
        }
        Err(_) => Ok(None),
    }
}

fn window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

impl SyncConfig {
    /// Defaults overlaid with `HARVESTDESK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = env_number("HARVESTDESK_STALENESS_SECS")? {
            config.staleness_threshold_secs = value;
        }
        if let Some(value) = env_number("HARVESTDESK_MANUAL_RATE_LIMIT_SECS")? {
            config.manual_rate_limit_secs = value;
        }
        if let Some(value) = env_number("HARVESTDESK_FIELD_CHUNK_SIZE")? {
            config.field_chunk_size = value;
        }
        if let Some(value) = env_number("HARVESTDESK_SCOPE_CHUNK_SIZE")? {
            config.scope_chunk_size = value;
        }
        if let Some(value) = env_number("HARVESTDESK_HISTORY_LIMIT")? {
            config.history_limit = value;
        }
        config.validated()
    }

    /// Clamps chunk sizes into `1..=inclusion_limit` and time windows to
    /// [`MAX_WINDOW_SECS`].
    pub fn validated(mut self) -> Result<Self> {
        if self.inclusion_limit == 0 {
            return Err(Error::Config(
                "inclusion_limit must be greater than zero".to_string(),
            ));
        }
        self.field_chunk_size = self.field_chunk_size.clamp(1, self.inclusion_limit);
        self.scope_chunk_size = self.scope_chunk_size.clamp(1, self.inclusion_limit);
        self.history_limit = self.history_limit.max(1);
        self.staleness_threshold_secs = self.staleness_threshold_secs.min(MAX_WINDOW_SECS);
        self.manual_rate_limit_secs = self.manual_rate_limit_secs.min(MAX_WINDOW_SECS);
        Ok(self)
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        window(self.staleness_threshold_secs)
    }

    pub fn manual_rate_limit(&self) -> chrono::Duration {
        window(self.manual_rate_limit_secs)
    }

    pub fn subscription_poll_interval(&self) -> Duration {
        Duration::from_secs(self.subscription_poll_interval_secs.max(1))
    }
}
