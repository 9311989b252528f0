//! The single in-flight sync guard.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Shared `isSyncing` lock. Priming entry points take a [`SyncPermit`], so a
/// run cannot start without holding it.
#[derive(Debug, Default)]
pub struct SyncLock {
    cycle_mutex: Arc<Mutex<()>>,
}

/// Proof that the holder owns the sync lock. Released on drop.
#[derive(Debug)]
pub struct SyncPermit {
    _guard: OwnedMutexGuard<()>,
}

impl SyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-set: `None` when a sync is already in flight.
    pub fn try_acquire(&self) -> Option<SyncPermit> {
        Arc::clone(&self.cycle_mutex)
            .try_lock_owned()
            .ok()
            .map(|guard| SyncPermit { _guard: guard })
    }

    /// Waits for any in-flight sync to finish, then takes the lock.
    pub async fn acquire(&self) -> SyncPermit {
        SyncPermit {
            _guard: Arc::clone(&self.cycle_mutex).lock_owned().await,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.cycle_mutex.try_lock().is_err()
    }
}
