//! Offline-readiness cache priming and incremental sync for harvest operations.
//!
//! Hosts build one [`context::SyncContext`] per signed-in session and hand it
//! to the [`sync::SyncScheduler`] and the [`sync::ReferenceDataStore`].

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod errors;
pub mod fetch;
pub mod persistence;
pub mod security;
pub mod store;
pub mod sync;

pub use context::SyncContext;
pub use errors::{Error, Result};
