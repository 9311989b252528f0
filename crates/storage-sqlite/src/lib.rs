//! SQLite persistence for harvestdesk: sync checkpoints, scheduler state and
//! the offline entity cache.

pub mod db;
pub mod entity_cache;
pub mod errors;
pub mod schema;
pub mod sync_state;

pub use db::{create_pool, get_connection, init, open, run_migrations, spawn_writer, DbPool, WriteHandle};
pub use entity_cache::EntityCacheRepository;
pub use errors::StorageError;
pub use sync_state::SyncStateRepository;
