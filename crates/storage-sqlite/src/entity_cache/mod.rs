mod model;
mod repository;

pub use model::CachedEntityDB;
pub use repository::EntityCacheRepository;
