use async_trait::async_trait;
use chrono::Utc;
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use harvestdesk_core::cache::EntityCache;
use harvestdesk_core::store::{CollectionPath, Document};
use harvestdesk_core::Result;

use super::model::CachedEntityDB;
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::cached_entities;

pub struct EntityCacheRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
    version: AtomicU64,
}

impl EntityCacheRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self {
            pool,
            writer,
            version: AtomicU64::new(0),
        }
    }

    /// Drops every cached entity of `collection`. Returns the number removed.
    pub async fn clear(&self, collection: &CollectionPath) -> Result<usize> {
        let path = collection.to_string();
        let removed = self
            .writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                Ok(diesel::delete(
                    cached_entities::table.filter(cached_entities::collection.eq(path)),
                )
                .execute(conn)
                .map_err(StorageError::from)?)
            })
            .await?;
        if removed > 0 {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    fn decode(row: CachedEntityDB) -> Option<Document> {
        let value = match serde_json::from_str(&row.body) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "[EntityCache] Skipping undecodable entity {}/{}: {}",
                    row.collection, row.entity_id, err
                );
                return None;
            }
        };
        Document::from_entity(value)
    }
}

#[async_trait]
impl EntityCache for EntityCacheRepository {
    async fn put_all(&self, collection: &CollectionPath, docs: Vec<Document>) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let path = collection.to_string();
        let now = Utc::now().to_rfc3339();
        let rows = docs
            .iter()
            .map(|doc| -> Result<CachedEntityDB> {
                Ok(CachedEntityDB {
                    collection: path.clone(),
                    entity_id: doc.id.clone(),
                    body: serde_json::to_string(&doc.to_entity())?,
                    updated_at: now.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let written = self
            .writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                for row in &rows {
                    diesel::insert_into(cached_entities::table)
                        .values(row)
                        .on_conflict((cached_entities::collection, cached_entities::entity_id))
                        .do_update()
                        .set((
                            cached_entities::body.eq(&row.body),
                            cached_entities::updated_at.eq(&row.updated_at),
                        ))
                        .execute(conn)
                        .map_err(StorageError::from)?;
                }
                Ok(rows.len())
            })
            .await?;

        self.version.fetch_add(1, Ordering::SeqCst);
        debug!("[EntityCache] Wrote {} entities to {}", written, path);
        Ok(written)
    }

    fn get(&self, collection: &CollectionPath, id: &str) -> Result<Option<Document>> {
        let mut conn = get_connection(&self.pool)?;
        let row = cached_entities::table
            .find((collection.to_string(), id))
            .select(CachedEntityDB::as_select())
            .first::<CachedEntityDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row.and_then(Self::decode))
    }

    fn list(&self, collection: &CollectionPath) -> Result<Vec<Document>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = cached_entities::table
            .filter(cached_entities::collection.eq(collection.to_string()))
            .order(cached_entities::entity_id.asc())
            .select(CachedEntityDB::as_select())
            .load::<CachedEntityDB>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(rows.into_iter().filter_map(Self::decode).collect())
    }

    fn count(&self, collection: &CollectionPath) -> Result<usize> {
        let mut conn = get_connection(&self.pool)?;
        let total: i64 = cached_entities::table
            .filter(cached_entities::collection.eq(collection.to_string()))
            .select(count_star())
            .first(&mut conn)
            .map_err(StorageError::from)?;
        Ok(usize::try_from(total).unwrap_or(0))
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
