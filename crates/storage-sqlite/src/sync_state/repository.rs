//! Key-value persistence for checkpoints and scheduler timestamps.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use harvestdesk_core::persistence::SyncStateStore;
use harvestdesk_core::Result;

use super::model::SyncStateDB;
use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::sync_state;

pub struct SyncStateRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl SyncStateRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    pub fn get_row(&self, key: &str) -> Result<Option<SyncStateDB>> {
        let mut conn = get_connection(&self.pool)?;
        let row = sync_state::table
            .find(key)
            .first::<SyncStateDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<bool> {
                let deleted = diesel::delete(sync_state::table.find(key))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(deleted > 0)
            })
            .await
    }
}

#[async_trait]
impl SyncStateStore for SyncStateRepository {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_row(key)?.map(|row| row.state_value))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let key = key.to_string();
        self.writer
            .exec(move |conn: &mut SqliteConnection| -> Result<()> {
                let now = Utc::now().to_rfc3339();
                let row = SyncStateDB {
                    state_key: key,
                    state_value: value.clone(),
                    updated_at: now.clone(),
                };
                diesel::insert_into(sync_state::table)
                    .values(&row)
                    .on_conflict(sync_state::state_key)
                    .do_update()
                    .set((
                        sync_state::state_value.eq(value),
                        sync_state::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }
}
