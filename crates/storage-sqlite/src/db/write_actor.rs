//! Single writer thread. SQLite allows one writer at a time, so every write
//! job is funneled through one connection and runs in an immediate
//! transaction.

use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use log::error;
use std::sync::mpsc;
use tokio::sync::oneshot;

use harvestdesk_core::errors::{DatabaseError, Error, Result};

use super::DbPool;
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

#[derive(Clone, Debug)]
pub struct WriteHandle {
    jobs: mpsc::Sender<Job>,
}

/// A job either fails on its own or the transaction around it does.
enum TxAbort {
    Job(Error),
    Diesel(diesel::result::Error),
}

impl From<diesel::result::Error> for TxAbort {
    fn from(err: diesel::result::Error) -> Self {
        Self::Diesel(err)
    }
}

pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (tx, rx) = mpsc::channel::<Job>();
    let spawned = std::thread::Builder::new()
        .name("harvestdesk-db-writer".to_string())
        .spawn(move || {
            let mut conn = match pool.get() {
                Ok(conn) => conn,
                Err(err) => {
                    error!("[Storage] Writer could not acquire a connection: {}", err);
                    return;
                }
            };
            while let Ok(job) = rx.recv() {
                job(&mut *conn);
            }
        });
    if let Err(err) = spawned {
        error!("[Storage] Failed to spawn writer thread: {}", err);
    }
    WriteHandle { jobs: tx }
}

impl WriteHandle {
    /// Runs `job` on the writer connection inside an immediate transaction.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let boxed: Job = Box::new(move |conn: &mut SqliteConnection| {
            let outcome = conn
                .immediate_transaction::<T, TxAbort, _>(|tx_conn| job(tx_conn).map_err(TxAbort::Job));
            let result = match outcome {
                Ok(value) => Ok(value),
                Err(TxAbort::Job(err)) => Err(err),
                Err(TxAbort::Diesel(err)) => Err(StorageError::from(err).into()),
            };
            let _ = reply_tx.send(result);
        });

        self.jobs
            .send(boxed)
            .map_err(|_| writer_gone("Database writer is not running"))?;
        reply_rx
            .await
            .map_err(|_| writer_gone("Database writer dropped the job"))?
    }
}

fn writer_gone(message: &str) -> Error {
    Error::Database(DatabaseError::Internal(message.to_string()))
}
