//! Single-writer actor for SQLite.
//!
//! Jobs are closures executed on a dedicated blocking thread inside an
//! `IMMEDIATE` transaction, so the write lock is taken up front and each job
//! commits or rolls back as a unit.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use authkeeper_core::{Error, Result};

use crate::db::{get_connection, DbPool};
use crate::errors::StorageError;

type WriteJob = Box<dyn FnOnce(&Arc<DbPool>) + Send>;

/// Cloneable handle used by repositories to submit write jobs.
#[derive(Clone)]
pub struct WriteHandle {
    sender: mpsc::UnboundedSender<WriteJob>,
}

impl WriteHandle {
    /// Run `job` on the writer thread inside an immediate transaction and
    /// await its result. Returning an `Err` from the job rolls the
    /// transaction back.
    pub async fn exec<R, F>(&self, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<R> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<R>>();

        let wrapped: WriteJob = Box::new(move |pool| {
            let result = (|| -> Result<R> {
                let mut conn = get_connection(pool)?;
                conn.immediate_transaction::<R, StorageError, _>(|tx| {
                    job(tx).map_err(StorageError::from)
                })
                .map_err(Error::from)
            })();
            let _ = reply_tx.send(result);
        });

        self.sender.send(wrapped).map_err(|_| {
            Error::from(StorageError::WriterGone("writer thread has shut down".to_string()))
        })?;

        reply_rx.await.map_err(|_| {
            Error::from(StorageError::WriterGone("writer dropped the job".to_string()))
        })?
    }
}

/// Start the writer thread. The handle can be cloned freely; the thread exits
/// when the last handle is dropped.
pub fn spawn_writer(pool: Arc<DbPool>) -> WriteHandle {
    let (sender, mut receiver) = mpsc::unbounded_channel::<WriteJob>();

    std::thread::spawn(move || {
        debug!("sqlite writer started");
        while let Some(job) = receiver.blocking_recv() {
            job(&pool);
        }
        debug!("sqlite writer stopped");
    });

    WriteHandle { sender }
}
