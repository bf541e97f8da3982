use crate::error::{Result, StoreError};
use crate::schema;
use rusqlite::types::Value;
use rusqlite::{Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use tagdex_runtime::{Promise, Scheduler, TaskError, TaskPolicy};
use tokio::sync::{mpsc as channel, oneshot};

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

const STREAM_BUFFER: usize = 64;

/// A SQLite connection owned by a dedicated thread.
///
/// Every statement runs as a job on that thread and its result rejoins the scheduler through a
/// promise. The thread exits once the last handle is dropped.
#[derive(Clone)]
pub struct DbConnection {
    scheduler: Scheduler,
    sender: mpsc::Sender<Job>,
    path: PathBuf,
}

impl DbConnection {
    /// Open the writer connection, creating and migrating the database as needed.
    pub fn open(scheduler: &Scheduler, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = schema::open_db(path)?;
        Self::spawn(scheduler, path, conn, false)
    }

    pub fn open_read_only(scheduler: &Scheduler, path: &Path) -> Result<Self> {
        let conn = schema::open_read_only(path)?;
        Self::spawn(scheduler, path, conn, true)
    }

    fn spawn(scheduler: &Scheduler, path: &Path, conn: Connection, read_only: bool) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let name = if read_only { "tagdex-db-read" } else { "tagdex-db-write" };
        thread::Builder::new().name(name.to_string()).spawn(move || {
            let mut conn = conn;
            while let Ok(job) = receiver.recv() {
                job(&mut conn);
            }
            log::debug!("Database thread exiting");
        })?;

        Ok(Self {
            scheduler: scheduler.clone(),
            sender,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run `f` on the connection thread.
    pub fn call<T, F>(&self, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |conn| {
            let _ = tx.send(f(conn));
        });
        if self.sender.send(job).is_err() {
            return Promise::failed(TaskError::failed(StoreError::ConnectionClosed));
        }

        let completion = self.scheduler.external(rx);
        self.scheduler
            .start_with(TaskPolicy::WhileFutureLives, async move {
                match completion.await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(TaskError::failed(err)),
                    Err(_) => Err(TaskError::failed(StoreError::ConnectionClosed)),
                }
            })
    }

    /// Stream the rows of a query.
    ///
    /// Rows are produced on the connection thread into a small buffer; the thread stays inside
    /// the query until the consumer drains it or drops the stream.
    pub fn stream<T, F>(&self, sql: &str, params: Vec<Value>, mut map: F) -> RowStream<T>
    where
        T: Send + 'static,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    {
        let (tx, rx) = channel::channel(STREAM_BUFFER);
        let sql = sql.to_string();
        let job: Job = Box::new(move |conn| {
            let produced = (|| -> Result<()> {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
                while let Some(row) = rows.next()? {
                    if tx.blocking_send(Ok(map(row)?)).is_err() {
                        // Consumer went away.
                        return Ok(());
                    }
                }
                Ok(())
            })();
            if let Err(err) = produced {
                let _ = tx.blocking_send(Err(err));
            }
        });

        let (receiver, pending_error) = match self.sender.send(job) {
            Ok(()) => (Some(rx), None),
            Err(_) => (None, Some(StoreError::ConnectionClosed)),
        };
        RowStream {
            scheduler: self.scheduler.clone(),
            receiver,
            pending_error,
        }
    }
}

/// Lazily produced query rows; see [`DbConnection::stream`].
pub struct RowStream<T> {
    scheduler: Scheduler,
    receiver: Option<channel::Receiver<Result<T>>>,
    pending_error: Option<StoreError>,
}

impl<T> RowStream<T> {
    /// Next row, `Ok(None)` once the query is exhausted.
    pub async fn next(&mut self) -> Result<Option<T>> {
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };
        let received = self.scheduler.external(receiver.recv()).await;
        match received {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(err)) => {
                self.receiver = None;
                Err(err)
            }
            None => {
                self.receiver = None;
                Ok(None)
            }
        }
    }

    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}
