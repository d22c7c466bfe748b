//! Durable outgoing update queue.
//!
//! Every status update the task runner produces is appended to a local
//! SQLite database before anything touches the network; the background
//! [`UpdateDispatcher`] then delivers entries strictly in sequence order and
//! deletes them only after the manager acknowledged with a 2xx. A manager
//! outage of any length therefore delays delivery but never loses or
//! reorders data, and a crash mid-dispatch re-sends at most the entry that
//! was in flight.
//!
//! The pool is capped at a single connection so enqueue and dispatch are
//! serialized by the database itself.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use farmhand_core::{ManagerClient, RetryPolicy, StatusUpdate};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WorkerError};

/// How often `drain` re-checks emptiness.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One persisted update with its queue sequence number.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub seq: i64,
    pub task_id: String,
    pub update: StatusUpdate,
}

/// Durable FIFO of outgoing status updates.
pub struct UpdateQueue {
    pool: SqlitePool,
    /// Woken on enqueue so the dispatcher picks up new entries immediately.
    dispatch_wakeup: Notify,
}

impl UpdateQueue {
    /// Open or create the queue database at the given path.
    ///
    /// Entries left `in-flight` by a previous run are reverted to `pending`:
    /// the POST may or may not have arrived, and re-sending is the safe side
    /// of at-least-once delivery.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| WorkerError::storage("opening update queue database", e))?;

        Self::from_pool(pool).await
    }

    /// Open an in-memory queue (for testing).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| WorkerError::storage("opening in-memory update queue", e))?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| WorkerError::storage("migrating update queue schema", e))?;

        let recovered = sqlx::query("UPDATE queued_updates SET state = 'pending' WHERE state = 'in-flight'")
            .execute(&pool)
            .await
            .map_err(|e| WorkerError::storage("recovering in-flight updates", e))?
            .rows_affected();
        if recovered > 0 {
            info!(recovered, "reverted in-flight updates from a previous run");
        }

        Ok(Self {
            pool,
            dispatch_wakeup: Notify::new(),
        })
    }

    /// Durably append an update. Returns its sequence number once the row is
    /// committed; delivery happens later, in the background.
    pub async fn enqueue(&self, update: &StatusUpdate) -> Result<i64> {
        let payload = serde_json::to_string(update)
            .map_err(|e| WorkerError::storage("encoding status update", e))?;

        let result = sqlx::query(
            "INSERT INTO queued_updates (task_id, payload, state, queued_at)
             VALUES (?, ?, 'pending', ?)",
        )
        .bind(&update.task_id)
        .bind(&payload)
        .bind(update.received_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| WorkerError::storage("enqueueing status update", e))?;

        let seq = result.last_insert_rowid();
        debug!(seq, task_id = %update.task_id, "status update queued");
        self.dispatch_wakeup.notify_one();
        Ok(seq)
    }

    /// Number of undelivered updates.
    pub async fn size(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM queued_updates")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| WorkerError::storage("counting queued updates", e))?;
        Ok(row.get("cnt"))
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    /// The oldest pending entry, if any.
    async fn oldest_pending(&self) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(
            "SELECT seq, task_id, payload FROM queued_updates
             WHERE state = 'pending'
             ORDER BY seq ASC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| WorkerError::storage("selecting oldest pending update", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.get("payload");
        let update: StatusUpdate = serde_json::from_str(&payload)
            .map_err(|e| WorkerError::storage("decoding queued update", e))?;

        Ok(Some(QueueEntry {
            seq: row.get("seq"),
            task_id: row.get("task_id"),
            update,
        }))
    }

    async fn set_state(&self, seq: i64, state: &str) -> Result<()> {
        sqlx::query("UPDATE queued_updates SET state = ? WHERE seq = ?")
            .bind(state)
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(|e| WorkerError::storage("updating queue entry state", e))?;
        Ok(())
    }

    /// Remove an entry after the manager acknowledged it. It will never be
    /// retried afterwards.
    async fn complete(&self, seq: i64) -> Result<()> {
        sqlx::query("DELETE FROM queued_updates WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await
            .map_err(|e| WorkerError::storage("deleting delivered update", e))?;
        Ok(())
    }

    /// Block until the queue is empty or the timeout elapses.
    ///
    /// Returns whether draining completed. Calling this on an empty queue is
    /// a no-op returning `true` immediately, so repeated drains are safe.
    pub async fn drain(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_empty().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// Background delivery loop for an [`UpdateQueue`].
///
/// Failures are retried forever with the configured policy; the loop only
/// ends when cancelled (storage errors excepted, which are fatal and bubble
/// out so the process can stop).
pub struct UpdateDispatcher {
    queue: Arc<UpdateQueue>,
    client: ManagerClient,
    retry: RetryPolicy,
}

impl UpdateDispatcher {
    pub fn new(queue: Arc<UpdateQueue>, client: ManagerClient, retry: RetryPolicy) -> Self {
        Self {
            queue,
            client,
            retry,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        debug!("update dispatcher started");
        let mut failed_attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                debug!("update dispatcher stopping");
                return Ok(());
            }

            let entry = match self.queue.oldest_pending().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    tokio::select! {
                        _ = self.queue.dispatch_wakeup.notified() => continue,
                        _ = cancel.cancelled() => continue,
                    }
                }
                Err(err) => {
                    error!(%err, "update queue unreadable, giving up");
                    return Err(err);
                }
            };

            self.queue.set_state(entry.seq, "in-flight").await?;

            match self
                .client
                .send_task_update(&entry.task_id, entry.seq, &entry.update)
                .await
            {
                Ok(()) => {
                    debug!(seq = entry.seq, task_id = %entry.task_id, "update delivered");
                    self.queue.complete(entry.seq).await?;
                    failed_attempts = 0;
                }
                Err(err) => {
                    self.queue.set_state(entry.seq, "pending").await?;
                    let delay = self.retry.delay_for(failed_attempts);
                    failed_attempts = failed_attempts.saturating_add(1);
                    warn!(
                        seq = entry.seq,
                        %err,
                        ?delay,
                        "update delivery failed, will retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }
}
