use async_trait::async_trait;
use sqlx::{Connection, PgConnection, postgres::PgConnectOptions};
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    Envelope,
    source::{DequeueOptions, SourceError, SourceQueue},
};

/// Postgres-backed source queue.
///
/// Messages live in the `source_queue` table, one row per envelope. A
/// dequeue deletes the oldest row of the requested queue and returns its
/// payload, so removal is atomic with the read. Concurrent dequeuers skip
/// rows locked by each other.
///
/// No connection is kept between calls: every dequeue opens its own
/// connection and closes it before returning.
#[derive(Clone)]
pub struct SqlxSourceQueue {
    options: PgConnectOptions,
    recheck_interval: Duration,
}

impl SqlxSourceQueue {
    /// Creates a queue without touching the database.
    pub fn new_uninitialized(options: PgConnectOptions) -> Self {
        Self {
            options,
            recheck_interval: Duration::from_millis(200),
        }
    }

    /// Creates a queue and ensures its table exists.
    ///
    /// Fails when the database is unreachable.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(options: PgConnectOptions) -> Result<Self, SourceError> {
        let mut conn = PgConnection::connect_with(&options).await?;
        create_table(&mut conn).await?;
        conn.close().await?;
        Ok(Self::new_uninitialized(options))
    }

    /// Sets how often an empty queue is re-checked during the wait window.
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    /// Enqueue an envelope as part of the caller's transaction.
    ///
    /// The row becomes visible to dequeuers when `tx` commits.
    #[tracing::instrument(skip(self, envelope, tx))]
    pub async fn enqueue(
        &self,
        queue_name: &str,
        envelope: &Envelope,
        tx: &mut sqlx::PgTransaction<'_>,
    ) -> Result<(), SourceError> {
        let payload =
            serde_json::to_string(envelope).map_err(|err| SourceError::store(None, err))?;
        sqlx::query("INSERT INTO source_queue (queue_name, payload) VALUES ($1, $2)")
            .bind(queue_name)
            .bind(payload)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Cancellation is only checked while no row has been taken.
    async fn dequeue_on(
        &self,
        conn: &mut PgConnection,
        queue_name: &str,
        options: &DequeueOptions,
    ) -> Result<String, SourceError> {
        let deadline = Instant::now() + options.wait;
        loop {
            if options.cancel.is_cancelled() {
                return Err(SourceError::timeout());
            }
            if let Some(payload) = take_first(conn, queue_name).await? {
                return Ok(payload);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SourceError::timeout());
            }
            tokio::select! {
                _ = options.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.recheck_interval.min(deadline - now)) => {}
            }
        }
    }
}

#[async_trait]
impl SourceQueue for SqlxSourceQueue {
    #[tracing::instrument(skip(self, options))]
    async fn dequeue(
        &self,
        queue_name: &str,
        options: &DequeueOptions,
    ) -> Result<String, SourceError> {
        let mut conn = PgConnection::connect_with(&self.options).await?;
        let result = self.dequeue_on(&mut conn, queue_name, options).await;
        if let Err(error) = conn.close().await {
            tracing::debug!(%error, "Failed to close source queue connection");
        }
        result
    }
}

async fn take_first(
    conn: &mut PgConnection,
    queue_name: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar(
        "DELETE FROM source_queue
         WHERE id = (
            SELECT id FROM source_queue
            WHERE queue_name = $1
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            LIMIT 1
         )
         RETURNING payload",
    )
    .bind(queue_name)
    .fetch_optional(&mut *conn)
    .await
}

/// Ensures the source queue table exists.
async fn create_table(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS source_queue (
            id BIGSERIAL PRIMARY KEY,
            queue_name TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl From<sqlx::Error> for SourceError {
    fn from(err: sqlx::Error) -> Self {
        SourceError::store(None, err)
    }
}
