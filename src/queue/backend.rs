//! Durable delayed job queue on libSQL.
//!
//! At-least-once delivery with lease-based claims: a claim marks the job
//! `running` and stamps `locked_until`; a worker that dies mid-job loses the
//! lease and the job becomes claimable again. Idempotency keys coalesce
//! duplicate enqueues across active jobs and a sliding window of completed
//! ones.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use libsql::{Connection, TransactionBehavior, params};
use tracing::info;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::job::{Enqueued, Job, JobFate, JobPayload, JobSpec, QueueName, backoff_delay};
use crate::store::migrations;

/// Completed jobs keep their idempotency key hot for this long.
const IDEMPOTENCY_WINDOW: Duration = Duration::hours(24);

/// Backend-agnostic queue trait.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue a job, coalescing on the idempotency key.
    async fn enqueue(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<Enqueued, QueueError>;

    /// Claim the next due job on `queue`, taking a lease of `lease` length.
    /// Jobs whose lease expired are reclaimed here too.
    async fn claim(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError>;

    /// Mark a claimed job done.
    async fn complete(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Record a failed execution: retry with backoff or dead-letter.
    async fn fail(
        &self,
        job: &Job,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<JobFate, QueueError>;

    /// Jobs waiting (or leased out) on a queue. For observability and tests.
    async fn pending_count(&self, queue: QueueName) -> Result<usize, QueueError>;

    /// Dead-lettered jobs on a queue.
    async fn dead_count(&self, queue: QueueName) -> Result<usize, QueueError>;
}

/// libSQL queue backend. Shares the schema (and, in production, the database
/// file) with the state store; only the `jobs` table is touched here.
pub struct LibSqlQueue {
    #[allow(dead_code)]
    db: Arc<libsql::Database>,
    conn: tokio::sync::Mutex<Connection>,
}

impl LibSqlQueue {
    pub async fn new_local(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| QueueError::Unavailable(format!("create db directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| QueueError::Unavailable(format!("open database: {e}")))?;

        let queue = Self::from_database(db).await?;
        info!(path = %path.display(), "Queue opened");
        Ok(queue)
    }

    /// In-memory queue (for tests).
    pub async fn new_memory() -> Result<Self, QueueError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| QueueError::Unavailable(format!("open in-memory database: {e}")))?;

        Self::from_database(db).await
    }

    async fn from_database(db: libsql::Database) -> Result<Self, QueueError> {
        let conn = db
            .connect()
            .map_err(|e| QueueError::Unavailable(format!("connect: {e}")))?;

        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .await
            .map_err(|e| QueueError::Unavailable(format!("configure connection: {e}")))?;

        migrations::run_migrations(&conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            conn: tokio::sync::Mutex::new(conn),
        })
    }
}

async fn begin(conn: &Connection) -> Result<libsql::Transaction, QueueError> {
    // Clear any transaction a cancelled caller left open on this connection.
    if !conn.is_autocommit() {
        let _ = conn.execute_batch("ROLLBACK").await;
    }

    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .await
        .map_err(map_sql)
}

fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::Query(format!("bad timestamp {s:?}: {e}")))
}

fn map_sql(e: libsql::Error) -> QueueError {
    QueueError::Query(e.to_string())
}

fn row_to_job(row: &libsql::Row) -> Result<Job, QueueError> {
    let id = Uuid::parse_str(&row.get::<String>(0).map_err(map_sql)?)
        .map_err(|e| QueueError::Query(format!("bad job id: {e}")))?;
    let queue_str: String = row.get(1).map_err(map_sql)?;
    let payload_str: String = row.get(2).map_err(map_sql)?;

    let payload: JobPayload = serde_json::from_str(&payload_str).map_err(|e| {
        QueueError::MalformedPayload {
            id,
            reason: e.to_string(),
        }
    })?;

    Ok(Job {
        id,
        queue: QueueName::parse(&queue_str)
            .ok_or_else(|| QueueError::Query(format!("bad queue {queue_str:?}")))?,
        payload,
        run_at: parse_dt(&row.get::<String>(3).map_err(map_sql)?)?,
        attempts: row.get::<i64>(4).map_err(map_sql)? as u32,
        max_attempts: row.get::<i64>(5).map_err(map_sql)? as u32,
        idempotency_key: row.get(6).map_err(map_sql)?,
    })
}

#[async_trait]
impl QueueBackend for LibSqlQueue {
    async fn enqueue(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<Enqueued, QueueError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;

        // Coalesce with any active job, or one completed inside the window.
        let mut rows = tx
            .query(
                "SELECT id FROM jobs WHERE idempotency_key = ?1 \
                 AND (status IN ('pending', 'running') \
                      OR (status = 'done' AND finished_at > ?2)) \
                 LIMIT 1",
                params![
                    spec.idempotency_key.clone(),
                    fmt_dt(now - IDEMPOTENCY_WINDOW),
                ],
            )
            .await
            .map_err(map_sql)?;

        if let Some(row) = rows.next().await.map_err(map_sql)? {
            let id = Uuid::parse_str(&row.get::<String>(0).map_err(map_sql)?)
                .map_err(|e| QueueError::Query(format!("bad job id: {e}")))?;
            drop(rows);
            tx.commit().await.map_err(map_sql)?;
            return Ok(Enqueued::Coalesced(id));
        }
        drop(rows);

        let queue = spec.payload.queue();
        let id = Uuid::new_v4();
        let payload = serde_json::to_string(&spec.payload)
            .map_err(|e| QueueError::Query(format!("serialize payload: {e}")))?;
        let max_attempts = spec
            .max_attempts
            .unwrap_or_else(|| queue.default_max_attempts());

        tx.execute(
            "INSERT INTO jobs (id, queue, payload, status, run_at, attempts, max_attempts, \
             idempotency_key, created_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, ?6, ?7)",
            params![
                id.to_string(),
                queue.as_str(),
                payload,
                fmt_dt(spec.run_at),
                max_attempts as i64,
                spec.idempotency_key.clone(),
                fmt_dt(now),
            ],
        )
        .await
        .map_err(map_sql)?;

        tx.commit().await.map_err(map_sql)?;
        Ok(Enqueued::New(id))
    }

    async fn claim(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn).await?;

        let mut rows = tx
            .query(
                "SELECT id, queue, payload, run_at, attempts, max_attempts, idempotency_key \
                 FROM jobs WHERE queue = ?1 AND run_at <= ?2 \
                 AND (status = 'pending' OR (status = 'running' AND locked_until <= ?2)) \
                 ORDER BY run_at LIMIT 1",
                params![queue.as_str(), fmt_dt(now)],
            )
            .await
            .map_err(map_sql)?;

        let Some(row) = rows.next().await.map_err(map_sql)? else {
            drop(rows);
            tx.commit().await.map_err(map_sql)?;
            return Ok(None);
        };
        let mut job = row_to_job(&row)?;
        drop(rows);

        job.attempts += 1;
        tx.execute(
            "UPDATE jobs SET status = 'running', attempts = ?1, locked_until = ?2 WHERE id = ?3",
            params![job.attempts as i64, fmt_dt(now + lease), job.id.to_string()],
        )
        .await
        .map_err(map_sql)?;

        tx.commit().await.map_err(map_sql)?;
        Ok(Some(job))
    }

    async fn complete(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE jobs SET status = 'done', finished_at = ?1, locked_until = NULL \
                 WHERE id = ?2 AND status = 'running'",
                params![fmt_dt(now), job_id.to_string()],
            )
            .await
            .map_err(map_sql)?;

        if changed == 0 {
            return Err(QueueError::JobNotFound { id: job_id });
        }
        Ok(())
    }

    async fn fail(
        &self,
        job: &Job,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<JobFate, QueueError> {
        let conn = self.conn.lock().await;

        if job.attempts >= job.max_attempts {
            conn.execute(
                "UPDATE jobs SET status = 'dead', finished_at = ?1, locked_until = NULL, \
                 last_error = ?2 WHERE id = ?3",
                params![fmt_dt(now), error, job.id.to_string()],
            )
            .await
            .map_err(map_sql)?;
            return Ok(JobFate::DeadLettered);
        }

        let run_at = now + backoff_delay(job.queue, job.attempts);
        conn.execute(
            "UPDATE jobs SET status = 'pending', run_at = ?1, locked_until = NULL, \
             last_error = ?2 WHERE id = ?3",
            params![fmt_dt(run_at), error, job.id.to_string()],
        )
        .await
        .map_err(map_sql)?;

        Ok(JobFate::Retried { run_at })
    }

    async fn pending_count(&self, queue: QueueName) -> Result<usize, QueueError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status IN ('pending', 'running')",
                params![queue.as_str()],
            )
            .await
            .map_err(map_sql)?;

        match rows.next().await.map_err(map_sql)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(map_sql)? as usize),
            None => Ok(0),
        }
    }

    async fn dead_count(&self, queue: QueueName) -> Result<usize, QueueError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status = 'dead'",
                params![queue.as_str()],
            )
            .await
            .map_err(map_sql)?;

        match rows.next().await.map_err(map_sql)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(map_sql)? as usize),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        "2025-01-01T00:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn enqueue_and_claim_honors_run_at() {
        let queue = LibSqlQueue::new_memory().await.unwrap();
        let user = Uuid::new_v4();

        queue
            .enqueue(JobSpec::release(user, t0() + Duration::days(7)), t0())
            .await
            .unwrap();

        // Not due yet.
        let early = queue
            .claim(QueueName::Release, t0(), Duration::seconds(30))
            .await
            .unwrap();
        assert!(early.is_none());

        let due = queue
            .claim(
                QueueName::Release,
                t0() + Duration::days(7),
                Duration::seconds(30),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(due.attempts, 1);
        assert_eq!(due.payload, JobPayload::Release { user_id: user });
    }

    #[tokio::test]
    async fn duplicate_keys_coalesce() {
        let queue = LibSqlQueue::new_memory().await.unwrap();
        let user = Uuid::new_v4();

        let first = queue
            .enqueue(JobSpec::release(user, t0()), t0())
            .await
            .unwrap();
        let second = queue
            .enqueue(JobSpec::release(user, t0()), t0() + Duration::minutes(1))
            .await
            .unwrap();

        assert!(matches!(first, Enqueued::New(_)));
        assert_eq!(second, Enqueued::Coalesced(first.id()));
        assert_eq!(queue.pending_count(QueueName::Release).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn coalescing_covers_recently_completed_jobs() {
        let queue = LibSqlQueue::new_memory().await.unwrap();
        let user = Uuid::new_v4();

        let first = queue
            .enqueue(JobSpec::release(user, t0()), t0())
            .await
            .unwrap();
        let job = queue
            .claim(QueueName::Release, t0(), Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        queue.complete(job.id, t0()).await.unwrap();

        // Inside the window the key still coalesces.
        let again = queue
            .enqueue(JobSpec::release(user, t0()), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(again, Enqueued::Coalesced(first.id()));

        // Outside the window it runs again.
        let later = queue
            .enqueue(JobSpec::release(user, t0()), t0() + Duration::hours(25))
            .await
            .unwrap();
        assert!(matches!(later, Enqueued::New(_)));
    }

    #[tokio::test]
    async fn failure_retries_with_backoff_then_dead_letters() {
        let queue = LibSqlQueue::new_memory().await.unwrap();
        let check_in = Uuid::new_v4();

        queue
            .enqueue(JobSpec::checkin(check_in, t0()), t0())
            .await
            .unwrap();

        let mut now = t0();
        for attempt in 1..=3u32 {
            let job = queue
                .claim(QueueName::Checkin, now, Duration::seconds(30))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(job.attempts, attempt);

            let fate = queue.fail(&job, "boom", now).await.unwrap();
            if attempt < 3 {
                let JobFate::Retried { run_at } = fate else {
                    panic!("expected retry");
                };
                assert_eq!(run_at, now + backoff_delay(QueueName::Checkin, attempt));
                now = run_at;
            } else {
                assert_eq!(fate, JobFate::DeadLettered);
            }
        }

        assert_eq!(queue.pending_count(QueueName::Checkin).await.unwrap(), 0);
        assert_eq!(queue.dead_count(QueueName::Checkin).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let queue = LibSqlQueue::new_memory().await.unwrap();
        let check_in = Uuid::new_v4();

        queue
            .enqueue(JobSpec::checkin(check_in, t0()), t0())
            .await
            .unwrap();

        let first = queue
            .claim(QueueName::Checkin, t0(), Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        // Still leased: nothing to claim.
        let held = queue
            .claim(QueueName::Checkin, t0() + Duration::seconds(10), Duration::seconds(30))
            .await
            .unwrap();
        assert!(held.is_none());

        // Lease expired: the crashed worker's job comes back.
        let reclaimed = queue
            .claim(QueueName::Checkin, t0() + Duration::seconds(31), Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, first.id);
        assert_eq!(reclaimed.attempts, 2);
    }
}
