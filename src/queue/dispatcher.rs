//! Dispatcher — per-queue consumer loops routing jobs to workers.
//!
//! Each queue gets `concurrency` polling loops (release: exactly one). A job
//! execution is wrapped in a wall-clock budget; a timeout or error sends the
//! job back through the queue's retry/backoff path, and exhaustion
//! dead-letters it with a `JOB_FAILED` audit entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Error, JobError, Result};
use crate::queue::backend::QueueBackend;
use crate::queue::job::{Job, JobFate, JobPayload, QueueName};
use crate::store::Store;
use crate::workers::{CheckinWorker, EscalationWorker, NotifyWorker, ReleaseWorker};

/// Wall-clock budget per job execution.
const JOB_BUDGET: StdDuration = StdDuration::from_secs(30);

/// How long a claim lease outlives the job budget.
const LEASE_SLACK_SECS: i64 = 30;

pub struct Dispatcher {
    queue: Arc<dyn QueueBackend>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    checkin: CheckinWorker,
    escalation: EscalationWorker,
    release: ReleaseWorker,
    notify: NotifyWorker,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueBackend>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        checkin: CheckinWorker,
        escalation: EscalationWorker,
        release: ReleaseWorker,
        notify: NotifyWorker,
    ) -> Self {
        Self {
            queue,
            store,
            clock,
            checkin,
            escalation,
            release,
            notify,
        }
    }

    /// Claim and run one job from `queue`. Returns whether a job was found.
    pub async fn poll_once(&self, queue: QueueName) -> Result<bool> {
        let now = self.clock.now();
        let lease = chrono::Duration::seconds(JOB_BUDGET.as_secs() as i64 + LEASE_SLACK_SECS);

        let Some(job) = self.queue.claim(queue, now, lease).await? else {
            return Ok(false);
        };

        debug!(
            job_id = %job.id,
            queue = queue.as_str(),
            attempt = job.attempts,
            "Executing job"
        );

        let execution = tokio::time::timeout(JOB_BUDGET, self.execute(&job)).await;
        let finished = self.clock.now();

        match execution {
            Ok(Ok(())) => {
                self.queue.complete(job.id, finished).await?;
                Ok(true)
            }
            Ok(Err(e)) => {
                self.record_failure(&job, &e.to_string(), finished).await?;
                Ok(true)
            }
            Err(_) => {
                let timeout = JobError::Timeout {
                    id: job.id,
                    budget: JOB_BUDGET,
                };
                self.record_failure(&job, &timeout.to_string(), finished)
                    .await?;
                Ok(true)
            }
        }
    }

    /// Run every due job to completion across all queues. Used by tests and
    /// at startup to drain a backlog deterministically.
    pub async fn process_available(&self) -> Result<usize> {
        let mut processed = 0;
        loop {
            let mut any = false;
            for queue in QueueName::ALL {
                while self.poll_once(queue).await? {
                    processed += 1;
                    any = true;
                }
            }
            if !any {
                return Ok(processed);
            }
        }
    }

    async fn execute(&self, job: &Job) -> Result<()> {
        match &job.payload {
            JobPayload::Checkin { check_in_id } => self.checkin.handle(*check_in_id).await,
            JobPayload::Escalation {
                user_id,
                level,
                expected_missed,
            } => {
                self.escalation
                    .handle(*user_id, *level, *expected_missed)
                    .await
            }
            JobPayload::Release { user_id } => self.release.handle(*user_id).await,
            JobPayload::Email {
                to,
                subject,
                html,
                text,
                ..
            } => self.notify.handle_email(to, subject, html, text).await,
            JobPayload::Sms { to, message } => self.notify.handle_sms(to, message).await,
        }
    }

    async fn record_failure(
        &self,
        job: &Job,
        reason: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        warn!(
            job_id = %job.id,
            queue = job.queue.as_str(),
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            reason,
            "Job failed"
        );

        match self.queue.fail(job, reason, now).await? {
            JobFate::Retried { run_at } => {
                debug!(job_id = %job.id, retry_at = %run_at, "Job requeued");
            }
            JobFate::DeadLettered => {
                error!(job_id = %job.id, queue = job.queue.as_str(), "Job dead-lettered");
                self.store
                    .append_audit(
                        job.payload.user_scope(),
                        crate::model::AuditKind::JobFailed,
                        serde_json::json!({
                            "job_id": job.id,
                            "queue": job.queue.as_str(),
                            "idempotency_key": job.idempotency_key,
                            "attempts": job.attempts,
                            "error": reason,
                        }),
                        now,
                    )
                    .await
                    .map_err(Error::Store)?;
            }
        }
        Ok(())
    }
}

/// Spawn the consumer loops: `concurrency` per queue (release: one). Returns
/// the handles and a shutdown flag; setting the flag stops claiming, and
/// in-flight jobs finish before the loops exit.
pub fn spawn_dispatcher(
    dispatcher: Arc<Dispatcher>,
    concurrency: usize,
    poll_interval: StdDuration,
) -> (Vec<JoinHandle<()>>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for queue in QueueName::ALL {
        for slot in 0..queue.concurrency(concurrency) {
            let dispatcher = Arc::clone(&dispatcher);
            let shutdown = Arc::clone(&shutdown);

            handles.push(tokio::spawn(async move {
                debug!(queue = queue.as_str(), slot, "Consumer loop started");
                let mut tick = tokio::time::interval(poll_interval);

                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        debug!(queue = queue.as_str(), slot, "Consumer loop stopping");
                        return;
                    }

                    match dispatcher.poll_once(queue).await {
                        // Found work: poll again immediately.
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(e) => {
                            error!(queue = queue.as_str(), "Consumer poll failed: {e}");
                        }
                    }

                    tick.tick().await;
                }
            }));
        }
    }

    info!(
        queues = QueueName::ALL.len(),
        concurrency, "Dispatcher started"
    );
    (handles, shutdown)
}
