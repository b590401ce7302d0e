//! Scheduler — the single-instance periodic sweep.
//!
//! One pass runs three batch-bounded subscans:
//!   1. issue check-ins for active configs that are due,
//!   2. expire stale pending check-ins and enqueue escalations,
//!   3. enqueue the release job for configs stuck in the final grace state.
//!
//! The sweep is restartable and idempotent: per-row conditions remove
//! processed rows from the next selection, and the queue's idempotency keys
//! collapse duplicate enqueues from overlapping or repeated passes. A store
//! lease keeps the sweep single-instance across deployments.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::queue::{JobSpec, QueueBackend};
use crate::store::Store;
use crate::token::TokenGenerator;

/// Name of the scheduler's singleton lease row.
const LEASE_NAME: &str = "scheduler-sweep";

/// Work done by one sweep, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub issued: usize,
    pub expired: usize,
    pub releases: usize,
}

pub struct Sweeper {
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueBackend>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenGenerator>,
    /// Per-subscan batch bound.
    batch: usize,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn QueueBackend>,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenGenerator>,
        batch: usize,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            tokens,
            batch: batch.max(1),
        }
    }

    /// One full pass over the three subscans.
    pub async fn run_once(&self) -> Result<SweepStats> {
        let now = self.clock.now();
        let mut stats = SweepStats::default();

        // 1. Due check-ins.
        let issued = self
            .store
            .issue_due_check_ins(now, self.batch, self.tokens.as_ref())
            .await?;
        for check_in in &issued {
            self.queue
                .enqueue(JobSpec::checkin(check_in.id, now), now)
                .await?;
        }
        stats.issued = issued.len();

        // 2. Expired check-ins → escalations.
        let expired = self.store.expire_pending_check_ins(now, self.batch).await?;
        for row in &expired {
            // Paused and triggered owners are marked missed without
            // escalation; the state machine would reject it anyway.
            let Some(level) = row.config.status.next_grace_level() else {
                debug!(
                    user_id = %row.config.user_id,
                    status = row.config.status.as_str(),
                    "Missed check-in without escalation"
                );
                continue;
            };
            self.queue
                .enqueue(
                    JobSpec::escalation(
                        row.config.user_id,
                        level,
                        row.config.current_missed,
                        now,
                    ),
                    now,
                )
                .await?;
        }
        stats.expired = expired.len();

        // 3. Final grace timeout → release.
        let timeouts = self.store.list_grace3_timeouts(now, self.batch).await?;
        for config in &timeouts {
            self.queue
                .enqueue(JobSpec::release(config.user_id, now), now)
                .await?;
        }
        stats.releases = timeouts.len();

        if stats != SweepStats::default() {
            info!(
                issued = stats.issued,
                expired = stats.expired,
                releases = stats.releases,
                "Sweep completed"
            );
        }
        Ok(stats)
    }
}

/// Spawn the sweep ticker. Each tick re-acquires the singleton lease before
/// sweeping, so at most one instance per deployment does the work. Returns
/// the task handle and a shutdown flag; the current sweep finishes before
/// the loop exits.
pub fn spawn_scheduler(
    sweeper: Arc<Sweeper>,
    period: StdDuration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let holder = Uuid::new_v4().to_string();

    let handle = tokio::spawn(async move {
        info!(period_secs = period.as_secs(), "Scheduler started");
        let mut tick = tokio::time::interval(period);
        // Lease TTL outlives two periods so a slow sweep doesn't lose it.
        let ttl = Duration::from_std(period * 2).unwrap_or(Duration::seconds(120));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Scheduler shutting down");
                return;
            }

            let now = sweeper.clock.now();
            match sweeper
                .store
                .try_acquire_lease(LEASE_NAME, &holder, ttl, now)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Another scheduler instance holds the lease");
                    continue;
                }
                Err(e) => {
                    error!("Lease acquisition failed: {e}");
                    continue;
                }
            }

            if let Err(e) = sweeper.run_once().await {
                error!("Sweep failed: {e}");
            }
        }
    });

    (handle, shutdown_flag)
}
