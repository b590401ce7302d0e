//! Escalation worker — applies `Miss` transitions and chains the follow-ups.
//!
//! Consumes the `escalation` queue. The transition itself (state machine,
//! grace check-in row, audit) commits inside the store; this worker then
//! enqueues the notification job for the new check-in and, on entry to the
//! final grace level, the delayed release job. The `release:<user_id>`
//! idempotency key guarantees only one release will actually execute.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock as _;
use crate::error::Result;
use crate::queue::{JobSpec, QueueBackend as _};
use crate::store::{MissOutcome, Store as _};
use crate::token::{CHECK_IN_TOKEN_BYTES, TokenGenerator as _};
use crate::workers::WorkerDeps;

pub struct EscalationWorker {
    deps: WorkerDeps,
}

impl EscalationWorker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }

    pub async fn handle(&self, user_id: Uuid, level: u8, expected_missed: i64) -> Result<()> {
        let now = self.deps.clock.now();
        let next_token = self.deps.tokens.mint(CHECK_IN_TOKEN_BYTES);

        let outcome = self
            .deps
            .store
            .apply_miss(user_id, expected_missed, now, &next_token)
            .await?;

        match outcome {
            MissOutcome::Stale => {
                // The user checked in after this job was enqueued.
                info!(
                    user_id = %user_id,
                    expected_missed,
                    "Escalation cancelled as stale"
                );
            }
            MissOutcome::Halted => {
                debug!(user_id = %user_id, "Escalation halted (paused, triggered, or deleted)");
            }
            MissOutcome::Escalated {
                config,
                check_in,
                level: applied_level,
                enqueue_release_after,
            } => {
                if applied_level != level {
                    // The queue payload's level is advisory; the store decides
                    // from actual state.
                    warn!(
                        user_id = %user_id,
                        enqueued_level = level,
                        applied_level,
                        "Escalation level drifted between enqueue and apply"
                    );
                }

                self.deps
                    .queue
                    .enqueue(JobSpec::checkin(check_in.id, now), now)
                    .await?;

                if let Some(delay) = enqueue_release_after {
                    self.deps
                        .queue
                        .enqueue(JobSpec::release(user_id, now + delay), now)
                        .await?;
                }

                info!(
                    user_id = %user_id,
                    level = applied_level,
                    missed = config.current_missed,
                    status = config.status.as_str(),
                    "Escalated"
                );
            }
        }

        Ok(())
    }
}
