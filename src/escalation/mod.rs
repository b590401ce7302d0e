//! Escalation state machine.
//!
//! `step` is a pure, total, deterministic function over
//! `(PollingConfig, Event)`. It never touches the store or the queue; it
//! returns the updated config plus a list of side-effect descriptors that the
//! calling worker executes. Per-user serialization is the caller's job (the
//! store runs `step` inside its write transaction).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AuditKind, PollingConfig, PollingStatus};

/// Everything that can happen to a polling config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// The user acknowledged a check-in in time.
    Confirm,
    /// A check-in expired unacknowledged. `expected_missed` is the miss
    /// counter observed when the escalation was enqueued; a mismatch at apply
    /// time means the user checked in since, and the event is stale.
    Miss { expected_missed: i64 },
    /// The grace window following a `Grace3` entry has elapsed.
    GraceTimeout,
    Pause,
    Resume,
    AdminForceCheckIn,
    AdminTrigger,
}

/// Side-effect descriptors emitted by `step`. The worker that applied the
/// event is responsible for executing them (after the state write commits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Create a `Pending` check-in expiring after the grace window for `level`.
    CreateGraceCheckIn { level: u8, expires_in: Duration },
    /// Enqueue the release job (idempotent on `release:<user_id>`).
    EnqueueRelease { delay: Duration },
    /// Append an audit event.
    Audit(AuditKind),
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub config: PollingConfig,
    pub effects: Vec<Effect>,
}

impl Step {
    fn unchanged(config: &PollingConfig) -> Step {
        Step {
            config: config.clone(),
            effects: Vec::new(),
        }
    }

    /// Whether the event changed the persisted state at all.
    pub fn is_state_change(&self, before: &PollingConfig) -> bool {
        self.config.status != before.status
            || self.config.current_missed != before.current_missed
            || self.config.next_check_in_due != before.next_check_in_due
            || self.config.last_check_in_at != before.last_check_in_at
    }
}

/// Reset to a healthy cadence: active, counter zeroed, next prompt one period out.
fn reset(config: &PollingConfig, now: DateTime<Utc>, confirmed: bool) -> PollingConfig {
    let mut next = config.clone();
    next.status = PollingStatus::Active;
    next.current_missed = 0;
    next.next_check_in_due = now + config.interval.period();
    if confirmed {
        next.last_check_in_at = Some(now);
    }
    next.updated_at = now;
    next
}

/// Apply one event. Unlisted `(state, event)` combinations are no-ops: the
/// config comes back unchanged with no effects.
pub fn step(config: &PollingConfig, event: &Event, now: DateTime<Utc>) -> Step {
    // Terminal state: nothing moves a triggered record, ever.
    if config.status == PollingStatus::Triggered {
        return Step::unchanged(config);
    }

    match (config.status, event) {
        // ── Confirmation ────────────────────────────────────────────
        (
            PollingStatus::Active
            | PollingStatus::Grace1
            | PollingStatus::Grace2
            | PollingStatus::Grace3,
            Event::Confirm,
        ) => Step {
            config: reset(config, now, true),
            effects: vec![Effect::Audit(AuditKind::CheckInConfirmed)],
        },
        (PollingStatus::Paused, Event::Confirm) => Step::unchanged(config),

        // ── Missed check-in ─────────────────────────────────────────
        (
            PollingStatus::Active
            | PollingStatus::Grace1
            | PollingStatus::Grace2
            | PollingStatus::Grace3,
            Event::Miss { expected_missed },
        ) => {
            if *expected_missed != config.current_missed {
                // The user checked in (or an admin intervened) after this
                // escalation was scheduled. Race-free cancel: no transition.
                return Step {
                    config: config.clone(),
                    effects: vec![Effect::Audit(AuditKind::EscalationSkippedStale)],
                };
            }

            let level = match config.status {
                PollingStatus::Active => 1,
                PollingStatus::Grace1 => 2,
                _ => 3,
            };
            let grace = config.grace_period(level);

            let mut next = config.clone();
            next.status = PollingStatus::grace(level);
            next.current_missed += 1;
            next.updated_at = now;

            let mut effects = vec![
                Effect::CreateGraceCheckIn {
                    level,
                    expires_in: grace,
                },
                Effect::Audit(AuditKind::escalation(level)),
            ];
            if next.status == PollingStatus::Grace3 {
                effects.push(Effect::EnqueueRelease {
                    delay: config.grace_period(3),
                });
            }

            Step {
                config: next,
                effects,
            }
        }
        (PollingStatus::Paused, Event::Miss { .. }) => Step::unchanged(config),

        // ── Grace timeout ───────────────────────────────────────────
        // The release procedure itself performs the TRIGGERED flip under its
        // own transaction; here we only request it.
        (PollingStatus::Grace3, Event::GraceTimeout) => Step {
            config: config.clone(),
            effects: vec![Effect::EnqueueRelease {
                delay: Duration::zero(),
            }],
        },
        (_, Event::GraceTimeout) => Step::unchanged(config),

        // ── Administrative ──────────────────────────────────────────
        (
            PollingStatus::Active
            | PollingStatus::Grace1
            | PollingStatus::Grace2
            | PollingStatus::Grace3,
            Event::Pause,
        ) => {
            let mut next = config.clone();
            next.status = PollingStatus::Paused;
            next.updated_at = now;
            Step {
                config: next,
                effects: vec![Effect::Audit(AuditKind::PollingPaused)],
            }
        }
        (PollingStatus::Paused, Event::Pause) => Step::unchanged(config),

        (PollingStatus::Paused, Event::Resume) => Step {
            config: reset(config, now, false),
            effects: vec![Effect::Audit(AuditKind::PollingResumed)],
        },
        (_, Event::Resume) => Step::unchanged(config),

        (_, Event::AdminForceCheckIn) => Step {
            config: reset(config, now, true),
            effects: vec![Effect::Audit(AuditKind::AdminForceCheckIn)],
        },

        (PollingStatus::Paused, Event::AdminTrigger) => Step::unchanged(config),
        (_, Event::AdminTrigger) => Step {
            config: config.clone(),
            effects: vec![
                Effect::EnqueueRelease {
                    delay: Duration::zero(),
                },
                Effect::Audit(AuditKind::AdminTrigger),
            ],
        },

        // Covered by the terminal check above; kept for match totality.
        (PollingStatus::Triggered, _) => Step::unchanged(config),
    }
}
