//! Job model — queue identities, payloads, idempotency keys, backoff.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The five logical queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Checkin,
    Escalation,
    Release,
    Email,
    Sms,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Checkin,
        QueueName::Escalation,
        QueueName::Release,
        QueueName::Email,
        QueueName::Sms,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Checkin => "checkin",
            QueueName::Escalation => "escalation",
            QueueName::Release => "release",
            QueueName::Email => "email",
            QueueName::Sms => "sms",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "checkin" => Some(QueueName::Checkin),
            "escalation" => Some(QueueName::Escalation),
            "release" => Some(QueueName::Release),
            "email" => Some(QueueName::Email),
            "sms" => Some(QueueName::Sms),
            _ => None,
        }
    }

    /// First-retry backoff: 30 s for notification queues, 60 s for
    /// state-transition queues. Doubles per attempt.
    pub fn base_backoff(&self) -> Duration {
        match self {
            QueueName::Checkin | QueueName::Email | QueueName::Sms => Duration::seconds(30),
            QueueName::Escalation | QueueName::Release => Duration::seconds(60),
        }
    }

    pub fn default_max_attempts(&self) -> u32 {
        match self {
            QueueName::Release => 5,
            _ => 3,
        }
    }

    /// Per-queue concurrency cap. Release is globally serialized.
    pub fn concurrency(&self, default: usize) -> usize {
        match self {
            QueueName::Release => 1,
            _ => default.max(1),
        }
    }
}

/// Exponential backoff for the next retry after `attempts` executions.
pub fn backoff_delay(queue: QueueName, attempts: u32) -> Duration {
    let base = queue.base_backoff();
    base * 2_i32.saturating_pow(attempts.saturating_sub(1).min(16))
}

/// Closed set of job payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Materialize and dispatch notifications for a check-in.
    Checkin { check_in_id: Uuid },
    /// Apply a `Miss` transition. `expected_missed` is the counter observed
    /// at enqueue; the state machine cancels the job if it moved since.
    Escalation {
        user_id: Uuid,
        level: u8,
        expected_missed: i64,
    },
    /// Run the death protocol for a user.
    Release { user_id: Uuid },
    /// Deliver a rendered email. `letter_id` links final-letter deliveries so
    /// retries stay idempotent.
    Email {
        to: String,
        subject: String,
        html: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        letter_id: Option<Uuid>,
    },
    /// Deliver a rendered SMS.
    Sms { to: String, message: String },
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Checkin { .. } => QueueName::Checkin,
            JobPayload::Escalation { .. } => QueueName::Escalation,
            JobPayload::Release { .. } => QueueName::Release,
            JobPayload::Email { .. } => QueueName::Email,
            JobPayload::Sms { .. } => QueueName::Sms,
        }
    }

    /// Owning user, where the payload names one (for dead-letter audit).
    pub fn user_scope(&self) -> Option<Uuid> {
        match self {
            JobPayload::Escalation { user_id, .. } | JobPayload::Release { user_id } => {
                Some(*user_id)
            }
            _ => None,
        }
    }
}

/// A job to enqueue.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub payload: JobPayload,
    pub run_at: DateTime<Utc>,
    pub idempotency_key: String,
    /// `None` uses the queue default.
    pub max_attempts: Option<u32>,
}

impl JobSpec {
    pub fn checkin(check_in_id: Uuid, run_at: DateTime<Utc>) -> Self {
        Self {
            payload: JobPayload::Checkin { check_in_id },
            run_at,
            idempotency_key: format!("checkin:{check_in_id}"),
            max_attempts: None,
        }
    }

    pub fn escalation(
        user_id: Uuid,
        level: u8,
        expected_missed: i64,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payload: JobPayload::Escalation {
                user_id,
                level,
                expected_missed,
            },
            run_at,
            idempotency_key: format!("escalation:{user_id}:{level}:{expected_missed}"),
            max_attempts: None,
        }
    }

    pub fn release(user_id: Uuid, run_at: DateTime<Utc>) -> Self {
        Self {
            payload: JobPayload::Release { user_id },
            run_at,
            idempotency_key: format!("release:{user_id}"),
            max_attempts: None,
        }
    }

    pub fn email(
        key: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        html: impl Into<String>,
        text: impl Into<String>,
        letter_id: Option<Uuid>,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payload: JobPayload::Email {
                to: to.into(),
                subject: subject.into(),
                html: html.into(),
                text: text.into(),
                letter_id,
            },
            run_at,
            idempotency_key: key.into(),
            max_attempts: None,
        }
    }

    pub fn sms(
        key: impl Into<String>,
        to: impl Into<String>,
        message: impl Into<String>,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payload: JobPayload::Sms {
                to: to.into(),
                message: message.into(),
            },
            run_at,
            idempotency_key: key.into(),
            max_attempts: None,
        }
    }
}

/// A claimed job handed to a worker. `attempts` counts this execution.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub idempotency_key: String,
}

/// What became of a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFate {
    /// Requeued with backoff.
    Retried { run_at: DateTime<Utc> },
    /// Out of attempts; parked for the audit log and operator review.
    DeadLettered,
}

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    New(Uuid),
    /// An active (or recently completed) job already carries this key.
    Coalesced(Uuid),
}

impl Enqueued {
    pub fn id(&self) -> Uuid {
        match self {
            Enqueued::New(id) | Enqueued::Coalesced(id) => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(QueueName::Email, 1), Duration::seconds(30));
        assert_eq!(backoff_delay(QueueName::Email, 2), Duration::seconds(60));
        assert_eq!(backoff_delay(QueueName::Email, 3), Duration::seconds(120));

        assert_eq!(
            backoff_delay(QueueName::Escalation, 1),
            Duration::seconds(60)
        );
        assert_eq!(
            backoff_delay(QueueName::Escalation, 3),
            Duration::seconds(240)
        );
    }

    #[test]
    fn release_queue_is_serialized() {
        assert_eq!(QueueName::Release.concurrency(5), 1);
        assert_eq!(QueueName::Email.concurrency(5), 5);
        assert_eq!(QueueName::Release.default_max_attempts(), 5);
        assert_eq!(QueueName::Checkin.default_max_attempts(), 3);
    }

    #[test]
    fn specs_carry_semantic_idempotency_keys() {
        let user = Uuid::new_v4();
        let spec = JobSpec::escalation(user, 2, 1, Utc::now());
        assert_eq!(spec.idempotency_key, format!("escalation:{user}:2:1"));
        assert_eq!(spec.payload.queue(), QueueName::Escalation);

        let spec = JobSpec::release(user, Utc::now());
        assert_eq!(spec.idempotency_key, format!("release:{user}"));
    }

    #[test]
    fn payload_serde_round_trip() {
        let payload = JobPayload::Escalation {
            user_id: Uuid::new_v4(),
            level: 2,
            expected_missed: 1,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"kind\":\"escalation\""));
        let back: JobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
