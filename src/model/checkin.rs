//! Check-in prompts — time-bounded, single-use liveness proofs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolution of a check-in. `Pending` rows are mutated exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInStatus {
    Pending,
    Confirmed,
    Missed,
    Cancelled,
}

impl CheckInStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInStatus::Pending => "pending",
            CheckInStatus::Confirmed => "confirmed",
            CheckInStatus::Missed => "missed",
            CheckInStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CheckInStatus::Pending),
            "confirmed" => Some(CheckInStatus::Confirmed),
            "missed" => Some(CheckInStatus::Missed),
            "cancelled" => Some(CheckInStatus::Cancelled),
            _ => None,
        }
    }
}

/// Notification channel a check-in was attempted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendChannel {
    Email,
    Sms,
}

/// A single liveness prompt. Created by the scheduler (regular cadence) or the
/// escalation worker (grace-period warnings), resolved exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckIn {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Unique, URL-safe, single-use confirmation token.
    pub token: String,
    pub status: CheckInStatus,
    /// Channels that were attempted, recorded by the check-in worker.
    pub sent_via: Vec<SendChannel>,
    pub sent_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl CheckIn {
    pub fn new(
        user_id: Uuid,
        token: impl Into<String>,
        sent_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            token: token.into(),
            status: CheckInStatus::Pending,
            sent_via: Vec::new(),
            sent_at,
            responded_at: None,
            expires_at,
        }
    }

    /// A confirmation is valid strictly before expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Request metadata recorded with a confirmation for the audit trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expiry_boundary_is_inclusive() {
        let now = Utc::now();
        let check_in = CheckIn::new(Uuid::new_v4(), "tok", now, now + Duration::days(3));

        assert!(!check_in.is_expired(now));
        assert!(!check_in.is_expired(now + Duration::days(3) - Duration::milliseconds(1)));
        // expires_at exactly equal to now counts as expired.
        assert!(check_in.is_expired(now + Duration::days(3)));
        assert!(check_in.is_expired(now + Duration::days(4)));
    }
}
