//! Append-only audit log. Every state transition, administrative override,
//! escalation, release, and access grant lands here. Rows are never mutated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    CheckInIssued,
    CheckInConfirmed,
    CheckInMissed,
    CheckInCancelled,
    EscalationLevel1,
    EscalationLevel2,
    EscalationLevel3,
    EscalationSkippedStale,
    PollingPaused,
    PollingResumed,
    AdminForceCheckIn,
    AdminTrigger,
    DeathProtocolTriggered,
    AccessGranted,
    LetterDelivered,
    TrusteeVerified,
    TrusteeRevoked,
    JobFailed,
}

impl AuditKind {
    /// Escalation event for a grace level (1..=3).
    pub fn escalation(level: u8) -> AuditKind {
        match level {
            1 => AuditKind::EscalationLevel1,
            2 => AuditKind::EscalationLevel2,
            _ => AuditKind::EscalationLevel3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::CheckInIssued => "CHECK_IN_ISSUED",
            AuditKind::CheckInConfirmed => "CHECK_IN_CONFIRMED",
            AuditKind::CheckInMissed => "CHECK_IN_MISSED",
            AuditKind::CheckInCancelled => "CHECK_IN_CANCELLED",
            AuditKind::EscalationLevel1 => "ESCALATION_LEVEL_1",
            AuditKind::EscalationLevel2 => "ESCALATION_LEVEL_2",
            AuditKind::EscalationLevel3 => "ESCALATION_LEVEL_3",
            AuditKind::EscalationSkippedStale => "ESCALATION_SKIPPED_STALE",
            AuditKind::PollingPaused => "POLLING_PAUSED",
            AuditKind::PollingResumed => "POLLING_RESUMED",
            AuditKind::AdminForceCheckIn => "ADMIN_FORCE_CHECK_IN",
            AuditKind::AdminTrigger => "ADMIN_TRIGGER",
            AuditKind::DeathProtocolTriggered => "DEATH_PROTOCOL_TRIGGERED",
            AuditKind::AccessGranted => "ACCESS_GRANTED",
            AuditKind::LetterDelivered => "LETTER_DELIVERED",
            AuditKind::TrusteeVerified => "TRUSTEE_VERIFIED",
            AuditKind::TrusteeRevoked => "TRUSTEE_REVOKED",
            AuditKind::JobFailed => "JOB_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CHECK_IN_ISSUED" => Some(AuditKind::CheckInIssued),
            "CHECK_IN_CONFIRMED" => Some(AuditKind::CheckInConfirmed),
            "CHECK_IN_MISSED" => Some(AuditKind::CheckInMissed),
            "CHECK_IN_CANCELLED" => Some(AuditKind::CheckInCancelled),
            "ESCALATION_LEVEL_1" => Some(AuditKind::EscalationLevel1),
            "ESCALATION_LEVEL_2" => Some(AuditKind::EscalationLevel2),
            "ESCALATION_LEVEL_3" => Some(AuditKind::EscalationLevel3),
            "ESCALATION_SKIPPED_STALE" => Some(AuditKind::EscalationSkippedStale),
            "POLLING_PAUSED" => Some(AuditKind::PollingPaused),
            "POLLING_RESUMED" => Some(AuditKind::PollingResumed),
            "ADMIN_FORCE_CHECK_IN" => Some(AuditKind::AdminForceCheckIn),
            "ADMIN_TRIGGER" => Some(AuditKind::AdminTrigger),
            "DEATH_PROTOCOL_TRIGGERED" => Some(AuditKind::DeathProtocolTriggered),
            "ACCESS_GRANTED" => Some(AuditKind::AccessGranted),
            "LETTER_DELIVERED" => Some(AuditKind::LetterDelivered),
            "TRUSTEE_VERIFIED" => Some(AuditKind::TrusteeVerified),
            "TRUSTEE_REVOKED" => Some(AuditKind::TrusteeRevoked),
            "JOB_FAILED" => Some(AuditKind::JobFailed),
        _ => None,
        }
    }
}

/// One immutable audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    /// Absent for system-level events (e.g. dead-lettered maintenance jobs).
    pub user_id: Option<Uuid>,
    pub kind: AuditKind,
    /// Structured event detail (counts, ids, observer metadata).
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            AuditKind::CheckInConfirmed,
            AuditKind::EscalationLevel2,
            AuditKind::EscalationSkippedStale,
            AuditKind::DeathProtocolTriggered,
            AuditKind::AccessGranted,
            AuditKind::JobFailed,
        ] {
            assert_eq!(AuditKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn escalation_levels_map() {
        assert_eq!(AuditKind::escalation(1), AuditKind::EscalationLevel1);
        assert_eq!(AuditKind::escalation(2), AuditKind::EscalationLevel2);
        assert_eq!(AuditKind::escalation(3), AuditKind::EscalationLevel3);
    }
}
