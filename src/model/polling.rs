//! Per-user polling state — the record the escalation state machine runs over.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How often the user must prove liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingInterval {
    Weekly,
    Biweekly,
    Monthly,
}

impl PollingInterval {
    /// Gap between scheduled check-ins.
    pub fn period(&self) -> Duration {
        match self {
            PollingInterval::Weekly => Duration::days(7),
            PollingInterval::Biweekly => Duration::days(14),
            PollingInterval::Monthly => Duration::days(30),
        }
    }

    /// How long a regular check-in stays confirmable.
    pub fn response_window(&self) -> Duration {
        match self {
            PollingInterval::Weekly => Duration::days(3),
            PollingInterval::Biweekly => Duration::days(5),
            PollingInterval::Monthly => Duration::days(7),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollingInterval::Weekly => "weekly",
            PollingInterval::Biweekly => "biweekly",
            PollingInterval::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weekly" => Some(PollingInterval::Weekly),
            "biweekly" => Some(PollingInterval::Biweekly),
            "monthly" => Some(PollingInterval::Monthly),
            _ => None,
        }
    }
}

/// Escalation state. `Triggered` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollingStatus {
    Active,
    Paused,
    Grace1,
    Grace2,
    Grace3,
    Triggered,
}

impl PollingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollingStatus::Triggered)
    }

    /// Whether the record participates in escalation (not paused, not terminal).
    pub fn is_escalatable(&self) -> bool {
        matches!(
            self,
            PollingStatus::Active
                | PollingStatus::Grace1
                | PollingStatus::Grace2
                | PollingStatus::Grace3
        )
    }

    /// Grace level a fresh miss escalates into, from this state.
    pub fn next_grace_level(&self) -> Option<u8> {
        match self {
            PollingStatus::Active => Some(1),
            PollingStatus::Grace1 => Some(2),
            PollingStatus::Grace2 | PollingStatus::Grace3 => Some(3),
            PollingStatus::Paused | PollingStatus::Triggered => None,
        }
    }

    /// The grace state for a given level.
    pub fn grace(level: u8) -> PollingStatus {
        match level {
            1 => PollingStatus::Grace1,
            2 => PollingStatus::Grace2,
            _ => PollingStatus::Grace3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollingStatus::Active => "active",
            PollingStatus::Paused => "paused",
            PollingStatus::Grace1 => "grace_1",
            PollingStatus::Grace2 => "grace_2",
            PollingStatus::Grace3 => "grace_3",
            PollingStatus::Triggered => "triggered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PollingStatus::Active),
            "paused" => Some(PollingStatus::Paused),
            "grace_1" => Some(PollingStatus::Grace1),
            "grace_2" => Some(PollingStatus::Grace2),
            "grace_3" => Some(PollingStatus::Grace3),
            "triggered" => Some(PollingStatus::Triggered),
            _ => None,
        }
    }
}

/// One per user. All mutations go through the escalation state machine and are
/// serialized by the store's write transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    pub id: Uuid,
    pub user_id: Uuid,
    pub interval: PollingInterval,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    /// Grace window lengths in days, levels 1..=3. Each 1–30.
    pub grace_period_1: i64,
    pub grace_period_2: i64,
    pub grace_period_3: i64,
    pub missed_before_trigger: i64,
    /// Reset to 0 on every confirmation; otherwise nondecreasing.
    pub current_missed: i64,
    pub last_check_in_at: Option<DateTime<Utc>>,
    pub next_check_in_due: DateTime<Utc>,
    pub status: PollingStatus,
    pub triggered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PollingConfig {
    /// Fresh config for a new user: active, first check-in due one period out.
    pub fn new(user_id: Uuid, interval: PollingInterval, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            interval,
            email_enabled: true,
            sms_enabled: false,
            grace_period_1: 7,
            grace_period_2: 14,
            grace_period_3: 7,
            missed_before_trigger: 3,
            current_missed: 0,
            last_check_in_at: None,
            next_check_in_due: now + interval.period(),
            status: PollingStatus::Active,
            triggered_at: None,
            updated_at: now,
        }
    }

    /// Grace window for a level (1..=3).
    pub fn grace_period(&self, level: u8) -> Duration {
        let days = match level {
            1 => self.grace_period_1,
            2 => self.grace_period_2,
            _ => self.grace_period_3,
        };
        Duration::days(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_periods() {
        assert_eq!(PollingInterval::Weekly.period(), Duration::days(7));
        assert_eq!(PollingInterval::Biweekly.period(), Duration::days(14));
        assert_eq!(PollingInterval::Monthly.period(), Duration::days(30));
    }

    #[test]
    fn response_windows() {
        assert_eq!(PollingInterval::Weekly.response_window(), Duration::days(3));
        assert_eq!(PollingInterval::Biweekly.response_window(), Duration::days(5));
        assert_eq!(PollingInterval::Monthly.response_window(), Duration::days(7));
    }

    #[test]
    fn next_grace_level_mapping() {
        assert_eq!(PollingStatus::Active.next_grace_level(), Some(1));
        assert_eq!(PollingStatus::Grace1.next_grace_level(), Some(2));
        assert_eq!(PollingStatus::Grace2.next_grace_level(), Some(3));
        assert_eq!(PollingStatus::Grace3.next_grace_level(), Some(3));
        assert_eq!(PollingStatus::Paused.next_grace_level(), None);
        assert_eq!(PollingStatus::Triggered.next_grace_level(), None);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            PollingStatus::Active,
            PollingStatus::Paused,
            PollingStatus::Grace1,
            PollingStatus::Grace2,
            PollingStatus::Grace3,
            PollingStatus::Triggered,
        ] {
            assert_eq!(PollingStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn new_config_is_active_with_due_one_period_out() {
        let now = Utc::now();
        let config = PollingConfig::new(Uuid::new_v4(), PollingInterval::Monthly, now);
        assert_eq!(config.status, PollingStatus::Active);
        assert_eq!(config.current_missed, 0);
        assert_eq!(config.next_check_in_due, now + Duration::days(30));
        assert!(config.triggered_at.is_none());
    }
}
