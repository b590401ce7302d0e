//! Trustees — third parties granted time-limited vault access at release.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trustee lifecycle. Only `Verified` and `Active` trustees are eligible for
/// access provisioning when the release fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrusteeStatus {
    Pending,
    Verified,
    Active,
    Revoked,
}

impl TrusteeStatus {
    pub fn is_eligible_for_release(&self) -> bool {
        matches!(self, TrusteeStatus::Verified | TrusteeStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrusteeStatus::Pending => "pending",
            TrusteeStatus::Verified => "verified",
            TrusteeStatus::Active => "active",
            TrusteeStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TrusteeStatus::Pending),
            "verified" => Some(TrusteeStatus::Verified),
            "active" => Some(TrusteeStatus::Active),
            "revoked" => Some(TrusteeStatus::Revoked),
            _ => None,
        }
    }
}

/// A nominated trustee. `(user_id, email)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trustee {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub relationship: String,
    pub status: TrusteeStatus,
    /// Single-use email-verification token; cleared on verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    /// Minted exactly once, by the release procedure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub access_granted_at: Option<DateTime<Utc>>,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Trustee {
    pub fn new(
        user_id: Uuid,
        name: impl Into<String>,
        email: impl Into<String>,
        relationship: impl Into<String>,
        verification_token: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.into(),
            email: email.into(),
            phone: None,
            relationship: relationship.into(),
            status: TrusteeStatus::Pending,
            verification_token: Some(verification_token.into()),
            verified_at: None,
            access_token: None,
            access_granted_at: None,
            access_expires_at: None,
            created_at: now,
        }
    }

    /// Builder: set the SMS phone number.
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Whether an issued grant is still usable.
    pub fn access_is_live(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_some()
            && self.access_expires_at.is_some_and(|expires| expires > now)
    }
}
