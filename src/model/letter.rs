//! Final letters — pre-composed messages delivered by the release procedure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Letter lifecycle. Only `Ready` letters are delivered; `Delivered` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LetterStatus {
    Draft,
    Ready,
    Delivered,
}

impl LetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LetterStatus::Draft => "draft",
            LetterStatus::Ready => "ready",
            LetterStatus::Delivered => "delivered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(LetterStatus::Draft),
            "ready" => Some(LetterStatus::Ready),
            "delivered" => Some(LetterStatus::Delivered),
            _ => None,
        }
    }
}

/// A final letter. The body is ciphertext opaque to the core; decryption
/// happens client-side with keys the core never holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalLetter {
    pub id: Uuid,
    pub user_id: Uuid,
    pub recipient_name: String,
    pub recipient_email: String,
    pub subject: String,
    /// Base64 ciphertext, opaque to the core.
    pub encrypted_body: String,
    pub nonce: String,
    pub status: LetterStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl FinalLetter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: Uuid,
        recipient_name: impl Into<String>,
        recipient_email: impl Into<String>,
        subject: impl Into<String>,
        encrypted_body: impl Into<String>,
        nonce: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            recipient_name: recipient_name.into(),
            recipient_email: recipient_email.into(),
            subject: subject.into(),
            encrypted_body: encrypted_body.into(),
            nonce: nonce.into(),
            status: LetterStatus::Draft,
            delivered_at: None,
            created_at: now,
        }
    }
}
