//! User account owning a polling config, trustees, letters, and a vault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered user. Deleting a user cascades to everything they own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Unique login/notification address.
    pub email: String,
    pub display_name: String,
    /// Optional SMS recipient; check-ins may still be SMS-enabled without one,
    /// in which case the SMS channel is attempted and dropped by the transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        email: impl Into<String>,
        display_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            display_name: display_name.into(),
            phone: None,
            created_at: now,
        }
    }

    /// Builder: set the SMS phone number.
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}
