//! Vault read model — opaque ciphertext blobs surfaced to trustees at release.
//!
//! The core never decrypts any of this; encryption and key handling are
//! entirely client-side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-user vault header: the wrapped master key and its KDF parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub id: Uuid,
    pub user_id: Uuid,
    pub encrypted_master_key: String,
    pub master_key_salt: String,
    pub master_key_nonce: String,
    pub created_at: DateTime<Utc>,
}

/// One encrypted vault entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultItem {
    pub id: Uuid,
    pub vault_id: Uuid,
    /// Client-defined kind tag (e.g. "password", "document", "note").
    pub item_type: String,
    pub name: String,
    pub encrypted_data: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// The full payload handed to a trustee with a live access grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub encrypted_master_key: String,
    pub master_key_salt: String,
    pub master_key_nonce: String,
    pub items: Vec<VaultItem>,
}
