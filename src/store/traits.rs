//! Unified `Store` trait — single async interface for all persistence.
//!
//! Entity CRUD plus the compound transactional operations the scheduler and
//! workers drive. Every operation that compares wall-clock time takes `now`
//! explicitly; the store itself never reads the system clock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    AuditEntry, AuditKind, CheckIn, FinalLetter, Observer, PollingConfig, PollingInterval,
    SendChannel, Trustee, User, Vault, VaultItem, VaultSnapshot,
};
use crate::token::TokenGenerator;

/// A confirmed check-in together with the reset polling config.
#[derive(Debug, Clone)]
pub struct ConfirmedCheckIn {
    pub check_in: CheckIn,
    pub config: PollingConfig,
}

/// A check-in the expiry sweep just marked `Missed`, with the owning config
/// snapshot so the scheduler can decide whether to enqueue an escalation.
#[derive(Debug, Clone)]
pub struct ExpiredCheckIn {
    pub check_in: CheckIn,
    pub config: PollingConfig,
}

/// Result of applying a `Miss` event transactionally.
#[derive(Debug, Clone)]
pub enum MissOutcome {
    /// The transition happened; the worker must enqueue the follow-ups.
    Escalated {
        config: PollingConfig,
        /// Freshly created grace-period check-in (`Pending`).
        check_in: CheckIn,
        /// Grace level entered (1..=3).
        level: u8,
        /// Set when the new state is `Grace3`: enqueue `release:<user_id>`
        /// with this delay.
        enqueue_release_after: Option<Duration>,
    },
    /// The miss counter moved since enqueue; nothing changed.
    Stale,
    /// The owner is paused, triggered, or gone; nothing to do.
    Halted,
}

/// Result of the release procedure's single transaction.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    /// A previous run already committed; nothing was written.
    AlreadyTriggered,
    /// This run committed the trigger. The worker fans out notifications.
    Released {
        config: PollingConfig,
        /// Eligible trustees, now `Active` with freshly minted access tokens.
        trustees: Vec<Trustee>,
        /// `Ready` letters selected for delivery.
        letters: Vec<FinalLetter>,
    },
}

/// Backend-agnostic persistence trait for the sentinel core.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Users & polling configs ─────────────────────────────────────

    /// Create a user and seed their polling config (active, first check-in
    /// due one period out) in one transaction.
    async fn create_user(
        &self,
        user: &User,
        interval: PollingInterval,
        now: DateTime<Utc>,
    ) -> Result<PollingConfig, StoreError>;

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Delete a user; cascades to config, check-ins, trustees, letters, vault.
    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get_polling_config(&self, user_id: Uuid) -> Result<Option<PollingConfig>, StoreError>;

    // ── Check-ins ───────────────────────────────────────────────────

    async fn get_check_in(&self, id: Uuid) -> Result<Option<CheckIn>, StoreError>;

    async fn get_check_in_by_token(&self, token: &str) -> Result<Option<CheckIn>, StoreError>;

    /// Record which channels the check-in worker attempted.
    async fn set_check_in_sent_via(
        &self,
        id: Uuid,
        channels: &[SendChannel],
    ) -> Result<(), StoreError>;

    /// Atomic confirmation by token. Fails with `NotFound` for an unknown
    /// token, `AlreadyResolved` when the row left `Pending`, `Expired` when
    /// `expires_at <= now`. On success the check-in is `Confirmed`, the
    /// owning config is reset to `Active`, and the audit entry is appended,
    /// all in one commit.
    async fn confirm_check_in(
        &self,
        token: &str,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<ConfirmedCheckIn, StoreError>;

    /// Authenticated manual confirmation: confirm every `Pending` check-in of
    /// the user and reset the config. Errors with `NotFound` when the user has
    /// no config, `Conflict` when it is terminal.
    async fn confirm_latest_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError>;

    // ── Scheduler subscans ──────────────────────────────────────────

    /// Subscan 1: for each active config with `next_check_in_due <= now`
    /// (up to `limit`), create a `Pending` check-in with a fresh token and
    /// advance the due date, one transaction per row. Returns the created
    /// check-ins for the scheduler to enqueue notification jobs.
    async fn issue_due_check_ins(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        tokens: &dyn TokenGenerator,
    ) -> Result<Vec<CheckIn>, StoreError>;

    /// Subscan 2: mark `Pending` check-ins with `expires_at <= now` as
    /// `Missed` (up to `limit`) and return them with their owning configs.
    async fn expire_pending_check_ins(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredCheckIn>, StoreError>;

    /// Subscan 3: configs sitting in `Grace3` past their final grace window.
    async fn list_grace3_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PollingConfig>, StoreError>;

    // ── Escalation & release ────────────────────────────────────────

    /// Apply a `Miss` event under the write transaction: lock the config, run
    /// the state machine, persist the transition, create the next grace
    /// check-in from `next_token`, append audit. The stale guard and the
    /// paused/triggered halt are decided inside the transaction.
    async fn apply_miss(
        &self,
        user_id: Uuid,
        expected_missed: i64,
        now: DateTime<Utc>,
        next_token: &str,
    ) -> Result<MissOutcome, StoreError>;

    /// The death protocol's single transaction: if already `Triggered`,
    /// nothing is written. Otherwise grant access tokens to all eligible
    /// trustees, select `Ready` letters, flip the config to `Triggered`, and
    /// append the audit trail, atomically.
    async fn run_release(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        tokens: &dyn TokenGenerator,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Administrative pause. `Conflict` when terminal.
    async fn pause(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<PollingConfig, StoreError>;

    /// Administrative resume: reset and reschedule from `now`.
    async fn resume(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<PollingConfig, StoreError>;

    /// Admin force check-in: reset the config regardless of pending rows and
    /// cancel any still-`Pending` check-ins.
    async fn admin_force_check_in(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PollingConfig, StoreError>;

    /// Record an administrative trigger request. `Conflict` when the config
    /// is already terminal. The actual state flip happens in `run_release`.
    async fn admin_trigger(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    // ── Trustees ────────────────────────────────────────────────────

    async fn create_trustee(&self, trustee: &Trustee) -> Result<(), StoreError>;

    async fn list_trustees(&self, user_id: Uuid) -> Result<Vec<Trustee>, StoreError>;

    async fn get_trustee_by_access_token(
        &self,
        token: &str,
    ) -> Result<Option<Trustee>, StoreError>;

    async fn get_trustee_by_verification_token(
        &self,
        token: &str,
    ) -> Result<Option<Trustee>, StoreError>;

    /// Single-use email verification: locate by token, flip
    /// `Pending → Verified`, clear the token, append audit. A second use of
    /// the same token is `NotFound`.
    async fn verify_trustee(&self, token: &str, now: DateTime<Utc>) -> Result<Trustee, StoreError>;

    async fn revoke_trustee(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    // ── Final letters ───────────────────────────────────────────────

    async fn create_letter(&self, letter: &FinalLetter) -> Result<(), StoreError>;

    async fn list_letters(&self, user_id: Uuid) -> Result<Vec<FinalLetter>, StoreError>;

    /// `Draft → Ready`. `Conflict` when already delivered.
    async fn mark_letter_ready(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// `Ready → Delivered` follow-up commit after the delivery job is
    /// enqueued. Idempotent: already-delivered letters are left alone.
    async fn mark_letter_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    // ── Vault ───────────────────────────────────────────────────────

    async fn upsert_vault(&self, vault: &Vault) -> Result<(), StoreError>;

    async fn add_vault_item(&self, item: &VaultItem) -> Result<(), StoreError>;

    /// The opaque payload handed to a trustee with a live grant.
    async fn get_vault_snapshot(
        &self,
        user_id: Uuid,
    ) -> Result<Option<VaultSnapshot>, StoreError>;

    // ── Audit & lease ───────────────────────────────────────────────

    async fn append_audit(
        &self,
        user_id: Option<Uuid>,
        kind: AuditKind,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn recent_audit(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, StoreError>;

    /// Scheduler singleton gate: acquire or refresh the named lease. Returns
    /// `true` when `holder` owns the lease after the call.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
