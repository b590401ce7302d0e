//! libSQL backend — async `Store` implementation.
//!
//! A single connection guarded by an async mutex. Compound operations run
//! under `BEGIN IMMEDIATE`; SQLite's single-writer property then serializes
//! every read-check-write, which subsumes the per-user row lock the
//! escalation pipeline requires. The pure state machine is invoked *inside*
//! the transaction so the staleness guard is race-free. Each transactional
//! method runs its body against the open transaction and then commits on
//! `Ok`, rolls back on `Err` — the connection never leaks an open
//! transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use libsql::{Connection, Transaction, TransactionBehavior, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::escalation::{self, Effect, Event};
use crate::model::{
    AuditEntry, AuditKind, CheckIn, CheckInStatus, FinalLetter, LetterStatus, Observer,
    PollingConfig, PollingInterval, PollingStatus, SendChannel, Trustee, TrusteeStatus, User,
    Vault, VaultItem, VaultSnapshot,
};
use crate::store::migrations;
use crate::store::traits::{
    ConfirmedCheckIn, ExpiredCheckIn, MissOutcome, ReleaseOutcome, Store,
};
use crate::token::{ACCESS_TOKEN_BYTES, TokenGenerator};

/// How long a trustee access grant stays live after release.
const ACCESS_GRANT_DAYS: i64 = 30;

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<libsql::Database>,
    conn: tokio::sync::Mutex<Connection>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("create db directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("open database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("open in-memory database: {e}")))?;

        Self::from_database(db).await
    }

    async fn from_database(db: libsql::Database) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("connect: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .await
            .map_err(|e| StoreError::Unavailable(format!("configure connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    async fn begin(conn: &Connection) -> Result<Transaction, StoreError> {
        // A cancelled caller (HTTP timeout, job budget) may have dropped its
        // future mid-transaction; clear the orphan before starting a new one.
        if !conn.is_autocommit() {
            let _ = conn.execute_batch("ROLLBACK").await;
        }

        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(map_sql)
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(tx: Transaction, result: Result<T, StoreError>) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            tx.commit().await.map_err(map_sql)?;
            Ok(value)
        }
        Err(e) => {
            let _ = tx.rollback().await;
            Err(e)
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width RFC 3339 with milliseconds and a
/// `Z` suffix, so lexicographic comparison in SQL is chronological.
fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fmt_opt_dt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(fmt_dt)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn parse_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_dt(&s)).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("bad uuid {s:?}: {e}")))
}

fn map_sql(e: libsql::Error) -> StoreError {
    let text = e.to_string();
    if text.contains("UNIQUE constraint failed") || text.contains("FOREIGN KEY constraint") {
        StoreError::Constraint(text)
    } else {
        StoreError::Query(text)
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const USER_COLS: &str = "id, email, display_name, phone, created_at";

fn row_to_user(row: &libsql::Row) -> Result<User, StoreError> {
    Ok(User {
        id: parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?,
        email: row.get(1).map_err(map_sql)?,
        display_name: row.get(2).map_err(map_sql)?,
        phone: row.get(3).map_err(map_sql)?,
        created_at: parse_dt(&row.get::<String>(4).map_err(map_sql)?)?,
    })
}

const CONFIG_COLS: &str = "id, user_id, interval, email_enabled, sms_enabled, \
     grace_period_1, grace_period_2, grace_period_3, missed_before_trigger, \
     current_missed, last_check_in_at, next_check_in_due, status, triggered_at, updated_at";

fn row_to_config(row: &libsql::Row) -> Result<PollingConfig, StoreError> {
    let interval_str: String = row.get(2).map_err(map_sql)?;
    let status_str: String = row.get(12).map_err(map_sql)?;

    Ok(PollingConfig {
        id: parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?,
        user_id: parse_uuid(&row.get::<String>(1).map_err(map_sql)?)?,
        interval: PollingInterval::parse(&interval_str)
            .ok_or_else(|| StoreError::Corrupt(format!("bad interval {interval_str:?}")))?,
        email_enabled: row.get::<i64>(3).map_err(map_sql)? != 0,
        sms_enabled: row.get::<i64>(4).map_err(map_sql)? != 0,
        grace_period_1: row.get(5).map_err(map_sql)?,
        grace_period_2: row.get(6).map_err(map_sql)?,
        grace_period_3: row.get(7).map_err(map_sql)?,
        missed_before_trigger: row.get(8).map_err(map_sql)?,
        current_missed: row.get(9).map_err(map_sql)?,
        last_check_in_at: parse_opt_dt(row.get(10).map_err(map_sql)?)?,
        next_check_in_due: parse_dt(&row.get::<String>(11).map_err(map_sql)?)?,
        status: PollingStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Corrupt(format!("bad status {status_str:?}")))?,
        triggered_at: parse_opt_dt(row.get(13).map_err(map_sql)?)?,
        updated_at: parse_dt(&row.get::<String>(14).map_err(map_sql)?)?,
    })
}

const CHECK_IN_COLS: &str =
    "id, user_id, token, status, sent_via, sent_at, responded_at, expires_at";

fn row_to_check_in(row: &libsql::Row) -> Result<CheckIn, StoreError> {
    let status_str: String = row.get(3).map_err(map_sql)?;
    let sent_via_str: String = row.get(4).map_err(map_sql)?;

    Ok(CheckIn {
        id: parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?,
        user_id: parse_uuid(&row.get::<String>(1).map_err(map_sql)?)?,
        token: row.get(2).map_err(map_sql)?,
        status: CheckInStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Corrupt(format!("bad check-in status {status_str:?}")))?,
        sent_via: serde_json::from_str::<Vec<SendChannel>>(&sent_via_str)
            .map_err(|e| StoreError::Corrupt(format!("bad sent_via: {e}")))?,
        sent_at: parse_dt(&row.get::<String>(5).map_err(map_sql)?)?,
        responded_at: parse_opt_dt(row.get(6).map_err(map_sql)?)?,
        expires_at: parse_dt(&row.get::<String>(7).map_err(map_sql)?)?,
    })
}

const TRUSTEE_COLS: &str = "id, user_id, name, email, phone, relationship, status, \
     verification_token, verified_at, access_token, access_granted_at, access_expires_at, created_at";

fn row_to_trustee(row: &libsql::Row) -> Result<Trustee, StoreError> {
    let status_str: String = row.get(6).map_err(map_sql)?;

    Ok(Trustee {
        id: parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?,
        user_id: parse_uuid(&row.get::<String>(1).map_err(map_sql)?)?,
        name: row.get(2).map_err(map_sql)?,
        email: row.get(3).map_err(map_sql)?,
        phone: row.get(4).map_err(map_sql)?,
        relationship: row.get(5).map_err(map_sql)?,
        status: TrusteeStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Corrupt(format!("bad trustee status {status_str:?}")))?,
        verification_token: row.get(7).map_err(map_sql)?,
        verified_at: parse_opt_dt(row.get(8).map_err(map_sql)?)?,
        access_token: row.get(9).map_err(map_sql)?,
        access_granted_at: parse_opt_dt(row.get(10).map_err(map_sql)?)?,
        access_expires_at: parse_opt_dt(row.get(11).map_err(map_sql)?)?,
        created_at: parse_dt(&row.get::<String>(12).map_err(map_sql)?)?,
    })
}

const LETTER_COLS: &str = "id, user_id, recipient_name, recipient_email, subject, \
     encrypted_body, nonce, status, delivered_at, created_at";

fn row_to_letter(row: &libsql::Row) -> Result<FinalLetter, StoreError> {
    let status_str: String = row.get(7).map_err(map_sql)?;

    Ok(FinalLetter {
        id: parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?,
        user_id: parse_uuid(&row.get::<String>(1).map_err(map_sql)?)?,
        recipient_name: row.get(2).map_err(map_sql)?,
        recipient_email: row.get(3).map_err(map_sql)?,
        subject: row.get(4).map_err(map_sql)?,
        encrypted_body: row.get(5).map_err(map_sql)?,
        nonce: row.get(6).map_err(map_sql)?,
        status: LetterStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Corrupt(format!("bad letter status {status_str:?}")))?,
        delivered_at: parse_opt_dt(row.get(8).map_err(map_sql)?)?,
        created_at: parse_dt(&row.get::<String>(9).map_err(map_sql)?)?,
    })
}

// ── Shared statement helpers (work on a Connection or a Transaction) ──

async fn load_config_by_user(
    conn: &Connection,
    user_id: Uuid,
) -> Result<Option<PollingConfig>, StoreError> {
    let mut rows = conn
        .query(
            &format!("SELECT {CONFIG_COLS} FROM polling_configs WHERE user_id = ?1"),
            params![user_id.to_string()],
        )
        .await
        .map_err(map_sql)?;

    match rows.next().await.map_err(map_sql)? {
        Some(row) => Ok(Some(row_to_config(&row)?)),
        None => Ok(None),
    }
}

/// Persist every mutable field of a polling config.
async fn write_config(conn: &Connection, config: &PollingConfig) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE polling_configs SET current_missed = ?1, last_check_in_at = ?2, \
         next_check_in_due = ?3, status = ?4, triggered_at = ?5, updated_at = ?6 \
         WHERE id = ?7",
        params![
            config.current_missed,
            fmt_opt_dt(config.last_check_in_at),
            fmt_dt(config.next_check_in_due),
            config.status.as_str(),
            fmt_opt_dt(config.triggered_at),
            fmt_dt(config.updated_at),
            config.id.to_string(),
        ],
    )
    .await
    .map_err(map_sql)?;
    Ok(())
}

async fn insert_check_in(conn: &Connection, check_in: &CheckIn) -> Result<(), StoreError> {
    let sent_via = serde_json::to_string(&check_in.sent_via)
        .map_err(|e| StoreError::Query(format!("serialize sent_via: {e}")))?;

    conn.execute(
        "INSERT INTO check_ins (id, user_id, token, status, sent_via, sent_at, responded_at, expires_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            check_in.id.to_string(),
            check_in.user_id.to_string(),
            check_in.token.clone(),
            check_in.status.as_str(),
            sent_via,
            fmt_dt(check_in.sent_at),
            fmt_opt_dt(check_in.responded_at),
            fmt_dt(check_in.expires_at),
        ],
    )
    .await
    .map_err(map_sql)?;
    Ok(())
}

async fn insert_audit(
    conn: &Connection,
    user_id: Option<Uuid>,
    kind: AuditKind,
    detail: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO audit_log (id, user_id, kind, detail, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Uuid::new_v4().to_string(),
            user_id.map(|id| id.to_string()),
            kind.as_str(),
            detail.to_string(),
            fmt_dt(now),
        ],
    )
    .await
    .map_err(map_sql)?;
    Ok(())
}

async fn load_check_in_by_token(
    conn: &Connection,
    token: &str,
) -> Result<Option<CheckIn>, StoreError> {
    let mut rows = conn
        .query(
            &format!("SELECT {CHECK_IN_COLS} FROM check_ins WHERE token = ?1"),
            params![token],
        )
        .await
        .map_err(map_sql)?;

    match rows.next().await.map_err(map_sql)? {
        Some(row) => Ok(Some(row_to_check_in(&row)?)),
        None => Ok(None),
    }
}

async fn load_trustee_by(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Option<Trustee>, StoreError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TRUSTEE_COLS} FROM trustees WHERE {column} = ?1"),
            params![value],
        )
        .await
        .map_err(map_sql)?;

    match rows.next().await.map_err(map_sql)? {
        Some(row) => Ok(Some(row_to_trustee(&row)?)),
        None => Ok(None),
    }
}

// ── Transactional bodies ────────────────────────────────────────────

async fn confirm_check_in_tx(
    tx: &Connection,
    token: &str,
    now: DateTime<Utc>,
    observer: &Observer,
) -> Result<ConfirmedCheckIn, StoreError> {
    let check_in = load_check_in_by_token(tx, token)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "check_in",
            id: token.to_string(),
        })?;

    if check_in.status != CheckInStatus::Pending {
        return Err(StoreError::AlreadyResolved);
    }
    if check_in.is_expired(now) {
        // Left `Pending`; the expiry sweep owns the MISSED transition and the
        // escalation that follows from it.
        return Err(StoreError::Expired);
    }

    tx.execute(
        "UPDATE check_ins SET status = 'confirmed', responded_at = ?1 WHERE id = ?2",
        params![fmt_dt(now), check_in.id.to_string()],
    )
    .await
    .map_err(map_sql)?;

    let config = load_config_by_user(tx, check_in.user_id)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "polling_config",
            id: check_in.user_id.to_string(),
        })?;

    let stepped = escalation::step(&config, &Event::Confirm, now);
    if stepped.is_state_change(&config) {
        write_config(tx, &stepped.config).await?;
    }

    let detail = serde_json::json!({
        "check_in_id": check_in.id,
        "observer": observer,
    });
    insert_audit(
        tx,
        Some(check_in.user_id),
        AuditKind::CheckInConfirmed,
        &detail,
        now,
    )
    .await?;

    let mut confirmed = check_in;
    confirmed.status = CheckInStatus::Confirmed;
    confirmed.responded_at = Some(now);

    Ok(ConfirmedCheckIn {
        check_in: confirmed,
        config: stepped.config,
    })
}

async fn confirm_latest_tx(
    tx: &Connection,
    user_id: Uuid,
    now: DateTime<Utc>,
    observer: &Observer,
) -> Result<PollingConfig, StoreError> {
    let config = load_config_by_user(tx, user_id)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "polling_config",
            id: user_id.to_string(),
        })?;

    if config.status.is_terminal() {
        return Err(StoreError::Conflict("already_triggered".into()));
    }

    tx.execute(
        "UPDATE check_ins SET status = 'confirmed', responded_at = ?1 \
         WHERE user_id = ?2 AND status = 'pending'",
        params![fmt_dt(now), user_id.to_string()],
    )
    .await
    .map_err(map_sql)?;

    let stepped = escalation::step(&config, &Event::Confirm, now);
    if stepped.is_state_change(&config) {
        write_config(tx, &stepped.config).await?;
    }

    let detail = serde_json::json!({
        "observer": observer,
        "previous_status": config.status.as_str(),
    });
    insert_audit(tx, Some(user_id), AuditKind::CheckInConfirmed, &detail, now).await?;

    Ok(stepped.config)
}

/// Issue one due check-in. Returns `None` when the row's condition no longer
/// holds under the transaction.
async fn issue_one_tx(
    tx: &Connection,
    config: &PollingConfig,
    now: DateTime<Utc>,
    tokens: &dyn TokenGenerator,
) -> Result<Option<CheckIn>, StoreError> {
    let changed = tx
        .execute(
            "UPDATE polling_configs SET next_check_in_due = ?1 WHERE id = ?2 \
             AND status = 'active' AND next_check_in_due <= ?3",
            params![
                fmt_dt(now + config.interval.period()),
                config.id.to_string(),
                fmt_dt(now),
            ],
        )
        .await
        .map_err(map_sql)?;
    if changed == 0 {
        return Ok(None);
    }

    let token = tokens.mint(crate::token::CHECK_IN_TOKEN_BYTES);
    let expires_at = now + config.interval.response_window();
    let check_in = CheckIn::new(config.user_id, token, now, expires_at);
    insert_check_in(tx, &check_in).await?;

    insert_audit(
        tx,
        Some(config.user_id),
        AuditKind::CheckInIssued,
        &serde_json::json!({ "check_in_id": check_in.id }),
        now,
    )
    .await?;

    Ok(Some(check_in))
}

/// Mark one pending check-in missed. Returns the owning config, or `None`
/// when the row was resolved concurrently or the owner vanished.
async fn expire_one_tx(
    tx: &Connection,
    check_in: &CheckIn,
    now: DateTime<Utc>,
) -> Result<Option<PollingConfig>, StoreError> {
    let changed = tx
        .execute(
            "UPDATE check_ins SET status = 'missed' WHERE id = ?1 AND status = 'pending'",
            params![check_in.id.to_string()],
        )
        .await
        .map_err(map_sql)?;
    if changed == 0 {
        return Ok(None);
    }

    let Some(config) = load_config_by_user(tx, check_in.user_id).await? else {
        return Ok(None);
    };

    insert_audit(
        tx,
        Some(check_in.user_id),
        AuditKind::CheckInMissed,
        &serde_json::json!({ "check_in_id": check_in.id }),
        now,
    )
    .await?;

    Ok(Some(config))
}

async fn apply_miss_tx(
    tx: &Connection,
    user_id: Uuid,
    expected_missed: i64,
    now: DateTime<Utc>,
    next_token: &str,
) -> Result<MissOutcome, StoreError> {
    let Some(config) = load_config_by_user(tx, user_id).await? else {
        return Ok(MissOutcome::Halted);
    };

    if !config.status.is_escalatable() {
        return Ok(MissOutcome::Halted);
    }

    let stepped = escalation::step(&config, &Event::Miss { expected_missed }, now);

    if !stepped.is_state_change(&config) {
        // Stale: the user checked in after this escalation was enqueued.
        insert_audit(
            tx,
            Some(user_id),
            AuditKind::EscalationSkippedStale,
            &serde_json::json!({
                "expected_missed": expected_missed,
                "current_missed": config.current_missed,
            }),
            now,
        )
        .await?;
        return Ok(MissOutcome::Stale);
    }

    write_config(tx, &stepped.config).await?;

    let mut check_in = None;
    let mut enqueue_release_after = None;
    let mut level = 0u8;

    for effect in &stepped.effects {
        match effect {
            Effect::CreateGraceCheckIn {
                level: l,
                expires_in,
            } => {
                level = *l;
                let row = CheckIn::new(user_id, next_token, now, now + *expires_in);
                insert_check_in(tx, &row).await?;
                check_in = Some(row);
            }
            Effect::EnqueueRelease { delay } => {
                enqueue_release_after = Some(*delay);
            }
            Effect::Audit(kind) => {
                let mut detail = serde_json::json!({
                    "missed": stepped.config.current_missed,
                    "status": stepped.config.status.as_str(),
                });
                if let Some(ref row) = check_in {
                    detail["check_in_id"] = serde_json::json!(row.id);
                }
                insert_audit(tx, Some(user_id), *kind, &detail, now).await?;
            }
        }
    }

    let check_in = check_in.ok_or_else(|| {
        StoreError::Corrupt("miss transition produced no grace check-in".into())
    })?;

    Ok(MissOutcome::Escalated {
        config: stepped.config,
        check_in,
        level,
        enqueue_release_after,
    })
}

async fn run_release_tx(
    tx: &Connection,
    user_id: Uuid,
    now: DateTime<Utc>,
    tokens: &dyn TokenGenerator,
) -> Result<ReleaseOutcome, StoreError> {
    let config = load_config_by_user(tx, user_id)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "polling_config",
            id: user_id.to_string(),
        })?;

    if config.status == PollingStatus::Triggered {
        // A previous run committed; at-most-once holds.
        return Ok(ReleaseOutcome::AlreadyTriggered);
    }

    // Eligible trustees: verified or already active.
    let mut rows = tx
        .query(
            &format!(
                "SELECT {TRUSTEE_COLS} FROM trustees \
                 WHERE user_id = ?1 AND status IN ('verified', 'active') \
                 ORDER BY created_at"
            ),
            params![user_id.to_string()],
        )
        .await
        .map_err(map_sql)?;

    let mut trustees = Vec::new();
    while let Some(row) = rows.next().await.map_err(map_sql)? {
        trustees.push(row_to_trustee(&row)?);
    }
    drop(rows);

    let mut rows = tx
        .query(
            &format!(
                "SELECT {LETTER_COLS} FROM final_letters \
                 WHERE user_id = ?1 AND status = 'ready' ORDER BY created_at"
            ),
            params![user_id.to_string()],
        )
        .await
        .map_err(map_sql)?;

    let mut letters = Vec::new();
    while let Some(row) = rows.next().await.map_err(map_sql)? {
        letters.push(row_to_letter(&row)?);
    }
    drop(rows);

    let access_expires = now + Duration::days(ACCESS_GRANT_DAYS);
    for trustee in &mut trustees {
        let access_token = tokens.mint(ACCESS_TOKEN_BYTES);

        tx.execute(
            "UPDATE trustees SET status = 'active', access_token = ?1, \
             access_granted_at = ?2, access_expires_at = ?3 WHERE id = ?4",
            params![
                access_token.clone(),
                fmt_dt(now),
                fmt_dt(access_expires),
                trustee.id.to_string(),
            ],
        )
        .await
        .map_err(map_sql)?;

        insert_audit(
            tx,
            Some(user_id),
            AuditKind::AccessGranted,
            &serde_json::json!({
                "trustee_id": trustee.id,
                "access_expires_at": access_expires,
            }),
            now,
        )
        .await?;

        trustee.status = TrusteeStatus::Active;
        trustee.access_token = Some(access_token);
        trustee.access_granted_at = Some(now);
        trustee.access_expires_at = Some(access_expires);
    }

    let mut triggered = config;
    triggered.status = PollingStatus::Triggered;
    triggered.triggered_at = Some(now);
    triggered.updated_at = now;
    write_config(tx, &triggered).await?;

    insert_audit(
        tx,
        Some(user_id),
        AuditKind::DeathProtocolTriggered,
        &serde_json::json!({
            "trustees_notified": trustees.len(),
            "letters_queued": letters.len(),
        }),
        now,
    )
    .await?;

    Ok(ReleaseOutcome::Released {
        config: triggered,
        trustees,
        letters,
    })
}

/// Apply an administrative state-machine event and audit it.
async fn admin_event_tx(
    tx: &Connection,
    user_id: Uuid,
    event: Event,
    kind: AuditKind,
    detail: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<PollingConfig, StoreError> {
    let config = load_config_by_user(tx, user_id)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "polling_config",
            id: user_id.to_string(),
        })?;

    if config.status.is_terminal() {
        return Err(StoreError::Conflict("already_triggered".into()));
    }

    let stepped = escalation::step(&config, &event, now);
    if !stepped.is_state_change(&config) {
        return Ok(config);
    }

    write_config(tx, &stepped.config).await?;
    insert_audit(tx, Some(user_id), kind, &detail, now).await?;

    Ok(stepped.config)
}

// ── Store implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn create_user(
        &self,
        user: &User,
        interval: PollingInterval,
        now: DateTime<Utc>,
    ) -> Result<PollingConfig, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;

        let config = PollingConfig::new(user.id, interval, now);
        let result = async {
            tx.execute(
                "INSERT INTO users (id, email, display_name, phone, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.id.to_string(),
                    user.email.clone(),
                    user.display_name.clone(),
                    user.phone.clone(),
                    fmt_dt(user.created_at),
                ],
            )
            .await
            .map_err(map_sql)?;

            tx.execute(
                "INSERT INTO polling_configs (id, user_id, interval, email_enabled, sms_enabled, \
                 grace_period_1, grace_period_2, grace_period_3, missed_before_trigger, \
                 current_missed, last_check_in_at, next_check_in_due, status, triggered_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    config.id.to_string(),
                    config.user_id.to_string(),
                    config.interval.as_str(),
                    config.email_enabled as i64,
                    config.sms_enabled as i64,
                    config.grace_period_1,
                    config.grace_period_2,
                    config.grace_period_3,
                    config.missed_before_trigger,
                    config.current_missed,
                    fmt_opt_dt(config.last_check_in_at),
                    fmt_dt(config.next_check_in_due),
                    config.status.as_str(),
                    fmt_opt_dt(config.triggered_at),
                    fmt_dt(config.updated_at),
                ],
            )
            .await
            .map_err(map_sql)?;
            Ok(())
        }
        .await;

        finish(tx, result).await?;
        Ok(config)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(map_sql)?;

        match rows.next().await.map_err(map_sql)? {
            Some(row) => Ok(Some(row_to_user(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM users WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(map_sql)?;
        Ok(())
    }

    async fn get_polling_config(&self, user_id: Uuid) -> Result<Option<PollingConfig>, StoreError> {
        let conn = self.conn.lock().await;
        load_config_by_user(&conn, user_id).await
    }

    async fn get_check_in(&self, id: Uuid) -> Result<Option<CheckIn>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {CHECK_IN_COLS} FROM check_ins WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(map_sql)?;

        match rows.next().await.map_err(map_sql)? {
            Some(row) => Ok(Some(row_to_check_in(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_check_in_by_token(&self, token: &str) -> Result<Option<CheckIn>, StoreError> {
        let conn = self.conn.lock().await;
        load_check_in_by_token(&conn, token).await
    }

    async fn set_check_in_sent_via(
        &self,
        id: Uuid,
        channels: &[SendChannel],
    ) -> Result<(), StoreError> {
        let sent_via = serde_json::to_string(channels)
            .map_err(|e| StoreError::Query(format!("serialize sent_via: {e}")))?;

        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE check_ins SET sent_via = ?1 WHERE id = ?2",
            params![sent_via, id.to_string()],
        )
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn confirm_check_in(
        &self,
        token: &str,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<ConfirmedCheckIn, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;
        let result = confirm_check_in_tx(&tx, token, now, observer).await;
        finish(tx, result).await
    }

    async fn confirm_latest_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        observer: &Observer,
    ) -> Result<PollingConfig, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;
        let result = confirm_latest_tx(&tx, user_id, now, observer).await;
        finish(tx, result).await
    }

    async fn issue_due_check_ins(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        tokens: &dyn TokenGenerator,
    ) -> Result<Vec<CheckIn>, StoreError> {
        let conn = self.conn.lock().await;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONFIG_COLS} FROM polling_configs \
                     WHERE status = 'active' AND next_check_in_due <= ?1 \
                     ORDER BY next_check_in_due LIMIT ?2"
                ),
                params![fmt_dt(now), limit as i64],
            )
            .await
            .map_err(map_sql)?;

        let mut due = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_sql)? {
            due.push(row_to_config(&row)?);
        }
        drop(rows);

        // One transaction per row so a mid-batch crash loses at most the rows
        // not yet processed; the next sweep picks them up again.
        let mut created = Vec::new();
        for config in due {
            let tx = Self::begin(&conn).await?;
            let result = issue_one_tx(&tx, &config, now, tokens).await;
            if let Some(check_in) = finish(tx, result).await? {
                created.push(check_in);
            }
        }

        Ok(created)
    }

    async fn expire_pending_check_ins(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredCheckIn>, StoreError> {
        let conn = self.conn.lock().await;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CHECK_IN_COLS} FROM check_ins \
                     WHERE status = 'pending' AND expires_at <= ?1 \
                     ORDER BY expires_at LIMIT ?2"
                ),
                params![fmt_dt(now), limit as i64],
            )
            .await
            .map_err(map_sql)?;

        let mut stale = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_sql)? {
            stale.push(row_to_check_in(&row)?);
        }
        drop(rows);

        let mut expired = Vec::new();
        for mut check_in in stale {
            let tx = Self::begin(&conn).await?;
            let result = expire_one_tx(&tx, &check_in, now).await;
            if let Some(config) = finish(tx, result).await? {
                check_in.status = CheckInStatus::Missed;
                expired.push(ExpiredCheckIn { check_in, config });
            }
        }

        Ok(expired)
    }

    async fn list_grace3_timeouts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PollingConfig>, StoreError> {
        let conn = self.conn.lock().await;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONFIG_COLS} FROM polling_configs \
                     WHERE status = 'grace_3' \
                     AND datetime(updated_at, '+' || grace_period_3 || ' days') <= datetime(?1) \
                     ORDER BY updated_at LIMIT ?2"
                ),
                params![fmt_dt(now), limit as i64],
            )
            .await
            .map_err(map_sql)?;

        let mut configs = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_sql)? {
            configs.push(row_to_config(&row)?);
        }
        Ok(configs)
    }

    async fn apply_miss(
        &self,
        user_id: Uuid,
        expected_missed: i64,
        now: DateTime<Utc>,
        next_token: &str,
    ) -> Result<MissOutcome, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;
        let result = apply_miss_tx(&tx, user_id, expected_missed, now, next_token).await;
        finish(tx, result).await
    }

    async fn run_release(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        tokens: &dyn TokenGenerator,
    ) -> Result<ReleaseOutcome, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;
        let result = run_release_tx(&tx, user_id, now, tokens).await;
        finish(tx, result).await
    }

    async fn pause(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<PollingConfig, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;
        let result = admin_event_tx(
            &tx,
            user_id,
            Event::Pause,
            AuditKind::PollingPaused,
            serde_json::json!({}),
            now,
        )
        .await;
        finish(tx, result).await
    }

    async fn resume(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<PollingConfig, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;
        let result = admin_event_tx(
            &tx,
            user_id,
            Event::Resume,
            AuditKind::PollingResumed,
            serde_json::json!({}),
            now,
        )
        .await;
        finish(tx, result).await
    }

    async fn admin_force_check_in(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PollingConfig, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;

        let result = async {
            // Pending prompts are voided, not confirmed: the user did not
            // respond themselves.
            tx.execute(
                "UPDATE check_ins SET status = 'cancelled' WHERE user_id = ?1 AND status = 'pending'",
                params![user_id.to_string()],
            )
            .await
            .map_err(map_sql)?;

            admin_event_tx(
                &tx,
                user_id,
                Event::AdminForceCheckIn,
                AuditKind::AdminForceCheckIn,
                serde_json::json!({}),
                now,
            )
            .await
        }
        .await;

        finish(tx, result).await
    }

    async fn admin_trigger(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;

        let result = async {
            let config = load_config_by_user(&tx, user_id)
                .await?
                .ok_or(StoreError::NotFound {
                    entity: "polling_config",
                    id: user_id.to_string(),
                })?;

            if config.status.is_terminal() {
                return Err(StoreError::Conflict("already_triggered".into()));
            }

            insert_audit(
                &tx,
                Some(user_id),
                AuditKind::AdminTrigger,
                &serde_json::json!({ "status": config.status.as_str() }),
                now,
            )
            .await
        }
        .await;

        finish(tx, result).await
    }

    async fn create_trustee(&self, trustee: &Trustee) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trustees (id, user_id, name, email, phone, relationship, status, \
             verification_token, verified_at, access_token, access_granted_at, access_expires_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                trustee.id.to_string(),
                trustee.user_id.to_string(),
                trustee.name.clone(),
                trustee.email.clone(),
                trustee.phone.clone(),
                trustee.relationship.clone(),
                trustee.status.as_str(),
                trustee.verification_token.clone(),
                fmt_opt_dt(trustee.verified_at),
                trustee.access_token.clone(),
                fmt_opt_dt(trustee.access_granted_at),
                fmt_opt_dt(trustee.access_expires_at),
                fmt_dt(trustee.created_at),
            ],
        )
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn list_trustees(&self, user_id: Uuid) -> Result<Vec<Trustee>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TRUSTEE_COLS} FROM trustees WHERE user_id = ?1 ORDER BY created_at"
                ),
                params![user_id.to_string()],
            )
            .await
            .map_err(map_sql)?;

        let mut trustees = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_sql)? {
            trustees.push(row_to_trustee(&row)?);
        }
        Ok(trustees)
    }

    async fn get_trustee_by_access_token(
        &self,
        token: &str,
    ) -> Result<Option<Trustee>, StoreError> {
        let conn = self.conn.lock().await;
        load_trustee_by(&conn, "access_token", token).await
    }

    async fn get_trustee_by_verification_token(
        &self,
        token: &str,
    ) -> Result<Option<Trustee>, StoreError> {
        let conn = self.conn.lock().await;
        load_trustee_by(&conn, "verification_token", token).await
    }

    async fn verify_trustee(&self, token: &str, now: DateTime<Utc>) -> Result<Trustee, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;

        let result = async {
            let trustee = load_trustee_by(&tx, "verification_token", token)
                .await?
                .ok_or(StoreError::NotFound {
                    entity: "trustee",
                    id: token.to_string(),
                })?;

            if trustee.status != TrusteeStatus::Pending {
                return Err(StoreError::Conflict("already_verified".into()));
            }

            // Token is single-use: cleared in the same commit that flips
            // status, so a replay is indistinguishable from an unknown token.
            tx.execute(
                "UPDATE trustees SET status = 'verified', verification_token = NULL, verified_at = ?1 \
                 WHERE id = ?2",
                params![fmt_dt(now), trustee.id.to_string()],
            )
            .await
            .map_err(map_sql)?;

            insert_audit(
                &tx,
                Some(trustee.user_id),
                AuditKind::TrusteeVerified,
                &serde_json::json!({ "trustee_id": trustee.id }),
                now,
            )
            .await?;

            let mut verified = trustee;
            verified.status = TrusteeStatus::Verified;
            verified.verification_token = None;
            verified.verified_at = Some(now);
            Ok(verified)
        }
        .await;

        finish(tx, result).await
    }

    async fn revoke_trustee(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;

        let result = async {
            let mut rows = tx
                .query(
                    "SELECT user_id FROM trustees WHERE id = ?1",
                    params![id.to_string()],
                )
                .await
                .map_err(map_sql)?;

            let user_id = match rows.next().await.map_err(map_sql)? {
                Some(row) => parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?,
                None => {
                    return Err(StoreError::NotFound {
                        entity: "trustee",
                        id: id.to_string(),
                    });
                }
            };
            drop(rows);

            tx.execute(
                "UPDATE trustees SET status = 'revoked', access_token = NULL, \
                 access_granted_at = NULL, access_expires_at = NULL WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(map_sql)?;

            insert_audit(
                &tx,
                Some(user_id),
                AuditKind::TrusteeRevoked,
                &serde_json::json!({ "trustee_id": id }),
                now,
            )
            .await
        }
        .await;

        finish(tx, result).await
    }

    async fn create_letter(&self, letter: &FinalLetter) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO final_letters (id, user_id, recipient_name, recipient_email, subject, \
             encrypted_body, nonce, status, delivered_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                letter.id.to_string(),
                letter.user_id.to_string(),
                letter.recipient_name.clone(),
                letter.recipient_email.clone(),
                letter.subject.clone(),
                letter.encrypted_body.clone(),
                letter.nonce.clone(),
                letter.status.as_str(),
                fmt_opt_dt(letter.delivered_at),
                fmt_dt(letter.created_at),
            ],
        )
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn list_letters(&self, user_id: Uuid) -> Result<Vec<FinalLetter>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LETTER_COLS} FROM final_letters WHERE user_id = ?1 ORDER BY created_at"
                ),
                params![user_id.to_string()],
            )
            .await
            .map_err(map_sql)?;

        let mut letters = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_sql)? {
            letters.push(row_to_letter(&row)?);
        }
        Ok(letters)
    }

    async fn mark_letter_ready(&self, id: Uuid, _now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE final_letters SET status = 'ready' WHERE id = ?1 AND status = 'draft'",
                params![id.to_string()],
            )
            .await
            .map_err(map_sql)?;

        if changed == 0 {
            let mut rows = conn
                .query(
                    "SELECT status FROM final_letters WHERE id = ?1",
                    params![id.to_string()],
                )
                .await
                .map_err(map_sql)?;
            return match rows.next().await.map_err(map_sql)? {
                Some(row) => {
                    let status: String = row.get(0).map_err(map_sql)?;
                    if status == "ready" {
                        Ok(())
                    } else {
                        Err(StoreError::Conflict(format!("letter is {status}")))
                    }
                }
                None => Err(StoreError::NotFound {
                    entity: "final_letter",
                    id: id.to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn mark_letter_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;

        let result = async {
            let changed = tx
                .execute(
                    "UPDATE final_letters SET status = 'delivered', delivered_at = ?1 \
                     WHERE id = ?2 AND status = 'ready'",
                    params![fmt_dt(now), id.to_string()],
                )
                .await
                .map_err(map_sql)?;

            if changed > 0 {
                let mut rows = tx
                    .query(
                        "SELECT user_id FROM final_letters WHERE id = ?1",
                        params![id.to_string()],
                    )
                    .await
                    .map_err(map_sql)?;
                let user_id = match rows.next().await.map_err(map_sql)? {
                    Some(row) => Some(parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?),
                    None => None,
                };
                drop(rows);

                insert_audit(
                    &tx,
                    user_id,
                    AuditKind::LetterDelivered,
                    &serde_json::json!({ "letter_id": id }),
                    now,
                )
                .await?;
            }
            Ok(())
        }
        .await;

        finish(tx, result).await
    }

    async fn upsert_vault(&self, vault: &Vault) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO vaults (id, user_id, encrypted_master_key, master_key_salt, master_key_nonce, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (user_id) DO UPDATE SET \
             encrypted_master_key = excluded.encrypted_master_key, \
             master_key_salt = excluded.master_key_salt, \
             master_key_nonce = excluded.master_key_nonce",
            params![
                vault.id.to_string(),
                vault.user_id.to_string(),
                vault.encrypted_master_key.clone(),
                vault.master_key_salt.clone(),
                vault.master_key_nonce.clone(),
                fmt_dt(vault.created_at),
            ],
        )
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn add_vault_item(&self, item: &VaultItem) -> Result<(), StoreError> {
        let metadata = item.metadata.as_ref().map(|m| m.to_string());

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO vault_items (id, vault_id, item_type, name, encrypted_data, nonce, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                item.id.to_string(),
                item.vault_id.to_string(),
                item.item_type.clone(),
                item.name.clone(),
                item.encrypted_data.clone(),
                item.nonce.clone(),
                metadata,
                fmt_dt(item.created_at),
            ],
        )
        .await
        .map_err(map_sql)?;
        Ok(())
    }

    async fn get_vault_snapshot(
        &self,
        user_id: Uuid,
    ) -> Result<Option<VaultSnapshot>, StoreError> {
        let conn = self.conn.lock().await;

        let mut rows = conn
            .query(
                "SELECT id, encrypted_master_key, master_key_salt, master_key_nonce \
                 FROM vaults WHERE user_id = ?1",
                params![user_id.to_string()],
            )
            .await
            .map_err(map_sql)?;

        let Some(row) = rows.next().await.map_err(map_sql)? else {
            return Ok(None);
        };

        let vault_id = parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?;
        let encrypted_master_key: String = row.get(1).map_err(map_sql)?;
        let master_key_salt: String = row.get(2).map_err(map_sql)?;
        let master_key_nonce: String = row.get(3).map_err(map_sql)?;
        drop(rows);

        let mut rows = conn
            .query(
                "SELECT id, vault_id, item_type, name, encrypted_data, nonce, metadata, created_at \
                 FROM vault_items WHERE vault_id = ?1 ORDER BY created_at",
                params![vault_id.to_string()],
            )
            .await
            .map_err(map_sql)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_sql)? {
            let metadata: Option<String> = row.get(6).map_err(map_sql)?;
            items.push(VaultItem {
                id: parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?,
                vault_id: parse_uuid(&row.get::<String>(1).map_err(map_sql)?)?,
                item_type: row.get(2).map_err(map_sql)?,
                name: row.get(3).map_err(map_sql)?,
                encrypted_data: row.get(4).map_err(map_sql)?,
                nonce: row.get(5).map_err(map_sql)?,
                metadata: metadata
                    .map(|m| {
                        serde_json::from_str(&m)
                            .map_err(|e| StoreError::Corrupt(format!("bad item metadata: {e}")))
                    })
                    .transpose()?,
                created_at: parse_dt(&row.get::<String>(7).map_err(map_sql)?)?,
            });
        }

        Ok(Some(VaultSnapshot {
            encrypted_master_key,
            master_key_salt,
            master_key_nonce,
            items,
        }))
    }

    async fn append_audit(
        &self,
        user_id: Option<Uuid>,
        kind: AuditKind,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        insert_audit(&conn, user_id, kind, &detail, now).await
    }

    async fn recent_audit(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, user_id, kind, detail, created_at FROM audit_log \
                 WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                params![user_id.to_string(), limit as i64],
            )
            .await
            .map_err(map_sql)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(map_sql)? {
            let kind_str: String = row.get(2).map_err(map_sql)?;
            let detail_str: String = row.get(3).map_err(map_sql)?;
            let user: Option<String> = row.get(1).map_err(map_sql)?;

            entries.push(AuditEntry {
                id: parse_uuid(&row.get::<String>(0).map_err(map_sql)?)?,
                user_id: user.map(|u| parse_uuid(&u)).transpose()?,
                kind: AuditKind::parse(&kind_str)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad audit kind {kind_str:?}")))?,
                detail: serde_json::from_str(&detail_str)
                    .map_err(|e| StoreError::Corrupt(format!("bad audit detail: {e}")))?,
                created_at: parse_dt(&row.get::<String>(4).map_err(map_sql)?)?,
            });
        }
        Ok(entries)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let tx = Self::begin(&conn).await?;

        let expires = fmt_dt(now + ttl);
        let result = tx
            .execute(
                "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at \
                 WHERE leases.holder = excluded.holder OR leases.expires_at <= ?4",
                params![name, holder, expires, fmt_dt(now)],
            )
            .await
            .map_err(map_sql);

        let result = result.map(|changed| changed > 0);
        finish(tx, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::OsRngTokens;

    fn t0() -> DateTime<Utc> {
        "2025-01-01T00:00:00Z".parse().unwrap()
    }

    async fn store_with_user() -> (LibSqlStore, User) {
        let store = LibSqlStore::new_memory().await.unwrap();
        let user = User::new("u1@example.com", "User One", t0());
        store
            .create_user(&user, PollingInterval::Monthly, t0())
            .await
            .unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn create_user_seeds_active_config() {
        let (store, user) = store_with_user().await;
        let config = store.get_polling_config(user.id).await.unwrap().unwrap();

        assert_eq!(config.status, PollingStatus::Active);
        assert_eq!(config.current_missed, 0);
        assert_eq!(config.next_check_in_due, t0() + Duration::days(30));
    }

    #[tokio::test]
    async fn duplicate_email_is_a_constraint_violation() {
        let (store, _user) = store_with_user().await;
        let dup = User::new("u1@example.com", "Impostor", t0());
        let err = store
            .create_user(&dup, PollingInterval::Weekly, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        // The failed transaction rolled back cleanly; the store still works.
        let other = User::new("u2@example.com", "User Two", t0());
        store
            .create_user(&other, PollingInterval::Weekly, t0())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn confirm_unknown_token_is_not_found() {
        let (store, _user) = store_with_user().await;
        let err = store
            .confirm_check_in("nope", t0(), &Observer::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn confirm_at_exact_expiry_is_expired() {
        let (store, user) = store_with_user().await;

        let due = t0() + Duration::days(30);
        let issued = store
            .issue_due_check_ins(due, 10, &OsRngTokens)
            .await
            .unwrap();
        assert_eq!(issued.len(), 1);
        let check_in = &issued[0];
        assert_eq!(check_in.user_id, user.id);

        // expires_at == now counts as expired; strictly before is valid.
        let err = store
            .confirm_check_in(&check_in.token, check_in.expires_at, &Observer::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Expired));

        let confirmed = store
            .confirm_check_in(
                &check_in.token,
                check_in.expires_at - Duration::milliseconds(1),
                &Observer::default(),
            )
            .await
            .unwrap();
        assert_eq!(confirmed.check_in.status, CheckInStatus::Confirmed);
        assert_eq!(confirmed.config.current_missed, 0);
    }

    #[tokio::test]
    async fn confirm_twice_is_already_resolved() {
        let (store, _user) = store_with_user().await;
        let due = t0() + Duration::days(30);
        let issued = store
            .issue_due_check_ins(due, 10, &OsRngTokens)
            .await
            .unwrap();
        let token = issued[0].token.clone();

        store
            .confirm_check_in(&token, due + Duration::hours(1), &Observer::default())
            .await
            .unwrap();
        let err = store
            .confirm_check_in(&token, due + Duration::hours(2), &Observer::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyResolved));
    }

    #[tokio::test]
    async fn issue_due_check_ins_advances_due_date() {
        let (store, user) = store_with_user().await;
        let due = t0() + Duration::days(30);

        let first = store
            .issue_due_check_ins(due, 10, &OsRngTokens)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].expires_at, due + Duration::days(7));

        // The due date moved one period out; a second sweep finds nothing.
        let config = store.get_polling_config(user.id).await.unwrap().unwrap();
        assert_eq!(config.next_check_in_due, due + Duration::days(30));
        let second = store
            .issue_due_check_ins(due, 10, &OsRngTokens)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn apply_miss_escalates_and_is_stale_after_counter_moves() {
        let (store, user) = store_with_user().await;

        let outcome = store
            .apply_miss(user.id, 0, t0() + Duration::days(37), "grace-token-1")
            .await
            .unwrap();
        let MissOutcome::Escalated {
            config,
            check_in,
            level,
            ..
        } = outcome
        else {
            panic!("expected escalation");
        };
        assert_eq!(level, 1);
        assert_eq!(config.status, PollingStatus::Grace1);
        assert_eq!(config.current_missed, 1);
        assert_eq!(
            check_in.expires_at,
            t0() + Duration::days(37) + Duration::days(7)
        );

        // A delayed duplicate carrying the old counter is stale.
        let outcome = store
            .apply_miss(user.id, 0, t0() + Duration::days(38), "grace-token-2")
            .await
            .unwrap();
        assert!(matches!(outcome, MissOutcome::Stale));

        let audit = store.recent_audit(user.id, 10).await.unwrap();
        assert!(
            audit
                .iter()
                .any(|e| e.kind == AuditKind::EscalationSkippedStale)
        );
    }

    #[tokio::test]
    async fn entering_grace3_reports_the_release_delay() {
        let (store, user) = store_with_user().await;

        store
            .apply_miss(user.id, 0, t0(), "tok-1")
            .await
            .unwrap();
        store
            .apply_miss(user.id, 1, t0() + Duration::days(7), "tok-2")
            .await
            .unwrap();
        let outcome = store
            .apply_miss(user.id, 2, t0() + Duration::days(21), "tok-3")
            .await
            .unwrap();

        let MissOutcome::Escalated {
            level,
            enqueue_release_after,
            ..
        } = outcome
        else {
            panic!("expected escalation");
        };
        assert_eq!(level, 3);
        assert_eq!(enqueue_release_after, Some(Duration::days(7)));
    }

    #[tokio::test]
    async fn release_is_at_most_once() {
        let (store, user) = store_with_user().await;

        let trustee = Trustee::new(user.id, "T", "t@example.com", "friend", "vtok", t0());
        store.create_trustee(&trustee).await.unwrap();
        store.verify_trustee("vtok", t0()).await.unwrap();

        let now = t0() + Duration::days(35);
        let first = store.run_release(user.id, now, &OsRngTokens).await.unwrap();
        let ReleaseOutcome::Released {
            config, trustees, ..
        } = first
        else {
            panic!("expected release");
        };
        assert_eq!(config.status, PollingStatus::Triggered);
        assert_eq!(config.triggered_at, Some(now));
        assert_eq!(trustees.len(), 1);
        let token = trustees[0].access_token.clone().unwrap();

        let second = store
            .run_release(user.id, now + Duration::hours(1), &OsRngTokens)
            .await
            .unwrap();
        assert!(matches!(second, ReleaseOutcome::AlreadyTriggered));

        // The original grant is untouched.
        let after = store.list_trustees(user.id).await.unwrap();
        assert_eq!(after[0].access_token.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn verification_token_is_single_use() {
        let (store, user) = store_with_user().await;
        let trustee = Trustee::new(user.id, "T", "t@example.com", "friend", "vtok", t0());
        store.create_trustee(&trustee).await.unwrap();

        let verified = store.verify_trustee("vtok", t0()).await.unwrap();
        assert_eq!(verified.status, TrusteeStatus::Verified);
        assert!(verified.verification_token.is_none());

        let err = store.verify_trustee("vtok", t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn lease_excludes_second_holder_until_expiry() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let ttl = Duration::seconds(120);

        assert!(
            store
                .try_acquire_lease("sweep", "a", ttl, t0())
                .await
                .unwrap()
        );
        assert!(
            !store
                .try_acquire_lease("sweep", "b", ttl, t0() + Duration::seconds(30))
                .await
                .unwrap()
        );
        // Same holder refreshes freely.
        assert!(
            store
                .try_acquire_lease("sweep", "a", ttl, t0() + Duration::seconds(60))
                .await
                .unwrap()
        );
        // After expiry anyone can take it.
        assert!(
            store
                .try_acquire_lease("sweep", "b", ttl, t0() + Duration::seconds(300))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn delete_user_cascades() {
        let (store, user) = store_with_user().await;
        let trustee = Trustee::new(user.id, "T", "t@example.com", "friend", "vtok", t0());
        store.create_trustee(&trustee).await.unwrap();

        store.delete_user(user.id).await.unwrap();
        assert!(store.get_polling_config(user.id).await.unwrap().is_none());
        assert!(store.list_trustees(user.id).await.unwrap().is_empty());
    }
}
