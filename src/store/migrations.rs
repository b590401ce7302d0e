//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks the
//! current version in `_migrations` and applies only the new ones
//! sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            phone TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS polling_configs (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
            interval TEXT NOT NULL,
            email_enabled INTEGER NOT NULL DEFAULT 1,
            sms_enabled INTEGER NOT NULL DEFAULT 0,
            grace_period_1 INTEGER NOT NULL DEFAULT 7,
            grace_period_2 INTEGER NOT NULL DEFAULT 14,
            grace_period_3 INTEGER NOT NULL DEFAULT 7,
            missed_before_trigger INTEGER NOT NULL DEFAULT 3,
            current_missed INTEGER NOT NULL DEFAULT 0,
            last_check_in_at TEXT,
            next_check_in_due TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            triggered_at TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_polling_due
            ON polling_configs(status, next_check_in_due);
        CREATE INDEX IF NOT EXISTS idx_polling_updated
            ON polling_configs(status, updated_at);

        CREATE TABLE IF NOT EXISTS check_ins (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending',
            sent_via TEXT NOT NULL DEFAULT '[]',
            sent_at TEXT NOT NULL,
            responded_at TEXT,
            expires_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_check_ins_expiry ON check_ins(status, expires_at);
        CREATE INDEX IF NOT EXISTS idx_check_ins_user ON check_ins(user_id);

        CREATE TABLE IF NOT EXISTS trustees (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT,
            relationship TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            verification_token TEXT UNIQUE,
            verified_at TEXT,
            access_token TEXT UNIQUE,
            access_granted_at TEXT,
            access_expires_at TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (user_id, email)
        );
        CREATE INDEX IF NOT EXISTS idx_trustees_user ON trustees(user_id);

        CREATE TABLE IF NOT EXISTS final_letters (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            recipient_name TEXT NOT NULL,
            recipient_email TEXT NOT NULL,
            subject TEXT NOT NULL,
            encrypted_body TEXT NOT NULL,
            nonce TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            delivered_at TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_letters_user ON final_letters(user_id, status);

        CREATE TABLE IF NOT EXISTS vaults (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
            encrypted_master_key TEXT NOT NULL,
            master_key_salt TEXT NOT NULL,
            master_key_nonce TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS vault_items (
            id TEXT PRIMARY KEY,
            vault_id TEXT NOT NULL REFERENCES vaults(id) ON DELETE CASCADE,
            item_type TEXT NOT NULL,
            name TEXT NOT NULL,
            encrypted_data TEXT NOT NULL,
            nonce TEXT NOT NULL,
            metadata TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_vault_items_vault ON vault_items(vault_id);

        CREATE TABLE IF NOT EXISTS audit_log (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            kind TEXT NOT NULL,
            detail TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log(user_id, created_at);

        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            run_at TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            idempotency_key TEXT NOT NULL,
            locked_until TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            finished_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, status, run_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_key ON jobs(idempotency_key, status);

        CREATE TABLE IF NOT EXISTS leases (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
    "#,
}];

/// Apply all pending migrations on this connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| StoreError::Migration(format!("failed to create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );

        conn.execute_batch(migration.sql).await.map_err(|e| {
            StoreError::Migration(format!(
                "migration {} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;

        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            StoreError::Migration(format!(
                "failed to record migration {}: {e}",
                migration.version
            ))
        })?;
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("failed to read version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("failed to read version row: {e}")))?;

    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("bad version column: {e}"))),
        None => Ok(0),
    }
}
