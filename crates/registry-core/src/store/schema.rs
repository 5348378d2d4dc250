//! SQLite schema and migrations for the registry database.

use crate::error::Result;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

pub const SUBSCRIPTIONS_TABLE: &str = "subscriptions";

/// Connection pragmas. WAL keeps readers unblocked while a writer commits.
pub(crate) fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(())
}

/// Second connection for reads. Opened after the writer has switched the file to WAL.
pub(crate) fn open_reader(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch(
        "PRAGMA query_only = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(conn)
}

pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Check that a storage file which is not live yet opens cleanly and holds a registry.
pub(crate) fn check_readable(path: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
    let status: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    let has_table: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [SUBSCRIPTIONS_TABLE],
        |row| row.get(0),
    )?;
    if status != "ok" || !has_table {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("storage snapshot failed validation ({status})"),
        )
        .into());
    }
    Ok(())
}

/// Schema version 1 - Initial schema
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        BEGIN;

        CREATE TABLE IF NOT EXISTS subscriptions (
            protocol_id TEXT PRIMARY KEY,
            owner_name TEXT NOT NULL,
            license_plate TEXT NOT NULL,
            email_encrypted BLOB NOT NULL,
            address_encrypted BLOB NOT NULL,
            mobile_encrypted BLOB NOT NULL,
            subscription_start TEXT NOT NULL,
            subscription_end TEXT NOT NULL,
            payment_amount_encrypted BLOB NOT NULL,
            payment_method TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_subscriptions_plate ON subscriptions(license_plate);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_owner ON subscriptions(owner_name);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_dates
            ON subscriptions(subscription_start, subscription_end);

        -- Append-only; snapshots are plaintext-equivalent JSON
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_type TEXT NOT NULL CHECK(operation_type IN ('INSERT', 'UPDATE', 'DELETE')),
            protocol_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            user TEXT NOT NULL,
            host TEXT,
            ip TEXT,
            reason TEXT NOT NULL,
            before_data TEXT,
            after_data TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_audit_protocol ON audit_log(protocol_id);
        CREATE INDEX IF NOT EXISTS idx_audit_operation ON audit_log(operation_type);

        CREATE TABLE IF NOT EXISTS data_integrity (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            signature BLOB NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(table_name, record_id)
        );

        INSERT OR REPLACE INTO schema_version (version) VALUES (1);

        COMMIT;
        "#,
    )?;

    Ok(())
}
