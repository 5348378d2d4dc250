//! RecordStore: the subscription table with field encryption, per-row
//! signatures and an audit entry for every mutation.
//!
//! Each mutation runs in one SQLite transaction: the row write, the read-back
//! signature and the audit append commit together or not at all.
//!
//! A file-backed store keeps two connections. Mutations go through the writer;
//! reads use a separate `query_only` connection so WAL readers never wait on an
//! open write transaction such as a long bulk import.

pub mod analytics;
pub mod models;
pub mod protocol_id;
pub mod schema;

use crate::actor::ActorInfo;
use crate::audit::{AuditChange, AuditLogEntry, AuditTrail, OperationType};
use crate::error::{RegistryError, Result};
use crate::gate::AccessGate;
use crate::integrity::{ColumnValue, IntegrityGuard, RecordFields};
use crate::vault::SymmetricVault;
use analytics::{PaymentStatistics, StatsFilter, StatsRow};
use chrono::{DateTime, Datelike, Local, NaiveDate, SecondsFormat, Utc};
use models::{IntegrityIssue, IntegrityReport, PaymentMethod, PlateLookup, Subscription, SubscriptionFields};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use rust_decimal::Decimal;
use schema::SUBSCRIPTIONS_TABLE;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Column order shared by every SELECT and by the signature's canonical form.
const COLUMNS: [&str; 12] = [
    "protocol_id",
    "owner_name",
    "license_plate",
    "email_encrypted",
    "address_encrypted",
    "mobile_encrypted",
    "subscription_start",
    "subscription_end",
    "payment_amount_encrypted",
    "payment_method",
    "created_at",
    "updated_at",
];

const SELECT_COLUMNS: &str = "protocol_id, owner_name, license_plate, email_encrypted, \
     address_encrypted, mobile_encrypted, subscription_start, subscription_end, \
     payment_amount_encrypted, payment_method, created_at, updated_at";

/// Bulk-import progress: `(rows_done, rows_total)`.
pub type BulkProgress<'a> = &'a mut dyn FnMut(usize, usize);

pub struct RecordStore {
    writer: Mutex<Connection>,
    /// `None` for in-memory stores, which cannot share data across connections.
    reader: Option<Mutex<Connection>>,
    gate: Arc<AccessGate>,
    vault: Arc<SymmetricVault>,
    guard: Arc<IntegrityGuard>,
    actor: Option<ActorInfo>,
}

/// A row exactly as stored.
struct StoredRow {
    protocol_id: String,
    owner_name: String,
    license_plate: String,
    email: Vec<u8>,
    address: Vec<u8>,
    mobile: Vec<u8>,
    subscription_start: String,
    subscription_end: String,
    payment_amount: Vec<u8>,
    payment_method: String,
    created_at: String,
    updated_at: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            protocol_id: row.get(0)?,
            owner_name: row.get(1)?,
            license_plate: row.get(2)?,
            email: row.get(3)?,
            address: row.get(4)?,
            mobile: row.get(5)?,
            subscription_start: row.get(6)?,
            subscription_end: row.get(7)?,
            payment_amount: row.get(8)?,
            payment_method: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

struct SealedFields {
    email: Vec<u8>,
    address: Vec<u8>,
    mobile: Vec<u8>,
    payment_amount: Vec<u8>,
}

impl RecordStore {
    /// Open or create the database at `db_path` and run migrations.
    pub fn open(
        db_path: impl AsRef<Path>,
        vault: Arc<SymmetricVault>,
        guard: Arc<IntegrityGuard>,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = Connection::open(db_path)?;
        schema::configure(&writer)?;
        schema::migrate(&writer)?;
        let reader = schema::open_reader(db_path)?;
        info!(path = %db_path.display(), "record store opened");
        Ok(Self::with_connections(writer, Some(reader), vault, guard))
    }

    /// In-memory database, for tests and dry runs.
    pub fn open_in_memory(vault: Arc<SymmetricVault>, guard: Arc<IntegrityGuard>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::migrate(&conn)?;
        Ok(Self::with_connections(conn, None, vault, guard))
    }

    fn with_connections(
        writer: Connection,
        reader: Option<Connection>,
        vault: Arc<SymmetricVault>,
        guard: Arc<IntegrityGuard>,
    ) -> Self {
        Self {
            writer: Mutex::new(writer),
            reader: reader.map(Mutex::new),
            gate: Arc::new(AccessGate::new()),
            vault,
            guard,
            actor: None,
        }
    }

    /// Record a fixed actor instead of probing the environment on each mutation.
    pub fn with_actor(mut self, actor: ActorInfo) -> Self {
        self.actor = Some(actor);
        self
    }

    fn actor(&self) -> ActorInfo {
        self.actor.clone().unwrap_or_else(ActorInfo::current)
    }

    /// The gate a `BackupEngine` must share with this store.
    pub fn access_gate(&self) -> Arc<AccessGate> {
        Arc::clone(&self.gate)
    }

    pub(crate) fn vault(&self) -> &Arc<SymmetricVault> {
        &self.vault
    }

    pub(crate) fn guard(&self) -> &Arc<IntegrityGuard> {
        &self.guard
    }

    fn reader(&self) -> MutexGuard<'_, Connection> {
        self.reader.as_ref().unwrap_or(&self.writer).lock()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub fn add_subscription(&self, fields: &SubscriptionFields, reason: &str) -> Result<String> {
        let actor = self.actor();
        let sealed = self.seal_fields(fields)?;
        let year = Local::now().year();

        let _gate = self.gate.shared();
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let sequence = protocol_id::stored_highest_sequence(&tx, year)?;
        let protocol_id = protocol_id::format_id(year, sequence.saturating_add(1))?;
        insert_row(&tx, &protocol_id, fields, &sealed, &now_text())?;
        let after = self.sign_and_snapshot(&tx, &protocol_id)?;
        AuditTrail::new(&tx).append(&protocol_id, &actor, reason, &AuditChange::Insert { after })?;
        tx.commit()?;

        info!(protocol_id = %protocol_id, "subscription added");
        Ok(protocol_id)
    }

    /// Returns `false` when `protocol_id` does not exist.
    pub fn update_subscription(
        &self,
        protocol_id: &str,
        fields: &SubscriptionFields,
        reason: &str,
    ) -> Result<bool> {
        let actor = self.actor();
        let _gate = self.gate.shared();
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let Some(stored) = load_row(&tx, protocol_id)? else {
            return Ok(false);
        };
        let before = self.decode(&stored)?;

        // Unchanged plaintext keeps its ciphertext.
        let email = self.reseal(&stored.email, &before.fields.email, &fields.email)?;
        let address = self.reseal(&stored.address, &before.fields.address, &fields.address)?;
        let mobile = self.reseal(&stored.mobile, &before.fields.mobile, &fields.mobile)?;
        let payment_amount = self.reseal(
            &stored.payment_amount,
            &before.fields.payment_amount.to_string(),
            &fields.payment_amount.to_string(),
        )?;
        let method = PaymentMethod::normalize(&fields.payment_method);

        tx.execute(
            "UPDATE subscriptions SET
                owner_name = ?1, license_plate = ?2, email_encrypted = ?3,
                address_encrypted = ?4, mobile_encrypted = ?5,
                subscription_start = ?6, subscription_end = ?7,
                payment_amount_encrypted = ?8, payment_method = ?9, updated_at = ?10
             WHERE protocol_id = ?11",
            params![
                fields.owner_name,
                fields.license_plate,
                email,
                address,
                mobile,
                date_text(fields.subscription_start),
                date_text(fields.subscription_end),
                payment_amount,
                method.as_str(),
                now_text(),
                protocol_id,
            ],
        )?;
        let after = self.sign_and_snapshot(&tx, protocol_id)?;
        AuditTrail::new(&tx).append(protocol_id, &actor, reason, &AuditChange::Update { before, after })?;
        tx.commit()?;

        info!(protocol_id = %protocol_id, "subscription updated");
        Ok(true)
    }

    /// Removes the row and its signature. Returns `false` when absent.
    pub fn delete_subscription(&self, protocol_id: &str, reason: &str) -> Result<bool> {
        let actor = self.actor();
        let _gate = self.gate.shared();
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let Some(stored) = load_row(&tx, protocol_id)? else {
            return Ok(false);
        };
        let before = self.decode(&stored)?;

        tx.execute("DELETE FROM subscriptions WHERE protocol_id = ?1", params![protocol_id])?;
        tx.execute(
            "DELETE FROM data_integrity WHERE table_name = ?1 AND record_id = ?2",
            params![SUBSCRIPTIONS_TABLE, protocol_id],
        )?;
        AuditTrail::new(&tx).append(protocol_id, &actor, reason, &AuditChange::Delete { before })?;
        tx.commit()?;

        info!(protocol_id = %protocol_id, "subscription deleted");
        Ok(true)
    }

    /// All-or-nothing import. IDs are allocated once up front, in input order.
    pub fn bulk_add_subscriptions(
        &self,
        rows: &[SubscriptionFields],
        reason: &str,
        progress: Option<BulkProgress<'_>>,
    ) -> Result<Vec<String>> {
        let actor = self.actor();
        let _gate = self.gate.shared();
        let mut conn = self.writer.lock();
        match self.bulk_insert(&mut conn, rows, reason, &actor, progress) {
            Ok(ids) => {
                info!(count = ids.len(), "bulk import committed");
                Ok(ids)
            }
            Err(e) => {
                warn!("bulk import rolled back: {}", e);
                Err(RegistryError::TransactionFailure(e.to_string()))
            }
        }
    }

    fn bulk_insert(
        &self,
        conn: &mut Connection,
        rows: &[SubscriptionFields],
        reason: &str,
        actor: &ActorInfo,
        mut progress: Option<BulkProgress<'_>>,
    ) -> Result<Vec<String>> {
        let year = Local::now().year();
        let tx = conn.transaction()?;
        let floor = protocol_id::stored_highest_sequence(&tx, year)?;
        let total = rows.len();
        let mut ids = Vec::with_capacity(total);
        for (index, fields) in rows.iter().enumerate() {
            let sequence = floor.saturating_add(index as u64 + 1);
            let protocol_id = protocol_id::format_id(year, sequence)?;
            let sealed = self.seal_fields(fields)?;
            insert_row(&tx, &protocol_id, fields, &sealed, &now_text())?;
            let after = self.sign_and_snapshot(&tx, &protocol_id)?;
            AuditTrail::new(&tx).append(&protocol_id, actor, reason, &AuditChange::Insert { after })?;
            ids.push(protocol_id);
            if let Some(report) = progress.as_deref_mut() {
                report(index + 1, total);
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get_subscription(&self, protocol_id: &str) -> Result<Option<Subscription>> {
        let _gate = self.gate.shared();
        let conn = self.reader();
        match load_row(&conn, protocol_id)? {
            Some(stored) => self.decode(&stored).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let _gate = self.gate.shared();
        let conn = self.reader();
        self.query_subscriptions(&conn, "ORDER BY protocol_id", [])
    }

    /// Substring match on protocol ID, owner name or plate. Case folding is
    /// SQLite's `LIKE`, which ignores case for ASCII letters only: `è` does not
    /// match `È`.
    pub fn search_subscriptions(&self, query: &str) -> Result<Vec<Subscription>> {
        let pattern = like_pattern(query);
        let _gate = self.gate.shared();
        let conn = self.reader();
        self.query_subscriptions(
            &conn,
            "WHERE protocol_id LIKE ?1 ESCAPE '\\'
                OR owner_name LIKE ?1 ESCAPE '\\'
                OR license_plate LIKE ?1 ESCAPE '\\'
             ORDER BY protocol_id",
            params![pattern],
        )
    }

    /// Exact plate match ignoring case. Contact fields are never decrypted here.
    pub fn get_subscriptions_by_plate(&self, plate: &str) -> Result<Vec<PlateLookup>> {
        let _gate = self.gate.shared();
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT protocol_id, owner_name, license_plate, subscription_start, subscription_end
             FROM subscriptions
             WHERE UPPER(license_plate) = UPPER(?1)
             ORDER BY subscription_start",
        )?;
        let raw = stmt
            .query_map(params![plate.trim()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|(protocol_id, owner_name, license_plate, start, end)| {
                Ok(PlateLookup {
                    subscription_start: parse_date(&protocol_id, "subscription_start", &start)?,
                    subscription_end: parse_date(&protocol_id, "subscription_end", &end)?,
                    protocol_id,
                    owner_name,
                    license_plate,
                })
            })
            .collect()
    }

    /// Re-derive every row's signature and compare. One bad row never stops the scan.
    pub fn verify_data_integrity(&self) -> Result<IntegrityReport> {
        let _gate = self.gate.shared();
        let conn = self.reader();
        let mut stmt =
            conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM subscriptions ORDER BY protocol_id"))?;
        let rows = stmt.query_map([], signature_fields)?;

        let mut issues = Vec::new();
        for (index, row) in rows.enumerate() {
            let fields = match row {
                Ok(fields) => fields,
                Err(e) => {
                    issues.push(IntegrityIssue::Unreadable {
                        protocol_id: format!("row #{}", index + 1),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let protocol_id = protocol_id_of(&fields);
            let checked = stored_signature(&conn, &protocol_id)
                .and_then(|sig| sig.map(|sig| self.guard.verify(&fields, &sig)).transpose());
            match checked {
                Ok(Some(true)) => {}
                Ok(Some(false)) => issues.push(IntegrityIssue::Mismatch(protocol_id)),
                Ok(None) => issues.push(IntegrityIssue::MissingSignature(protocol_id)),
                Err(e) => issues.push(IntegrityIssue::Unreadable {
                    protocol_id,
                    reason: e.to_string(),
                }),
            }
        }

        for issue in &issues {
            warn!(protocol_id = issue.protocol_id(), "{}", issue);
        }
        Ok(IntegrityReport {
            all_valid: issues.is_empty(),
            issues,
        })
    }

    // ========================================================================
    // Audit
    // ========================================================================

    pub fn audit_log(&self, operation: Option<OperationType>, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let _gate = self.gate.shared();
        let conn = self.reader();
        AuditTrail::new(&conn).query(operation, limit)
    }

    pub fn audit_history(&self, protocol_id: &str) -> Result<Vec<AuditLogEntry>> {
        let _gate = self.gate.shared();
        let conn = self.reader();
        AuditTrail::new(&conn).history(protocol_id)
    }

    // ========================================================================
    // Analytics
    // ========================================================================

    pub fn payment_statistics(&self, filter: &StatsFilter) -> Result<PaymentStatistics> {
        Ok(analytics::payment_statistics(&self.stats_rows(filter)?))
    }

    pub fn monthly_revenue(&self, filter: &StatsFilter) -> Result<Vec<(String, Decimal)>> {
        Ok(analytics::monthly_revenue(&self.stats_rows(filter)?))
    }

    pub fn payment_methods_breakdown(&self, filter: &StatsFilter) -> Result<BTreeMap<String, usize>> {
        Ok(analytics::payment_methods_breakdown(&self.stats_rows(filter)?))
    }

    pub fn revenue_trend(&self, filter: &StatsFilter) -> Result<Vec<(String, Decimal)>> {
        Ok(analytics::revenue_trend(&self.stats_rows(filter)?, filter))
    }

    pub fn subscriptions_per_month(&self, filter: &StatsFilter) -> Result<Vec<(String, usize)>> {
        Ok(analytics::subscriptions_per_month(&self.stats_rows(filter)?))
    }

    /// Only the payment amount is decrypted.
    fn stats_rows(&self, filter: &StatsFilter) -> Result<Vec<StatsRow>> {
        let (from, to) = match filter.date_range {
            Some((from, to)) => (Some(date_text(from)), Some(date_text(to))),
            None => (None, None),
        };
        let _gate = self.gate.shared();
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT protocol_id, subscription_start, subscription_end, payment_amount_encrypted, payment_method
             FROM subscriptions
             WHERE (?1 IS NULL OR subscription_start >= ?1)
               AND (?2 IS NULL OR subscription_start <= ?2)
             ORDER BY protocol_id",
        )?;
        let raw = stmt
            .query_map(params![from, to], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (protocol_id, start, end, amount, payment_method) in raw {
            let subscription_start = parse_date(&protocol_id, "subscription_start", &start)?;
            if !filter.matches(subscription_start) {
                continue;
            }
            let subscription_end = parse_date(&protocol_id, "subscription_end", &end)?;
            let payment_amount = self.decrypt_amount(&protocol_id, &amount)?;
            rows.push(StatsRow {
                protocol_id,
                subscription_start,
                subscription_end,
                payment_amount,
                payment_method,
            });
        }
        Ok(rows)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn seal_fields(&self, fields: &SubscriptionFields) -> Result<SealedFields> {
        Ok(SealedFields {
            email: self.vault.encrypt(&fields.email)?,
            address: self.vault.encrypt(&fields.address)?,
            mobile: self.vault.encrypt(&fields.mobile)?,
            payment_amount: self.vault.encrypt(&fields.payment_amount.to_string())?,
        })
    }

    fn reseal(&self, existing: &[u8], old_plain: &str, new_plain: &str) -> Result<Vec<u8>> {
        if old_plain == new_plain {
            Ok(existing.to_vec())
        } else {
            self.vault.encrypt(new_plain)
        }
    }

    /// Sign what is actually persisted, then return the decrypted row for the audit snapshot.
    fn sign_and_snapshot(&self, conn: &Connection, protocol_id: &str) -> Result<Subscription> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM subscriptions WHERE protocol_id = ?1");
        let fields = conn
            .query_row(&sql, params![protocol_id], signature_fields)
            .optional()?
            .ok_or_else(|| invalid(protocol_id, "protocol_id", "row missing after write"))?;
        let signature = self.guard.sign(&fields)?;
        conn.execute(
            "INSERT OR REPLACE INTO data_integrity (table_name, record_id, signature, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![SUBSCRIPTIONS_TABLE, protocol_id, signature, now_text()],
        )?;

        let stored = load_row(conn, protocol_id)?
            .ok_or_else(|| invalid(protocol_id, "protocol_id", "row missing after write"))?;
        self.decode(&stored)
    }

    fn query_subscriptions<P: Params>(&self, conn: &Connection, tail: &str, params: P) -> Result<Vec<Subscription>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM subscriptions {tail}");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, StoredRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    fn decode(&self, row: &StoredRow) -> Result<Subscription> {
        let id = row.protocol_id.as_str();
        Ok(Subscription {
            protocol_id: row.protocol_id.clone(),
            fields: SubscriptionFields {
                owner_name: row.owner_name.clone(),
                license_plate: row.license_plate.clone(),
                email: self.vault.decrypt(&row.email)?,
                address: self.vault.decrypt(&row.address)?,
                mobile: self.vault.decrypt(&row.mobile)?,
                subscription_start: parse_date(id, "subscription_start", &row.subscription_start)?,
                subscription_end: parse_date(id, "subscription_end", &row.subscription_end)?,
                payment_amount: self.decrypt_amount(id, &row.payment_amount)?,
                payment_method: row.payment_method.clone(),
            },
            created_at: parse_timestamp(id, "created_at", &row.created_at)?,
            updated_at: parse_timestamp(id, "updated_at", &row.updated_at)?,
        })
    }

    fn decrypt_amount(&self, protocol_id: &str, ciphertext: &[u8]) -> Result<Decimal> {
        let text = self.vault.decrypt(ciphertext)?;
        Decimal::from_str(text.trim())
            .map_err(|e| invalid(protocol_id, "payment_amount_encrypted", e))
    }
}

fn insert_row(
    conn: &Connection,
    protocol_id: &str,
    fields: &SubscriptionFields,
    sealed: &SealedFields,
    now: &str,
) -> Result<()> {
    let method = PaymentMethod::normalize(&fields.payment_method);
    conn.execute(
        "INSERT INTO subscriptions
         (protocol_id, owner_name, license_plate, email_encrypted, address_encrypted,
          mobile_encrypted, subscription_start, subscription_end, payment_amount_encrypted,
          payment_method, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            protocol_id,
            fields.owner_name,
            fields.license_plate,
            sealed.email,
            sealed.address,
            sealed.mobile,
            date_text(fields.subscription_start),
            date_text(fields.subscription_end),
            sealed.payment_amount,
            method.as_str(),
            now,
        ],
    )?;
    Ok(())
}

fn load_row(conn: &Connection, protocol_id: &str) -> Result<Option<StoredRow>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM subscriptions WHERE protocol_id = ?1");
    conn.query_row(&sql, params![protocol_id], StoredRow::from_row)
        .optional()
        .map_err(Into::into)
}

/// Canonical signature input. Reads raw values so a tampered column type cannot abort a scan.
fn signature_fields(row: &Row<'_>) -> rusqlite::Result<RecordFields> {
    let mut fields = RecordFields::new();
    for (index, name) in COLUMNS.iter().enumerate() {
        let value = match row.get::<_, Value>(index)? {
            Value::Null => ColumnValue::Null,
            Value::Integer(i) => ColumnValue::Text(i.to_string()),
            Value::Real(f) => ColumnValue::Text(f.to_string()),
            Value::Text(s) => ColumnValue::Text(s),
            Value::Blob(b) => ColumnValue::Blob(b),
        };
        fields.insert((*name).to_string(), value);
    }
    Ok(fields)
}

fn protocol_id_of(fields: &RecordFields) -> String {
    match fields.get("protocol_id") {
        Some(ColumnValue::Text(s)) => s.clone(),
        Some(ColumnValue::Blob(b)) => hex::encode(b),
        _ => "<null>".to_string(),
    }
}

fn stored_signature(conn: &Connection, protocol_id: &str) -> Result<Option<Vec<u8>>> {
    let value = conn
        .query_row(
            "SELECT signature FROM data_integrity WHERE table_name = ?1 AND record_id = ?2",
            params![SUBSCRIPTIONS_TABLE, protocol_id],
            |row| row.get::<_, Value>(0),
        )
        .optional()?;
    Ok(value.map(|v| match v {
        Value::Blob(b) => b,
        Value::Text(s) => s.into_bytes(),
        _ => Vec::new(),
    }))
}

fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn invalid(protocol_id: &str, column: &'static str, reason: impl ToString) -> RegistryError {
    RegistryError::InvalidStoredValue {
        protocol_id: protocol_id.to_string(),
        column,
        reason: reason.to_string(),
    }
}

// Dates may carry a time suffix; only the calendar day is kept.
fn parse_date(protocol_id: &str, column: &'static str, text: &str) -> Result<NaiveDate> {
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|e| invalid(protocol_id, column, e))
}

fn parse_timestamp(protocol_id: &str, column: &'static str, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| invalid(protocol_id, column, e))
}
