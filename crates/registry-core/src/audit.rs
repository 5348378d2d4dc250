//! Append-only audit trail stored in the `audit_log` table.
//!
//! Only the record store appends, always inside the transaction of the
//! mutation being documented. Everyone else reads.

use crate::actor::ActorInfo;
use crate::error::{RegistryError, Result};
use crate::store::models::Subscription;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(OperationType::Insert),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// What changed. INSERT has only `after`, DELETE only `before`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditChange {
    Insert { after: Subscription },
    Update { before: Subscription, after: Subscription },
    Delete { before: Subscription },
}

impl AuditChange {
    pub fn operation(&self) -> OperationType {
        match self {
            AuditChange::Insert { .. } => OperationType::Insert,
            AuditChange::Update { .. } => OperationType::Update,
            AuditChange::Delete { .. } => OperationType::Delete,
        }
    }

    pub fn before(&self) -> Option<&Subscription> {
        match self {
            AuditChange::Insert { .. } => None,
            AuditChange::Update { before, .. } | AuditChange::Delete { before } => Some(before),
        }
    }

    pub fn after(&self) -> Option<&Subscription> {
        match self {
            AuditChange::Insert { after } | AuditChange::Update { after, .. } => Some(after),
            AuditChange::Delete { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub id: i64,
    pub protocol_id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: ActorInfo,
    pub reason: String,
    pub change: AuditChange,
}

impl AuditLogEntry {
    pub fn operation(&self) -> OperationType {
        self.change.operation()
    }
}

const ENTRY_COLUMNS: &str =
    "id, operation_type, protocol_id, timestamp, user, host, ip, reason, before_data, after_data";

pub struct AuditTrail<'c> {
    conn: &'c Connection,
}

impl<'c> AuditTrail<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Write one entry. `conn` must be the mutation's open transaction.
    pub(crate) fn append(
        &self,
        protocol_id: &str,
        actor: &ActorInfo,
        reason: &str,
        change: &AuditChange,
    ) -> Result<i64> {
        let before = change.before().map(serde_json::to_string).transpose()?;
        let after = change.after().map(serde_json::to_string).transpose()?;
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.conn
            .execute(
                "INSERT INTO audit_log
                 (operation_type, protocol_id, timestamp, user, host, ip, reason, before_data, after_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    change.operation().as_str(),
                    protocol_id,
                    timestamp,
                    actor.user,
                    actor.host,
                    actor.ip,
                    reason,
                    before,
                    after,
                ],
            )
            .map_err(|e| RegistryError::Audit(e.to_string()))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first, optionally restricted to one operation type.
    pub fn query(&self, operation: Option<OperationType>, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM audit_log
             WHERE ?1 IS NULL OR operation_type = ?1
             ORDER BY id DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params![operation.map(|o| o.as_str()), limit], RawEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawEntry::into_entry).collect()
    }

    /// Every entry for one record, newest first.
    pub fn history(&self, protocol_id: &str) -> Result<Vec<AuditLogEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM audit_log WHERE protocol_id = ?1 ORDER BY id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params![protocol_id], RawEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawEntry::into_entry).collect()
    }
}

struct RawEntry {
    id: i64,
    operation: String,
    protocol_id: String,
    timestamp: String,
    actor: ActorInfo,
    reason: String,
    before: Option<String>,
    after: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            operation: row.get(1)?,
            protocol_id: row.get(2)?,
            timestamp: row.get(3)?,
            actor: ActorInfo {
                user: row.get(4)?,
                host: row.get(5)?,
                ip: row.get(6)?,
            },
            reason: row.get(7)?,
            before: row.get(8)?,
            after: row.get(9)?,
        })
    }

    fn into_entry(self) -> Result<AuditLogEntry> {
        let corrupt = |reason: String| RegistryError::Audit(format!("entry {}: {}", self.id, reason));
        let operation = OperationType::from_str(&self.operation).map_err(corrupt)?;
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| corrupt(e.to_string()))?;
        let snapshot = |json: &Option<String>| -> Result<Option<Subscription>> {
            json.as_deref()
                .map(serde_json::from_str::<Subscription>)
                .transpose()
                .map_err(Into::into)
        };
        let before = snapshot(&self.before)?;
        let after = snapshot(&self.after)?;
        let change = match (operation, before, after) {
            (OperationType::Insert, None, Some(after)) => AuditChange::Insert { after },
            (OperationType::Update, Some(before), Some(after)) => AuditChange::Update { before, after },
            (OperationType::Delete, Some(before), None) => AuditChange::Delete { before },
            (op, _, _) => return Err(corrupt(format!("snapshots do not match {op}"))),
        };
        Ok(AuditLogEntry {
            id: self.id,
            protocol_id: self.protocol_id,
            timestamp,
            actor: self.actor,
            reason: self.reason,
            change,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::SubscriptionFields;
    use crate::store::schema;
    use chrono::NaiveDate;

    fn snapshot(plate: &str) -> Subscription {
        Subscription {
            protocol_id: "2026-0000000001".into(),
            fields: SubscriptionFields {
                owner_name: "Mario Rossi".into(),
                license_plate: plate.into(),
                email: "m@example.it".into(),
                address: "Via Roma 1".into(),
                mobile: "3331234567".into(),
                subscription_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                subscription_end: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
                payment_amount: "42.50".parse().unwrap(),
                payment_method: "POS".into(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn actor() -> ActorInfo {
        ActorInfo {
            user: "clerk".into(),
            host: Some("desk-1".into()),
            ip: None,
        }
    }

    #[test]
    fn append_and_query_newest_first() {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        let trail = AuditTrail::new(&conn);
        let id = "2026-0000000001";
        trail
            .append(id, &actor(), "new permit", &AuditChange::Insert { after: snapshot("AB123CD") })
            .unwrap();
        trail
            .append(
                id,
                &actor(),
                "plate corrected",
                &AuditChange::Update { before: snapshot("AB123CD"), after: snapshot("AB123CE") },
            )
            .unwrap();
        trail
            .append(id, &actor(), "permit revoked", &AuditChange::Delete { before: snapshot("AB123CE") })
            .unwrap();

        let all = trail.query(None, 10).unwrap();
        let ops: Vec<_> = all.iter().map(|e| e.operation()).collect();
        assert_eq!(ops, vec![OperationType::Delete, OperationType::Update, OperationType::Insert]);
        assert!(all[0].change.after().is_none());
        assert_eq!(all[0].change.before().unwrap().fields.license_plate, "AB123CE");
        assert_eq!(all[2].actor, actor());

        let updates = trail.query(Some(OperationType::Update), 10).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].reason, "plate corrected");

        assert_eq!(trail.query(None, 1).unwrap().len(), 1);
        assert_eq!(trail.history(id).unwrap().len(), 3);
        assert!(trail.history("2026-0000000002").unwrap().is_empty());
    }

    #[test]
    fn operation_type_parses_case_insensitively() {
        assert_eq!("delete".parse::<OperationType>().unwrap(), OperationType::Delete);
        assert!("drop".parse::<OperationType>().is_err());
    }
}
