//! Record types exposed by the store

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Plaintext field values supplied by callers for insert and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFields {
    pub owner_name: String,
    pub license_plate: String,
    pub email: String,
    pub address: String,
    pub mobile: String,
    pub subscription_start: NaiveDate,
    pub subscription_end: NaiveDate,
    pub payment_amount: Decimal,
    pub payment_method: String,
}

/// A decrypted subscription as read back from storage.
///
/// This is also the shape of audit snapshots, so the trail stays readable
/// without the vault key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub protocol_id: String,
    #[serde(flatten)]
    pub fields: SubscriptionFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validity-check projection returned by plate lookups. Carries no contact data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlateLookup {
    pub protocol_id: String,
    pub owner_name: String,
    pub license_plate: String,
    pub subscription_start: NaiveDate,
    pub subscription_end: NaiveDate,
}

impl PlateLookup {
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.subscription_start <= date && date <= self.subscription_end
    }
}

/// Canonical payment-method classes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    Pos,
    Bollettino,
    Other(String),
}

impl PaymentMethod {
    pub const POS: &'static str = "POS";
    pub const BOLLETTINO: &'static str = "BOLLETTINO";

    /// Trim and uppercase, then fold known free-text variants.
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        match upper.as_str() {
            "POS" | "CARD" | "CARTE" | "CARTA" => PaymentMethod::Pos,
            s if s.starts_with("BOL") => PaymentMethod::Bollettino,
            _ => PaymentMethod::Other(upper),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PaymentMethod::Pos => Self::POS,
            PaymentMethod::Bollettino => Self::BOLLETTINO,
            PaymentMethod::Other(s) => s,
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    MissingSignature(String),
    Mismatch(String),
    Unreadable { protocol_id: String, reason: String },
}

impl IntegrityIssue {
    pub fn protocol_id(&self) -> &str {
        match self {
            IntegrityIssue::MissingSignature(id) | IntegrityIssue::Mismatch(id) => id,
            IntegrityIssue::Unreadable { protocol_id, .. } => protocol_id,
        }
    }
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::MissingSignature(id) => write!(f, "Missing integrity signature for {id}"),
            IntegrityIssue::Mismatch(id) => write!(f, "Integrity check failed for {id}"),
            IntegrityIssue::Unreadable { protocol_id, reason } => {
                write!(f, "Could not check {protocol_id}: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub all_valid: bool,
    pub issues: Vec<IntegrityIssue>,
}
