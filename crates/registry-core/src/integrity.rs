//! IntegrityGuard: HMAC-SHA256 signatures over canonical row serializations.
//!
//! Canonical form is JSON with keys in sorted order (a `BTreeMap`), binary
//! values base64-encoded and NULLs as JSON null. Signatures are stored in the
//! `data_integrity` table and compared in constant time.

use crate::crypto::KEY_LEN;
use crate::error::{RegistryError, Result};
use crate::keyfile;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroizing;

pub const INTEGRITY_KEY_FILE: &str = "integrity.key";
pub const SIGNATURE_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Text(String),
    Blob(Vec<u8>),
    Null,
}

impl Serialize for ColumnValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ColumnValue::Text(s) => serializer.serialize_str(s),
            ColumnValue::Blob(b) => serializer.serialize_str(&general_purpose::STANDARD.encode(b)),
            ColumnValue::Null => serializer.serialize_none(),
        }
    }
}

/// Column name to value, iterated in key order.
pub type RecordFields = BTreeMap<String, ColumnValue>;

pub struct IntegrityGuard {
    key_path: PathBuf,
    key: RwLock<Zeroizing<[u8; KEY_LEN]>>,
}

impl fmt::Debug for IntegrityGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityGuard")
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl IntegrityGuard {
    pub fn open(keys_dir: impl AsRef<Path>) -> Result<Self> {
        let key_path = keys_dir.as_ref().join(INTEGRITY_KEY_FILE);
        let key = keyfile::load_or_generate(&key_path)?;
        Ok(Self {
            key_path,
            key: RwLock::new(key),
        })
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn reload(&self) -> Result<()> {
        let key = keyfile::read_key(&self.key_path)?;
        *self.key.write() = key;
        info!(path = %self.key_path.display(), "integrity key reloaded");
        Ok(())
    }

    pub fn sign(&self, fields: &RecordFields) -> Result<Vec<u8>> {
        let mac = self.mac_over(fields)?;
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Constant-time comparison; wrong-length signatures never match.
    pub fn verify(&self, fields: &RecordFields, signature: &[u8]) -> Result<bool> {
        if signature.len() != SIGNATURE_LEN {
            return Ok(false);
        }
        let mac = self.mac_over(fields)?;
        Ok(mac.verify_slice(signature).is_ok())
    }

    fn mac_over(&self, fields: &RecordFields) -> Result<HmacSha256> {
        let canonical = serde_json::to_vec(fields)?;
        let key = self.key.read();
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&key[..]).map_err(|e| {
            RegistryError::InvalidKeyMaterial {
                path: self.key_path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        mac.update(&canonical);
        Ok(mac)
    }
}
