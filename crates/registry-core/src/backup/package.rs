//! Plaintext package carried inside an archive: a gzipped tar holding the
//! storage snapshot, both key files and a manifest of BLAKE3 digests.
//!
//! Packages are built and unpacked in memory. Extraction never touches the
//! filesystem, so entry names cannot escape anywhere; anything outside the
//! fixed entry set is rejected outright.

use super::archive::ArchiveKind;
use crate::crypto::KEY_LEN;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use zeroize::Zeroizing;

pub const DATABASE_ENTRY: &str = "database.db";
pub const VAULT_KEY_ENTRY: &str = "keys/vault.key";
pub const INTEGRITY_KEY_ENTRY: &str = "keys/integrity.key";
pub const MANIFEST_ENTRY: &str = "manifest.json";

const CONTENT_ENTRIES: [&str; 3] = [DATABASE_ENTRY, VAULT_KEY_ENTRY, INTEGRITY_KEY_ENTRY];

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest: {0}")]
    Manifest(String),
    #[error("unexpected entry '{0}'")]
    UnexpectedEntry(String),
    #[error("missing entry '{0}'")]
    MissingEntry(String),
    #[error("digest mismatch for '{0}'")]
    DigestMismatch(String),
    #[error("'{entry}' holds {len} bytes, expected {}", KEY_LEN)]
    BadKeyLength { entry: String, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub blake3: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub kind: ArchiveKind,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

/// Verified package contents.
pub struct Package {
    pub manifest: PackageManifest,
    pub database: Option<Vec<u8>>,
    pub vault_key: Zeroizing<[u8; KEY_LEN]>,
    pub integrity_key: Zeroizing<[u8; KEY_LEN]>,
}

pub fn blake3_hex(bytes: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bytes);
    hasher.finalize().to_hex().to_string()
}

/// `database` must be present for a full backup and absent for a keys-only export.
pub fn build(
    kind: ArchiveKind,
    database: Option<&[u8]>,
    vault_key: &[u8],
    integrity_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, PackageError> {
    match (kind, database.is_some()) {
        (ArchiveKind::Full, false) => return Err(PackageError::MissingEntry(DATABASE_ENTRY.into())),
        (ArchiveKind::KeysOnly, true) => return Err(PackageError::UnexpectedEntry(DATABASE_ENTRY.into())),
        _ => {}
    }
    let mut contents: Vec<(&str, &[u8])> = Vec::with_capacity(3);
    if let Some(db) = database {
        contents.push((DATABASE_ENTRY, db));
    }
    contents.push((VAULT_KEY_ENTRY, vault_key));
    contents.push((INTEGRITY_KEY_ENTRY, integrity_key));

    let created_at = Utc::now();
    let manifest = PackageManifest {
        kind,
        created_at,
        entries: contents
            .iter()
            .map(|(path, data)| ManifestEntry {
                path: (*path).to_string(),
                blake3: blake3_hex(data),
                size: data.len() as u64,
            })
            .collect(),
    };
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).map_err(|e| PackageError::Manifest(e.to_string()))?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = Builder::new(encoder);
    let mtime = created_at.timestamp().max(0) as u64;
    for (path, data) in contents.iter().copied().chain([(MANIFEST_ENTRY, manifest_json.as_slice())]) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(mtime);
        tar.append_data(&mut header, path, data)?;
    }
    let encoder = tar.into_inner()?;
    Ok(Zeroizing::new(encoder.finish()?))
}

/// Unpack and verify a package against its manifest and the expected kind.
pub fn extract(bytes: &[u8], expected: ArchiveKind) -> Result<Package, PackageError> {
    let mut files: BTreeMap<String, Zeroizing<Vec<u8>>> = BTreeMap::new();
    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if entry.header().entry_type() != EntryType::Regular {
            return Err(PackageError::UnexpectedEntry(name));
        }
        if name != MANIFEST_ENTRY && !CONTENT_ENTRIES.contains(&name.as_str()) {
            return Err(PackageError::UnexpectedEntry(name));
        }
        let mut data = Zeroizing::new(Vec::new());
        entry.read_to_end(&mut data)?;
        if files.insert(name.clone(), data).is_some() {
            return Err(PackageError::UnexpectedEntry(name));
        }
    }

    let manifest_bytes = files
        .remove(MANIFEST_ENTRY)
        .ok_or_else(|| PackageError::MissingEntry(MANIFEST_ENTRY.into()))?;
    let manifest: PackageManifest =
        serde_json::from_slice(&manifest_bytes).map_err(|e| PackageError::Manifest(e.to_string()))?;
    if manifest.kind != expected {
        return Err(PackageError::Manifest(format!(
            "package is a {}, expected a {}",
            manifest.kind, expected
        )));
    }

    for listed in &manifest.entries {
        let data = files
            .get(&listed.path)
            .ok_or_else(|| PackageError::MissingEntry(listed.path.clone()))?;
        if data.len() as u64 != listed.size || blake3_hex(data) != listed.blake3 {
            return Err(PackageError::DigestMismatch(listed.path.clone()));
        }
    }
    if let Some(unlisted) = files.keys().find(|k| !manifest.entries.iter().any(|e| &e.path == *k)) {
        return Err(PackageError::UnexpectedEntry(unlisted.clone()));
    }

    let database = match (expected, files.remove(DATABASE_ENTRY)) {
        (ArchiveKind::Full, Some(db)) => Some(db.to_vec()),
        (ArchiveKind::Full, None) => return Err(PackageError::MissingEntry(DATABASE_ENTRY.into())),
        (ArchiveKind::KeysOnly, Some(_)) => return Err(PackageError::UnexpectedEntry(DATABASE_ENTRY.into())),
        (ArchiveKind::KeysOnly, None) => None,
    };
    let vault_key = take_key(&mut files, VAULT_KEY_ENTRY)?;
    let integrity_key = take_key(&mut files, INTEGRITY_KEY_ENTRY)?;

    Ok(Package {
        manifest,
        database,
        vault_key,
        integrity_key,
    })
}

fn take_key(
    files: &mut BTreeMap<String, Zeroizing<Vec<u8>>>,
    entry: &str,
) -> Result<Zeroizing<[u8; KEY_LEN]>, PackageError> {
    let data = files
        .remove(entry)
        .ok_or_else(|| PackageError::MissingEntry(entry.to_string()))?;
    if data.len() != KEY_LEN {
        return Err(PackageError::BadKeyLength {
            entry: entry.to_string(),
            len: data.len(),
        });
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&data);
    Ok(key)
}
