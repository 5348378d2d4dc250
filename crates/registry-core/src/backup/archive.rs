//! Archive file format.
//!
//! ```text
//! bytes 0..5   magic "87029"
//! byte  5      version: 0x01 full registry backup, 0x02 keys-only export
//! bytes 6..38  PBKDF2 salt
//! bytes 38..   XChaCha20-Poly1305 (nonce | ciphertext + tag) of the package
//! ```
//!
//! The six header bytes are bound as associated data, so a rewritten version
//! byte fails authentication instead of changing how the payload is read.

use super::BackupError;
use crate::crypto::{self, KEY_LEN};
use crate::kdf::{DerivedKey, SALT_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

pub const MAGIC: &[u8; 5] = b"87029";
pub const HEADER_LEN: usize = MAGIC.len() + 1;
pub const PREFIX_LEN: usize = HEADER_LEN + SALT_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    Full,
    KeysOnly,
}

impl ArchiveKind {
    pub fn version_byte(self) -> u8 {
        match self {
            ArchiveKind::Full => 0x01,
            ArchiveKind::KeysOnly => 0x02,
        }
    }

    pub fn from_version_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ArchiveKind::Full),
            0x02 => Some(ArchiveKind::KeysOnly),
            _ => None,
        }
    }

    pub(crate) fn file_prefix(self) -> &'static str {
        match self {
            ArchiveKind::Full => "registry_backup",
            ArchiveKind::KeysOnly => "registry_keys",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveKind::Full => "full registry backup",
            ArchiveKind::KeysOnly => "keys-only export",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub kind: ArchiveKind,
    pub salt: [u8; SALT_LEN],
}

impl ArchiveHeader {
    fn aad(&self) -> [u8; HEADER_LEN] {
        header_bytes(self.kind)
    }
}

fn header_bytes(kind: ArchiveKind) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..MAGIC.len()].copy_from_slice(MAGIC);
    header[MAGIC.len()] = kind.version_byte();
    header
}

/// Split a file into header and ciphertext. Nothing is decrypted here.
pub fn parse(data: &[u8]) -> Result<(ArchiveHeader, &[u8]), BackupError> {
    if data.len() < HEADER_LEN || &data[..MAGIC.len()] != MAGIC {
        return Err(BackupError::NotAnArchive);
    }
    let version = data[MAGIC.len()];
    let kind = ArchiveKind::from_version_byte(version).ok_or(BackupError::UnsupportedVersion(version))?;
    if data.len() < PREFIX_LEN {
        return Err(BackupError::WrongPassphraseOrCorrupted);
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&data[HEADER_LEN..PREFIX_LEN]);
    Ok((ArchiveHeader { kind, salt }, &data[PREFIX_LEN..]))
}

pub fn seal(kind: ArchiveKind, derived: &DerivedKey, package: &[u8]) -> Result<Vec<u8>, BackupError> {
    let header = ArchiveHeader {
        kind,
        salt: derived.salt,
    };
    let sealed = crypto::seal(&derived.key, package, &header.aad()).map_err(|e| BackupError::Step {
        step: super::Step::EncryptArchive,
        message: e.to_string(),
    })?;
    let mut out = Vec::with_capacity(PREFIX_LEN + sealed.len());
    out.extend_from_slice(&header.aad());
    out.extend_from_slice(&header.salt);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Any failure here means the passphrase is wrong or the file was damaged; callers cannot tell which.
pub fn open(
    header: &ArchiveHeader,
    key: &[u8; KEY_LEN],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, BackupError> {
    crypto::open(key, ciphertext, &header.aad()).map_err(|_| BackupError::WrongPassphraseOrCorrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_key;

    fn derived() -> DerivedKey {
        DerivedKey {
            key: random_key(),
            salt: [7u8; SALT_LEN],
        }
    }

    #[test]
    fn header_layout_matches_format() {
        let key = derived();
        let bytes = seal(ArchiveKind::KeysOnly, &key, b"payload").unwrap();
        assert_eq!(&bytes[..5], b"87029");
        assert_eq!(bytes[5], 0x02);
        assert_eq!(&bytes[6..38], &[7u8; 32]);

        let (header, ciphertext) = parse(&bytes).unwrap();
        assert_eq!(header.kind, ArchiveKind::KeysOnly);
        assert_eq!(open(&header, &key.key, ciphertext).unwrap().as_slice(), b"payload");
    }

    #[test]
    fn bad_magic_and_unknown_version_are_distinct() {
        assert!(matches!(parse(b"PK\x03\x04 zip file"), Err(BackupError::NotAnArchive)));
        assert!(matches!(parse(b"870"), Err(BackupError::NotAnArchive)));
        let mut future = b"87029".to_vec();
        future.push(0x07);
        future.extend_from_slice(&[0u8; 64]);
        assert!(matches!(parse(&future), Err(BackupError::UnsupportedVersion(0x07))));
    }

    #[test]
    fn flipped_version_byte_fails_authentication() {
        let key = derived();
        let mut bytes = seal(ArchiveKind::Full, &key, b"payload").unwrap();
        bytes[5] = 0x02;
        let (header, ciphertext) = parse(&bytes).unwrap();
        assert!(matches!(
            open(&header, &key.key, ciphertext),
            Err(BackupError::WrongPassphraseOrCorrupted)
        ));
    }

    #[test]
    fn truncated_after_header_is_corruption() {
        let mut bytes = b"87029".to_vec();
        bytes.push(0x01);
        bytes.extend_from_slice(&[0u8; 10]);
        assert!(matches!(parse(&bytes), Err(BackupError::WrongPassphraseOrCorrupted)));
    }
}
