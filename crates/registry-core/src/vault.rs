//! SymmetricVault: holds the persistent field key and seals sensitive columns.
//!
//! The key lives in `<keys_dir>/vault.key` as 32 raw bytes. It is generated on
//! first open and written to disk before any value is sealed with it.

use crate::crypto::{self, KEY_LEN};
use crate::error::{RegistryError, Result};
use crate::keyfile;
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroizing;

pub const VAULT_KEY_FILE: &str = "vault.key";

const FIELD_AAD: &[u8] = b"permit-registry/field/v1";

pub struct SymmetricVault {
    key_path: PathBuf,
    key: RwLock<Zeroizing<[u8; KEY_LEN]>>,
}

impl fmt::Debug for SymmetricVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricVault")
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl SymmetricVault {
    pub fn open(keys_dir: impl AsRef<Path>) -> Result<Self> {
        let key_path = keys_dir.as_ref().join(VAULT_KEY_FILE);
        let key = keyfile::load_or_generate(&key_path)?;
        Ok(Self {
            key_path,
            key: RwLock::new(key),
        })
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Re-read the key file, e.g. after a restore replaced it.
    pub fn reload(&self) -> Result<()> {
        let key = keyfile::read_key(&self.key_path)?;
        *self.key.write() = key;
        info!(path = %self.key_path.display(), "vault key reloaded");
        Ok(())
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let key = self.key.read();
        crypto::seal(&key, plaintext.as_bytes(), FIELD_AAD).map_err(|_| RegistryError::Encryption)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<String> {
        let key = self.key.read();
        let plaintext =
            crypto::open(&key, ciphertext, FIELD_AAD).map_err(|_| RegistryError::Decryption)?;
        String::from_utf8(plaintext.to_vec()).map_err(|_| RegistryError::Decryption)
    }

    /// Short non-secret identifier for the current key, for operator display.
    pub fn fingerprint(&self) -> String {
        let key = self.key.read();
        let digest = blake3::keyed_hash(&key, b"permit-registry/fingerprint");
        hex::encode(&digest.as_bytes()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let dir = tempdir().unwrap();
        let vault = SymmetricVault::open(dir.path()).unwrap();
        let sealed = vault.encrypt("mario.rossi@example.it").unwrap();
        assert_ne!(sealed.as_slice(), b"mario.rossi@example.it");
        assert_eq!(vault.decrypt(&sealed).unwrap(), "mario.rossi@example.it");
        assert_eq!(vault.decrypt(&vault.encrypt("").unwrap()).unwrap(), "");
    }

    #[test]
    fn key_survives_reopen() {
        let dir = tempdir().unwrap();
        let sealed = SymmetricVault::open(dir.path()).unwrap().encrypt("42.50").unwrap();
        let reopened = SymmetricVault::open(dir.path()).unwrap();
        assert_eq!(reopened.decrypt(&sealed).unwrap(), "42.50");
    }

    #[test]
    fn foreign_key_or_corruption_is_decryption_error() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let vault_a = SymmetricVault::open(a.path()).unwrap();
        let vault_b = SymmetricVault::open(b.path()).unwrap();
        let mut sealed = vault_a.encrypt("via roma 1").unwrap();
        assert!(matches!(vault_b.decrypt(&sealed), Err(RegistryError::Decryption)));
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(vault_a.decrypt(&sealed), Err(RegistryError::Decryption)));
        assert!(matches!(vault_a.decrypt(b"garbage"), Err(RegistryError::Decryption)));
    }

    #[test]
    fn reload_picks_up_replaced_key() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let vault = SymmetricVault::open(a.path()).unwrap();
        let other = SymmetricVault::open(b.path()).unwrap();
        let sealed = other.encrypt("3331234567").unwrap();
        std::fs::copy(other.key_path(), vault.key_path()).unwrap();
        vault.reload().unwrap();
        assert_eq!(vault.decrypt(&sealed).unwrap(), "3331234567");
        assert_eq!(vault.fingerprint(), other.fingerprint());
    }
}
