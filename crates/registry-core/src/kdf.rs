//! Passphrase stretching for backup and key archives.
//!
//! PBKDF2-HMAC-SHA256, 1,000,000 iterations, 32-byte salt, 32-byte key.
//! Passphrases shorter than 16 characters are refused before any work is done.

use crate::crypto::{random_salt, KEY_LEN};
use hmac::Hmac;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

pub const MIN_PASSPHRASE_CHARS: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 1_000_000;
pub const SALT_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PassphraseError {
    #[error("Passphrase must be at least {min_chars} characters long")]
    WeakPassphrase { min_chars: usize },

    #[error("Passphrases do not match")]
    PassphraseMismatch,

    #[error("Key derivation failed: {0}")]
    Derivation(String),
}

pub struct DerivedKey {
    pub key: Zeroizing<[u8; KEY_LEN]>,
    pub salt: [u8; SALT_LEN],
}

pub fn validate_passphrase(passphrase: &str) -> Result<(), PassphraseError> {
    if passphrase.chars().count() < MIN_PASSPHRASE_CHARS {
        return Err(PassphraseError::WeakPassphrase {
            min_chars: MIN_PASSPHRASE_CHARS,
        });
    }
    Ok(())
}

/// Check strength, then that the confirmation matches exactly.
pub fn confirm_passphrase(passphrase: &str, confirmation: &str) -> Result<(), PassphraseError> {
    validate_passphrase(passphrase)?;
    if passphrase != confirmation {
        return Err(PassphraseError::PassphraseMismatch);
    }
    Ok(())
}

/// Derive an archive key. A fresh salt is drawn when `salt` is `None`.
pub fn derive(passphrase: &str, salt: Option<&[u8; SALT_LEN]>) -> Result<DerivedKey, PassphraseError> {
    validate_passphrase(passphrase)?;
    let salt = match salt {
        Some(s) => *s,
        None => random_salt(),
    };
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(passphrase.as_bytes(), &salt, PBKDF2_ITERATIONS, key.as_mut())
        .map_err(|e| PassphraseError::Derivation(e.to_string()))?;
    Ok(DerivedKey { key, salt })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "correct horse battery staple";

    #[test]
    fn short_passphrase_is_weak() {
        let err = validate_passphrase("fifteen chars!!").unwrap_err();
        assert_eq!(err, PassphraseError::WeakPassphrase { min_chars: 16 });
        assert!(validate_passphrase("sixteen chars!!!").is_ok());
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        // 15 characters, more than 16 bytes.
        assert!(validate_passphrase("èèèèèèèèèèèèèèè").is_err());
        assert!(validate_passphrase("èèèèèèèèèèèèèèèè").is_ok());
    }

    #[test]
    fn confirmation_must_match() {
        assert_eq!(
            confirm_passphrase(GOOD, "correct horse battery stapler"),
            Err(PassphraseError::PassphraseMismatch)
        );
        assert!(confirm_passphrase(GOOD, GOOD).is_ok());
    }

    #[test]
    fn same_salt_same_key() {
        let first = derive(GOOD, None).unwrap();
        let again = derive(GOOD, Some(&first.salt)).unwrap();
        assert_eq!(first.key.as_ref(), again.key.as_ref());
        let other = derive("another long passphrase", Some(&first.salt)).unwrap();
        assert_ne!(first.key.as_ref(), other.key.as_ref());
    }
}
