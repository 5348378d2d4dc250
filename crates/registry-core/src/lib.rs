//! registry-core: encrypted storage engine for the municipal permit registry
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. We use application-level encryption:
//! - Sensitive columns (email, address, mobile, payment amount) are stored as
//!   XChaCha20-Poly1305 ciphertext under the persistent vault key.
//! - Every subscription row carries an HMAC-SHA256 signature computed with a
//!   second, independent key, so out-of-band edits to the file are detected.
//! - Owner name, plate and dates stay in plaintext for search and lookups.
//!
//! # KEY LOSS IS PERMANENT
//! There is exactly one vault key per install (`<keys_dir>/vault.key`). If it
//! is lost, every encrypted field is unrecoverable. Export the keys with
//! [`backup::BackupEngine::export_keys`] and keep the archive and its
//! passphrase apart. Nothing in this crate rotates keys implicitly.
//!
//! # Module layout
//! - `crypto`: AEAD seal/open helpers and OS randomness
//! - `vault`: SymmetricVault, the field encryption key holder
//! - `integrity`: IntegrityGuard, per-record HMAC signatures
//! - `kdf`: passphrase key stretching for archives (PBKDF2-SHA256)
//! - `actor`: best-effort user/host/IP metadata for audit entries
//! - `audit`: append-only audit trail
//! - `store`: RecordStore with CRUD, search, integrity scan and analytics
//! - `backup`: encrypted full backups and keys-only exports
//! - `gate`: shared/exclusive access between the store and restore
//! - `paths`: storage layout and default data directory
//! - `settings`: operator settings file
//! - `error`: unified error type

pub mod actor;
pub mod audit;
pub mod backup;
pub mod crypto;
pub mod error;
pub mod gate;
pub mod integrity;
pub mod kdf;
mod keyfile;
pub mod paths;
pub mod settings;
pub mod store;
pub mod vault;

pub use backup::{BackupEngine, BackupError};
pub use error::{RegistryError, Result};
pub use gate::AccessGate;
pub use integrity::IntegrityGuard;
pub use paths::StorageLayout;
pub use store::RecordStore;
pub use vault::SymmetricVault;
