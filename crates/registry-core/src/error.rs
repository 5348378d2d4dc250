//! Error types for the registry core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Ciphertext could not be opened with the current vault key.
    #[error("Decryption failed: ciphertext is corrupted or was sealed with a different vault key")]
    Decryption,

    #[error("Encryption failed")]
    Encryption,

    #[error("Invalid key material in {path}: {reason}")]
    InvalidKeyMaterial { path: String, reason: String },

    #[error("Invalid stored value in {column} of {protocol_id}: {reason}")]
    InvalidStoredValue {
        protocol_id: String,
        column: &'static str,
        reason: String,
    },

    #[error("Protocol sequence exhausted for year {0}")]
    ProtocolIdExhausted(i32),

    /// Bulk import rolled back; the message is the original failure.
    #[error("Transaction rolled back: {0}")]
    TransactionFailure(String),

    #[error("Audit log write failed: {0}")]
    Audit(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
