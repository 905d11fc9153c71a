use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletError {
    // Credential and session errors
    WeakPassword(String),
    AlreadyInitialized,
    NotInitialized,
    AuthenticationFailed,
    Locked,
    PermissionDenied(String),

    // Registry errors
    AlreadyExists(String),
    IndexAlreadyDerived { group: String, index: u32 },
    SeedGroupNotFound(String),
    NotFound(String),

    // Cryptographic errors
    CryptoError(String),
    InvalidKey(String),

    // Storage errors
    RecordNotFound(String),
    StorageError(String),
    FileNotFound(String),

    // Validation errors
    ValidationError(String),

    // Collaborator errors
    NetworkError(String),

    // Generic errors
    Unknown(String),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WalletError::WeakPassword(msg) => write!(f, "Weak password: {}", msg),
            WalletError::AlreadyInitialized => write!(f, "Master password already set"),
            WalletError::NotInitialized => write!(f, "Master password not set"),
            WalletError::AuthenticationFailed => write!(f, "Authentication failed"),
            WalletError::Locked => write!(f, "Vault is locked"),
            WalletError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),

            WalletError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            WalletError::IndexAlreadyDerived { group, index } => {
                write!(f, "Index {} already derived in seed group {}", index, group)
            }
            WalletError::SeedGroupNotFound(id) => write!(f, "Seed group not found: {}", id),
            WalletError::NotFound(msg) => write!(f, "Not found: {}", msg),

            WalletError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            WalletError::InvalidKey(msg) => write!(f, "Invalid key: {}", msg),

            WalletError::RecordNotFound(id) => write!(f, "Record not found: {}", id),
            WalletError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            WalletError::FileNotFound(msg) => write!(f, "File not found: {}", msg),

            WalletError::ValidationError(msg) => write!(f, "Validation error: {}", msg),

            WalletError::NetworkError(msg) => write!(f, "Network error: {}", msg),

            WalletError::Unknown(msg) => write!(f, "Unknown error: {}", msg),
        }
    }
}

impl std::error::Error for WalletError {}

pub type WalletResult<T> = Result<T, WalletError>;

// Conversion helpers
impl From<std::io::Error> for WalletError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => WalletError::FileNotFound(error.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                WalletError::PermissionDenied(error.to_string())
            }
            _ => WalletError::StorageError(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(error: serde_json::Error) -> Self {
        WalletError::ValidationError(format!("JSON error: {}", error))
    }
}
