//! Error types for rota.
//!
//! Every error carries a stable [`ErrorCode`] that prefixes its message, so
//! log lines from different nodes can be matched up by code.

use thiserror::Error;

/// Result type for rota core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes.
///
/// 1xxx codes reject input from a peer or a caller. 5xxx codes are local
/// storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidHash = 1001,
    InvalidKey = 1002,
    InvalidSignature = 1003,
    InvalidTransaction = 1004,
    InvalidBlock = 1005,
    BlockNotFound = 2002,
    DuplicateBlock = 3002,
    StorageWrite = 5002,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E{:04}", *self as u16)
    }
}

/// Errors raised by core types and by the block store.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed hex digest or address.
    #[error("[{code}] invalid hash: {message}")]
    InvalidHash {
        code: ErrorCode,
        message: String,
        #[source]
        source: Option<hex::FromHexError>,
    },

    /// Bytes that are not an Ed25519 public key, or a key that belongs to
    /// someone else.
    #[error("[{code}] invalid key: {message}")]
    InvalidKey { code: ErrorCode, message: String },

    #[error("[{code}] signature verification failed")]
    InvalidSignature { code: ErrorCode },

    /// Transaction fails its structural checks.
    #[error("[{code}] invalid transaction: {message}")]
    InvalidTransaction { code: ErrorCode, message: String },

    /// Block fails its structural checks.
    #[error("[{code}] invalid block: {message}")]
    InvalidBlock { code: ErrorCode, message: String },

    #[error("[{code}] not found: {message}")]
    NotFound { code: ErrorCode, message: String },

    #[error("[{code}] duplicate: {message}")]
    Duplicate { code: ErrorCode, message: String },

    /// The store refused a write.
    #[error("[{code}] storage error: {message}")]
    Storage { code: ErrorCode, message: String },
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidHash { code, .. }
            | Error::InvalidKey { code, .. }
            | Error::InvalidSignature { code }
            | Error::InvalidTransaction { code, .. }
            | Error::InvalidBlock { code, .. }
            | Error::NotFound { code, .. }
            | Error::Duplicate { code, .. }
            | Error::Storage { code, .. } => *code,
        }
    }

    /// Whether repeating the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code() == ErrorCode::StorageWrite
    }

    pub fn invalid_hash(message: impl Into<String>) -> Self {
        Error::InvalidHash {
            code: ErrorCode::InvalidHash,
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid_key(message: impl Into<String>) -> Self {
        Error::InvalidKey {
            code: ErrorCode::InvalidKey,
            message: message.into(),
        }
    }

    pub fn invalid_signature() -> Self {
        Error::InvalidSignature {
            code: ErrorCode::InvalidSignature,
        }
    }

    pub fn invalid_transaction(message: impl Into<String>) -> Self {
        Error::InvalidTransaction {
            code: ErrorCode::InvalidTransaction,
            message: message.into(),
        }
    }

    pub fn invalid_block(message: impl Into<String>) -> Self {
        Error::InvalidBlock {
            code: ErrorCode::InvalidBlock,
            message: message.into(),
        }
    }

    pub fn block_not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            code: ErrorCode::BlockNotFound,
            message: message.into(),
        }
    }

    pub fn duplicate_block(message: impl Into<String>) -> Self {
        Error::Duplicate {
            code: ErrorCode::DuplicateBlock,
            message: message.into(),
        }
    }

    pub fn storage_write(message: impl Into<String>) -> Self {
        Error::Storage {
            code: ErrorCode::StorageWrite,
            message: message.into(),
        }
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::InvalidHash {
            code: ErrorCode::InvalidHash,
            message: e.to_string(),
            source: Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hash, Hash160};

    #[test]
    fn test_message_carries_code() {
        let e = Error::invalid_transaction("negative output");
        assert_eq!(e.code(), ErrorCode::InvalidTransaction);
        assert_eq!(e.to_string(), "[E1004] invalid transaction: negative output");

        assert!(Error::duplicate_block("b1").to_string().starts_with("[E3002]"));
        assert!(Error::invalid_signature().to_string().starts_with("[E1003]"));
    }

    #[test]
    fn test_only_write_failures_are_retryable() {
        assert!(Error::storage_write("disk full").is_retryable());
        assert!(!Error::block_not_found("tip").is_retryable());
        assert!(!Error::invalid_block("bad merkle root").is_retryable());
    }

    #[test]
    fn test_bad_hex_keeps_source() {
        let err = Hash160::from_hex("zz").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidHash);
        assert!(std::error::Error::source(&err).is_some());

        let err = Hash::from_hex("abcd").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidHash);
        assert!(std::error::Error::source(&err).is_none());
    }
}
