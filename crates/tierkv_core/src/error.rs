//! Error types for tierkv core.

use thiserror::Error;
use tierkv_protocol::{ErrorCode, ProtocolError};
use tierkv_storage::StorageError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding or decoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The key does not exist.
    #[error("key not found: {key}")]
    KeyNotFound {
        /// The missing key.
        key: String,
    },

    /// The transaction is not registered.
    #[error("transaction not found: {txn_id}")]
    TxnNotFound {
        /// The unknown transaction id.
        txn_id: String,
    },

    /// A log position was trimmed or has not been written yet.
    #[error("log position {position} outside [{first}, {next})")]
    LogPositionOutOfRange {
        /// The requested position.
        position: u64,
        /// First retained position.
        first: u64,
        /// Next position to be written.
        next: u64,
    },

    /// Another transaction holds a conflicting lock.
    #[error("lock conflict on {key} for {txn_id}")]
    LockConflict {
        /// The contended key.
        key: String,
        /// The transaction that was refused.
        txn_id: String,
    },

    /// A younger transaction already read the version being overwritten.
    #[error("version conflict on {key} for {txn_id}: read at {read_timestamp}")]
    VersionConflict {
        /// The contended key.
        key: String,
        /// The transaction that was refused.
        txn_id: String,
        /// Read timestamp of the version it tried to overwrite.
        read_timestamp: u64,
    },

    /// Writes are only accepted by the primary replica.
    #[error("not the primary replica for {key}")]
    NotPrimary {
        /// The key.
        key: String,
    },

    /// The transaction holds no lock on the key it tried to finish.
    #[error("{txn_id} holds no lock on {key}")]
    LockNotHeld {
        /// The key.
        key: String,
        /// The transaction.
        txn_id: String,
    },

    /// A transaction id without a parsable timestamp.
    #[error("invalid transaction id: {txn_id}")]
    InvalidTxnId {
        /// The malformed id.
        txn_id: String,
    },

    /// The log journal could not be replayed.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch in a journal record.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// The cluster configuration is unusable.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong.
        message: String,
    },
}

impl CoreError {
    /// Creates a key-not-found error.
    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    /// Creates a transaction-not-found error.
    pub fn txn_not_found(txn_id: impl Into<String>) -> Self {
        Self::TxnNotFound {
            txn_id: txn_id.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Maps the error onto the wire error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::KeyNotFound { .. } => ErrorCode::KeyDne,
            Self::TxnNotFound { .. } => ErrorCode::TxnDne,
            Self::LogPositionOutOfRange { .. } => ErrorCode::LogDne,
            _ => ErrorCode::FailedOp,
        }
    }

    /// Returns true if retrying the same operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockConflict { .. } | Self::VersionConflict { .. }
        )
    }
}
