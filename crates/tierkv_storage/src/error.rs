//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a journal.
    #[error("read beyond end of journal: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current journal size.
        size: u64,
    },

    /// Truncation target lies past the end of the journal.
    #[error("cannot truncate to {requested} bytes, journal holds {size}")]
    TruncatePastEnd {
        /// The requested size.
        requested: u64,
        /// The current journal size.
        size: u64,
    },

    /// A spill file does not follow the `is_primary\nvalue\n` layout.
    #[error("malformed spill file for key {key:?}: {reason}")]
    MalformedSpillFile {
        /// The key whose file is malformed.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Another store already owns the spill directory.
    #[error("spill directory {path} is locked by another store")]
    DirectoryLocked {
        /// The locked directory.
        path: String,
    },
}
