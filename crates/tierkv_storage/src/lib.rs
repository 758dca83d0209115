//! # tierkv storage
//!
//! Lowest-level persistence for tierkv workers.
//!
//! Two kinds of storage live here:
//!
//! - [`StorageBackend`]: an opaque append-only byte journal. The log tier
//!   frames its write-ahead records on top of it; this crate never looks
//!   inside the bytes.
//! - [`SpillDirectory`]: one small file per key, used by the disk-backed
//!   lock store to page unlocked keys out of memory.
//!
//! ## Example
//!
//! ```rust
//! use tierkv_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut journal = InMemoryBackend::new();
//! let offset = journal.append(b"record").unwrap();
//! assert_eq!(journal.read_at(offset, 6).unwrap(), b"record");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod spill;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use spill::{SpillDirectory, SpilledKey};
