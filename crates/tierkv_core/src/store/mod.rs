//! Concurrency-control stores.
//!
//! Every storage worker owns one [`ConcurrencyStore`]. The variant is picked
//! once, from configuration, by [`open_store`]:
//!
//! | Protocol | Type | Isolation |
//! |---|---|---|
//! | `single_lock` | [`SingleLockStore`] | one lock per key, writes in place |
//! | `two_phase_lock` | [`LockStore`] | strict 2PL with shadow values |
//! | `disk_two_phase_lock` | [`DiskLockStore`] | strict 2PL, unlocked keys on disk |
//! | `mvcc` | [`MvccStore`] | timestamp-ordered multi-versioning |

mod disk;
mod element;
mod lock;
mod mvcc;
mod single_lock;

pub use disk::DiskLockStore;
pub use lock::LockStore;
pub use mvcc::{MvccStore, MvccVersion, Visibility};
pub use single_lock::SingleLockStore;

use crate::error::CoreResult;
use crate::types::TxnId;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Selects a [`ConcurrencyStore`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyProtocol {
    /// [`SingleLockStore`].
    SingleLock,
    /// [`LockStore`].
    TwoPhaseLock,
    /// [`DiskLockStore`].
    DiskTwoPhaseLock,
    /// [`MvccStore`].
    Mvcc,
}

impl fmt::Display for ConcurrencyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SingleLock => "single_lock",
            Self::TwoPhaseLock => "two_phase_lock",
            Self::DiskTwoPhaseLock => "disk_two_phase_lock",
            Self::Mvcc => "mvcc",
        })
    }
}

/// Per-key transactional storage.
///
/// Errors map onto wire codes through [`crate::CoreError::code`]: unknown
/// keys are `KEY_DNE`, refused locks, versions and writes are `FAILED_OP`.
pub trait ConcurrencyStore: Send {
    /// The protocol this store implements.
    fn protocol(&self) -> ConcurrencyProtocol;

    /// Reads `key` on behalf of `txn`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` when there is no value visible to `txn`; a conflict
    /// error when the read is refused.
    fn get(&mut self, txn: &TxnId, key: &str) -> CoreResult<String>;

    /// Writes `value` to `key` on behalf of `txn`. Only the primary replica
    /// (`is_primary`) accepts writes under the lock-based protocols.
    ///
    /// # Errors
    ///
    /// A conflict or not-primary error when the write is refused.
    fn put(&mut self, txn: &TxnId, key: &str, value: &str, is_primary: bool) -> CoreResult<()>;

    /// First commit phase for `key`: checks `txn` can still commit it.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` for unknown keys, `LockNotHeld` when `txn` lost its lock.
    fn prepare(&mut self, txn: &TxnId, key: &str) -> CoreResult<()>;

    /// Publishes `txn`'s write to `key` and releases its locks.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` for unknown keys, `LockNotHeld` when `txn` holds nothing.
    fn commit(&mut self, txn: &TxnId, key: &str) -> CoreResult<()>;

    /// Discards `txn`'s pending write to `key` and releases its locks.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` for unknown keys.
    fn abort(&mut self, txn: &TxnId, key: &str) -> CoreResult<()>;

    /// Whether this replica accepted writes for `key`.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` for unknown keys.
    fn is_primary(&mut self, key: &str) -> CoreResult<bool>;

    /// The committed value of `key`, ignoring locks.
    fn committed_value(&self, key: &str) -> Option<String>;

    /// The uncommitted value pending on `key`, if any.
    fn shadow_value(&self, key: &str) -> Option<String>;

    /// Whether `key` has a committed value.
    fn contains(&self, key: &str) -> bool;

    /// Drops `key` and everything pending on it. Returns whether it existed.
    fn remove(&mut self, key: &str) -> bool;

    /// Number of keys with a committed value.
    fn len(&self) -> usize;

    /// Returns true if no key has a committed value.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates the store for `protocol`. Disk stores keep their files under
/// `<disk_root>/<tid>`.
///
/// # Errors
///
/// Returns an error if a disk store cannot open its directory.
pub fn open_store(
    protocol: ConcurrencyProtocol,
    disk_root: &Path,
    tid: u32,
) -> CoreResult<Box<dyn ConcurrencyStore>> {
    info!(%protocol, tid, "opening store");
    Ok(match protocol {
        ConcurrencyProtocol::SingleLock => Box::new(SingleLockStore::new()),
        ConcurrencyProtocol::TwoPhaseLock => Box::new(LockStore::new()),
        ConcurrencyProtocol::DiskTwoPhaseLock => Box::new(DiskLockStore::open(disk_root, tid)?),
        ConcurrencyProtocol::Mvcc => Box::new(MvccStore::new()),
    })
}
