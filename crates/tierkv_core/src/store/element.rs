//! Per-key lock state shared by the lock-based stores.

use crate::types::TxnId;
use std::collections::BTreeSet;

/// Lock and value state of one key.
///
/// At most one writer; a writer excludes every reader but itself.
#[derive(Debug, Clone, Default)]
pub(crate) struct LockElement {
    pub(crate) committed: Option<String>,
    pub(crate) shadow: Option<String>,
    pub(crate) readers: BTreeSet<TxnId>,
    pub(crate) writer: Option<TxnId>,
    pub(crate) is_primary: bool,
}

impl LockElement {
    pub(crate) fn committed(value: String, is_primary: bool) -> Self {
        Self {
            committed: Some(value),
            is_primary,
            ..Self::default()
        }
    }

    pub(crate) fn is_writer(&self, txn: &TxnId) -> bool {
        self.writer.as_ref() == Some(txn)
    }

    pub(crate) fn holds(&self, txn: &TxnId) -> bool {
        self.is_writer(txn) || self.readers.contains(txn)
    }

    /// Takes a read lock unless another transaction is writing.
    pub(crate) fn try_read(&mut self, txn: &TxnId) -> bool {
        if self.writer.as_ref().is_some_and(|w| w != txn) {
            return false;
        }
        self.readers.insert(txn.clone());
        true
    }

    /// Takes the write lock unless another transaction holds any lock. The
    /// only reader may upgrade.
    pub(crate) fn try_write(&mut self, txn: &TxnId) -> bool {
        if self.writer.as_ref().is_some_and(|w| w != txn) {
            return false;
        }
        if self.readers.iter().any(|r| r != txn) {
            return false;
        }
        self.writer = Some(txn.clone());
        true
    }

    /// Releases every lock `txn` holds. Returns whether it was the writer.
    pub(crate) fn release(&mut self, txn: &TxnId) -> bool {
        self.readers.remove(txn);
        if self.is_writer(txn) {
            self.writer = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn is_unlocked(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    /// A lock placeholder for a key that never had a value.
    pub(crate) fn is_vacant(&self) -> bool {
        self.committed.is_none() && self.shadow.is_none() && self.is_unlocked()
    }
}
