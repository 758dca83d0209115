//! Two-phase locking over spill files.

use super::element::LockElement;
use super::lock::LockTable;
use super::{ConcurrencyProtocol, ConcurrencyStore};
use crate::error::CoreResult;
use crate::types::TxnId;
use std::collections::BTreeSet;
use std::path::Path;
use tierkv_storage::{SpillDirectory, SpilledKey};
use tracing::warn;

/// Strict 2PL with only locked keys held in memory.
///
/// Every operation pages the key in from its spill file, runs the 2PL
/// logic, and then purges the key back to disk if no transaction holds a
/// lock on it any more.
#[derive(Debug)]
pub struct DiskLockStore {
    table: LockTable,
    spill: SpillDirectory,
}

impl DiskLockStore {
    /// Opens the store of thread `tid` under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or is in use.
    pub fn open(root: &Path, tid: u32) -> CoreResult<Self> {
        Ok(Self {
            table: LockTable::default(),
            spill: SpillDirectory::open(root, tid)?,
        })
    }

    /// Number of keys currently held in memory.
    #[must_use]
    pub fn resident(&self) -> usize {
        self.table.resident()
    }

    fn load(&mut self, key: &str) -> CoreResult<()> {
        if self.table.element(key).is_some() {
            return Ok(());
        }
        if let Some(spilled) = self.spill.read(key)? {
            self.table
                .insert(key, LockElement::committed(spilled.value, spilled.is_primary));
        }
        Ok(())
    }

    /// Writes `key` back to its spill file and evicts it when unlocked.
    fn purge_key(&mut self, key: &str) -> CoreResult<()> {
        let unlocked = self
            .table
            .element(key)
            .is_some_and(LockElement::is_unlocked);
        if !unlocked {
            return Ok(());
        }
        if let Some(element) = self.table.take(key) {
            if let Some(value) = element.committed {
                self.spill.write(
                    key,
                    &SpilledKey {
                        is_primary: element.is_primary,
                        value,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn with_key<T>(
        &mut self,
        key: &str,
        op: impl FnOnce(&mut LockTable) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.load(key)?;
        let result = op(&mut self.table);
        self.purge_key(key)?;
        result
    }
}

impl ConcurrencyStore for DiskLockStore {
    fn protocol(&self) -> ConcurrencyProtocol {
        ConcurrencyProtocol::DiskTwoPhaseLock
    }

    fn get(&mut self, txn: &TxnId, key: &str) -> CoreResult<String> {
        self.with_key(key, |table| table.get(txn, key))
    }

    fn put(&mut self, txn: &TxnId, key: &str, value: &str, is_primary: bool) -> CoreResult<()> {
        self.with_key(key, |table| table.put(txn, key, value, is_primary))
    }

    fn prepare(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.with_key(key, |table| table.prepare(txn, key))
    }

    fn commit(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.with_key(key, |table| table.commit(txn, key))
    }

    fn abort(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.with_key(key, |table| table.abort(txn, key))
    }

    fn is_primary(&mut self, key: &str) -> CoreResult<bool> {
        self.with_key(key, |table| table.is_primary(key))
    }

    fn committed_value(&self, key: &str) -> Option<String> {
        if let Some(element) = self.table.element(key) {
            return element.committed.clone();
        }
        match self.spill.read(key) {
            Ok(spilled) => spilled.map(|s| s.value),
            Err(e) => {
                warn!(key, error = %e, "unreadable spill file");
                None
            }
        }
    }

    fn shadow_value(&self, key: &str) -> Option<String> {
        self.table.element(key).and_then(|e| e.shadow.clone())
    }

    fn contains(&self, key: &str) -> bool {
        self.table
            .element(key)
            .map_or_else(|| self.spill.contains(key), |e| e.committed.is_some())
    }

    fn remove(&mut self, key: &str) -> bool {
        let resident = self.table.take(key).is_some();
        let spilled = self.spill.remove(key).unwrap_or_else(|e| {
            warn!(key, error = %e, "failed to remove spill file");
            false
        });
        resident || spilled
    }

    fn len(&self) -> usize {
        let mut keys: BTreeSet<String> = match self.spill.keys() {
            Ok(keys) => keys.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "failed to list spill directory");
                BTreeSet::new()
            }
        };
        keys.extend(self.table.keys_with_values().cloned());
        keys.len()
    }
}
