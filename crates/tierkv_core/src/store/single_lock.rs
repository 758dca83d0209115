//! One lock per key, writes applied in place.

use super::element::LockElement;
use super::{ConcurrencyProtocol, ConcurrencyStore};
use crate::error::{CoreError, CoreResult};
use crate::types::TxnId;
use std::collections::HashMap;

/// A minimal lock store.
///
/// `get` needs no foreign write lock and `put` needs no foreign lock of
/// either kind. A granted write replaces the committed value immediately,
/// so an abort releases the lock but cannot undo the write, and there is
/// no atomicity across keys.
#[derive(Debug, Default)]
pub struct SingleLockStore {
    elements: HashMap<String, LockElement>,
}

impl SingleLockStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn conflict(key: &str, txn: &TxnId) -> CoreError {
        CoreError::LockConflict {
            key: key.to_string(),
            txn_id: txn.to_string(),
        }
    }

    fn finish(&mut self, txn: &TxnId, key: &str, require_lock: bool) -> CoreResult<()> {
        let element = self
            .elements
            .get_mut(key)
            .ok_or_else(|| CoreError::key_not_found(key))?;
        if require_lock && !element.holds(txn) {
            return Err(CoreError::LockNotHeld {
                key: key.to_string(),
                txn_id: txn.to_string(),
            });
        }
        element.release(txn);
        if element.is_vacant() {
            self.elements.remove(key);
        }
        Ok(())
    }
}

impl ConcurrencyStore for SingleLockStore {
    fn protocol(&self) -> ConcurrencyProtocol {
        ConcurrencyProtocol::SingleLock
    }

    fn get(&mut self, txn: &TxnId, key: &str) -> CoreResult<String> {
        let element = self.elements.entry(key.to_string()).or_default();
        if !element.try_read(txn) {
            return Err(Self::conflict(key, txn));
        }
        element
            .committed
            .clone()
            .ok_or_else(|| CoreError::key_not_found(key))
    }

    fn put(&mut self, txn: &TxnId, key: &str, value: &str, is_primary: bool) -> CoreResult<()> {
        let element = self.elements.entry(key.to_string()).or_default();
        if !element.try_write(txn) {
            return Err(Self::conflict(key, txn));
        }
        element.committed = Some(value.to_string());
        element.is_primary = is_primary;
        Ok(())
    }

    fn prepare(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        let element = self
            .elements
            .get(key)
            .ok_or_else(|| CoreError::key_not_found(key))?;
        if element.holds(txn) {
            Ok(())
        } else {
            Err(CoreError::LockNotHeld {
                key: key.to_string(),
                txn_id: txn.to_string(),
            })
        }
    }

    fn commit(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.finish(txn, key, true)
    }

    fn abort(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.finish(txn, key, false)
    }

    fn is_primary(&mut self, key: &str) -> CoreResult<bool> {
        self.elements
            .get(key)
            .filter(|e| e.committed.is_some())
            .map(|e| e.is_primary)
            .ok_or_else(|| CoreError::key_not_found(key))
    }

    fn committed_value(&self, key: &str) -> Option<String> {
        self.elements.get(key).and_then(|e| e.committed.clone())
    }

    fn shadow_value(&self, _key: &str) -> Option<String> {
        None
    }

    fn contains(&self, key: &str) -> bool {
        self.elements.get(key).is_some_and(|e| e.committed.is_some())
    }

    fn remove(&mut self, key: &str) -> bool {
        self.elements.remove(key).is_some()
    }

    fn len(&self) -> usize {
        self.elements
            .values()
            .filter(|e| e.committed.is_some())
            .count()
    }
}
