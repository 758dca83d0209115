//! Strict two-phase locking with shadow values.

use super::element::LockElement;
use super::{ConcurrencyProtocol, ConcurrencyStore};
use crate::error::{CoreError, CoreResult};
use crate::types::TxnId;
use std::collections::HashMap;
use tracing::trace;

/// The 2PL lock table, shared by [`LockStore`] and the disk-backed store.
///
/// Reads of absent keys install a lock-only placeholder so the read lock
/// also keeps concurrent writers from creating the key until the reader
/// finishes.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    elements: HashMap<String, LockElement>,
}

impl LockTable {
    pub(crate) fn element(&self, key: &str) -> Option<&LockElement> {
        self.elements.get(key)
    }

    pub(crate) fn insert(&mut self, key: &str, element: LockElement) {
        self.elements.insert(key.to_string(), element);
    }

    pub(crate) fn take(&mut self, key: &str) -> Option<LockElement> {
        self.elements.remove(key)
    }

    pub(crate) fn resident(&self) -> usize {
        self.elements.len()
    }

    pub(crate) fn keys_with_values(&self) -> impl Iterator<Item = &String> {
        self.elements
            .iter()
            .filter(|(_, e)| e.committed.is_some())
            .map(|(k, _)| k)
    }

    pub(crate) fn get(&mut self, txn: &TxnId, key: &str) -> CoreResult<String> {
        let element = self.elements.entry(key.to_string()).or_default();
        if element.is_writer(txn) {
            return element
                .shadow
                .clone()
                .or_else(|| element.committed.clone())
                .ok_or_else(|| CoreError::key_not_found(key));
        }
        if !element.try_read(txn) {
            trace!(key, %txn, "read lock refused");
            return Err(CoreError::LockConflict {
                key: key.to_string(),
                txn_id: txn.to_string(),
            });
        }
        element
            .committed
            .clone()
            .ok_or_else(|| CoreError::key_not_found(key))
    }

    pub(crate) fn put(
        &mut self,
        txn: &TxnId,
        key: &str,
        value: &str,
        is_primary: bool,
    ) -> CoreResult<()> {
        if !is_primary {
            return Err(CoreError::NotPrimary {
                key: key.to_string(),
            });
        }
        let element = self.elements.entry(key.to_string()).or_default();
        if !element.try_write(txn) {
            trace!(key, %txn, "write lock refused");
            return Err(CoreError::LockConflict {
                key: key.to_string(),
                txn_id: txn.to_string(),
            });
        }
        element.is_primary = true;
        element.shadow = Some(value.to_string());
        Ok(())
    }

    pub(crate) fn prepare(&self, txn: &TxnId, key: &str) -> CoreResult<()> {
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

    pub(crate) fn commit(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        let element = self
            .elements
            .get_mut(key)
            .ok_or_else(|| CoreError::key_not_found(key))?;
        if !element.holds(txn) {
            return Err(CoreError::LockNotHeld {
                key: key.to_string(),
                txn_id: txn.to_string(),
            });
        }
        if element.release(txn) {
            if let Some(value) = element.shadow.take() {
                element.committed = Some(value);
            }
        }
        self.drop_if_vacant(key);
        Ok(())
    }

    pub(crate) fn abort(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        let element = self
            .elements
            .get_mut(key)
            .ok_or_else(|| CoreError::key_not_found(key))?;
        if element.release(txn) {
            element.shadow = None;
        }
        self.drop_if_vacant(key);
        Ok(())
    }

    pub(crate) fn is_primary(&self, key: &str) -> CoreResult<bool> {
        self.elements
            .get(key)
            .filter(|e| e.committed.is_some() || e.shadow.is_some())
            .map(|e| e.is_primary)
            .ok_or_else(|| CoreError::key_not_found(key))
    }

    fn drop_if_vacant(&mut self, key: &str) {
        if self.elements.get(key).is_some_and(LockElement::is_vacant) {
            self.elements.remove(key);
        }
    }
}

/// In-memory strict 2PL store.
///
/// Writes go to a per-key shadow slot under the write lock and become the
/// committed value at commit. Reads see committed values only, except that
/// the writer reads its own shadow value.
#[derive(Debug, Default)]
pub struct LockStore {
    table: LockTable,
}

impl LockStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConcurrencyStore for LockStore {
    fn protocol(&self) -> ConcurrencyProtocol {
        ConcurrencyProtocol::TwoPhaseLock
    }

    fn get(&mut self, txn: &TxnId, key: &str) -> CoreResult<String> {
        self.table.get(txn, key)
    }

    fn put(&mut self, txn: &TxnId, key: &str, value: &str, is_primary: bool) -> CoreResult<()> {
        self.table.put(txn, key, value, is_primary)
    }

    fn prepare(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.table.prepare(txn, key)
    }

    fn commit(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.table.commit(txn, key)
    }

    fn abort(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.table.abort(txn, key)
    }

    fn is_primary(&mut self, key: &str) -> CoreResult<bool> {
        self.table.is_primary(key)
    }

    fn committed_value(&self, key: &str) -> Option<String> {
        self.table.element(key).and_then(|e| e.committed.clone())
    }

    fn shadow_value(&self, key: &str) -> Option<String> {
        self.table.element(key).and_then(|e| e.shadow.clone())
    }

    fn contains(&self, key: &str) -> bool {
        self.table.element(key).is_some_and(|e| e.committed.is_some())
    }

    fn remove(&mut self, key: &str) -> bool {
        self.table.take(key).is_some()
    }

    fn len(&self) -> usize {
        self.table.keys_with_values().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tierkv_protocol::ErrorCode;

    fn txn(n: u64) -> TxnId {
        TxnId::new("c", n as u32, n)
    }

    fn committed(key: &str, value: &str) -> LockStore {
        let mut store = LockStore::new();
        let setup = TxnId::from("setup-0:0");
        store.put(&setup, key, value, true).unwrap();
        store.commit(&setup, key).unwrap();
        store
    }

    #[test]
    fn writer_blocks_foreign_readers_until_commit() {
        let mut store = committed("k", "old");
        store.put(&txn(1), "k", "new", true).unwrap();

        let err = store.get(&txn(2), "k").unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedOp);
        assert_eq!(store.committed_value("k").as_deref(), Some("old"));
        assert_eq!(store.shadow_value("k").as_deref(), Some("new"));

        store.prepare(&txn(1), "k").unwrap();
        store.commit(&txn(1), "k").unwrap();
        assert_eq!(store.get(&txn(2), "k").unwrap(), "new");
        assert_eq!(store.shadow_value("k"), None);
    }

    #[test]
    fn writer_reads_its_own_write() {
        let mut store = committed("k", "old");
        store.put(&txn(1), "k", "mine", true).unwrap();
        assert_eq!(store.get(&txn(1), "k").unwrap(), "mine");
    }

    #[test]
    fn readers_block_writers_and_sole_reader_upgrades() {
        let mut store = committed("k", "v");
        assert_eq!(store.get(&txn(1), "k").unwrap(), "v");
        assert_eq!(store.get(&txn(2), "k").unwrap(), "v");
        assert!(store.put(&txn(1), "k", "x", true).is_err());

        store.commit(&txn(2), "k").unwrap();
        store.put(&txn(1), "k", "x", true).unwrap();
        store.commit(&txn(1), "k").unwrap();
        assert_eq!(store.committed_value("k").as_deref(), Some("x"));
    }

    #[test]
    fn replica_refuses_writes() {
        let mut store = LockStore::new();
        let err = store.put(&txn(1), "k", "v", false).unwrap_err();
        assert!(matches!(err, CoreError::NotPrimary { .. }));
        assert!(!store.contains("k"));
    }

    #[test]
    fn missing_key_read_holds_a_lock() {
        let mut store = LockStore::new();
        let err = store.get(&txn(1), "ghost").unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyDne);
        assert!(store.put(&txn(2), "ghost", "boo", true).is_err());

        store.prepare(&txn(1), "ghost").unwrap();
        store.commit(&txn(1), "ghost").unwrap();
        assert!(!store.contains("ghost"));
        store.put(&txn(2), "ghost", "boo", true).unwrap();
    }

    #[test]
    fn abort_discards_shadow() {
        let mut store = committed("k", "old");
        store.put(&txn(1), "k", "new", true).unwrap();
        store.abort(&txn(1), "k").unwrap();

        assert_eq!(store.committed_value("k").as_deref(), Some("old"));
        assert_eq!(store.shadow_value("k"), None);
        store.put(&txn(2), "k", "other", true).unwrap();
    }

    #[test]
    fn aborted_insert_leaves_nothing() {
        let mut store = LockStore::new();
        store.put(&txn(1), "k", "v", true).unwrap();
        store.abort(&txn(1), "k").unwrap();
        assert!(store.is_empty());
        assert_eq!(store.is_primary("k").unwrap_err().code(), ErrorCode::KeyDne);
    }

    #[test]
    fn finishing_without_a_lock_fails() {
        let mut store = committed("k", "v");
        assert!(matches!(
            store.prepare(&txn(1), "k"),
            Err(CoreError::LockNotHeld { .. })
        ));
        assert!(matches!(
            store.commit(&txn(1), "k"),
            Err(CoreError::LockNotHeld { .. })
        ));
        assert_eq!(
            store.prepare(&txn(1), "absent").unwrap_err().code(),
            ErrorCode::KeyDne
        );
    }

    proptest! {
        #[test]
        fn at_most_one_writer(order in proptest::collection::vec(0u64..4, 1..12)) {
            let mut store = LockStore::new();
            let mut holder: Option<u64> = None;
            for t in order {
                let granted = store.put(&txn(t), "k", "v", true).is_ok();
                match holder {
                    None => { prop_assert!(granted); holder = Some(t); }
                    Some(h) => prop_assert_eq!(granted, h == t),
                }
            }
        }
    }
}
