//! Open transactions of one TXN-tier worker.

use crate::error::{CoreError, CoreResult};
use crate::types::TxnId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tierkv_protocol::Operation;
use tracing::debug;

#[derive(Debug, Default)]
struct OpenTxn {
    ops: Vec<Operation>,
    // A storage worker refused one of the writes.
    failed: bool,
}

/// Registry of open transactions and the operations they performed.
///
/// Ids are `<client>-<random>:<millis>`; the timestamp part is strictly
/// increasing for ids created by the same registry, even within one
/// millisecond.
#[derive(Debug)]
pub struct TxnRegistry {
    txns: HashMap<TxnId, OpenTxn>,
    last_timestamp: u64,
    rng: StdRng,
}

impl Default for TxnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Creates a registry whose random disambiguators are reproducible.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            txns: HashMap::new(),
            last_timestamp: 0,
            rng,
        }
    }

    fn next_timestamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    /// Opens a transaction for `client_id` and returns its id.
    pub fn create_txn(&mut self, client_id: &str) -> TxnId {
        let timestamp = self.next_timestamp();
        let txn = TxnId::new(client_id, self.rng.gen(), timestamp);
        self.txns.insert(txn.clone(), OpenTxn::default());
        debug!(%txn, "transaction started");
        txn
    }

    /// Records an operation of `txn`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TxnNotFound`] if `txn` is not open.
    pub fn put_op(&mut self, txn: &TxnId, key: &str, payload: &str) -> CoreResult<()> {
        let open = self
            .txns
            .get_mut(txn)
            .ok_or_else(|| CoreError::txn_not_found(txn.as_str()))?;
        open.ops.push(Operation::new(txn.as_str(), key, payload));
        Ok(())
    }

    /// Marks `txn` as doomed: one of its writes was refused, so its commit
    /// must abort. Returns false if `txn` is not open.
    pub fn mark_failed(&mut self, txn: &TxnId) -> bool {
        match self.txns.get_mut(txn) {
            Some(open) => {
                if !open.failed {
                    debug!(%txn, "write refused, transaction will abort");
                }
                open.failed = true;
                true
            }
            None => false,
        }
    }

    /// Returns whether a write of `txn` was refused.
    #[must_use]
    pub fn has_failed(&self, txn: &TxnId) -> bool {
        self.txns.get(txn).is_some_and(|open| open.failed)
    }

    /// Operations of `txn` in the order they were recorded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TxnNotFound`] if `txn` is not open.
    pub fn get_ops(&self, txn: &TxnId) -> CoreResult<&[Operation]> {
        self.txns
            .get(txn)
            .map(|open| open.ops.as_slice())
            .ok_or_else(|| CoreError::txn_not_found(txn.as_str()))
    }

    /// Distinct keys of `txn`, in first-touch order. Commit fans out to
    /// these in this order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TxnNotFound`] if `txn` is not open.
    pub fn touched_keys(&self, txn: &TxnId) -> CoreResult<Vec<String>> {
        let mut keys: Vec<String> = Vec::new();
        for op in self.get_ops(txn)? {
            if !keys.contains(&op.key) {
                keys.push(op.key.clone());
            }
        }
        Ok(keys)
    }

    /// Closes `txn` and returns its operations.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TxnNotFound`] if `txn` is not open, including a
    /// second close of the same transaction.
    pub fn commit_txn(&mut self, txn: &TxnId) -> CoreResult<Vec<Operation>> {
        let ops = self
            .txns
            .remove(txn)
            .map(|open| open.ops)
            .ok_or_else(|| CoreError::txn_not_found(txn.as_str()))?;
        debug!(%txn, ops = ops.len(), "transaction closed");
        Ok(ops)
    }

    /// Returns whether `txn` is open.
    #[must_use]
    pub fn contains(&self, txn: &TxnId) -> bool {
        self.txns.contains_key(txn)
    }

    /// Number of operations recorded for `txn`, 0 if unknown.
    #[must_use]
    pub fn op_count(&self, txn: &TxnId) -> usize {
        self.txns.get(txn).map_or(0, |open| open.ops.len())
    }

    /// Number of open transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.txns.len()
    }

    /// Returns true if no transaction is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }
}
