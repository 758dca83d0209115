//! Multi-version timestamp ordering.

use super::{ConcurrencyProtocol, ConcurrencyStore};
use crate::error::{CoreError, CoreResult};
use crate::types::TxnId;
use std::collections::HashMap;
use tracing::trace;

/// Who may see a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// Committed; visible to every transaction with a later timestamp.
    Global,
    /// Uncommitted; visible only to the owning transaction.
    Private(TxnId),
}

/// One version of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MvccVersion {
    /// The value, `None` for the bootstrap version of a new key.
    pub value: Option<String>,
    /// Timestamp of the writing transaction.
    pub write_timestamp: u64,
    /// Largest timestamp of any transaction that read this version.
    pub read_timestamp: u64,
    /// Who may see the version.
    pub visibility: Visibility,
    /// Whether the writing replica was primary.
    pub is_primary: bool,
}

impl MvccVersion {
    fn bootstrap() -> Self {
        Self {
            value: None,
            write_timestamp: 0,
            read_timestamp: 0,
            visibility: Visibility::Global,
            is_primary: false,
        }
    }

    fn is_global(&self) -> bool {
        self.visibility == Visibility::Global
    }

    fn is_owned_by(&self, txn: &TxnId) -> bool {
        matches!(&self.visibility, Visibility::Private(owner) if owner == txn)
    }
}

/// Multi-version store ordered by transaction timestamps.
///
/// Each key has a chain of versions, newest write timestamp first, that
/// always ends in a bootstrap version with write timestamp 0. A transaction
/// with timestamp `ts` reads its own private version if it has one, else
/// the newest global version written at or before `ts`. Writes that would
/// hide a version already read by a younger transaction are refused, and
/// the refusal is remembered so the transaction cannot prepare that key.
#[derive(Debug, Default)]
pub struct MvccStore {
    chains: HashMap<String, Vec<MvccVersion>>,
    // key -> txn -> read timestamp that refused its write
    refused: HashMap<String, HashMap<TxnId, u64>>,
}

impl MvccStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The version chain of `key`, newest first.
    #[must_use]
    pub fn versions(&self, key: &str) -> Option<&[MvccVersion]> {
        self.chains.get(key).map(Vec::as_slice)
    }

    fn timestamp(txn: &TxnId) -> CoreResult<u64> {
        txn.timestamp().ok_or_else(|| CoreError::InvalidTxnId {
            txn_id: txn.to_string(),
        })
    }

    fn chain(&mut self, key: &str) -> &mut Vec<MvccVersion> {
        self.chains
            .entry(key.to_string())
            .or_insert_with(|| vec![MvccVersion::bootstrap()])
    }

    fn existing(&mut self, key: &str) -> CoreResult<&mut Vec<MvccVersion>> {
        self.chains
            .get_mut(key)
            .ok_or_else(|| CoreError::key_not_found(key))
    }

    fn forget_refusal(&mut self, txn: &TxnId, key: &str) {
        if let Some(txns) = self.refused.get_mut(key) {
            txns.remove(txn);
            if txns.is_empty() {
                self.refused.remove(key);
            }
        }
    }
}

/// Index of the newest global version written at or before `ts`. The
/// bootstrap version guarantees a match.
fn visible_global(chain: &[MvccVersion], ts: u64) -> Option<usize> {
    chain
        .iter()
        .position(|v| v.is_global() && v.write_timestamp <= ts)
}

impl ConcurrencyStore for MvccStore {
    fn protocol(&self) -> ConcurrencyProtocol {
        ConcurrencyProtocol::Mvcc
    }

    fn get(&mut self, txn: &TxnId, key: &str) -> CoreResult<String> {
        let ts = Self::timestamp(txn)?;
        let chain = self.chain(key);
        let index = chain
            .iter()
            .position(|v| v.is_owned_by(txn))
            .or_else(|| visible_global(chain, ts))
            .ok_or_else(|| CoreError::key_not_found(key))?;

        let version = &mut chain[index];
        version.read_timestamp = version.read_timestamp.max(ts);
        version
            .value
            .clone()
            .ok_or_else(|| CoreError::key_not_found(key))
    }

    fn put(&mut self, txn: &TxnId, key: &str, value: &str, is_primary: bool) -> CoreResult<()> {
        if !is_primary {
            return Err(CoreError::NotPrimary {
                key: key.to_string(),
            });
        }
        let ts = Self::timestamp(txn)?;
        let chain = self.chain(key);

        if let Some(own) = chain.iter_mut().find(|v| v.is_owned_by(txn)) {
            own.value = Some(value.to_string());
            return Ok(());
        }

        let original = visible_global(chain, ts).ok_or_else(|| CoreError::key_not_found(key))?;
        let read_timestamp = chain[original].read_timestamp;
        if read_timestamp > ts {
            trace!(key, %txn, read_timestamp, "write refused, version already read");
            self.refused
                .entry(key.to_string())
                .or_default()
                .insert(txn.clone(), read_timestamp);
            return Err(CoreError::VersionConflict {
                key: key.to_string(),
                txn_id: txn.to_string(),
                read_timestamp,
            });
        }

        let at = chain
            .iter()
            .position(|v| v.write_timestamp <= ts)
            .unwrap_or(chain.len());
        chain.insert(
            at,
            MvccVersion {
                value: Some(value.to_string()),
                write_timestamp: ts,
                read_timestamp: ts,
                visibility: Visibility::Private(txn.clone()),
                is_primary,
            },
        );
        Ok(())
    }

    fn prepare(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.existing(key)?;
        match self.refused.get(key).and_then(|txns| txns.get(txn)) {
            Some(&read_timestamp) => Err(CoreError::VersionConflict {
                key: key.to_string(),
                txn_id: txn.to_string(),
                read_timestamp,
            }),
            None => Ok(()),
        }
    }

    fn commit(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.forget_refusal(txn, key);
        let chain = self.existing(key)?;
        if let Some(own) = chain.iter_mut().find(|v| v.is_owned_by(txn)) {
            own.visibility = Visibility::Global;
        }
        Ok(())
    }

    fn abort(&mut self, txn: &TxnId, key: &str) -> CoreResult<()> {
        self.forget_refusal(txn, key);
        let chain = self.existing(key)?;
        chain.retain(|v| !v.is_owned_by(txn));
        Ok(())
    }

    fn is_primary(&mut self, key: &str) -> CoreResult<bool> {
        self.chains
            .get(key)
            .and_then(|chain| chain.iter().find(|v| v.value.is_some()))
            .map(|v| v.is_primary)
            .ok_or_else(|| CoreError::key_not_found(key))
    }

    fn committed_value(&self, key: &str) -> Option<String> {
        self.chains
            .get(key)?
            .iter()
            .find(|v| v.is_global())
            .and_then(|v| v.value.clone())
    }

    fn shadow_value(&self, key: &str) -> Option<String> {
        self.chains
            .get(key)?
            .iter()
            .find(|v| !v.is_global())
            .and_then(|v| v.value.clone())
    }

    fn contains(&self, key: &str) -> bool {
        self.committed_value(key).is_some()
    }

    fn remove(&mut self, key: &str) -> bool {
        self.refused.remove(key);
        self.chains.remove(key).is_some()
    }

    fn len(&self) -> usize {
        self.chains
            .keys()
            .filter(|key| self.contains(key))
            .count()
    }
}
