//! The unit recorded by transaction registries and the write-ahead log.

use serde::{Deserialize, Serialize};

/// One read or write performed by a transaction.
///
/// Reads carry an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Owning transaction id.
    pub txn_id: String,
    /// Key touched.
    pub key: String,
    /// Written value, empty for reads.
    pub value: String,
}

impl Operation {
    /// Creates an operation.
    pub fn new(txn_id: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            txn_id: txn_id.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}
