//! Transaction identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A transaction id of the form `<client_id>-<random>:<timestamp>`.
///
/// The timestamp (milliseconds) orders transactions for MVCC; the client id
/// prefix decides which TXN-tier thread coordinates the transaction. Client
/// ids therefore must not contain `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(String);

impl TxnId {
    /// Builds an id from its parts.
    #[must_use]
    pub fn new(client_id: &str, disambiguator: u32, timestamp: u64) -> Self {
        Self(format!("{client_id}-{disambiguator}:{timestamp}"))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the transaction timestamp, the digits after the last `:`.
    #[must_use]
    pub fn timestamp(&self) -> Option<u64> {
        self.0.rsplit_once(':')?.1.parse().ok()
    }

    /// Returns the client id, everything before the first `-`.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.0.split_once('-').map_or(self.0.as_str(), |(client, _)| client)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TxnId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TxnId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for TxnId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
