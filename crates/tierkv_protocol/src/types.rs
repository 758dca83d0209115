//! Enumerations shared by every tier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A transport endpoint, e.g. `tcp://10.0.0.4:6200`.
pub type Address = String;

/// A tier of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    /// Transaction coordinators.
    Txn,
    /// In-memory storage.
    Memory,
    /// Disk-backed storage.
    Disk,
    /// Write-ahead log.
    Log,
    /// Key-address lookup service.
    Routing,
}

impl Tier {
    /// Every server tier that can own keys, in ring order.
    pub const SERVER_TIERS: [Tier; 4] = [Tier::Txn, Tier::Memory, Tier::Disk, Tier::Log];

    /// Storage tiers in lookup priority order.
    pub const STORAGE_TIERS: [Tier; 2] = [Tier::Memory, Tier::Disk];

    /// Returns true for MEMORY and DISK.
    #[must_use]
    pub fn is_storage(self) -> bool {
        matches!(self, Tier::Memory | Tier::Disk)
    }

    /// Returns the upper-case name used in logs and configuration.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Tier::Txn => "TXN",
            Tier::Memory => "MEMORY",
            Tier::Disk => "DISK",
            Tier::Log => "LOG",
            Tier::Routing => "ROUTING",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The kind of a transaction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    /// Create a transaction.
    StartTxn,
    /// Read a key inside a transaction.
    TxnGet,
    /// Write a key inside a transaction.
    TxnPut,
    /// First phase of commit for one key.
    PrepareTxn,
    /// Commit a transaction (client) or one key (storage).
    CommitTxn,
    /// Roll back one key of an aborted transaction.
    AbortTxn,
}

impl RequestType {
    /// Returns the command name as typed at the CLI.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            RequestType::StartTxn => "START_TXN",
            RequestType::TxnGet => "TXN_GET",
            RequestType::TxnPut => "TXN_PUT",
            RequestType::PrepareTxn => "PREPARE_TXN",
            RequestType::CommitTxn => "COMMIT_TXN",
            RequestType::AbortTxn => "ABORT_TXN",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-tuple and per-response outcome carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Success.
    #[default]
    NoError,
    /// The key does not exist.
    KeyDne,
    /// The transaction does not exist.
    TxnDne,
    /// The log position does not exist.
    LogDne,
    /// The receiver does not own the key; refresh routing and retry.
    WrongThread,
    /// The operation was rejected (lock or version conflict, not primary).
    FailedOp,
    /// No server has joined the needed tier.
    NoServers,
    /// No response arrived in time (synthesized by the client).
    Timeout,
}

impl ErrorCode {
    /// Returns true for [`ErrorCode::NoError`].
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == ErrorCode::NoError
    }

    /// Returns the upper-case wire name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::KeyDne => "KEY_DNE",
            ErrorCode::TxnDne => "TXN_DNE",
            ErrorCode::LogDne => "LOG_DNE",
            ErrorCode::WrongThread => "WRONG_THREAD",
            ErrorCode::FailedOp => "FAILED_OP",
            ErrorCode::NoServers => "NO_SERVERS",
            ErrorCode::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
