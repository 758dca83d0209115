//! Worker thread identity and addressing.

use serde::{Deserialize, Serialize};
use std::fmt;
use tierkv_protocol::Address;

const TXN_REQUEST_PORT: u32 = 6100;
const STORAGE_REQUEST_PORT: u32 = 6200;
const LOG_REQUEST_PORT: u32 = 6300;
const REQUEST_RESPONSE_PORT: u32 = 6400;
const REPLICATION_RESPONSE_PORT: u32 = 6500;
const REPLICATION_CHANGE_PORT: u32 = 6600;
const KEY_ADDRESS_PORT: u32 = 6700;
const MEMBERSHIP_PORT: u32 = 6800;

/// One worker thread of one node.
///
/// Each channel a thread listens on is a fixed base port plus its tid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerThread {
    public_ip: String,
    private_ip: String,
    tid: u32,
}

impl ServerThread {
    /// Creates a thread identity.
    pub fn new(public_ip: impl Into<String>, private_ip: impl Into<String>, tid: u32) -> Self {
        Self {
            public_ip: public_ip.into(),
            private_ip: private_ip.into(),
            tid,
        }
    }

    /// Public address of the node.
    #[must_use]
    pub fn public_ip(&self) -> &str {
        &self.public_ip
    }

    /// Private address of the node.
    #[must_use]
    pub fn private_ip(&self) -> &str {
        &self.private_ip
    }

    /// Thread id within the node.
    #[must_use]
    pub const fn tid(&self) -> u32 {
        self.tid
    }

    /// Returns the same node's thread `tid`.
    #[must_use]
    pub fn with_tid(&self, tid: u32) -> Self {
        Self::new(self.public_ip.clone(), self.private_ip.clone(), tid)
    }

    fn address(&self, base_port: u32) -> Address {
        format!("tcp://{}:{}", self.private_ip, base_port + self.tid)
    }

    /// Where clients send transaction requests (TXN tier).
    #[must_use]
    pub fn txn_request_address(&self) -> Address {
        self.address(TXN_REQUEST_PORT)
    }

    /// Where TXN workers send storage requests (MEMORY and DISK tiers).
    #[must_use]
    pub fn storage_request_address(&self) -> Address {
        self.address(STORAGE_REQUEST_PORT)
    }

    /// Where storage workers send log requests (LOG tier).
    #[must_use]
    pub fn log_request_address(&self) -> Address {
        self.address(LOG_REQUEST_PORT)
    }

    /// Where downstream tiers answer this thread's requests.
    #[must_use]
    pub fn request_response_address(&self) -> Address {
        self.address(REQUEST_RESPONSE_PORT)
    }

    /// Where replication record lookups are answered.
    #[must_use]
    pub fn replication_response_address(&self) -> Address {
        self.address(REPLICATION_RESPONSE_PORT)
    }

    /// Where replication changes are pushed.
    #[must_use]
    pub fn replication_change_address(&self) -> Address {
        self.address(REPLICATION_CHANGE_PORT)
    }

    /// Where clients send key-address lookups (ROUTING tier).
    #[must_use]
    pub fn key_address_request_address(&self) -> Address {
        self.address(KEY_ADDRESS_PORT)
    }

    /// Where membership changes are announced.
    #[must_use]
    pub fn membership_address(&self) -> Address {
        self.address(MEMBERSHIP_PORT)
    }
}

impl fmt::Display for ServerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.private_ip, self.tid)
    }
}
