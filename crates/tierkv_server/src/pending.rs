//! Tables of requests waiting on another message.
//!
//! A [`PendingTable`] is an arena: every record gets a [`PendingId`] that
//! stays valid until the record is removed, and the by-key index holds ids
//! rather than positions, so removing one record never disturbs another.
//! The record itself says what kind of request it is.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tierkv_protocol::{Address, Tier, TxnRequest, TxnResponse};

/// Stable id of a pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingId(u64);

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A record in a [`PendingTable`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry<T> {
    /// Key the record waits on.
    pub key: String,
    /// The parked state.
    pub value: T,
}

/// Arena of pending records with a by-key index.
#[derive(Debug, Clone)]
pub struct PendingTable<T> {
    next_id: u64,
    entries: BTreeMap<PendingId, PendingEntry<T>>,
    by_key: HashMap<String, BTreeSet<PendingId>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: BTreeMap::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<T> PendingTable<T> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key` and returns its id.
    pub fn insert(&mut self, key: impl Into<String>, value: T) -> PendingId {
        let id = PendingId(self.next_id);
        self.next_id += 1;

        let key = key.into();
        self.by_key.entry(key.clone()).or_default().insert(id);
        self.entries.insert(id, PendingEntry { key, value });
        id
    }

    /// Returns the record with `id`.
    #[must_use]
    pub fn get(&self, id: PendingId) -> Option<&PendingEntry<T>> {
        self.entries.get(&id)
    }

    /// Removes the record with `id`.
    pub fn remove(&mut self, id: PendingId) -> Option<PendingEntry<T>> {
        let entry = self.entries.remove(&id)?;
        if let Some(ids) = self.by_key.get_mut(&entry.key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_key.remove(&entry.key);
            }
        }
        Some(entry)
    }

    /// Ids waiting on `key`, oldest first.
    #[must_use]
    pub fn ids_for_key(&self, key: &str) -> Vec<PendingId> {
        self.by_key
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Removes and returns every record waiting on `key`, oldest first.
    pub fn take_key(&mut self, key: &str) -> Vec<PendingEntry<T>> {
        self.ids_for_key(key)
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    /// Returns whether anything waits on `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A request waiting for the replication record of its key.
#[derive(Debug, Clone, PartialEq)]
pub enum Parked {
    /// An inbound request not yet checked for ownership.
    ///
    /// `redriven` is set when the lookup was issued because this thread did
    /// not own the key; a second miss is then answered WRONG_THREAD.
    Inbound {
        /// The single-tuple request.
        request: TxnRequest,
        /// Whether ownership already failed once.
        redriven: bool,
    },

    /// A TXN-tier GET or PUT already recorded in the registry, waiting to
    /// be forwarded to its storage owner.
    ForwardToStorage {
        /// The client request.
        request: TxnRequest,
    },

    /// A storage-tier prepare or commit applied locally, waiting for the
    /// log owners of its key.
    LogDurability {
        /// The coordinator request.
        request: TxnRequest,
        /// The reply held until the log acknowledges.
        response: TxnResponse,
    },

    /// A ROUTING-tier address lookup.
    Address {
        /// Id of the lookup request.
        request_id: String,
        /// Where to send the answer.
        response_address: Address,
        /// Tier family the client asked about.
        tier: Tier,
    },
}

/// A request waiting for a downstream reply, keyed by the request id of the
/// downstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum InFlight {
    /// A client GET or PUT forwarded by the TXN tier to storage.
    Client {
        /// The client request.
        request: TxnRequest,
    },

    /// A storage-tier reply held until the log acknowledges.
    Durability {
        /// Where the held reply goes.
        response_address: Address,
        /// The held reply.
        response: TxnResponse,
    },
}
