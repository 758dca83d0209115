//! Key ownership as seen by one worker.
//!
//! The [`Router`] combines the worker's ring view with its cached
//! replication records. When a key's record is unknown it sends a lookup
//! for the key's metadata record and reports [`Resolution::Pending`]; the
//! caller parks its request until the replication response arrives.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use tierkv_core::{ClusterConfig, HashRings, ReplicationDefaults, ReplicationMap, ServerThread};
use tierkv_protocol::{
    is_metadata, replication_key, Message, RequestType, Tier, Transport, TxnRequest,
};
use tracing::{debug, trace, warn};

/// Outcome of an ownership query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The owning threads, primary first. Empty when no node can hold the
    /// key.
    Resolved(Vec<ServerThread>),
    /// The replication record is being fetched.
    Pending,
}

/// Ring view, replication cache and lookup bookkeeping of one worker.
#[derive(Debug)]
pub struct Router {
    rings: HashRings,
    replication: ReplicationMap,
    defaults: ReplicationDefaults,
    rng: StdRng,
    /// Outstanding lookups and the WRONG_THREAD answers each has received.
    lookups: HashMap<String, u32>,
    max_retries: u32,
}

impl Router {
    /// Creates a router over `rings`.
    pub fn new(rings: HashRings, config: &ClusterConfig, seed: u64) -> Self {
        Self {
            rings,
            replication: ReplicationMap::new(),
            defaults: config.replication,
            rng: StdRng::seed_from_u64(seed),
            lookups: HashMap::new(),
            max_retries: config.max_replication_retries,
        }
    }

    /// The ring view.
    #[must_use]
    pub fn rings(&self) -> &HashRings {
        &self.rings
    }

    /// Mutable ring view, for membership changes.
    pub fn rings_mut(&mut self) -> &mut HashRings {
        &mut self.rings
    }

    /// The replication cache.
    #[must_use]
    pub fn replication(&self) -> &ReplicationMap {
        &self.replication
    }

    /// Mutable replication cache.
    pub fn replication_mut(&mut self) -> &mut ReplicationMap {
        &mut self.replication
    }

    /// Installs the default record of `key` for its owning `tier`.
    pub fn init_tier(&mut self, key: &str, tier: Tier) {
        self.replication.init_tier(key, tier, &self.defaults);
    }

    /// First tier of `tiers` that has nodes.
    #[must_use]
    pub fn owning_tier(&self, tiers: &[Tier]) -> Option<Tier> {
        tiers
            .iter()
            .copied()
            .find(|tier| self.rings.node_count(*tier) > 0)
    }

    /// Threads responsible for `key` across `tiers`, in tier order.
    ///
    /// Metadata keys resolve with the fixed metadata replication against
    /// the first tier. Data keys need a cached replication record stating
    /// every requested tier; without one a lookup is sent (at most one per
    /// key at a time) with replies going to `response_address`, and the
    /// result is [`Resolution::Pending`].
    pub fn get_responsible_threads(
        &mut self,
        transport: &dyn Transport,
        response_address: &str,
        key: &str,
        tiers: &[Tier],
    ) -> Resolution {
        if is_metadata(key) {
            let threads = tiers
                .first()
                .map(|tier| self.rings.metadata_threads(*tier, key))
                .unwrap_or_default();
            return Resolution::Resolved(threads);
        }

        if self.replication.is_known(key, tiers) {
            if let Some(replication) = self.replication.get(key) {
                let threads = tiers
                    .iter()
                    .flat_map(|tier| self.rings.responsible_threads(*tier, key, replication))
                    .collect();
                return Resolution::Resolved(threads);
            }
        }

        let Some(tier) = self.owning_tier(tiers) else {
            return Resolution::Resolved(Vec::new());
        };
        if !self.lookups.contains_key(key)
            && !self.issue_replication_factor_request(transport, response_address, key, tier)
        {
            return Resolution::Resolved(Vec::new());
        }
        Resolution::Pending
    }

    /// Asks a metadata owner of `key` in `tier` for the key's replication
    /// record. Returns false if `tier` has no nodes.
    pub fn issue_replication_factor_request(
        &mut self,
        transport: &dyn Transport,
        response_address: &str,
        key: &str,
        tier: Tier,
    ) -> bool {
        let metadata_key = replication_key(key);
        let threads = self.rings.metadata_threads(tier, &metadata_key);
        let Some(target) = threads.choose(&mut self.rng) else {
            warn!(key, %tier, "no metadata owner for replication lookup");
            return false;
        };

        let (request_type, address) = match tier {
            Tier::Txn => (RequestType::StartTxn, target.txn_request_address()),
            Tier::Log => (RequestType::TxnGet, target.log_request_address()),
            _ => (RequestType::TxnGet, target.storage_request_address()),
        };
        let request = TxnRequest::new(request_type, "")
            .with_request_id(metadata_key.clone())
            .with_response_address(response_address)
            .with_tuple(metadata_key, "");

        debug!(key, %tier, target = %target, "replication lookup");
        self.lookups.entry(key.to_string()).or_insert(0);
        send(transport, &address, &Message::TxnRequest(request))
    }

    /// Returns whether a lookup for `key` is outstanding.
    #[must_use]
    pub fn lookup_pending(&self, key: &str) -> bool {
        self.lookups.contains_key(key)
    }

    /// Marks the lookup of `key` as answered.
    pub fn complete_lookup(&mut self, key: &str) {
        self.lookups.remove(key);
    }

    /// Re-sends the lookup of `key` after a WRONG_THREAD answer. Returns
    /// false once the retry budget is spent; the lookup is then dropped.
    pub fn retry_lookup(
        &mut self,
        transport: &dyn Transport,
        response_address: &str,
        key: &str,
        tier: Tier,
    ) -> bool {
        let retries = self.lookups.entry(key.to_string()).or_insert(0);
        *retries += 1;
        if *retries > self.max_retries {
            warn!(key, retries = *retries, "replication lookup retries exhausted");
            self.lookups.remove(key);
            return false;
        }
        trace!(key, retries = *retries, "retrying replication lookup");
        self.issue_replication_factor_request(transport, response_address, key, tier)
    }

    /// Returns whether `thread` is the primary replica of `key` in `tier`:
    /// the first owner in that tier, with no replica in a storage tier above
    /// it.
    #[must_use]
    pub fn is_primary_replica(&self, key: &str, tier: Tier, thread: &ServerThread) -> bool {
        let Some(replication) = self.replication.get(key) else {
            return false;
        };
        if replication.global(tier) == 0 {
            return false;
        }
        let upper_replica = Tier::STORAGE_TIERS
            .iter()
            .take_while(|t| **t != tier)
            .any(|t| replication.global(*t) > 0);
        if tier.is_storage() && upper_replica {
            return false;
        }
        self.rings
            .responsible_threads(tier, key, replication)
            .first()
            == Some(thread)
    }
}

/// Sends `request` to the storage-request address of `thread`.
pub fn issue_storage_request(
    transport: &dyn Transport,
    thread: &ServerThread,
    request: TxnRequest,
) -> bool {
    send(
        transport,
        &thread.storage_request_address(),
        &Message::TxnRequest(request),
    )
}

/// Sends `request` to the log-request address of `thread`.
pub fn issue_log_request(transport: &dyn Transport, thread: &ServerThread, request: TxnRequest) -> bool {
    send(
        transport,
        &thread.log_request_address(),
        &Message::TxnRequest(request),
    )
}

/// Tells the storage owner `thread` to release what `txn_id` holds on
/// `key`. No reply is requested.
pub fn issue_abort_request(
    transport: &dyn Transport,
    thread: &ServerThread,
    txn_id: &str,
    key: &str,
) -> bool {
    let request = TxnRequest::new(RequestType::AbortTxn, txn_id).with_tuple(key, "");
    issue_storage_request(transport, thread, request)
}

/// Fire-and-forget delivery; failures are logged.
pub(crate) fn send(transport: &dyn Transport, address: &str, message: &Message) -> bool {
    match transport.send(address, message) {
        Ok(()) => true,
        Err(e) => {
            warn!(address, error = %e, "send failed");
            false
        }
    }
}
