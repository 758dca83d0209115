//! Per-tier ring sets and ownership queries.

use super::hash::{GlobalHashRing, LocalHashRing};
use super::thread::ServerThread;
use crate::replication::KeyReplication;
use std::collections::HashMap;
use tierkv_protocol::Tier;
use tracing::debug;

/// Global and local replication of metadata keys.
pub const METADATA_REPLICATION: u32 = 1;

/// The global and local rings of every tier, as seen by one worker.
///
/// All nodes of a tier run the same number of threads, so a tier has a
/// single local ring.
#[derive(Debug, Clone, Default)]
pub struct HashRings {
    global: HashMap<Tier, GlobalHashRing>,
    local: HashMap<Tier, LocalHashRing>,
}

impl HashRings {
    /// Creates empty rings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with `thread_count` threads to `tier`. Returns false if
    /// the node was already present.
    pub fn insert_node(
        &mut self,
        tier: Tier,
        public_ip: &str,
        private_ip: &str,
        join_count: u32,
        thread_count: u32,
    ) -> bool {
        let local = self.local.entry(tier).or_default();
        for tid in 0..thread_count {
            local.insert(tid);
        }
        let inserted = self
            .global
            .entry(tier)
            .or_default()
            .insert(public_ip, private_ip, join_count);
        if inserted {
            debug!(%tier, private_ip, join_count, "node joined ring");
        }
        inserted
    }

    /// Removes a node from `tier`. Returns false if it was not present.
    pub fn remove_node(&mut self, tier: Tier, private_ip: &str) -> bool {
        let removed = self
            .global
            .get_mut(&tier)
            .is_some_and(|ring| ring.remove(private_ip));
        if removed {
            debug!(%tier, private_ip, "node left ring");
        }
        removed
    }

    /// The node ring of `tier`.
    #[must_use]
    pub fn global(&self, tier: Tier) -> Option<&GlobalHashRing> {
        self.global.get(&tier)
    }

    /// The thread ring of `tier`.
    #[must_use]
    pub fn local(&self, tier: Tier) -> Option<&LocalHashRing> {
        self.local.get(&tier)
    }

    /// Number of nodes in `tier`.
    #[must_use]
    pub fn node_count(&self, tier: Tier) -> usize {
        self.global.get(&tier).map_or(0, GlobalHashRing::len)
    }

    /// Number of nodes across every key-owning tier.
    #[must_use]
    pub fn server_count(&self) -> usize {
        Tier::SERVER_TIERS
            .iter()
            .map(|tier| self.node_count(*tier))
            .sum()
    }

    /// Nodes owning `key` in `tier`, primary first.
    #[must_use]
    pub fn responsible_global(&self, tier: Tier, key: &str, replication: u32) -> Vec<ServerThread> {
        self.global
            .get(&tier)
            .map(|ring| ring.responsible(key, replication))
            .unwrap_or_default()
    }

    /// Thread ids owning `key` on each node of `tier`.
    #[must_use]
    pub fn responsible_local(&self, tier: Tier, key: &str, replication: u32) -> Vec<u32> {
        self.local
            .get(&tier)
            .map(|ring| ring.responsible(key, replication))
            .unwrap_or_default()
    }

    /// Every thread owning `key` in `tier`: each responsible node crossed
    /// with each responsible tid.
    #[must_use]
    pub fn responsible_threads(
        &self,
        tier: Tier,
        key: &str,
        replication: &KeyReplication,
    ) -> Vec<ServerThread> {
        self.cross(
            tier,
            key,
            replication.global(tier),
            replication.local(tier),
        )
    }

    /// Threads storing the metadata key `metadata_key` in `tier`.
    #[must_use]
    pub fn metadata_threads(&self, tier: Tier, metadata_key: &str) -> Vec<ServerThread> {
        self.cross(tier, metadata_key, METADATA_REPLICATION, METADATA_REPLICATION)
    }

    fn cross(&self, tier: Tier, key: &str, global: u32, local: u32) -> Vec<ServerThread> {
        let tids = self.responsible_local(tier, key, local);
        self.responsible_global(tier, key, global)
            .iter()
            .flat_map(|node| tids.iter().map(move |tid| node.with_tid(*tid)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rings() -> HashRings {
        let mut rings = HashRings::new();
        rings.insert_node(Tier::Memory, "54.0.0.1", "10.0.0.1", 0, 4);
        rings.insert_node(Tier::Memory, "54.0.0.2", "10.0.0.2", 0, 4);
        rings.insert_node(Tier::Log, "54.0.1.1", "10.0.1.1", 0, 1);
        rings
    }

    #[test]
    fn counts() {
        let mut rings = rings();
        assert_eq!(rings.node_count(Tier::Memory), 2);
        assert_eq!(rings.node_count(Tier::Disk), 0);
        assert_eq!(rings.server_count(), 3);
        assert!(!rings.insert_node(Tier::Memory, "54.0.0.1", "10.0.0.1", 0, 4));

        assert!(rings.remove_node(Tier::Memory, "10.0.0.2"));
        assert!(!rings.remove_node(Tier::Disk, "10.0.0.2"));
        assert_eq!(rings.server_count(), 2);
    }

    #[test]
    fn threads_cross_nodes_and_tids() {
        let rings = rings();
        let mut replication = KeyReplication::default();
        replication.set(Tier::Memory, 2, 2);

        let threads = rings.responsible_threads(Tier::Memory, "user:1", &replication);
        assert_eq!(threads.len(), 4);
        assert_eq!(threads[0].private_ip(), threads[1].private_ip());
        assert_ne!(threads[0].private_ip(), threads[2].private_ip());
        assert_eq!(threads[0].tid(), threads[2].tid());
    }

    #[test]
    fn zero_replication_owns_nothing() {
        let rings = rings();
        let replication = KeyReplication::default();
        assert!(rings
            .responsible_threads(Tier::Memory, "k", &replication)
            .is_empty());
        assert!(rings
            .responsible_threads(Tier::Disk, "k", &replication)
            .is_empty());
    }

    #[test]
    fn metadata_has_exactly_one_owner() {
        let rings = rings();
        let owners = rings.metadata_threads(Tier::Memory, "__tierkv_metadata__|replication|k");
        assert_eq!(owners.len(), 1);
        assert!(rings.metadata_threads(Tier::Disk, "m").is_empty());
    }
}
