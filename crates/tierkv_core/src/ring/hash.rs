//! Global (node) and local (thread) hash rings.

use super::thread::ServerThread;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Ring positions per node or thread.
pub const VIRTUAL_THREAD_COUNT: u32 = 3000;

/// Position of `s` on a ring: the first eight bytes of its SHA-256 digest.
#[must_use]
pub fn ring_position(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Ring of the nodes of one tier.
///
/// Each node is entered at [`VIRTUAL_THREAD_COUNT`] positions derived from
/// its private address and join count, and is represented by its thread 0.
#[derive(Debug, Clone, Default)]
pub struct GlobalHashRing {
    positions: BTreeMap<u64, ServerThread>,
    nodes: BTreeMap<String, ServerThread>,
}

impl GlobalHashRing {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. Returns false if a node with this private address is
    /// already present.
    pub fn insert(&mut self, public_ip: &str, private_ip: &str, join_count: u32) -> bool {
        if self.nodes.contains_key(private_ip) {
            return false;
        }
        let thread = ServerThread::new(public_ip, private_ip, 0);
        for vnode in 0..VIRTUAL_THREAD_COUNT {
            let position = ring_position(&format!("{private_ip}:{join_count}_{vnode}"));
            self.positions.insert(position, thread.clone());
        }
        self.nodes.insert(private_ip.to_string(), thread);
        true
    }

    /// Removes a node. Returns false if it was not present.
    pub fn remove(&mut self, private_ip: &str) -> bool {
        if self.nodes.remove(private_ip).is_none() {
            return false;
        }
        self.positions
            .retain(|_, thread| thread.private_ip() != private_ip);
        true
    }

    /// Returns whether the node is on the ring.
    #[must_use]
    pub fn contains(&self, private_ip: &str) -> bool {
        self.nodes.contains_key(private_ip)
    }

    /// Number of distinct nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no node has joined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Thread 0 of every node, ordered by private address.
    pub fn nodes(&self) -> impl Iterator<Item = &ServerThread> {
        self.nodes.values()
    }

    /// The first `replication` distinct nodes clockwise from `key`,
    /// wrapping around. Fewer are returned when the ring is smaller.
    #[must_use]
    pub fn responsible(&self, key: &str, replication: u32) -> Vec<ServerThread> {
        let wanted = (replication as usize).min(self.nodes.len());
        let mut seen = HashSet::with_capacity(wanted);
        let mut owners = Vec::with_capacity(wanted);
        if wanted == 0 {
            return owners;
        }

        let start = ring_position(key);
        for thread in self
            .positions
            .range(start..)
            .chain(self.positions.range(..start))
            .map(|(_, thread)| thread)
        {
            if seen.insert(thread.private_ip()) {
                owners.push(thread.clone());
                if owners.len() == wanted {
                    break;
                }
            }
        }
        owners
    }
}

/// Ring of the thread ids of one tier's nodes.
#[derive(Debug, Clone, Default)]
pub struct LocalHashRing {
    positions: BTreeMap<u64, u32>,
    tids: BTreeSet<u32>,
}

impl LocalHashRing {
    /// Creates an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ring holding threads `0..thread_count`.
    #[must_use]
    pub fn with_threads(thread_count: u32) -> Self {
        let mut ring = Self::new();
        for tid in 0..thread_count {
            ring.insert(tid);
        }
        ring
    }

    /// Adds a thread id. Returns false if already present.
    pub fn insert(&mut self, tid: u32) -> bool {
        if !self.tids.insert(tid) {
            return false;
        }
        for vnode in 0..VIRTUAL_THREAD_COUNT {
            self.positions
                .insert(ring_position(&format!("{tid}_{vnode}")), tid);
        }
        true
    }

    /// Removes a thread id. Returns false if it was not present.
    pub fn remove(&mut self, tid: u32) -> bool {
        if !self.tids.remove(&tid) {
            return false;
        }
        self.positions.retain(|_, t| *t != tid);
        true
    }

    /// Number of distinct threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tids.len()
    }

    /// Returns true if the ring has no threads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tids.is_empty()
    }

    /// The first `replication` distinct tids clockwise from `key`.
    #[must_use]
    pub fn responsible(&self, key: &str, replication: u32) -> Vec<u32> {
        let wanted = (replication as usize).min(self.tids.len());
        let mut owners = Vec::with_capacity(wanted);
        if wanted == 0 {
            return owners;
        }

        let start = ring_position(key);
        for &tid in self
            .positions
            .range(start..)
            .chain(self.positions.range(..start))
            .map(|(_, tid)| tid)
        {
            if !owners.contains(&tid) {
                owners.push(tid);
                if owners.len() == wanted {
                    break;
                }
            }
        }
        owners
    }
}
