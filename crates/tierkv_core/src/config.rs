//! Cluster configuration.
//!
//! Every worker receives the same [`ClusterConfig`] at construction. All
//! fields have defaults, so a YAML file only needs the values it changes:
//!
//! ```yaml
//! threads: { memory: 4 }
//! nodes: { disk: 1 }
//! protocol: mvcc
//! ```

use crate::error::{CoreError, CoreResult};
use crate::store::ConcurrencyProtocol;
use serde::Deserialize;
use std::path::PathBuf;
use tierkv_protocol::Tier;

/// A count per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TierCounts {
    /// TXN tier.
    pub txn: u32,
    /// MEMORY tier.
    pub memory: u32,
    /// DISK tier.
    pub disk: u32,
    /// LOG tier.
    pub log: u32,
    /// ROUTING tier.
    pub routing: u32,
}

impl TierCounts {
    /// Creates counts with the same value for every tier.
    #[must_use]
    pub const fn uniform(n: u32) -> Self {
        Self {
            txn: n,
            memory: n,
            disk: n,
            log: n,
            routing: n,
        }
    }

    /// Returns the count for `tier`.
    #[must_use]
    pub const fn get(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Txn => self.txn,
            Tier::Memory => self.memory,
            Tier::Disk => self.disk,
            Tier::Log => self.log,
            Tier::Routing => self.routing,
        }
    }

    /// Sets the count for `tier`.
    pub fn set(&mut self, tier: Tier, n: u32) {
        match tier {
            Tier::Txn => self.txn = n,
            Tier::Memory => self.memory = n,
            Tier::Disk => self.disk = n,
            Tier::Log => self.log = n,
            Tier::Routing => self.routing = n,
        }
    }
}

impl Default for TierCounts {
    fn default() -> Self {
        Self::uniform(1)
    }
}

/// Replication factors assigned to keys with no stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplicationDefaults {
    /// Node-level replication for TXN-tier keys.
    pub txn: u32,
    /// Node-level replication for MEMORY-tier keys.
    pub memory: u32,
    /// Node-level replication for DISK-tier keys.
    pub disk: u32,
    /// Node-level replication for LOG-tier records.
    pub log: u32,
    /// Thread-level replication for every tier.
    pub local: u32,
    /// Lower bound a replication change may not go below.
    pub minimum: u32,
}

impl ReplicationDefaults {
    /// Returns the default global factor for `tier`.
    #[must_use]
    pub const fn global(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Txn => self.txn,
            Tier::Memory => self.memory,
            Tier::Disk => self.disk,
            Tier::Log => self.log,
            Tier::Routing => 0,
        }
    }
}

impl Default for ReplicationDefaults {
    fn default() -> Self {
        Self {
            txn: 1,
            memory: 1,
            disk: 1,
            log: 1,
            local: 1,
            minimum: 1,
        }
    }
}

/// Configuration shared by every worker of a cluster.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Worker threads per node, per tier.
    pub threads: TierCounts,

    /// Nodes per tier started by a local cluster.
    pub nodes: TierCounts,

    /// Default replication factors.
    pub replication: ReplicationDefaults,

    /// Concurrency-control protocol of the storage tiers.
    pub protocol: ConcurrencyProtocol,

    /// Root directory of DISK-tier spill files.
    pub disk_root: PathBuf,

    /// Directory for LOG-tier journals. `None` keeps the log in memory.
    pub log_dir: Option<PathBuf>,

    /// How many WRONG_THREAD answers a replication lookup may receive before
    /// the requests waiting on it are failed.
    pub max_replication_retries: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            threads: TierCounts::default(),
            nodes: TierCounts {
                disk: 0,
                ..TierCounts::default()
            },
            replication: ReplicationDefaults::default(),
            protocol: ConcurrencyProtocol::TwoPhaseLock,
            disk_root: PathBuf::from("./tierkv-disk"),
            log_dir: None,
            max_replication_retries: 8,
        }
    }
}

impl ClusterConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads per node of `tier`.
    #[must_use]
    pub fn threads(mut self, tier: Tier, n: u32) -> Self {
        self.threads.set(tier, n);
        self
    }

    /// Sets the number of nodes of `tier`.
    #[must_use]
    pub fn nodes(mut self, tier: Tier, n: u32) -> Self {
        self.nodes.set(tier, n);
        self
    }

    /// Sets the concurrency-control protocol.
    #[must_use]
    pub const fn protocol(mut self, protocol: ConcurrencyProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the spill root of the DISK tier.
    #[must_use]
    pub fn disk_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_root = path.into();
        self
    }

    /// Journals the LOG tier under `path`.
    #[must_use]
    pub fn log_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(path.into());
        self
    }

    /// Sets the WRONG_THREAD retry budget of replication lookups.
    #[must_use]
    pub const fn max_replication_retries(mut self, n: u32) -> Self {
        self.max_replication_retries = n;
        self
    }

    /// Sets the default thread-level replication factor.
    #[must_use]
    pub const fn local_replication(mut self, n: u32) -> Self {
        self.replication.local = n;
        self
    }

    /// Returns the protocol used by a store on `tier`.
    ///
    /// The DISK tier pages locked keys to disk whenever a lock-based protocol
    /// is configured; MVCC and single-lock stores stay in memory.
    #[must_use]
    pub fn protocol_for(&self, tier: Tier) -> ConcurrencyProtocol {
        match (tier, self.protocol) {
            (Tier::Disk, ConcurrencyProtocol::TwoPhaseLock) => {
                ConcurrencyProtocol::DiskTwoPhaseLock
            }
            (_, protocol) => protocol,
        }
    }

    /// Checks the configuration for values no cluster can run with.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        for tier in Tier::SERVER_TIERS.into_iter().chain([Tier::Routing]) {
            if self.nodes.get(tier) > 0 && self.threads.get(tier) == 0 {
                return Err(CoreError::invalid_config(format!(
                    "{tier} has nodes but zero threads per node"
                )));
            }
        }
        if self.nodes.txn == 0 {
            return Err(CoreError::invalid_config("at least one TXN node is required"));
        }
        if self.nodes.routing == 0 {
            return Err(CoreError::invalid_config(
                "at least one ROUTING node is required",
            ));
        }
        if self.replication.local == 0 {
            return Err(CoreError::invalid_config(
                "local replication must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.threads, TierCounts::uniform(1));
        assert_eq!(config.nodes.disk, 0);
        assert_eq!(config.replication.global(Tier::Memory), 1);
        assert_eq!(config.replication.global(Tier::Routing), 0);
        assert_eq!(config.protocol, ConcurrencyProtocol::TwoPhaseLock);
        assert_eq!(config.max_replication_retries, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = ClusterConfig::new()
            .threads(Tier::Memory, 4)
            .nodes(Tier::Disk, 2)
            .protocol(ConcurrencyProtocol::Mvcc)
            .disk_root("/tmp/spill")
            .log_dir("/tmp/log")
            .max_replication_retries(2)
            .local_replication(2);

        assert_eq!(config.threads.get(Tier::Memory), 4);
        assert_eq!(config.nodes.get(Tier::Disk), 2);
        assert_eq!(config.disk_root, PathBuf::from("/tmp/spill"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/log")));
        assert_eq!(config.max_replication_retries, 2);
        assert_eq!(config.replication.local, 2);
    }

    #[test]
    fn disk_tier_pages_lock_based_stores() {
        let config = ClusterConfig::new();
        assert_eq!(
            config.protocol_for(Tier::Disk),
            ConcurrencyProtocol::DiskTwoPhaseLock
        );
        assert_eq!(
            config.protocol_for(Tier::Memory),
            ConcurrencyProtocol::TwoPhaseLock
        );

        let mvcc = config.protocol(ConcurrencyProtocol::Mvcc);
        assert_eq!(mvcc.protocol_for(Tier::Disk), ConcurrencyProtocol::Mvcc);
    }

    #[test]
    fn validate_rejects_unusable_layouts() {
        assert!(ClusterConfig::new().nodes(Tier::Txn, 0).validate().is_err());
        assert!(ClusterConfig::new().nodes(Tier::Routing, 0).validate().is_err());
        assert!(ClusterConfig::new()
            .threads(Tier::Memory, 0)
            .validate()
            .is_err());
        assert!(ClusterConfig::new().local_replication(0).validate().is_err());
    }
}
