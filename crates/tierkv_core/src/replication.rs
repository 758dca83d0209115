//! Cached replication factors.
//!
//! A key missing from the [`ReplicationMap`] is unknown: its owners cannot
//! be computed until the replication record has been fetched from the
//! metadata partition (or defaulted when none is stored).

use crate::config::ReplicationDefaults;
use std::collections::HashMap;
use tierkv_protocol::{ReplicationFactor, ReplicationValue, Tier};

/// Global and local replication factors of one key, per tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyReplication {
    global: HashMap<Tier, u32>,
    local: HashMap<Tier, u32>,
}

impl KeyReplication {
    /// Node-level replication in `tier`, 0 when unset.
    #[must_use]
    pub fn global(&self, tier: Tier) -> u32 {
        self.global.get(&tier).copied().unwrap_or(0)
    }

    /// Thread-level replication in `tier`, 0 when unset.
    #[must_use]
    pub fn local(&self, tier: Tier) -> u32 {
        self.local.get(&tier).copied().unwrap_or(0)
    }

    /// Sets both factors for `tier`.
    pub fn set(&mut self, tier: Tier, global: u32, local: u32) {
        self.global.insert(tier, global);
        self.local.insert(tier, local);
    }

    /// Returns whether the record states a replication for `tier`, even 0.
    #[must_use]
    pub fn covers(&self, tier: Tier) -> bool {
        self.global.contains_key(&tier)
    }

    /// Builds the record carried by a [`ReplicationFactor`].
    #[must_use]
    pub fn from_factor(factor: &ReplicationFactor) -> Self {
        let mut replication = Self::default();
        for value in &factor.global {
            replication.global.insert(value.tier, value.value);
        }
        for value in &factor.local {
            replication.local.insert(value.tier, value.value);
        }
        replication
    }

    /// Converts back into a wire record for `key`, tiers in ring order.
    #[must_use]
    pub fn to_factor(&self, key: &str) -> ReplicationFactor {
        let values = |map: &HashMap<Tier, u32>| {
            Tier::SERVER_TIERS
                .iter()
                .filter_map(|tier| {
                    map.get(tier).map(|value| ReplicationValue {
                        tier: *tier,
                        value: *value,
                    })
                })
                .collect()
        };
        ReplicationFactor {
            key: key.to_string(),
            global: values(&self.global),
            local: values(&self.local),
        }
    }
}

/// Replication records known to one worker.
#[derive(Debug, Clone, Default)]
pub struct ReplicationMap {
    keys: HashMap<String, KeyReplication>,
}

impl ReplicationMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record of `key`, if known.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&KeyReplication> {
        self.keys.get(key)
    }

    /// Returns whether `key` has a record.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Returns whether `key` has a record that states every one of `tiers`.
    #[must_use]
    pub fn is_known(&self, key: &str, tiers: &[Tier]) -> bool {
        self.keys
            .get(key)
            .is_some_and(|replication| tiers.iter().all(|tier| replication.covers(*tier)))
    }

    /// Installs the record carried by a replication change.
    pub fn apply(&mut self, factor: &ReplicationFactor) {
        self.keys
            .insert(factor.key.clone(), KeyReplication::from_factor(factor));
    }

    /// Installs a record fetched from the key's metadata owner. Tiers it
    /// does not mention have no replicas.
    pub fn install(&mut self, factor: &ReplicationFactor) {
        let mut replication = KeyReplication::from_factor(factor);
        for tier in Tier::SERVER_TIERS {
            if !replication.covers(tier) {
                replication.set(tier, 0, 0);
            }
        }
        self.keys.insert(factor.key.clone(), replication);
    }

    /// Installs the default record of a key owned by `tier`.
    ///
    /// `tier` gets the configured defaults and every other tier gets 0,
    /// except that storage keys also get the LOG default so their prepare
    /// and commit records can be routed.
    pub fn init_tier(&mut self, key: &str, tier: Tier, defaults: &ReplicationDefaults) {
        let mut replication = KeyReplication::default();
        for t in Tier::SERVER_TIERS {
            let related = t == tier || (tier.is_storage() && t == Tier::Log);
            if related {
                replication.set(t, defaults.global(t), defaults.local);
            } else {
                replication.set(t, 0, 0);
            }
        }
        self.keys.insert(key.to_string(), replication);
    }

    /// Forgets the record of `key`.
    pub fn remove(&mut self, key: &str) -> Option<KeyReplication> {
        self.keys.remove(key)
    }

    /// Number of known keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if no key is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
