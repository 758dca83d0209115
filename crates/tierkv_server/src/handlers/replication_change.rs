use crate::error::ServerResult;
use crate::node::{Node, TierState};
use tierkv_protocol::{replication_key, Message, ReplicationFactorUpdate};
use tracing::{debug, info, warn};

impl Node {
    /// Installs pushed replication records.
    ///
    /// Thread 0 of a node fans the update out to the node's other threads
    /// first. Metadata owners keep the record so later lookups find it, and
    /// requests parked on any updated key are re-driven.
    ///
    /// # Errors
    ///
    /// This handler does not fail.
    pub fn replication_change_handler(&mut self, update: ReplicationFactorUpdate) -> ServerResult<()> {
        if self.thread.tid() == 0 {
            let message = Message::ReplicationFactorUpdate(update.clone());
            for tid in 1..self.config.threads.get(self.tier) {
                let peer = self.thread.with_tid(tid);
                self.send(&peer.replication_change_address(), &message);
            }
        }

        info!(tier = %self.tier, count = update.updates.len(), "replication change");
        for factor in update.updates {
            let key = factor.key.clone();
            self.router.replication_mut().apply(&factor);

            let metadata_key = replication_key(&key);
            let owners = self.router.rings().metadata_threads(self.tier, &metadata_key);
            if owners.contains(&self.thread) {
                debug!(key, "storing replication record");
                self.metadata.insert(metadata_key, factor);
            }

            if let TierState::Storage(store) = &self.state {
                if store.contains(&key) {
                    let owners = self.router.replication().get(&key).map(|replication| {
                        self.router
                            .rings()
                            .responsible_threads(self.tier, &key, replication)
                    });
                    if !owners.is_some_and(|owners| owners.contains(&self.thread)) {
                        warn!(key, thread = %self.thread, "holding a key this thread no longer owns");
                    }
                }
            }

            self.router.complete_lookup(&key);
            self.redrive(&key);
        }
        Ok(())
    }
}
