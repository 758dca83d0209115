//! An in-process cluster of workers.
//!
//! [`LocalCluster`] starts every node named by a [`ClusterConfig`] as a set
//! of tokio tasks, one per worker thread, connected by a shared
//! [`ChannelNetwork`]. Clients join the same network to talk to it.

use crate::error::{ServerError, ServerResult};
use crate::node::Node;
use crate::worker::Worker;
use std::sync::Arc;
use tierkv_core::{ClusterConfig, HashRings, ServerThread};
use tierkv_protocol::{
    Address, Channel, ChannelNetwork, Membership, Message, ReplicationFactorUpdate, Tier,
    Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const ALL_TIERS: [Tier; 5] = [Tier::Txn, Tier::Memory, Tier::Disk, Tier::Log, Tier::Routing];

fn tier_index(tier: Tier) -> u8 {
    match tier {
        Tier::Txn => 1,
        Tier::Memory => 2,
        Tier::Disk => 3,
        Tier::Log => 4,
        Tier::Routing => 5,
    }
}

/// Addresses a worker of `tier` listens on, with their channels.
fn listen_addresses(tier: Tier, thread: &ServerThread) -> Vec<(Address, Channel)> {
    let mut addresses = vec![
        (thread.replication_response_address(), Channel::ReplicationResponse),
        (thread.replication_change_address(), Channel::ReplicationChange),
        (thread.membership_address(), Channel::Membership),
    ];
    match tier {
        Tier::Txn => {
            addresses.push((thread.txn_request_address(), Channel::TxnRequest));
            addresses.push((thread.request_response_address(), Channel::RequestResponse));
        }
        Tier::Memory | Tier::Disk => {
            addresses.push((thread.storage_request_address(), Channel::StorageRequest));
            addresses.push((thread.request_response_address(), Channel::RequestResponse));
        }
        Tier::Log => addresses.push((thread.log_request_address(), Channel::LogRequest)),
        Tier::Routing => {
            addresses.push((thread.key_address_request_address(), Channel::KeyAddress));
        }
    }
    addresses
}

/// A node of the local cluster: thread 0 of it, and its tier.
#[derive(Debug, Clone)]
struct Member {
    tier: Tier,
    thread: ServerThread,
    join_count: u32,
}

/// A running in-process cluster.
#[derive(Debug)]
pub struct LocalCluster {
    config: Arc<ClusterConfig>,
    network: Arc<ChannelNetwork>,
    rings: HashRings,
    members: Vec<Member>,
    handles: Vec<JoinHandle<Node>>,
}

impl LocalCluster {
    /// Starts the nodes named by `config.nodes`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a worker cannot
    /// open its store or log.
    pub fn start(config: ClusterConfig) -> ServerResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let mut members = Vec::new();
        let mut rings = HashRings::new();
        for tier in ALL_TIERS {
            for i in 0..config.nodes.get(tier) {
                let member = Member {
                    tier,
                    thread: Self::node_thread(tier, i),
                    join_count: 0,
                };
                if tier != Tier::Routing {
                    rings.insert_node(
                        tier,
                        member.thread.public_ip(),
                        member.thread.private_ip(),
                        0,
                        config.threads.get(tier),
                    );
                }
                members.push(member);
            }
        }

        let mut cluster = Self {
            config,
            network: Arc::new(ChannelNetwork::new()),
            rings,
            members: Vec::new(),
            handles: Vec::new(),
        };
        for member in members {
            cluster.spawn_member(member)?;
        }
        info!(
            nodes = cluster.members.len(),
            workers = cluster.handles.len(),
            "local cluster started"
        );
        Ok(cluster)
    }

    fn node_thread(tier: Tier, index: u32) -> ServerThread {
        let t = tier_index(tier);
        ServerThread::new(
            format!("34.0.{t}.{}", index + 1),
            format!("10.0.{t}.{}", index + 1),
            0,
        )
    }

    fn spawn_member(&mut self, member: Member) -> ServerResult<()> {
        for tid in 0..self.config.threads.get(member.tier) {
            let thread = member.thread.with_tid(tid);
            let node = Node::new(
                self.config.clone(),
                member.tier,
                thread.clone(),
                self.rings.clone(),
                self.network.clone(),
            )?;
            let (sender, inbox) = mpsc::unbounded_channel();
            for (address, channel) in listen_addresses(member.tier, &thread) {
                self.network.register(address, channel, sender.clone());
            }
            self.handles.push(Worker::new(node, inbox).spawn());
        }
        self.members.push(member);
        Ok(())
    }

    /// The network shared by workers and clients.
    #[must_use]
    pub fn network(&self) -> Arc<ChannelNetwork> {
        self.network.clone()
    }

    /// The configuration the cluster was started with.
    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The current ring view.
    #[must_use]
    pub fn rings(&self) -> &HashRings {
        &self.rings
    }

    /// Key-address request addresses of every ROUTING worker.
    #[must_use]
    pub fn routing_addresses(&self) -> Vec<Address> {
        self.members
            .iter()
            .filter(|member| member.tier == Tier::Routing)
            .flat_map(|member| {
                (0..self.config.threads.get(Tier::Routing))
                    .map(|tid| member.thread.with_tid(tid).key_address_request_address())
            })
            .collect()
    }

    /// Private addresses of the nodes of `tier`.
    #[must_use]
    pub fn nodes(&self, tier: Tier) -> Vec<String> {
        self.members
            .iter()
            .filter(|member| member.tier == tier)
            .map(|member| member.thread.private_ip().to_string())
            .collect()
    }

    /// Pushes replication changes to thread 0 of every node, which forwards
    /// them to its other threads.
    pub fn update_replication(&self, update: &ReplicationFactorUpdate) {
        let message = Message::ReplicationFactorUpdate(update.clone());
        for member in &self.members {
            self.deliver(&member.thread.replication_change_address(), &message);
        }
    }

    /// Starts a new node in `tier` and announces it to every running worker.
    /// Returns its private address.
    ///
    /// # Errors
    ///
    /// Returns an error if the node's workers cannot be created.
    pub fn add_node(&mut self, tier: Tier) -> ServerResult<String> {
        let index = self.members.iter().filter(|m| m.tier == tier).count() as u32;
        let member = Member {
            tier,
            thread: Self::node_thread(tier, index),
            join_count: 0,
        };
        let join = Message::Membership(Membership::NodeJoin {
            tier,
            public_ip: member.thread.public_ip().to_string(),
            private_ip: member.thread.private_ip().to_string(),
            join_count: member.join_count,
        });
        self.broadcast(&join);

        if tier != Tier::Routing {
            self.rings.insert_node(
                tier,
                member.thread.public_ip(),
                member.thread.private_ip(),
                member.join_count,
                self.config.threads.get(tier),
            );
        }
        let private_ip = member.thread.private_ip().to_string();
        self.spawn_member(member)?;
        Ok(private_ip)
    }

    /// Removes the node `private_ip` of `tier`: its addresses stop
    /// accepting messages and every other worker drops it from its ring.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Cluster`] if no such node is running.
    pub fn depart(&mut self, tier: Tier, private_ip: &str) -> ServerResult<()> {
        let Some(position) = self
            .members
            .iter()
            .position(|m| m.tier == tier && m.thread.private_ip() == private_ip)
        else {
            return Err(ServerError::cluster(format!(
                "no {tier} node at {private_ip}"
            )));
        };
        let member = self.members.remove(position);
        for tid in 0..self.config.threads.get(tier) {
            let thread = member.thread.with_tid(tid);
            for (address, _) in listen_addresses(tier, &thread) {
                self.network.unregister(&address);
            }
        }
        self.rings.remove_node(tier, private_ip);

        self.broadcast(&Message::Membership(Membership::NodeDepart {
            tier,
            public_ip: member.thread.public_ip().to_string(),
            private_ip: private_ip.to_string(),
            join_count: member.join_count,
        }));
        info!(%tier, private_ip, "node departed");
        Ok(())
    }

    fn broadcast(&self, message: &Message) {
        for member in &self.members {
            for tid in 0..self.config.threads.get(member.tier) {
                self.deliver(&member.thread.with_tid(tid).membership_address(), message);
            }
        }
    }

    fn deliver(&self, address: &str, message: &Message) {
        if let Err(e) = self.network.send(address, message) {
            warn!(address, error = %e, "cluster message not delivered");
        }
    }

    /// Stops accepting messages, lets every worker drain its inbox and
    /// returns the final worker states.
    pub async fn shutdown(mut self) -> Vec<Node> {
        for member in std::mem::take(&mut self.members) {
            for tid in 0..self.config.threads.get(member.tier) {
                for (address, _) in listen_addresses(member.tier, &member.thread.with_tid(tid)) {
                    self.network.unregister(&address);
                }
            }
        }
        let mut nodes = Vec::new();
        for handle in std::mem::take(&mut self.handles) {
            match handle.await {
                Ok(node) => nodes.push(node),
                Err(e) => warn!(error = %e, "worker task failed"),
            }
        }
        nodes
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
