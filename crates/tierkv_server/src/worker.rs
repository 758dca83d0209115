//! The event loop of one worker thread.

use crate::node::Node;
use tierkv_protocol::Envelope;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A [`Node`] fed by the inbox its addresses are registered with.
///
/// Messages are handled one at a time in arrival order, so handlers never
/// run concurrently on the same node.
#[derive(Debug)]
pub struct Worker {
    node: Node,
    inbox: UnboundedReceiver<Envelope>,
}

impl Worker {
    /// Creates a worker draining `inbox` into `node`.
    pub fn new(node: Node, inbox: UnboundedReceiver<Envelope>) -> Self {
        Self { node, inbox }
    }

    /// Runs the worker on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<Node> {
        tokio::spawn(self.run())
    }

    /// Handles messages until every sender of the inbox is gone, then
    /// returns the node.
    pub async fn run(mut self) -> Node {
        while let Some(envelope) = self.inbox.recv().await {
            if let Err(e) = self.node.handle(&envelope) {
                warn!(
                    thread = %self.node.thread(),
                    address = %envelope.address,
                    error = %e,
                    "message dropped"
                );
            }
        }
        debug!(thread = %self.node.thread(), "worker stopped");
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{rings, thread_of};
    use std::sync::Arc;
    use tierkv_core::ClusterConfig;
    use tierkv_protocol::{Channel, ChannelNetwork, Membership, Message, Tier, Transport};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn worker_applies_messages_until_closed() {
        let network = Arc::new(ChannelNetwork::new());
        let thread = thread_of(Tier::Memory);
        let node = Node::new(
            Arc::new(ClusterConfig::default()),
            Tier::Memory,
            thread.clone(),
            rings(),
            network.clone(),
        )
        .unwrap();

        let (sender, inbox) = mpsc::unbounded_channel();
        network.register(thread.membership_address(), Channel::Membership, sender);
        let handle = Worker::new(node, inbox).spawn();

        let join = Membership::NodeJoin {
            tier: Tier::Disk,
            public_ip: "34.0.3.1".into(),
            private_ip: "10.0.3.1".into(),
            join_count: 0,
        };
        network
            .send(&thread.membership_address(), &Message::Membership(join))
            .unwrap();
        network.unregister(&thread.membership_address());

        let node = handle.await.unwrap();
        assert_eq!(node.router().rings().node_count(Tier::Disk), 1);
    }
}
