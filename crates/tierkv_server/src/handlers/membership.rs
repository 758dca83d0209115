use crate::error::ServerResult;
use crate::node::Node;
use tierkv_protocol::Membership;
use tracing::info;

impl Node {
    /// Applies a node join or departure to this worker's ring view.
    ///
    /// # Errors
    ///
    /// This handler does not fail; repeated notifications are ignored.
    pub fn membership_handler(&mut self, change: Membership) -> ServerResult<()> {
        match change {
            Membership::NodeJoin {
                tier,
                public_ip,
                private_ip,
                join_count,
            } => {
                let threads = self.config.threads.get(tier);
                if self
                    .router
                    .rings_mut()
                    .insert_node(tier, &public_ip, &private_ip, join_count, threads)
                {
                    info!(%tier, private_ip, join_count, "node joined");
                }
            }
            Membership::NodeDepart {
                tier, private_ip, ..
            } => {
                if self.router.rings_mut().remove_node(tier, &private_ip) {
                    info!(%tier, private_ip, "node departed");
                }
            }
        }
        Ok(())
    }
}
