//! The routing state shared by the overlay components of a single node.

use std::net::SocketAddr;

use crate::{
    core::{
        config::Config,
        id::NodeId,
        message::{Envelope, Message},
    },
    leafset::Leafset,
    router::Router,
    routing_table::RoutingTable,
};

/// Messages queued for sending, paired with their destination address.
pub type Outbox = Vec<(SocketAddr, Envelope)>;

/// The leafset, routing table and outbound queue of one node.
///
/// Owned by [`OverlayNode`](crate::OverlayNode) and lent to the heartbeater, bootstrapper and
/// proximity search for the duration of each call.
#[derive(Debug)]
pub struct NodeState {
    pub(crate) local_id: NodeId,
    pub(crate) local_addr: SocketAddr,
    pub(crate) config: Config,
    pub(crate) leafset: Leafset,
    pub(crate) routing_table: RoutingTable,
    pub(crate) outbox: Outbox,
}

impl NodeState {
    pub(crate) fn new(
        local_id: NodeId,
        local_addr: SocketAddr,
        config: Config,
    ) -> Result<Self, crate::core::error::Error> {
        config.validate()?;

        Ok(Self {
            leafset: Leafset::new(local_id, config.leafset_size)?,
            routing_table: RoutingTable::new(local_id, &config),
            local_id,
            local_addr,
            config,
            outbox: Vec::new(),
        })
    }

    pub(crate) fn router(&self) -> Router<'_> {
        Router::new(&self.leafset, &self.routing_table)
    }

    /// Queues a message originating from this node for direct delivery to `addr`.
    pub(crate) fn send(&mut self, addr: SocketAddr, message: Message) {
        self.send_routed(addr, None, message);
    }

    /// Queues a message originating from this node, routed towards `dest_id` through `addr`.
    pub(crate) fn send_routed(&mut self, addr: SocketAddr, dest_id: Option<NodeId>, message: Message) {
        let envelope = Envelope {
            source_id: self.local_id,
            source_addr: self.local_addr,
            dest_id,
            message,
        };

        self.outbox.push((addr, envelope));
    }

    /// Queues an envelope as is, for forwarding.
    pub(crate) fn forward(&mut self, addr: SocketAddr, envelope: Envelope) {
        self.outbox.push((addr, envelope));
    }
}
