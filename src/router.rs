//! Next-hop selection.

use std::{collections::HashMap, net::SocketAddr};

use crate::{
    core::{id::NodeId, ring::common_prefix_len, ring::nearest_id},
    leafset::Leafset,
    routing_table::RoutingTable,
};

/// Where a message for a given identifier should go next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// The local node is the closest known node; the message is delivered here.
    Local,
    /// The message is forwarded to this peer.
    Peer { id: NodeId, addr: SocketAddr },
}

impl NextHop {
    pub fn is_local(&self) -> bool {
        matches!(self, NextHop::Local)
    }

    /// Returns the peer's address, `None` for local delivery.
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            NextHop::Local => None,
            NextHop::Peer { addr, .. } => Some(*addr),
        }
    }
}

/// Combines the leafset and the routing table to answer next-hop queries.
pub struct Router<'a> {
    leafset: &'a Leafset,
    routing_table: &'a RoutingTable,
}

impl<'a> Router<'a> {
    pub fn new(leafset: &'a Leafset, routing_table: &'a RoutingTable) -> Self {
        Self {
            leafset,
            routing_table,
        }
    }

    fn local_id(&self) -> NodeId {
        self.leafset.local_id()
    }

    /// Returns the next hop towards `id`.
    ///
    /// The leafset answers for identifiers within its range, otherwise the routing table slot
    /// sharing one more digit with `id` is used. An empty leafset never answers, and the answer of
    /// a leafset that isn't full yet loses to the routing table slot when that slot's peer is
    /// closer to `id`. When the slot is empty the message goes to whichever known node is closest
    /// to `id` among the local node, the matching row, the row above it and the leafset edges.
    pub fn get_next_hop(&self, id: &NodeId) -> NextHop {
        let local_id = self.local_id();
        if *id == local_id {
            return NextHop::Local;
        }

        if let Some(hop) = self.leafset.get_routing_hop(id) {
            // The leafset may still be missing nodes the routing table already knows about.
            let slot = self.routing_table.slot_for(id).filter(|_| !self.leafset.is_full());
            if let Some(peer) = slot {
                let closer = nearest_id(id, [hop, peer.id].iter(), true).nearest == Some(peer.id);
                if peer.id != hop && closer {
                    return NextHop::Peer {
                        id: peer.id,
                        addr: peer.addr,
                    };
                }
            }

            if hop == local_id {
                return NextHop::Local;
            }
            if let Some(peer) = self.leafset.peer(&hop) {
                return NextHop::Peer {
                    id: hop,
                    addr: peer.addr,
                };
            }
        }

        if let Some(peer) = self.routing_table.slot_for(id) {
            return NextHop::Peer {
                id: peer.id,
                addr: peer.addr,
            };
        }

        self.fallback_hop(id)
    }

    // The rare case: no leafset answer and an empty routing table slot. Only two peers of the row
    // above are ever useful here but the whole row is considered.
    fn fallback_hop(&self, id: &NodeId) -> NextHop {
        let local_id = self.local_id();
        let row = common_prefix_len(&local_id, id);

        let mut candidates: HashMap<NodeId, Option<SocketAddr>> = HashMap::new();
        candidates.insert(local_id, None);

        let rows = if row > 0 { vec![row, row - 1] } else { vec![row] };
        for peer in rows.into_iter().flat_map(|r| self.routing_table.row(r)) {
            candidates.insert(peer.id, Some(peer.addr));
        }

        let (cw_edge, ccw_edge) = self.leafset.edge_peers();
        for edge in [cw_edge, ccw_edge].into_iter().flatten() {
            if let Some(peer) = self.leafset.peer(&edge) {
                candidates.insert(edge, Some(peer.addr));
            }
        }

        // The local node maps to `None` and wins whenever nothing else is closer.
        let nearest = nearest_id(id, candidates.keys(), true).nearest;
        let winner = nearest
            .and_then(|nearest| candidates.get(&nearest).copied().flatten().map(|addr| (nearest, addr)));
        match winner {
            Some((id, addr)) => NextHop::Peer { id, addr },
            None => NextHop::Local,
        }
    }
}
