//! Protocol message types.
//!
//! Every overlay-internal message kind is a variant of the closed [`Message`] enum, so incoming
//! traffic is dispatched with a single `match` and each kind is owned by exactly one component.

use std::{collections::BTreeMap, net::SocketAddr, time::Duration};

#[cfg(feature = "codec")]
use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::core::id::NodeId;

pub type Nonce = u128;

/// A peer as it is exchanged between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct PeerRef {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// The round-trip time measured by the node sharing this record, if any.
    pub rtt: Option<Duration>,
}

impl PeerRef {
    pub fn new(id: NodeId, addr: SocketAddr, rtt: Option<Duration>) -> Self {
        Self { id, addr, rtt }
    }
}

/// A compact leafset listing: identifiers and their listening addresses.
pub type LeafsetSnapshot = Vec<(NodeId, SocketAddr)>;

/// Part of a routing table, keyed by row then digit.
pub type PartialTable = BTreeMap<usize, BTreeMap<u8, PeerRef>>;

/// The verb a message is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// An overlay message with its routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Envelope {
    /// The node that created the message, unchanged when it is forwarded.
    pub source_id: NodeId,
    /// The listening address of the node that created the message.
    pub source_addr: SocketAddr,
    /// Set for messages routed through the overlay towards an identifier.
    pub dest_id: Option<NodeId>,
    pub message: Message,
}

/// Overlay message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub enum Message {
    /// Routed towards the joining identifier, collecting routing state at every hop.
    JoinRequest(JoinRequest),
    /// Sent by the node nearest to the joining identifier straight back to the joining node.
    JoinResponse(JoinResponse),
    /// Graceful departure notice.
    PeerDeparting(PeerDeparting),
    /// Liveness and routing state exchange.
    Heartbeat(Heartbeat),

    PnsLeafsetRequest(PnsLeafsetRequest),
    PnsLeafset(PnsLeafset),
    PnsRoutingRowRequest(PnsRoutingRowRequest),
    PnsRoutingRow(PnsRoutingRow),
    /// An RTT probe, answered with [`Message::PnsRttProbeEcho`] carrying the same identifiers.
    PnsRttProbe(PnsRttProbe),
    PnsRttProbeEcho(PnsRttProbe),

    /// Application traffic carried by the overlay.
    App(App),
}

impl Message {
    /// Returns the resource path the message is addressed to.
    pub fn uri(&self) -> String {
        match self {
            Message::JoinRequest(_) | Message::JoinResponse(_) => "graviti/peers".to_owned(),
            Message::PeerDeparting(departing) => format!("graviti/peers/{}", departing.id),
            Message::Heartbeat(_) => "graviti/heartbeat".to_owned(),
            Message::PnsLeafsetRequest(_) | Message::PnsLeafset(_) => {
                "graviti/pns/leafset".to_owned()
            }
            Message::PnsRoutingRowRequest(_) | Message::PnsRoutingRow(_) => {
                "graviti/pns/routingrow".to_owned()
            }
            Message::PnsRttProbe(_) | Message::PnsRttProbeEcho(_) => {
                "graviti/pns/rttprobe".to_owned()
            }
            Message::App(app) => app.uri.clone(),
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Message::JoinRequest(_)
            | Message::PnsLeafsetRequest(_)
            | Message::PnsRoutingRowRequest(_)
            | Message::PnsRttProbe(_) => Method::Get,
            Message::JoinResponse(_)
            | Message::Heartbeat(_)
            | Message::PnsLeafset(_)
            | Message::PnsRoutingRow(_)
            | Message::PnsRttProbeEcho(_)
            | Message::App(_) => Method::Post,
            Message::PeerDeparting(_) => Method::Delete,
        }
    }

    /// Returns the proximity search request the message belongs to, if any.
    pub fn req_id(&self) -> Option<Nonce> {
        match self {
            Message::PnsLeafsetRequest(m) => Some(m.req_id),
            Message::PnsLeafset(m) => Some(m.req_id),
            Message::PnsRoutingRowRequest(m) => Some(m.req_id),
            Message::PnsRoutingRow(m) => Some(m.req_id),
            Message::PnsRttProbe(m) | Message::PnsRttProbeEcho(m) => Some(m.req_id),
            _ => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::JoinResponse(_)
                | Message::PnsLeafset(_)
                | Message::PnsRoutingRow(_)
                | Message::PnsRttProbeEcho(_)
        )
    }
}

/// The data making up a join request (`GET graviti/peers`).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct JoinRequest {
    pub joining_node_id: NodeId,
    /// Routing rows accumulated from every hop so far.
    pub routing_table: PartialTable,
    /// Identifiers of the hops the request went through, in order.
    pub bootstrap_request_hops: Vec<NodeId>,
    /// Where the final response is to be sent.
    pub bootstrap_source_addr: SocketAddr,
}

/// The data making up a join response (`POST graviti/peers`).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct JoinResponse {
    pub routing_table: PartialTable,
    pub bootstrap_request_hops: Vec<NodeId>,
    pub leafset: LeafsetSnapshot,
    pub last_bootstrap_hop: bool,
}

/// The data making up a departure notice (`DELETE graviti/peers/{id}`).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct PeerDeparting {
    pub id: NodeId,
}

/// The data making up a heartbeat (`POST graviti/heartbeat`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Heartbeat {
    pub leafset: Option<LeafsetSnapshot>,
    pub routing_table: Option<PartialTable>,
    /// Asks the recipient to reply, echoing this nonce.
    pub rsvp_with: Option<Nonce>,
    /// The nonce of the heartbeat this one replies to.
    pub rsvp_echo: Option<Nonce>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct PnsLeafsetRequest {
    pub req_id: Nonce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct PnsLeafset {
    pub req_id: Nonce,
    pub leafset: LeafsetSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct PnsRoutingRowRequest {
    pub req_id: Nonce,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct PnsRoutingRow {
    pub req_id: Nonce,
    /// The row actually returned, at most the requested depth.
    pub depth: usize,
    pub routing_row: Option<Vec<PeerRef>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct PnsRttProbe {
    pub req_id: Nonce,
    pub probe_id: Nonce,
}

/// An application message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct App {
    pub uri: String,

    #[cfg_attr(feature = "codec", bincode(with_serde))]
    pub payload: Bytes,
}
