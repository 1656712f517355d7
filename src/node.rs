//! The overlay node: message dispatch and timers over the routing state.

use std::net::SocketAddr;

use bytes::Bytes;
use time::OffsetDateTime;
use tracing::*;

use crate::{
    bootstrap::{parse_endpoints, Bootstrapper},
    core::{
        config::Config,
        error::Error,
        id::NodeId,
        message::{App, Envelope, Heartbeat, Message},
        traits::ProcessData,
    },
    heartbeat::{self, Heartbeater},
    leafset::{Leafset, LeafsetEvent},
    pns::Pns,
    router::NextHop,
    routing_table::RoutingTable,
    state::{NodeState, Outbox},
};

/// Changes in the node's view of the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A peer joined the leafset.
    PeerArrived { id: NodeId, addr: SocketAddr },
    /// A peer left the leafset, because it departed, timed out or was displaced by a closer one.
    PeerDeparted { id: NodeId, addr: SocketAddr },
    /// The node joined a ring, or started its own.
    BootstrapCompleted,
}

/// A single overlay node.
///
/// The node doesn't perform any I/O: received envelopes are passed to
/// [`process_message`](OverlayNode::process_message), timers are driven by calling
/// [`poll_timers`](OverlayNode::poll_timers) regularly and the messages to send are collected with
/// [`take_outgoing`](OverlayNode::take_outgoing). Every call takes the current time.
#[derive(Debug)]
pub struct OverlayNode {
    state: NodeState,
    heartbeater: Heartbeater,
    pns: Pns,
    bootstrapper: Bootstrapper,
    events: Vec<NodeEvent>,
}

impl OverlayNode {
    /// Creates a node listening on `local_addr`, fails if the configuration is invalid.
    pub fn new(local_id: NodeId, local_addr: SocketAddr, config: Config) -> Result<Self, Error> {
        Ok(Self {
            state: NodeState::new(local_id, local_addr, config)?,
            heartbeater: Heartbeater::new(),
            pns: Pns::new(),
            bootstrapper: Bootstrapper::new(),
            events: Vec::new(),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.state.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.state.config
    }

    pub fn leafset(&self) -> &Leafset {
        &self.state.leafset
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.state.routing_table
    }

    /// Returns `true` while the node is joining a ring.
    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapper.is_bootstrapping()
    }

    /// Returns `true` once the node is part of a ring.
    pub fn is_ready(&self) -> bool {
        self.bootstrapper.is_completed()
    }

    /// Returns the next hop towards `id`.
    pub fn get_next_hop(&self, id: &NodeId) -> NextHop {
        self.state.router().get_next_hop(id)
    }

    /// Starts the node and joins the ring through a comma-separated list of `ip[:port]`
    /// endpoints. An empty list starts a new ring.
    pub fn join(&mut self, bootstrap: &str, now: OffsetDateTime) -> Result<(), Error> {
        let endpoints = parse_endpoints(bootstrap, self.state.config.default_port)?;
        self.join_with(endpoints, now);

        Ok(())
    }

    /// Starts the node and joins the ring through the given endpoints.
    pub fn join_with(&mut self, endpoints: Vec<SocketAddr>, now: OffsetDateTime) {
        self.heartbeater.start(now);
        if self
            .bootstrapper
            .start(&mut self.state, &mut self.pns, endpoints, now)
        {
            self.events.push(NodeEvent::BootstrapCompleted);
        }

        self.collect_events();
    }

    /// Stops the node, telling the leafset about it if configured to.
    pub fn leave(&mut self) {
        info!(id = %self.state.local_id, "leaving the overlay");
        let notify = self.state.config.notify_peers_on_leave;
        self.heartbeater.stop(&mut self.state, notify);
        self.pns.cancel_all();
        self.bootstrapper.stop();
    }

    /// Runs the timers that are due.
    pub fn poll_timers(&mut self, now: OffsetDateTime) {
        self.heartbeater.poll(&mut self.state, now);
        self.pns.poll(&mut self.state, now);
        self.bootstrapper.poll(&mut self.state, &mut self.pns, now);

        self.collect_events();
    }

    /// Processes an envelope received from the network.
    ///
    /// Application messages routed to an identifier are delivered through `T` when this node is
    /// the closest to it and forwarded otherwise.
    pub fn process_message<S: Clone, T: ProcessData<S>>(
        &mut self,
        state: S,
        envelope: Envelope,
        now: OffsetDateTime,
    ) {
        let Envelope {
            source_id,
            source_addr,
            dest_id,
            message,
        } = envelope;

        trace!(
            uri = %message.uri(),
            method = ?message.method(),
            req_id = ?message.req_id(),
            source = %source_id,
            %source_addr,
            "received"
        );

        if message.is_response() && !self.bootstrapper.is_bootstrapping() && !self.pns.is_searching() {
            debug!(uri = %message.uri(), source = %source_id, "nothing awaits this response, dropped");
            return;
        }

        match message {
            Message::JoinRequest(request) => {
                let envelope = Envelope {
                    source_id,
                    source_addr,
                    dest_id,
                    message: Message::JoinRequest(request),
                };
                Bootstrapper::handle_join_request(&mut self.state, envelope);
            }
            Message::JoinResponse(response) => {
                if self.bootstrapper.handle_join_response(
                    &mut self.state,
                    source_id,
                    source_addr,
                    response,
                    now,
                ) {
                    self.events.push(NodeEvent::BootstrapCompleted);
                }
            }
            Message::PeerDeparting(departing) => {
                heartbeat::handle_peer_departing(&mut self.state, departing, now);
            }
            Message::Heartbeat(heartbeat) => {
                heartbeat::handle_heartbeat(&mut self.state, source_id, source_addr, heartbeat, now);
            }
            Message::PnsLeafsetRequest(request) => {
                Pns::handle_leafset_request(&mut self.state, source_addr, request);
            }
            Message::PnsLeafset(response) => {
                self.pns
                    .handle_leafset(&mut self.state, source_id, source_addr, response, now);
            }
            Message::PnsRoutingRowRequest(request) => {
                Pns::handle_routing_row_request(&mut self.state, source_addr, request);
            }
            Message::PnsRoutingRow(response) => {
                self.pns.handle_routing_row(&mut self.state, response, now);
            }
            Message::PnsRttProbe(probe) => {
                Pns::handle_rtt_probe(&mut self.state, source_addr, probe);
            }
            Message::PnsRttProbeEcho(echo) => {
                self.pns.handle_rtt_probe_echo(&mut self.state, echo, now);
            }
            Message::App(app) => {
                self.process_app::<S, T>(state, source_id, source_addr, dest_id, app, now);
            }
        }

        self.collect_events();
    }

    fn process_app<S: Clone, T: ProcessData<S>>(
        &mut self,
        state: S,
        source_id: NodeId,
        source_addr: SocketAddr,
        dest_id: Option<NodeId>,
        app: App,
        now: OffsetDateTime,
    ) {
        // Cheap as the backing storage is shared amongst instances.
        let data = app.payload.clone();

        let data_as_t: T = match data.try_into() {
            Ok(data) => data,
            Err(_) => {
                debug!(uri = %app.uri, source = %source_id, "undecodable payload dropped");
                return;
            }
        };

        if !data_as_t.verify_data(state.clone()) {
            debug!(uri = %app.uri, source = %source_id, "unverified payload dropped");
            return;
        }

        let (dest_id, next_hop) = match dest_id {
            Some(dest_id) => (dest_id, self.get_next_hop(&dest_id)),
            None => {
                data_as_t.process_data(state, source_id, &app.uri);
                return;
            }
        };

        match next_hop {
            NextHop::Local => data_as_t.process_data(state, source_id, &app.uri),
            NextHop::Peer { id, addr } => {
                trace!(uri = %app.uri, dest = %dest_id, hop = %id, "forwarding");
                let envelope = Envelope {
                    source_id,
                    source_addr,
                    dest_id: Some(dest_id),
                    message: Message::App(app),
                };
                self.state.forward(addr, envelope);
                self.suggest_better_hop(source_id, source_addr, dest_id, now);
            }
        }
    }

    // Offers a routing table row to a sender whose message passed through this node on its way to
    // a destination this node knows a shorter route to.
    fn suggest_better_hop(
        &mut self,
        source_id: NodeId,
        source_addr: SocketAddr,
        dest_id: NodeId,
        now: OffsetDateTime,
    ) {
        if source_id == self.state.local_id {
            return;
        }

        if let Some((_, row)) =
            self.state
                .routing_table
                .find_better_routing_hop(&source_id, &dest_id, now)
        {
            let heartbeat = Heartbeat {
                routing_table: Some(row),
                ..Default::default()
            };
            self.state.send(source_addr, Message::Heartbeat(heartbeat));
        }
    }

    /// Sends an application message towards the node closest to `dest_id`.
    ///
    /// Returns the hop the message was sent to. Nothing is sent when the local node is the
    /// closest, the caller is expected to handle the message itself.
    pub fn send_to_id(&mut self, dest_id: NodeId, uri: &str, payload: Bytes) -> NextHop {
        let next_hop = self.get_next_hop(&dest_id);
        if let NextHop::Peer { addr, .. } = next_hop {
            let app = App {
                uri: uri.to_owned(),
                payload,
            };
            self.state.send_routed(addr, Some(dest_id), Message::App(app));
        }

        next_hop
    }

    /// Sends an application message directly to a node.
    pub fn send_to_addr(&mut self, addr: SocketAddr, uri: &str, payload: Bytes) {
        let app = App {
            uri: uri.to_owned(),
            payload,
        };
        self.state.send(addr, Message::App(app));
    }

    /// Drains the messages queued for sending.
    pub fn take_outgoing(&mut self) -> Outbox {
        std::mem::take(&mut self.state.outbox)
    }

    /// Drains the events raised since the last call.
    pub fn take_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }

    fn collect_events(&mut self) {
        for outcome in self.pns.take_outcomes() {
            self.bootstrapper.handle_pns_outcome(&mut self.state, outcome);
        }

        let events = self.state.leafset.take_events().into_iter().map(|event| match event {
            LeafsetEvent::PeerArrived(id, addr) => NodeEvent::PeerArrived { id, addr },
            LeafsetEvent::PeerDeparted(id, addr) => NodeEvent::PeerDeparted { id, addr },
        });
        self.events.extend(events);
    }
}
