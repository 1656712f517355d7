//! Joining an existing ring.
//!
//! The joining node sends a join request, routed towards its own identifier, either straight to a
//! bootstrap endpoint or to the nearest node a proximity search finds from it. Every hop merges
//! its routing state into the request; the node nearest to the joining identifier answers the
//! joining node directly with the accumulated tables and its leafset.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
};

use time::OffsetDateTime;
use tracing::*;

use crate::{
    core::{
        clock::is_due,
        error::Error,
        id::NodeId,
        message::{Envelope, Heartbeat, JoinRequest, JoinResponse, Message, PartialTable, PeerRef},
        ring::common_prefix_len,
    },
    pns::{Pns, PnsOutcome, RunId},
    router::NextHop,
    state::NodeState,
};

/// Parses a comma-separated list of bootstrap endpoints.
///
/// Each endpoint is an IP address with an optional port, `default_port` is used when the port is
/// omitted. Blank entries are skipped.
pub fn parse_endpoints(list: &str, default_port: u16) -> Result<Vec<SocketAddr>, Error> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<SocketAddr>()
                .or_else(|_| {
                    entry
                        .trim_start_matches('[')
                        .trim_end_matches(']')
                        .parse::<IpAddr>()
                        .map(|ip| SocketAddr::new(ip, default_port))
                })
                .map_err(|_| Error::InvalidEndpoint(entry.to_owned()))
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Endpoint {
    addr: SocketAddr,
    last_attempt: Option<OffsetDateTime>,
}

/// Drives the join protocol on the joining side and answers the join requests of others.
#[derive(Debug, Default)]
pub struct Bootstrapper {
    endpoints: Vec<Endpoint>,
    bootstrapping: bool,
    completed: bool,
    last_check: Option<OffsetDateTime>,
    // Proximity searches in flight, by the endpoint they started from.
    pns_runs: HashMap<RunId, SocketAddr>,
}

impl Bootstrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while a join is in progress.
    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    /// Returns `true` once the node is part of a ring, its own included.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Starts joining through the given endpoints. Without endpoints the node forms a ring of its
    /// own and `true` is returned.
    pub fn start(
        &mut self,
        state: &mut NodeState,
        pns: &mut Pns,
        endpoints: Vec<SocketAddr>,
        now: OffsetDateTime,
    ) -> bool {
        if endpoints.is_empty() {
            info!(id = %state.local_id, "no bootstrap endpoints, starting a new ring");
            self.completed = true;
            return true;
        }

        info!(id = %state.local_id, ?endpoints, "bootstrapping");
        self.bootstrapping = true;
        self.completed = false;
        self.last_check = None;
        self.endpoints = endpoints
            .into_iter()
            .map(|addr| Endpoint {
                addr,
                last_attempt: None,
            })
            .collect();

        self.poll(state, pns, now);

        false
    }

    /// Stops any join in progress.
    pub fn stop(&mut self) {
        self.bootstrapping = false;
        self.endpoints.clear();
        self.pns_runs.clear();
    }

    /// Retries the endpoints whose last attempt is older than the retry interval. An endpoint with
    /// a proximity search still in flight waits for that search to finish.
    pub fn poll(&mut self, state: &mut NodeState, pns: &mut Pns, now: OffsetDateTime) {
        if !self.bootstrapping || !is_due(self.last_check, now, state.config.pending_request_check_interval) {
            return;
        }

        self.last_check = Some(now);
        let retry_interval = state.config.bootstrap_retry_interval;

        for endpoint in self.endpoints.iter_mut() {
            if !is_due(endpoint.last_attempt, now, retry_interval) {
                continue;
            }

            if self.pns_runs.values().any(|addr| *addr == endpoint.addr) {
                trace!(endpoint = %endpoint.addr, "nearest node search still running");
                continue;
            }

            endpoint.last_attempt = Some(now);
            if state.config.use_pns {
                let run_id = pns.find_nearest_node(state, endpoint.addr, now);
                self.pns_runs.insert(run_id, endpoint.addr);
            } else {
                send_join_request(state, endpoint.addr);
            }
        }
    }

    /// Sends the join request once a proximity search has finished. Failed searches fall back to
    /// the endpoint they started from.
    pub fn handle_pns_outcome(&mut self, state: &mut NodeState, outcome: PnsOutcome) {
        let endpoint = match self.pns_runs.remove(&outcome.run_id) {
            Some(endpoint) => endpoint,
            None => return,
        };

        if !self.bootstrapping {
            return;
        }

        match outcome.result {
            Ok(nearest) => {
                debug!(peer = %nearest.id, rtt = ?nearest.rtt, "joining through the nearest node");
                send_join_request(state, nearest.addr);
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "nearest node search failed, joining through the endpoint");
                send_join_request(state, endpoint);
            }
        }
    }

    /// Enriches a join request with this node's routing state, then either answers the joining
    /// node or forwards the request towards its identifier.
    pub fn handle_join_request(state: &mut NodeState, mut envelope: Envelope) {
        let mut request = match envelope.message {
            Message::JoinRequest(request) => request,
            _ => return,
        };

        let joining_id = request.joining_node_id;
        if joining_id == state.local_id {
            trace!("own join request came back, dropped");
            return;
        }

        enrich(state, &mut request);

        let next_hop = state.router().get_next_hop(&joining_id);
        let forward_to = match next_hop {
            NextHop::Peer { id, addr } if id != joining_id && !state.leafset.is_this_node_nearest_to(&joining_id) => {
                Some(addr)
            }
            _ => None,
        };

        match forward_to {
            Some(addr) => {
                trace!(joining = %joining_id, %addr, "forwarding join request");
                envelope.message = Message::JoinRequest(request);
                state.forward(addr, envelope);
            }
            None => {
                debug!(joining = %joining_id, hops = request.bootstrap_request_hops.len(), "answering join request");
                let response = JoinResponse {
                    routing_table: request.routing_table,
                    bootstrap_request_hops: request.bootstrap_request_hops,
                    leafset: state.leafset.compressed(),
                    last_bootstrap_hop: true,
                };

                state.send(request.bootstrap_source_addr, Message::JoinResponse(response));
            }
        }
    }

    /// Completes the join. Returns `true` if the node just became part of the ring.
    pub fn handle_join_response(
        &mut self,
        state: &mut NodeState,
        source_id: NodeId,
        source_addr: SocketAddr,
        response: JoinResponse,
        now: OffsetDateTime,
    ) -> bool {
        if !self.bootstrapping {
            warn!(peer = %source_id, "join response received while not bootstrapping, dropped");
            return false;
        }

        if !response.last_bootstrap_hop {
            trace!(peer = %source_id, "intermediate join response, ignored");
            return false;
        }

        for &(id, addr) in &response.leafset {
            state.leafset.update_with_known_good(id, addr, now);
            state.routing_table.update_with_known_good(id, addr, None, now);
        }
        state.routing_table.merge_known_good(&response.routing_table, now);

        state.leafset.update_with_known_good(source_id, source_addr, now);
        state
            .routing_table
            .update_with_known_good(source_id, source_addr, None, now);

        // Tell the new neighbours about ourselves right away.
        let leafset = state.leafset.compressed();
        let members: Vec<(NodeId, SocketAddr)> = state.leafset.members().map(|(&id, peer)| (id, peer.addr)).collect();
        for (id, addr) in members {
            let heartbeat = Heartbeat {
                leafset: Some(leafset.clone()),
                ..Default::default()
            };
            state.send(addr, Message::Heartbeat(heartbeat));
            state.leafset.mark_heartbeat_sent(&id, now);
        }

        let peers: Vec<PeerRef> = state.routing_table.peers().copied().collect();
        for peer in peers {
            let heartbeat = Heartbeat {
                routing_table: Some(state.routing_table.get_shared_row(&peer.id)),
                ..Default::default()
            };
            state.send(peer.addr, Message::Heartbeat(heartbeat));
        }

        info!(
            id = %state.local_id,
            leafset = state.leafset.len(),
            hops = response.bootstrap_request_hops.len(),
            "bootstrap completed"
        );

        self.stop();
        self.completed = true;

        true
    }
}

fn send_join_request(state: &mut NodeState, addr: SocketAddr) {
    let local_id = state.local_id;
    let request = JoinRequest {
        joining_node_id: local_id,
        routing_table: PartialTable::new(),
        bootstrap_request_hops: Vec::new(),
        bootstrap_source_addr: state.local_addr,
    };

    debug!(%addr, "sending join request");
    state.send_routed(addr, Some(local_id), Message::JoinRequest(request));
}

// Adds this node's shared row and its own entry to the request's partial table and records the
// hop. Slots filled by an earlier hop are kept.
fn enrich(state: &NodeState, request: &mut JoinRequest) {
    let joining_id = request.joining_node_id;
    let mut contribution = state.routing_table.get_shared_row(&joining_id);

    let row = common_prefix_len(&state.local_id, &joining_id);
    if row < NodeId::DIGITS {
        contribution
            .entry(row)
            .or_default()
            .insert(state.local_id.digit(row), PeerRef::new(state.local_id, state.local_addr, None));
    }

    for (row, entries) in contribution {
        let target = request.routing_table.entry(row).or_default();
        for (digit, peer) in entries {
            target.entry(digit).or_insert(peer);
        }
    }

    if !request.bootstrap_request_hops.contains(&state.local_id) {
        request.bootstrap_request_hops.push(state.local_id);
    }
}
