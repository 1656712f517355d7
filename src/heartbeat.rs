//! Liveness detection and routing state maintenance.
//!
//! Four loops run once the node has started:
//!
//! 1. heartbeats go out to every leafset member and candidate every `heartbeat_interval`,
//! 2. silent members are removed and expired peers are purged every `purge_interval`,
//! 3. routing candidates are sent an RTT probe every `routing_candidate_probe_interval`,
//! 4. a random peer of every routing table row is re-staged for probing every
//!    `routing_table_maintenance_interval`.
//!
//! A heartbeat carrying `rsvp_with` expects a reply echoing the nonce. Replies to routing table
//! probes also carry the responder's shared row and are what turns a routing candidate into an
//! entry with a measured RTT.

use std::net::SocketAddr;

use time::OffsetDateTime;
use tracing::*;

use crate::{
    core::{
        clock::{elapsed, is_due},
        id::NodeId,
        message::{Heartbeat, Message, PeerDeparting},
    },
    state::NodeState,
};

#[derive(Debug, Clone, Copy, Default)]
struct Loops {
    heartbeat: Option<OffsetDateTime>,
    purge: Option<OffsetDateTime>,
    probe: Option<OffsetDateTime>,
    maintenance: Option<OffsetDateTime>,
}

/// Drives the periodic heartbeat, purge, probe and maintenance loops.
#[derive(Debug, Default)]
pub struct Heartbeater {
    running: bool,
    last_run: Loops,
}

impl Heartbeater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts the loops. Each one first fires a full interval after `now`.
    pub fn start(&mut self, now: OffsetDateTime) {
        if self.running {
            return;
        }

        debug!("starting the heartbeat loops");
        self.running = true;
        self.last_run = Loops {
            heartbeat: Some(now),
            purge: Some(now),
            probe: Some(now),
            maintenance: Some(now),
        };
    }

    /// Stops the loops, optionally telling the leafset members the node is leaving.
    pub fn stop(&mut self, state: &mut NodeState, notify_peers: bool) {
        if !self.running {
            return;
        }

        self.running = false;
        if notify_peers {
            let members: Vec<SocketAddr> = state.leafset.members().map(|(_, peer)| peer.addr).collect();
            debug!(peers = members.len(), "notifying the leafset of our departure");

            let id = state.local_id;
            for addr in members {
                state.send(addr, Message::PeerDeparting(PeerDeparting { id }));
            }
        }
    }

    /// Runs whichever loops are due.
    pub fn poll(&mut self, state: &mut NodeState, now: OffsetDateTime) {
        if !self.running {
            return;
        }

        let config = state.config.clone();

        if is_due(self.last_run.heartbeat, now, config.heartbeat_check_interval) {
            self.last_run.heartbeat = Some(now);
            send_heartbeats(state, now);
        }

        if is_due(self.last_run.purge, now, config.purge_interval) {
            self.last_run.purge = Some(now);
            purge(state, now);
        }

        if is_due(self.last_run.probe, now, config.routing_candidate_probe_interval) {
            self.last_run.probe = Some(now);
            probe_routing_candidates(state, now);
        }

        if is_due(
            self.last_run.maintenance,
            now,
            config.routing_table_maintenance_interval,
        ) {
            self.last_run.maintenance = Some(now);
            maintain_routing_table(state, now);
        }
    }
}

// Sends a heartbeat to every member and candidate that hasn't been sent one within the heartbeat
// interval. The loop itself ticks every `heartbeat_check_interval`.
fn send_heartbeats(state: &mut NodeState, now: OffsetDateTime) {
    let interval = state.config.heartbeat_interval;

    let due: Vec<(NodeId, SocketAddr)> = state
        .leafset
        .members()
        .map(|(&id, peer)| (id, peer.addr, peer.last_heartbeat_sent))
        .chain(
            state
                .leafset
                .candidates()
                .map(|(&id, candidate)| (id, candidate.addr, candidate.last_heartbeat_sent)),
        )
        .filter(|(_, _, sent)| is_due(*sent, now, interval))
        .map(|(id, addr, _)| (id, addr))
        .collect();

    if due.is_empty() {
        return;
    }

    let leafset = state.leafset.compressed();
    for (id, addr) in due {
        trace!(peer = %id, "sending heartbeat");
        let heartbeat = Heartbeat {
            leafset: Some(leafset.clone()),
            rsvp_with: Some(rand::random()),
            ..Default::default()
        };

        state.send(addr, Message::Heartbeat(heartbeat));
        state.leafset.mark_heartbeat_sent(&id, now);
    }
}

fn purge(state: &mut NodeState, now: OffsetDateTime) {
    let config = &state.config;
    state.leafset.clear_expired_dead_and_candidate_peers(
        now,
        config.departed_peer_retention,
        config.candidate_peer_retention,
    );

    let timed_out = state
        .leafset
        .clear_timed_out_peers(now, config.timed_out_peer_interval);
    if !timed_out.is_empty() {
        debug!(count = timed_out.len(), "leafset members timed out");
    }

    state.routing_table.housekeep(now);
}

fn probe_routing_candidates(state: &mut NodeState, now: OffsetDateTime) {
    for (id, addr) in state.routing_table.unprobed_candidates() {
        let nonce = rand::random();
        trace!(peer = %id, %addr, "probing routing candidate");

        let heartbeat = Heartbeat {
            routing_table: Some(state.routing_table.get_shared_row(&id)),
            rsvp_with: Some(nonce),
            ..Default::default()
        };

        state.send(addr, Message::Heartbeat(heartbeat));
        state.routing_table.mark_probed(&id, nonce, now);
    }
}

// Forces a fresh RTT measurement of one peer per row.
fn maintain_routing_table(state: &mut NodeState, now: OffsetDateTime) {
    for peer in state.routing_table.random_peer_per_row() {
        state
            .routing_table
            .update_with_provisional(peer.id, peer.addr, true, now);
    }
}

/// Processes a received heartbeat.
pub fn handle_heartbeat(
    state: &mut NodeState,
    source_id: NodeId,
    source_addr: SocketAddr,
    heartbeat: Heartbeat,
    now: OffsetDateTime,
) {
    state.leafset.update_with_known_good(source_id, source_addr, now);

    if let Some(leafset) = &heartbeat.leafset {
        for &(id, addr) in leafset {
            state.leafset.update_with_provisional(id, addr, now);
        }
    }

    if let Some(routing_table) = &heartbeat.routing_table {
        state.routing_table.merge_provisional(routing_table, now);
    }

    match (heartbeat.rsvp_with, heartbeat.rsvp_echo) {
        (Some(nonce), _) => {
            state
                .routing_table
                .update_with_provisional(source_id, source_addr, false, now);

            let reply = Heartbeat {
                leafset: Some(state.leafset.compressed()),
                routing_table: Some(state.routing_table.get_shared_row(&source_id)),
                rsvp_echo: Some(nonce),
                ..Default::default()
            };

            state.send(source_addr, Message::Heartbeat(reply));
            state.leafset.mark_heartbeat_sent(&source_id, now);
        }
        (None, Some(echo)) if heartbeat.routing_table.is_some() => {
            match state.routing_table.probed_at(&source_id, echo) {
                Some(probed_at) => {
                    let rtt = elapsed(probed_at, now);
                    trace!(peer = %source_id, ?rtt, "routing candidate answered");
                    state
                        .routing_table
                        .update_with_known_good(source_id, source_addr, Some(rtt), now);
                }
                None => trace!(peer = %source_id, "stale probe reply"),
            }
        }
        _ => {
            state
                .routing_table
                .update_with_provisional(source_id, source_addr, false, now);
        }
    }
}

/// Removes a departing peer from the leafset and the routing table.
pub fn handle_peer_departing(state: &mut NodeState, departing: PeerDeparting, now: OffsetDateTime) {
    debug!(peer = %departing.id, "peer departing");
    state.leafset.remove_peer(&departing.id, now);
    state.routing_table.remove_peer(&departing.id);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::config::Config;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn state(raw: u16) -> NodeState {
        NodeState::new(NodeId::from_u16(raw), addr(raw), Config::default()).unwrap()
    }

    fn heartbeats(state: &mut NodeState) -> Vec<(SocketAddr, Heartbeat)> {
        state
            .outbox
            .drain(..)
            .filter_map(|(addr, envelope)| match envelope.message {
                Message::Heartbeat(heartbeat) => Some((addr, heartbeat)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn loops_wait_for_their_first_interval() {
        let mut state = state(1000);
        let now = OffsetDateTime::now_utc();
        state.leafset.update_with_known_good(NodeId::from_u16(1001), addr(1001), now);

        let mut heartbeater = Heartbeater::new();
        heartbeater.poll(&mut state, now);
        assert!(state.outbox.is_empty());

        heartbeater.start(now);
        heartbeater.poll(&mut state, now);
        assert!(state.outbox.is_empty());

        heartbeater.poll(&mut state, now + Duration::from_secs(1));
        let sent = heartbeats(&mut state);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(1001));
        assert!(sent[0].1.rsvp_with.is_some());
        assert!(sent[0].1.leafset.is_some());

        // Not again until the heartbeat interval has passed.
        heartbeater.poll(&mut state, now + Duration::from_secs(2));
        assert!(heartbeats(&mut state).is_empty());
        heartbeater.poll(&mut state, now + Duration::from_secs(12));
        assert_eq!(heartbeats(&mut state).len(), 1);
    }

    #[test]
    fn rsvp_is_answered() {
        let mut state = state(1000);
        let now = OffsetDateTime::now_utc();
        let peer = NodeId::from_u16(1005);

        let heartbeat = Heartbeat {
            rsvp_with: Some(42),
            leafset: Some(vec![(NodeId::from_u16(1007), addr(1007))]),
            ..Default::default()
        };
        handle_heartbeat(&mut state, peer, addr(1005), heartbeat, now);

        assert!(state.leafset.contains(&peer));
        assert!(state.leafset.candidate(&NodeId::from_u16(1007)).is_some());
        assert!(state.routing_table.candidate(&peer).is_some());

        let sent = heartbeats(&mut state);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr(1005));
        assert_eq!(sent[0].1.rsvp_echo, Some(42));
        assert_eq!(sent[0].1.rsvp_with, None);
        assert!(sent[0].1.routing_table.is_some());
    }

    #[test]
    fn probe_reply_measures_rtt() {
        let mut state = state(1000);
        let now = OffsetDateTime::now_utc();
        let peer = NodeId::from_hex("F000000000000000000000000000000000000000").unwrap();

        state.routing_table.update_with_provisional(peer, addr(2000), false, now);
        probe_routing_candidates(&mut state, now);

        let sent = heartbeats(&mut state);
        assert_eq!(sent.len(), 1);
        let nonce = sent[0].1.rsvp_with.unwrap();

        let reply = Heartbeat {
            routing_table: Some(Default::default()),
            rsvp_echo: Some(nonce),
            ..Default::default()
        };
        handle_heartbeat(&mut state, peer, addr(2000), reply, now + Duration::from_millis(30));

        let entry = state.routing_table.peer(&peer).unwrap();
        assert_eq!(entry.rtt, Some(Duration::from_millis(30)));
        assert!(state.routing_table.candidate(&peer).is_none());
        assert!(heartbeats(&mut state).is_empty());
    }

    #[test]
    fn mismatched_echo_is_ignored() {
        let mut state = state(1000);
        let now = OffsetDateTime::now_utc();
        let peer = NodeId::from_hex("F000000000000000000000000000000000000000").unwrap();

        state.routing_table.update_with_provisional(peer, addr(2000), false, now);
        state.routing_table.mark_probed(&peer, 1, now);

        let reply = Heartbeat {
            routing_table: Some(Default::default()),
            rsvp_echo: Some(2),
            ..Default::default()
        };
        handle_heartbeat(&mut state, peer, addr(2000), reply, now);

        assert!(state.routing_table.peer(&peer).is_none());
    }

    #[test]
    fn silent_members_are_purged() {
        let mut state = state(1000);
        let now = OffsetDateTime::now_utc();
        let peer = NodeId::from_u16(1001);
        state.leafset.update_with_known_good(peer, addr(1001), now);

        let mut heartbeater = Heartbeater::new();
        heartbeater.start(now);
        heartbeater.poll(&mut state, now + Duration::from_secs(30));
        assert!(state.leafset.contains(&peer));

        heartbeater.poll(&mut state, now + Duration::from_secs(40));
        assert!(!state.leafset.contains(&peer));
        assert!(state.leafset.is_dead(&peer));
    }

    #[test]
    fn departing_peer_is_forgotten() {
        let mut state = state(1000);
        let now = OffsetDateTime::now_utc();
        let peer = NodeId::from_u16(1001);
        state.leafset.update_with_known_good(peer, addr(1001), now);
        state.routing_table.update_with_known_good(peer, addr(1001), None, now);

        handle_peer_departing(&mut state, PeerDeparting { id: peer }, now);

        assert!(!state.leafset.contains(&peer));
        assert!(state.routing_table.peer(&peer).is_none());
        assert!(state.routing_table.candidate(&peer).is_none());
    }

    #[test]
    fn stop_notifies_members() {
        let mut state = state(1000);
        let now = OffsetDateTime::now_utc();
        state.leafset.update_with_known_good(NodeId::from_u16(1001), addr(1001), now);
        state.leafset.update_with_known_good(NodeId::from_u16(999), addr(999), now);

        let mut heartbeater = Heartbeater::new();
        heartbeater.start(now);
        heartbeater.stop(&mut state, true);

        assert!(!heartbeater.is_running());
        assert_eq!(state.outbox.len(), 2);
        for (_, envelope) in &state.outbox {
            assert_eq!(
                envelope.message,
                Message::PeerDeparting(PeerDeparting {
                    id: NodeId::from_u16(1000)
                })
            );
        }
    }
}
