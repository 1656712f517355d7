//! The set of peers adjacent to the local node on the ring.
//!
//! A peer moves through `unknown → candidate → member → dead → forgotten`. Candidates are peers
//! learned from third parties and wait for first-hand contact before becoming members; dead peers
//! are quarantined for a while so that stale third-party gossip can't bring them straight back.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use time::OffsetDateTime;
use tracing::*;

use crate::core::{
    clock::elapsed,
    config::validate_leafset_size,
    error::Error,
    id::NodeId,
    message::LeafsetSnapshot,
    ring::{nearest_id, sort_by_distance},
};

/// A leafset member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafsetPeer {
    pub addr: SocketAddr,
    pub last_heartbeat_received: OffsetDateTime,
    pub last_heartbeat_sent: Option<OffsetDateTime>,
}

/// A peer learned about second-hand, not yet confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidatePeer {
    pub addr: SocketAddr,
    pub discovered_at: OffsetDateTime,
    pub last_heartbeat_sent: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeadPeer {
    addr: SocketAddr,
    departed_at: OffsetDateTime,
}

/// Membership changes raised by the leafset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafsetEvent {
    PeerArrived(NodeId, SocketAddr),
    PeerDeparted(NodeId, SocketAddr),
}

/// The leafset, bounded to `max_size` members split evenly on either side of the local id.
#[derive(Debug, Clone)]
pub struct Leafset {
    local_id: NodeId,
    max_size: usize,
    members: HashMap<NodeId, LeafsetPeer>,
    dead: HashMap<NodeId, DeadPeer>,
    candidates: HashMap<NodeId, CandidatePeer>,
    events: Vec<LeafsetEvent>,
}

impl Leafset {
    /// Creates an empty leafset, `max_size` must be even.
    pub fn new(local_id: NodeId, max_size: usize) -> Result<Self, Error> {
        validate_leafset_size(max_size)?;

        Ok(Self {
            local_id,
            max_size,
            members: HashMap::new(),
            dead: HashMap::new(),
            candidates: HashMap::new(),
            events: Vec::new(),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max_size
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    pub fn peer(&self, id: &NodeId) -> Option<&LeafsetPeer> {
        self.members.get(id)
    }

    pub fn members(&self) -> impl Iterator<Item = (&NodeId, &LeafsetPeer)> {
        self.members.iter()
    }

    pub fn candidate(&self, id: &NodeId) -> Option<&CandidatePeer> {
        self.candidates.get(id)
    }

    pub fn candidates(&self) -> impl Iterator<Item = (&NodeId, &CandidatePeer)> {
        self.candidates.iter()
    }

    pub fn is_dead(&self, id: &NodeId) -> bool {
        self.dead.contains_key(id)
    }

    /// Returns the members as `(id, addr)` pairs, as shared with other nodes.
    pub fn compressed(&self) -> LeafsetSnapshot {
        self.members
            .iter()
            .map(|(&id, peer)| (id, peer.addr))
            .collect()
    }

    /// Drains the membership changes raised since the last call.
    pub fn take_events(&mut self) -> Vec<LeafsetEvent> {
        std::mem::take(&mut self.events)
    }

    /// Records first-hand evidence that the peer is alive, admitting it if it belongs in the
    /// leafset. Returns `true` if the peer is a member afterwards.
    pub fn update_with_known_good(&mut self, id: NodeId, addr: SocketAddr, now: OffsetDateTime) -> bool {
        if id == self.local_id {
            return false;
        }

        self.dead.remove(&id);
        self.candidates.remove(&id);

        if let Some(peer) = self.members.get_mut(&id) {
            peer.addr = addr;
            peer.last_heartbeat_received = now;
            return true;
        }

        if !self.is_full() {
            self.admit(id, addr, now);
            return true;
        }

        match self.excluded_position(&id) {
            Some(evicted) if evicted != id => {
                if let Some(peer) = self.members.remove(&evicted) {
                    debug!(peer = %evicted, addr = %peer.addr, "evicted from the leafset");
                    self.events.push(LeafsetEvent::PeerDeparted(evicted, peer.addr));
                }
                self.admit(id, addr, now);
                true
            }
            _ => {
                trace!(peer = %id, "outside of the leafset range, dropped");
                false
            }
        }
    }

    /// Stages a peer learned second-hand. Returns `true` if it was staged.
    pub fn update_with_provisional(&mut self, id: NodeId, addr: SocketAddr, now: OffsetDateTime) -> bool {
        if id == self.local_id || self.dead.contains_key(&id) || self.members.contains_key(&id) {
            return false;
        }

        if matches!(self.candidates.get(&id), Some(candidate) if candidate.addr == addr) {
            return false;
        }

        if !self.is_within_leafset_range(&id) {
            return false;
        }

        trace!(peer = %id, addr = %addr, "staged as leafset candidate");
        self.candidates.insert(
            id,
            CandidatePeer {
                addr,
                discovered_at: now,
                last_heartbeat_sent: None,
            },
        );

        true
    }

    /// Moves a member to the dead set, returning `true` if it was a member.
    pub fn remove_peer(&mut self, id: &NodeId, now: OffsetDateTime) -> bool {
        match self.members.remove(id) {
            Some(peer) => {
                debug!(peer = %id, addr = %peer.addr, "removed from the leafset");
                self.dead.insert(
                    *id,
                    DeadPeer {
                        addr: peer.addr,
                        departed_at: now,
                    },
                );
                self.events.push(LeafsetEvent::PeerDeparted(*id, peer.addr));
                true
            }
            None => false,
        }
    }

    /// Forgets dead peers and candidates older than their retention intervals.
    pub fn clear_expired_dead_and_candidate_peers(
        &mut self,
        now: OffsetDateTime,
        dead_retention: Duration,
        candidate_retention: Duration,
    ) {
        self.dead
            .retain(|_, dead| elapsed(dead.departed_at, now) <= dead_retention);
        self.candidates
            .retain(|_, candidate| elapsed(candidate.discovered_at, now) <= candidate_retention);
    }

    /// Removes the members that haven't been heard from within `timeout`, returns their ids.
    pub fn clear_timed_out_peers(&mut self, now: OffsetDateTime, timeout: Duration) -> Vec<NodeId> {
        let timed_out: Vec<NodeId> = self
            .members
            .iter()
            .filter(|(_, peer)| elapsed(peer.last_heartbeat_received, now) > timeout)
            .map(|(&id, _)| id)
            .collect();

        for id in &timed_out {
            debug!(peer = %id, "timed out");
            self.remove_peer(id, now);
        }

        timed_out
    }

    /// Stamps the time a heartbeat was last sent to a member or candidate.
    pub fn mark_heartbeat_sent(&mut self, id: &NodeId, now: OffsetDateTime) {
        if let Some(peer) = self.members.get_mut(id) {
            peer.last_heartbeat_sent = Some(now);
        } else if let Some(candidate) = self.candidates.get_mut(id) {
            candidate.last_heartbeat_sent = Some(now);
        }
    }

    /// Returns `true` if `id` falls within the arc of the ring covered by the leafset.
    ///
    /// The members and `id` are sorted clockwise from the local id; the first `max_size / 2`
    /// positions form the clockwise half and the last `max_size / 2` the counterclockwise half.
    /// `id` is in range if it lands in either half. A leafset that isn't full covers the whole
    /// ring.
    pub fn is_within_leafset_range(&self, id: &NodeId) -> bool {
        if *id == self.local_id || self.members.contains_key(id) || !self.is_full() {
            return true;
        }

        self.excluded_position(id) != Some(*id)
    }

    // Sorts the members plus `id` clockwise and returns the one left over between the two halves,
    // if any.
    fn excluded_position(&self, id: &NodeId) -> Option<NodeId> {
        let half = self.max_size / 2;
        let sorted = sort_by_distance(
            &self.local_id,
            self.members.keys().chain(std::iter::once(id)),
            true,
        );

        (half..sorted.len().saturating_sub(half))
            .next()
            .map(|i| sorted[i])
    }

    /// Returns the member (or the local id) closest to `id` if `id` falls within the leafset's
    /// range, `None` otherwise.
    ///
    /// An empty leafset knows nothing about the ring and never answers. A leafset that holds
    /// members but isn't full has both edges reaching past each other, so it answers for every
    /// identifier; callers should still weigh the answer against other routing state.
    pub fn get_routing_hop(&self, id: &NodeId) -> Option<NodeId> {
        if self.members.contains_key(id) {
            return Some(*id);
        }

        if self.members.is_empty() || !self.is_within_leafset_range(id) {
            return None;
        }

        nearest_id(
            id,
            self.members.keys().chain(std::iter::once(&self.local_id)),
            true,
        )
        .nearest
    }

    /// Returns `true` if no member is closer to `id` than the local node. `id` itself is never
    /// considered, so a node asking about its own identifier gets an answer from the others.
    pub fn is_this_node_nearest_to(&self, id: &NodeId) -> bool {
        let nearest = nearest_id(
            id,
            self.members
                .keys()
                .filter(|&member| member != id)
                .chain(std::iter::once(&self.local_id)),
            true,
        );

        nearest.nearest == Some(self.local_id)
    }

    /// Returns the clockwise-most and counterclockwise-most members.
    pub fn edge_peers(&self) -> (Option<NodeId>, Option<NodeId>) {
        let half = self.max_size / 2;
        let reach = half.min(self.members.len());
        if reach == 0 {
            return (None, None);
        }

        let cw = sort_by_distance(&self.local_id, self.members.keys(), true);
        let ccw = sort_by_distance(&self.local_id, self.members.keys(), false);

        (Some(cw[reach - 1]), Some(ccw[reach - 1]))
    }

    fn admit(&mut self, id: NodeId, addr: SocketAddr, now: OffsetDateTime) {
        debug!(peer = %id, addr = %addr, "admitted to the leafset");
        self.members.insert(
            id,
            LeafsetPeer {
                addr,
                last_heartbeat_received: now,
                last_heartbeat_sent: None,
            },
        );
        self.events.push(LeafsetEvent::PeerArrived(id, addr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost_with_port(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn leafset(size: usize) -> Leafset {
        Leafset::new(NodeId::from_u16(1000), size).unwrap()
    }

    #[test]
    fn odd_size_is_rejected() {
        assert_eq!(
            Leafset::new(NodeId::from_u16(0), 3).unwrap_err(),
            Error::OddLeafsetSize(3)
        );
    }

    #[test]
    fn known_good_is_idempotent() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();
        let id = NodeId::from_u16(1001);

        assert!(ls.update_with_known_good(id, localhost_with_port(1), now));
        assert!(ls.update_with_known_good(id, localhost_with_port(1), now));
        assert_eq!(ls.len(), 1);
        assert_eq!(ls.peer(&id).unwrap().addr, localhost_with_port(1));

        // A new address replaces the old one.
        assert!(ls.update_with_known_good(id, localhost_with_port(2), now));
        assert_eq!(ls.peer(&id).unwrap().addr, localhost_with_port(2));

        // Only one arrival was raised.
        assert_eq!(
            ls.take_events(),
            vec![LeafsetEvent::PeerArrived(id, localhost_with_port(1))]
        );
    }

    #[test]
    fn known_good_ignores_self() {
        let mut ls = leafset(4);
        assert!(!ls.update_with_known_good(ls.local_id(), localhost_with_port(0), OffsetDateTime::now_utc()));
        assert!(ls.is_empty());
    }

    #[test]
    fn never_exceeds_max_size() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();

        for _ in 0..100 {
            ls.update_with_known_good(NodeId::rand(), localhost_with_port(1), now);
            assert!(ls.len() <= 4);
        }
        assert_eq!(ls.len(), 4);
    }

    #[test]
    fn eviction_keeps_ring_neighbours() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();

        // Two either side of 1000.
        for (i, raw) in [1010u16, 1020, 990, 980].into_iter().enumerate() {
            assert!(ls.update_with_known_good(NodeId::from_u16(raw), localhost_with_port(i as u16), now));
        }
        ls.take_events();

        // Further away than everything: dropped.
        assert!(!ls.update_with_known_good(NodeId::from_u16(1100), localhost_with_port(9), now));
        assert!(!ls.contains(&NodeId::from_u16(1100)));

        // Closer on the clockwise side: the furthest clockwise member makes room.
        assert!(ls.update_with_known_good(NodeId::from_u16(1005), localhost_with_port(9), now));
        assert!(ls.contains(&NodeId::from_u16(1005)));
        assert!(!ls.contains(&NodeId::from_u16(1020)));
        assert_eq!(ls.len(), 4);

        assert_eq!(
            ls.take_events(),
            vec![
                LeafsetEvent::PeerDeparted(NodeId::from_u16(1020), localhost_with_port(1)),
                LeafsetEvent::PeerArrived(NodeId::from_u16(1005), localhost_with_port(9)),
            ]
        );
    }

    #[test]
    fn range_boundaries() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();

        // Not full: the whole ring is in range.
        assert!(ls.is_within_leafset_range(&NodeId::from_u16(30000)));

        for raw in [1010u16, 1020, 990, 980] {
            ls.update_with_known_good(NodeId::from_u16(raw), localhost_with_port(1), now);
        }

        // Sorted clockwise from 1000: 1010, 1020 | x | 980, 990.
        assert!(ls.is_within_leafset_range(&NodeId::from_u16(1015)));
        assert!(ls.is_within_leafset_range(&NodeId::from_u16(985)));
        // Just past either edge falls between the halves.
        assert!(!ls.is_within_leafset_range(&NodeId::from_u16(1021)));
        assert!(!ls.is_within_leafset_range(&NodeId::from_u16(979)));
        // Members themselves are in range.
        assert!(ls.is_within_leafset_range(&NodeId::from_u16(1020)));
        assert!(ls.is_within_leafset_range(&NodeId::from_u16(980)));
    }

    #[test]
    fn provisional_staging() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();
        let id = NodeId::from_u16(1001);

        assert!(ls.update_with_provisional(id, localhost_with_port(1), now));
        // Staged identically.
        assert!(!ls.update_with_provisional(id, localhost_with_port(1), now));
        // Different address re-stages.
        assert!(ls.update_with_provisional(id, localhost_with_port(2), now));
        assert_eq!(ls.candidate(&id).unwrap().addr, localhost_with_port(2));
        assert!(!ls.contains(&id));

        // Promotion clears the candidate.
        assert!(ls.update_with_known_good(id, localhost_with_port(2), now));
        assert!(ls.candidate(&id).is_none());
        assert!(!ls.update_with_provisional(id, localhost_with_port(2), now));
    }

    #[test]
    fn provisional_out_of_range_is_ignored() {
        let mut ls = leafset(2);
        let now = OffsetDateTime::now_utc();

        ls.update_with_known_good(NodeId::from_u16(1010), localhost_with_port(1), now);
        ls.update_with_known_good(NodeId::from_u16(990), localhost_with_port(2), now);

        assert!(!ls.update_with_provisional(NodeId::from_u16(2000), localhost_with_port(3), now));
        assert!(ls.update_with_provisional(NodeId::from_u16(1001), localhost_with_port(3), now));
    }

    #[test]
    fn dead_peers_are_quarantined() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();
        let retention = Duration::from_secs(60);
        let id = NodeId::from_u16(1001);

        ls.update_with_known_good(id, localhost_with_port(1), now);
        assert!(ls.remove_peer(&id, now));
        assert!(!ls.contains(&id));
        assert!(ls.is_dead(&id));

        // Within the window.
        let later = now + Duration::from_secs(30);
        ls.clear_expired_dead_and_candidate_peers(later, retention, retention);
        assert!(!ls.update_with_provisional(id, localhost_with_port(1), later));

        // After the window.
        let much_later = now + Duration::from_secs(61);
        ls.clear_expired_dead_and_candidate_peers(much_later, retention, retention);
        assert!(!ls.is_dead(&id));
        assert!(ls.update_with_provisional(id, localhost_with_port(1), much_later));
    }

    #[test]
    fn candidates_expire() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();
        let id = NodeId::from_u16(1001);
        let retention = Duration::from_secs(60);

        ls.update_with_provisional(id, localhost_with_port(1), now);
        ls.clear_expired_dead_and_candidate_peers(now + Duration::from_secs(61), retention, retention);
        assert!(ls.candidate(&id).is_none());
    }

    #[test]
    fn timed_out_peers_are_removed() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();
        let timeout = Duration::from_secs(35);

        ls.update_with_known_good(NodeId::from_u16(1001), localhost_with_port(1), now);
        ls.update_with_known_good(
            NodeId::from_u16(1002),
            localhost_with_port(2),
            now + Duration::from_secs(20),
        );

        let removed = ls.clear_timed_out_peers(now + Duration::from_secs(36), timeout);
        assert_eq!(removed, vec![NodeId::from_u16(1001)]);
        assert!(ls.contains(&NodeId::from_u16(1002)));
        assert!(ls.is_dead(&NodeId::from_u16(1001)));
    }

    #[test]
    fn routing_hop() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();

        // Empty leafset: nothing is known, so nothing is in range.
        assert_eq!(ls.get_routing_hop(&NodeId::from_u16(5000)), None);
        assert_eq!(ls.get_routing_hop(&NodeId::from_u16(1001)), None);

        // Partly filled: the nearest of the members and the local node.
        ls.update_with_known_good(NodeId::from_u16(1010), localhost_with_port(1), now);
        assert_eq!(ls.get_routing_hop(&NodeId::from_u16(1008)), Some(NodeId::from_u16(1010)));
        assert_eq!(ls.get_routing_hop(&NodeId::from_u16(1003)), Some(ls.local_id()));
        assert_eq!(ls.get_routing_hop(&NodeId::from_u16(5000)), Some(NodeId::from_u16(1010)));

        for raw in [1020u16, 990, 980] {
            ls.update_with_known_good(NodeId::from_u16(raw), localhost_with_port(1), now);
        }

        assert_eq!(ls.get_routing_hop(&NodeId::from_u16(1018)), Some(NodeId::from_u16(1020)));
        assert_eq!(ls.get_routing_hop(&NodeId::from_u16(1002)), Some(ls.local_id()));
        assert_eq!(ls.get_routing_hop(&NodeId::from_u16(980)), Some(NodeId::from_u16(980)));
        assert_eq!(ls.get_routing_hop(&NodeId::from_u16(5000)), None);
    }

    #[test]
    fn nearest_to() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();
        ls.update_with_known_good(NodeId::from_u16(1010), localhost_with_port(1), now);

        assert!(ls.is_this_node_nearest_to(&NodeId::from_u16(1004)));
        assert!(!ls.is_this_node_nearest_to(&NodeId::from_u16(1006)));
        // The identifier asked about is never its own answer.
        assert!(ls.is_this_node_nearest_to(&NodeId::from_u16(1010)));
    }

    #[test]
    fn edges() {
        let mut ls = leafset(4);
        let now = OffsetDateTime::now_utc();
        assert_eq!(ls.edge_peers(), (None, None));

        for raw in [1010u16, 1020, 990, 980] {
            ls.update_with_known_good(NodeId::from_u16(raw), localhost_with_port(1), now);
        }

        assert_eq!(
            ls.edge_peers(),
            (Some(NodeId::from_u16(1020)), Some(NodeId::from_u16(980)))
        );
    }
}
