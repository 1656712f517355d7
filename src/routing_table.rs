//! Prefix routing table.
//!
//! Row `r` holds peers sharing exactly `r` leading digits with the local identifier; the slot
//! within the row is the peer's digit at position `r`. Each slot keeps the lowest-RTT peer seen
//! for it. Peers learned second-hand are staged as candidates until an RTT probe confirms them.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    time::Duration,
};

use rand::{seq::IteratorRandom, thread_rng};
use time::OffsetDateTime;
use tracing::*;

use crate::core::{
    clock::elapsed,
    config::Config,
    id::NodeId,
    message::{Nonce, PartialTable, PeerRef},
    ring::{common_prefix_len, nearest_id},
};

/// The number of rows, one per identifier digit.
pub const ROWS: usize = NodeId::DIGITS;

/// The number of slots per row, one per digit value.
pub const SLOTS: usize = NodeId::RADIX;

type Row = [Option<PeerRef>; SLOTS];

/// The outcome of a known-good update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// The peer now occupies its slot.
    Inserted,
    /// The peer already occupied its slot and its record was refreshed.
    Refreshed,
    /// A different peer with a lower RTT occupies the slot.
    Rejected,
    /// The local identifier is never stored.
    SelfEntry,
}

/// An outstanding RTT probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub nonce: Nonce,
    pub probed_at: OffsetDateTime,
}

/// A provisionally known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingCandidate {
    pub addr: SocketAddr,
    pub discovered_at: OffsetDateTime,
    pub probe: Option<Probe>,
}

/// The core routing table implementation.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    // The node's local identifier.
    local_id: NodeId,
    // RTT assumed for entries that were never measured.
    long_rtt: Duration,
    candidate_retention: Duration,
    proposed_retention: Duration,
    // The rows, indexed by common prefix length then digit.
    table: Box<[Row; ROWS]>,
    // Peers awaiting an RTT probe.
    candidates: HashMap<NodeId, RoutingCandidate>,
    // Per source, the better hops already proposed to it and when.
    proposed: HashMap<NodeId, HashMap<NodeId, OffsetDateTime>>,
}

impl RoutingTable {
    /// Creates a new routing table.
    pub fn new(local_id: NodeId, config: &Config) -> Self {
        Self {
            local_id,
            long_rtt: config.long_round_trip_time,
            candidate_retention: config.routing_candidate_retention,
            proposed_retention: config.proposed_better_routing_hops_retention,
            table: Box::new([[None; SLOTS]; ROWS]),
            candidates: HashMap::new(),
            proposed: HashMap::new(),
        }
    }

    /// Returns this table's local identifier.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    // Returns the (row, digit) slot coordinates for the identifier, `None` for the local id.
    fn coordinates(&self, id: &NodeId) -> Option<(usize, usize)> {
        let row = common_prefix_len(&self.local_id, id);
        (row < ROWS).then(|| (row, id.digit(row) as usize))
    }

    /// Returns the entry stored for exactly this identifier.
    pub fn peer(&self, id: &NodeId) -> Option<&PeerRef> {
        self.slot_for(id).filter(|peer| peer.id == *id)
    }

    /// Returns whichever peer occupies the slot `id` maps to, this is the routing table's answer
    /// for the next hop towards `id`.
    pub fn slot_for(&self, id: &NodeId) -> Option<&PeerRef> {
        let (row, digit) = self.coordinates(id)?;
        self.table[row][digit].as_ref()
    }

    /// Returns the occupied slots of a row.
    pub fn row(&self, row: usize) -> Vec<PeerRef> {
        self.table
            .get(row)
            .map(|r| r.iter().flatten().copied().collect())
            .unwrap_or_default()
    }

    /// Returns every peer in the table.
    pub fn peers(&self) -> impl Iterator<Item = &PeerRef> {
        self.table.iter().flat_map(|row| row.iter().flatten())
    }

    pub fn is_empty(&self) -> bool {
        self.peers().next().is_none()
    }

    /// Returns the deepest occupied row whose index doesn't exceed `depth`, with its index.
    pub fn deepest_row(&self, depth: usize) -> Option<(usize, Vec<PeerRef>)> {
        (0..=depth.min(ROWS - 1))
            .rev()
            .map(|i| (i, self.row(i)))
            .find(|(_, row)| !row.is_empty())
    }

    /// Records a confirmed peer. Without a measured `rtt` the peer is assumed to be far away and
    /// is also staged for probing.
    pub fn update_with_known_good(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
        rtt: Option<Duration>,
        now: OffsetDateTime,
    ) -> EntryState {
        let (row, digit) = match self.coordinates(&id) {
            Some(coordinates) => coordinates,
            None => return EntryState::SelfEntry,
        };

        match rtt {
            Some(_) => {
                self.candidates.remove(&id);
            }
            None => {
                self.update_with_provisional(id, addr, true, now);
            }
        }

        let rtt_value = rtt.unwrap_or(self.long_rtt);
        let slot = &mut self.table[row][digit];
        if let Some(existing) = slot.as_mut() {
            if existing.id == id {
                existing.addr = addr;
                if rtt.is_some() {
                    existing.rtt = rtt;
                }
                return EntryState::Refreshed;
            }

            if existing.rtt.map_or(false, |held| held < rtt_value) {
                trace!(peer = %id, row, digit, holder = %existing.id, "closer peer holds the slot");
                return EntryState::Rejected;
            }
        }

        debug!(peer = %id, addr = %addr, row, digit, ?rtt, "routing table entry set");
        *slot = Some(PeerRef::new(id, addr, Some(rtt_value)));

        EntryState::Inserted
    }

    /// Stages a peer for an RTT probe. Returns `true` if it was staged.
    ///
    /// Peers whose table entry already has the same address aren't staged unless
    /// `override_known_good` is set, which forces the entry to be measured again.
    pub fn update_with_provisional(
        &mut self,
        id: NodeId,
        addr: SocketAddr,
        override_known_good: bool,
        now: OffsetDateTime,
    ) -> bool {
        if id == self.local_id {
            return false;
        }

        if !override_known_good && matches!(self.peer(&id), Some(peer) if peer.addr == addr) {
            return false;
        }

        if matches!(self.candidates.get(&id), Some(candidate) if candidate.addr == addr) {
            return false;
        }

        trace!(peer = %id, addr = %addr, "staged as routing candidate");
        self.candidates.insert(
            id,
            RoutingCandidate {
                addr,
                discovered_at: now,
                probe: None,
            },
        );

        true
    }

    /// Stages every peer of a table received from another node.
    pub fn merge_provisional(&mut self, partial: &PartialTable, now: OffsetDateTime) {
        for peer in partial.values().flat_map(|row| row.values()) {
            self.update_with_provisional(peer.id, peer.addr, false, now);
        }
    }

    /// Records every peer of a table received from another node as known-good. The RTTs in the
    /// partial table were measured by the sender and aren't carried over.
    pub fn merge_known_good(&mut self, partial: &PartialTable, now: OffsetDateTime) {
        for peer in partial.values().flat_map(|row| row.values()) {
            self.update_with_known_good(peer.id, peer.addr, None, now);
        }
    }

    /// Returns the row relevant to a peer sharing `common_prefix_len(local, id)` digits with
    /// this node, keyed by that row's index.
    pub fn get_shared_row(&self, id: &NodeId) -> PartialTable {
        let mut partial = PartialTable::new();
        if let Some((row, _)) = self.coordinates(id) {
            let entries: BTreeMap<u8, PeerRef> = self.table[row]
                .iter()
                .enumerate()
                .filter_map(|(digit, slot)| slot.map(|peer| (digit as u8, peer)))
                .collect();

            if !entries.is_empty() {
                partial.insert(row, entries);
            }
        }

        partial
    }

    /// Removes a peer from the table and from the candidates.
    pub fn remove_peer(&mut self, id: &NodeId) {
        self.candidates.remove(id);
        if let Some((row, digit)) = self.coordinates(id) {
            if matches!(self.table[row][digit], Some(peer) if peer.id == *id) {
                debug!(peer = %id, row, digit, "routing table entry removed");
                self.table[row][digit] = None;
            }
        }
    }

    /// Looks for a peer closer to `dest_id` than anything `source_id` appears to know, so the
    /// source can be told about it.
    ///
    /// Rows are scanned from `common_prefix_len(local, source)` down to
    /// `common_prefix_len(local, dest)`. Peers already proposed to the same source within the
    /// retention interval are skipped. The proposal is recorded and returned with its row.
    pub fn find_better_routing_hop(
        &mut self,
        source_id: &NodeId,
        dest_id: &NodeId,
        now: OffsetDateTime,
    ) -> Option<(PeerRef, PartialTable)> {
        let start = common_prefix_len(&self.local_id, source_id).min(ROWS - 1);
        let end = common_prefix_len(&self.local_id, dest_id).min(ROWS - 1);
        if start < end {
            return None;
        }

        let retention = self.proposed_retention;
        let already_proposed = self.proposed.get(source_id);
        let was_proposed = |id: &NodeId| {
            already_proposed
                .and_then(|proposed| proposed.get(id))
                .map_or(false, |&at| elapsed(at, now) <= retention)
        };

        let mut found = None;
        for row in (end..=start).rev() {
            let peers = self.row(row);
            let candidates: Vec<NodeId> = peers
                .iter()
                .map(|peer| peer.id)
                .filter(|id| id != source_id && !was_proposed(id))
                .chain(std::iter::once(self.local_id))
                .collect();

            let nearest = nearest_id(dest_id, candidates.iter(), false).nearest;
            if let Some(peer) = nearest
                .filter(|id| *id != self.local_id)
                .and_then(|id| peers.iter().find(|peer| peer.id == id))
            {
                found = Some((row, *peer));
                break;
            }
        }

        let (row, peer) = found?;
        self.proposed
            .entry(*source_id)
            .or_default()
            .insert(peer.id, now);

        let mut partial = PartialTable::new();
        partial.insert(
            row,
            self.table[row]
                .iter()
                .enumerate()
                .filter_map(|(digit, slot)| slot.map(|p| (digit as u8, p)))
                .collect(),
        );

        debug!(source = %source_id, dest = %dest_id, better = %peer.id, row, "better routing hop found");
        Some((peer, partial))
    }

    /// Expires stale candidates and route proposals.
    pub fn housekeep(&mut self, now: OffsetDateTime) {
        let candidate_retention = self.candidate_retention;
        self.candidates
            .retain(|_, candidate| elapsed(candidate.discovered_at, now) <= candidate_retention);

        let proposed_retention = self.proposed_retention;
        self.proposed.retain(|_, proposals| {
            proposals.retain(|_, &mut at| elapsed(at, now) <= proposed_retention);
            !proposals.is_empty()
        });
    }

    pub fn candidate(&self, id: &NodeId) -> Option<&RoutingCandidate> {
        self.candidates.get(id)
    }

    /// Returns the candidates that haven't been probed yet.
    pub fn unprobed_candidates(&self) -> Vec<(NodeId, SocketAddr)> {
        self.candidates
            .iter()
            .filter(|(_, candidate)| candidate.probe.is_none())
            .map(|(&id, candidate)| (id, candidate.addr))
            .collect()
    }

    /// Records an outstanding probe for a candidate.
    pub fn mark_probed(&mut self, id: &NodeId, nonce: Nonce, now: OffsetDateTime) {
        if let Some(candidate) = self.candidates.get_mut(id) {
            candidate.probe = Some(Probe {
                nonce,
                probed_at: now,
            });
        }
    }

    /// Returns when the candidate was probed if `nonce` matches its outstanding probe.
    pub fn probed_at(&self, id: &NodeId, nonce: Nonce) -> Option<OffsetDateTime> {
        self.candidates
            .get(id)
            .and_then(|candidate| candidate.probe)
            .filter(|probe| probe.nonce == nonce)
            .map(|probe| probe.probed_at)
    }

    /// Picks one peer at random from every occupied row.
    pub fn random_peer_per_row(&self) -> Vec<PeerRef> {
        let mut rng = thread_rng();

        self.table
            .iter()
            .filter_map(|row| row.iter().flatten().choose(&mut rng).copied())
            .collect()
    }
}
