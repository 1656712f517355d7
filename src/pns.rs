//! Proximity neighbour selection.
//!
//! A search looks for the node with the lowest round-trip time to this one, starting from a
//! seed address:
//!
//! 1. the seed's leafset is requested and every member is sent an RTT probe,
//! 2. the first probe answer of a round names the best node so far, which is asked for its
//!    deepest routing row not past the current depth,
//! 3. the members of that row are probed in turn, one row shallower each round,
//! 4. the search ends when a round's first answer is no faster than the best so far, when a row
//!    comes back empty or when the rows run out.
//!
//! The runner repeats the search from other discovered addresses, keeping the best result
//! across attempts.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    time::Duration,
};

use rand::{seq::SliceRandom, thread_rng};
use time::OffsetDateTime;
use tracing::*;

use crate::{
    core::{
        clock::elapsed,
        error::Error,
        id::NodeId,
        message::{
            Message, Nonce, PnsLeafset, PnsLeafsetRequest, PnsRoutingRow, PnsRoutingRowRequest,
            PnsRttProbe,
        },
    },
    state::NodeState,
};

/// Identifies a run of one or more searches.
pub type RunId = u64;

/// The node found closest in network terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnsResult {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub rtt: Duration,
}

/// The final result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnsOutcome {
    pub run_id: RunId,
    pub result: Result<PnsResult, Error>,
    /// Every address learned during the run, seeds excluded.
    pub discovered: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingLeafset,
    AwaitingProbes,
    AwaitingRow,
}

#[derive(Debug, Clone, Copy)]
struct PendingProbe {
    id: NodeId,
    addr: SocketAddr,
    sent_at: OffsetDateTime,
    round: u32,
}

#[derive(Debug)]
struct Search {
    run_id: RunId,
    phase: Phase,
    started_at: OffsetDateTime,
    // The row to request next, `None` once row 0 has been visited.
    depth: Option<usize>,
    round: u32,
    best: Option<PnsResult>,
    probes: HashMap<Nonce, PendingProbe>,
    discovered: Vec<SocketAddr>,
}

#[derive(Debug, Default)]
struct Run {
    attempts: usize,
    best: Option<PnsResult>,
    last_error: Option<Error>,
    discovered: Vec<SocketAddr>,
    used: HashSet<SocketAddr>,
}

/// Runs nearest node searches and answers the searches of other nodes.
#[derive(Debug, Default)]
pub struct Pns {
    next_run_id: RunId,
    runs: HashMap<RunId, Run>,
    searches: HashMap<Nonce, Search>,
    outcomes: Vec<PnsOutcome>,
}

impl Pns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if any search is in progress.
    pub fn is_searching(&self) -> bool {
        !self.searches.is_empty()
    }

    /// Starts looking for the nearest node from `seed`, the result is reported as a
    /// [`PnsOutcome`] carrying the returned run id.
    pub fn find_nearest_node(&mut self, state: &mut NodeState, seed: SocketAddr, now: OffsetDateTime) -> RunId {
        let run_id = self.next_run_id;
        self.next_run_id = self.next_run_id.wrapping_add(1);

        self.runs.insert(run_id, Run::default());
        self.start_search(state, run_id, seed, now);

        run_id
    }

    /// Abandons every run in progress without reporting outcomes.
    pub fn cancel_all(&mut self) {
        if !self.runs.is_empty() {
            debug!(runs = self.runs.len(), "cancelling nearest node searches");
        }

        self.runs.clear();
        self.searches.clear();
    }

    /// Drains the outcomes of the runs completed since the last call.
    pub fn take_outcomes(&mut self) -> Vec<PnsOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Fails the searches that have exceeded the search timeout.
    pub fn poll(&mut self, state: &mut NodeState, now: OffsetDateTime) {
        let timeout = state.config.nearest_node_search_timeout;
        let expired: Vec<Nonce> = self
            .searches
            .iter()
            .filter(|(_, search)| elapsed(search.started_at, now) >= timeout)
            .map(|(&req_id, _)| req_id)
            .collect();

        for req_id in expired {
            warn!(req_id, "nearest node search timed out");
            self.finish(state, req_id, Err(Error::SearchTimedOut), now);
        }
    }

    fn start_search(&mut self, state: &mut NodeState, run_id: RunId, seed: SocketAddr, now: OffsetDateTime) {
        let req_id: Nonce = rand::random();

        if let Some(run) = self.runs.get_mut(&run_id) {
            run.attempts += 1;
            run.used.insert(seed);
            debug!(run_id, attempt = run.attempts, %seed, "starting nearest node search");
        }

        self.searches.insert(
            req_id,
            Search {
                run_id,
                phase: Phase::AwaitingLeafset,
                started_at: now,
                depth: Some(state.config.max_routing_table_depth),
                round: 0,
                best: None,
                probes: HashMap::new(),
                discovered: Vec::new(),
            },
        );

        state.send(seed, Message::PnsLeafsetRequest(PnsLeafsetRequest { req_id }));
    }

    /// Handles the seed's leafset.
    pub fn handle_leafset(
        &mut self,
        state: &mut NodeState,
        source_id: NodeId,
        source_addr: SocketAddr,
        response: PnsLeafset,
        now: OffsetDateTime,
    ) {
        let req_id = response.req_id;
        let search = match self.searches.get_mut(&req_id) {
            Some(search) if search.phase == Phase::AwaitingLeafset => search,
            _ => {
                trace!(req_id, "unexpected leafset response");
                return;
            }
        };

        let peers: Vec<(NodeId, SocketAddr)> = response
            .leafset
            .into_iter()
            .filter(|(id, _)| *id != state.local_id)
            .collect();

        if peers.is_empty() {
            // A lone seed is the best there is.
            let result = PnsResult {
                id: source_id,
                addr: source_addr,
                rtt: state.config.insufficient_peers_rtt,
            };
            self.finish(state, req_id, Ok(result), now);
            return;
        }

        probe(state, req_id, search, peers, now);
    }

    /// Handles an RTT probe answer.
    pub fn handle_rtt_probe_echo(&mut self, state: &mut NodeState, echo: PnsRttProbe, now: OffsetDateTime) {
        let req_id = echo.req_id;
        let search = match self.searches.get_mut(&req_id) {
            Some(search) if search.phase == Phase::AwaitingProbes => search,
            _ => {
                trace!(req_id, "late probe answer discarded");
                return;
            }
        };

        let probe = match search.probes.remove(&echo.probe_id) {
            Some(probe) if probe.round == search.round => probe,
            _ => {
                trace!(req_id, "stale probe answer discarded");
                return;
            }
        };

        let rtt = elapsed(probe.sent_at, now);
        if matches!(search.best, Some(best) if best.rtt <= rtt) {
            // The previous round's winner is still the closest.
            let best = search.best;
            self.finish_with_best(state, req_id, best, now);
            return;
        }

        trace!(req_id, peer = %probe.id, ?rtt, "new nearest node candidate");
        search.best = Some(PnsResult {
            id: probe.id,
            addr: probe.addr,
            rtt,
        });

        match search.depth {
            Some(depth) => {
                search.phase = Phase::AwaitingRow;
                search.probes.clear();
                state.send(
                    probe.addr,
                    Message::PnsRoutingRowRequest(PnsRoutingRowRequest { req_id, depth }),
                );
            }
            None => {
                let best = search.best;
                self.finish_with_best(state, req_id, best, now);
            }
        }
    }

    /// Handles the routing row of the best node so far.
    pub fn handle_routing_row(&mut self, state: &mut NodeState, response: PnsRoutingRow, now: OffsetDateTime) {
        let req_id = response.req_id;
        let search = match self.searches.get_mut(&req_id) {
            Some(search) if search.phase == Phase::AwaitingRow => search,
            _ => {
                trace!(req_id, "unexpected routing row");
                return;
            }
        };

        let best_id = search.best.map(|best| best.id);
        let peers: Vec<(NodeId, SocketAddr)> = response
            .routing_row
            .unwrap_or_default()
            .into_iter()
            .filter(|peer| peer.id != state.local_id && Some(peer.id) != best_id)
            .map(|peer| (peer.id, peer.addr))
            .collect();

        if peers.is_empty() {
            let best = search.best;
            self.finish_with_best(state, req_id, best, now);
            return;
        }

        search.depth = response.depth.checked_sub(1);
        probe(state, req_id, search, peers, now);
    }

    /// Answers another node's leafset request.
    pub fn handle_leafset_request(state: &mut NodeState, source_addr: SocketAddr, request: PnsLeafsetRequest) {
        let response = PnsLeafset {
            req_id: request.req_id,
            leafset: state.leafset.compressed(),
        };

        state.send(source_addr, Message::PnsLeafset(response));
    }

    /// Answers another node's routing row request with the deepest occupied row not past the
    /// requested depth.
    pub fn handle_routing_row_request(
        state: &mut NodeState,
        source_addr: SocketAddr,
        request: PnsRoutingRowRequest,
    ) {
        let (depth, routing_row) = match state.routing_table.deepest_row(request.depth) {
            Some((depth, row)) => (depth, Some(row)),
            None => (0, None),
        };

        let response = PnsRoutingRow {
            req_id: request.req_id,
            depth,
            routing_row,
        };

        state.send(source_addr, Message::PnsRoutingRow(response));
    }

    /// Echoes an RTT probe.
    pub fn handle_rtt_probe(state: &mut NodeState, source_addr: SocketAddr, probe: PnsRttProbe) {
        state.send(source_addr, Message::PnsRttProbeEcho(probe));
    }

    fn finish_with_best(
        &mut self,
        state: &mut NodeState,
        req_id: Nonce,
        best: Option<PnsResult>,
        now: OffsetDateTime,
    ) {
        let result = best.ok_or(Error::NoSearchResult);
        self.finish(state, req_id, result, now);
    }

    // Ends a search and either retries the run from an unused address or reports its outcome.
    fn finish(
        &mut self,
        state: &mut NodeState,
        req_id: Nonce,
        result: Result<PnsResult, Error>,
        now: OffsetDateTime,
    ) {
        let search = match self.searches.remove(&req_id) {
            Some(search) => search,
            None => return,
        };

        let run_id = search.run_id;
        let run = match self.runs.get_mut(&run_id) {
            Some(run) => run,
            None => return,
        };

        for addr in search.discovered {
            if !run.discovered.contains(&addr) {
                run.discovered.push(addr);
            }
        }

        match result {
            Ok(found) => {
                debug!(run_id, peer = %found.id, rtt = ?found.rtt, "nearest node search finished");
                if run.best.map_or(true, |best| found.rtt < best.rtt) {
                    run.best = Some(found);
                }
            }
            Err(e) => {
                debug!(run_id, error = %e, "nearest node search failed");
                run.last_error = Some(e);
            }
        }

        let unused: Vec<SocketAddr> = run
            .discovered
            .iter()
            .filter(|addr| !run.used.contains(*addr))
            .copied()
            .collect();

        if run.attempts < state.config.max_pns_attempts {
            if let Some(&seed) = unused.choose(&mut thread_rng()) {
                self.start_search(state, run_id, seed, now);
                return;
            }
        }

        if let Some(run) = self.runs.remove(&run_id) {
            let result = match (run.best, run.last_error) {
                (Some(best), _) => Ok(best),
                (None, Some(e)) => Err(e),
                (None, None) => Err(Error::NoSearchResult),
            };

            self.outcomes.push(PnsOutcome {
                run_id,
                result,
                discovered: run.discovered,
            });
        }
    }
}

// Sends a new round of probes.
fn probe(
    state: &mut NodeState,
    req_id: Nonce,
    search: &mut Search,
    peers: Vec<(NodeId, SocketAddr)>,
    now: OffsetDateTime,
) {
    search.round += 1;
    search.phase = Phase::AwaitingProbes;
    search.probes.clear();

    for (id, addr) in peers {
        if !search.discovered.contains(&addr) {
            search.discovered.push(addr);
        }

        let probe_id: Nonce = rand::random();
        search.probes.insert(
            probe_id,
            PendingProbe {
                id,
                addr,
                sent_at: now,
                round: search.round,
            },
        );

        state.send(addr, Message::PnsRttProbe(PnsRttProbe { req_id, probe_id }));
    }
}
