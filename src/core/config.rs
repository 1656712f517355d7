//! Overlay tuning parameters.

use std::time::Duration;

use crate::core::error::Error;

/// The port assumed for bootstrap endpoints that don't specify one.
pub const DEFAULT_PORT: u16 = 4728;

/// Configuration shared by every component of an [`OverlayNode`](crate::OverlayNode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The maximum number of leafset members, half on either side of the local identifier.
    pub leafset_size: usize,
    /// The port used for bootstrap endpoints given without one.
    pub default_port: u16,

    /// How long a departed peer is kept out of the leafset.
    pub departed_peer_retention: Duration,
    /// How long an unconfirmed leafset candidate is kept.
    pub candidate_peer_retention: Duration,
    /// A leafset member not heard from for this long is considered gone.
    pub timed_out_peer_interval: Duration,

    pub heartbeat_check_interval: Duration,
    /// The minimum time between two heartbeats sent to the same leafset peer.
    pub heartbeat_interval: Duration,
    pub purge_interval: Duration,
    pub routing_candidate_probe_interval: Duration,
    pub routing_table_maintenance_interval: Duration,
    /// How long a routing table candidate waits to be confirmed by an RTT probe.
    pub routing_candidate_retention: Duration,
    /// How long a route correction proposed to a sender isn't proposed again.
    pub proposed_better_routing_hops_retention: Duration,
    /// The RTT assumed for routing table entries that were never measured.
    pub long_round_trip_time: Duration,

    pub pending_request_check_interval: Duration,
    pub bootstrap_retry_interval: Duration,

    /// Whether joins look for a topologically close entry point first.
    pub use_pns: bool,
    pub nearest_node_search_timeout: Duration,
    /// The RTT reported for a seed that had no peers to compare it against.
    pub insufficient_peers_rtt: Duration,
    pub max_pns_attempts: usize,
    pub max_routing_table_depth: usize,

    /// Whether leafset peers are told about a graceful departure.
    pub notify_peers_on_leave: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            leafset_size: 20,
            default_port: DEFAULT_PORT,

            departed_peer_retention: Duration::from_secs(60),
            candidate_peer_retention: Duration::from_secs(60),
            timed_out_peer_interval: Duration::from_secs(35),

            heartbeat_check_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            purge_interval: Duration::from_millis(2500),
            routing_candidate_probe_interval: Duration::from_secs(1),
            routing_table_maintenance_interval: Duration::from_secs(15 * 60),
            routing_candidate_retention: Duration::from_secs(60),
            proposed_better_routing_hops_retention: Duration::from_secs(10 * 60),
            long_round_trip_time: Duration::from_secs(10),

            pending_request_check_interval: Duration::from_secs(1),
            bootstrap_retry_interval: Duration::from_secs(30),

            use_pns: true,
            nearest_node_search_timeout: Duration::from_secs(20),
            insufficient_peers_rtt: Duration::from_secs(10),
            max_pns_attempts: 3,
            max_routing_table_depth: 10,

            notify_peers_on_leave: true,
        }
    }
}

impl Config {
    /// Checks the parameters that can't be corrected at runtime.
    pub fn validate(&self) -> Result<(), Error> {
        validate_leafset_size(self.leafset_size)
    }
}

pub(crate) fn validate_leafset_size(size: usize) -> Result<(), Error> {
    if size == 0 {
        return Err(Error::ZeroLeafsetSize);
    }
    if size % 2 != 0 {
        return Err(Error::OddLeafsetSize(size));
    }

    Ok(())
}
