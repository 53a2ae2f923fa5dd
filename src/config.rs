//! Tunable constants for the dynamic query controller.
//!
//! Every value here has a direct counterpart in gtk-gnutella's `dq.c`
//! `#define`s (spec §2/§7). They are gathered into one struct, rather than
//! left as crate-wide constants, so an embedding application can override
//! them per-[`DqController`](crate::controller::DqController) instance —
//! useful chiefly for tests, which want short timeouts and small horizons.

use std::time::Duration;

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct DqConfig {
    /// Hard destruction deadline from creation, regardless of state (§4.4.8).
    pub max_lifetime: Duration,
    /// How long a terminated query lingers, absorbing late hits (§4.4.8).
    pub linger_timeout: Duration,
    /// How long we wait for a leaf's query-status reply (§4.4.5).
    pub status_timeout: Duration,
    /// Initial per-probe result-wait timeout (§4.4.2/4.4.3).
    pub query_timeout: Duration,
    /// Extra wait added per probed connection during the initial probe (§4.4.2).
    pub probe_timeout: Duration,
    /// Extra wait added per pending (unacked) message (§4.4.3).
    pub pending_timeout: Duration,
    /// Floor below which `result_timeout` is never shortened (§4.4.3).
    pub min_timeout: Duration,
    /// Amount `result_timeout` is shortened by on low yield (§4.4.3).
    pub timeout_adjust: Duration,

    /// Max number of unacked probes in flight before we must wait (§4.4.3).
    pub max_pending: u32,
    /// Max consecutive status-request timeouts before giving up on guidance (§4.4.5).
    pub max_stat_timeout: u32,
    /// Minimum new ultrapeers probed between guidance requests (§4.4.5).
    pub stat_threshold: u32,
    /// Minimum new hits seen since last guidance before asking again (§4.4.5).
    pub min_for_guidance: u32,

    /// Target result count for leaf-originated queries (§4.4.1).
    pub leaf_results: u32,
    /// Target result count for locally-originated queries (§4.4.1).
    pub local_results: u32,
    /// Divisor applied to the target when the query carries a hash URN (§4.4.1).
    pub sha1_decimator: u32,
    /// Number of ultrapeers probed in the initial fan-out (§4.4.2).
    pub probe_up: u32,
    /// Theoretical horizon at which we stop regardless of result count (§4.4.3).
    pub max_horizon: u32,
    /// Horizon below which the timeout-adjustment heuristic does not apply (§4.4.3).
    pub min_horizon: u32,
    /// Result count used by the low-yield timeout heuristic (§4.4.3).
    pub low_results: u32,
    /// Percent of raw hits assumed kept, worst case, used to size `fin_results` (§4.4.1).
    pub percent_kept: u32,
    /// Average number of ultrapeers a leaf queries through (§4.4.1/4.4.3).
    pub avg_ultra_nodes: u32,

    /// Maximum TTL this controller will ever use (§4.4.1).
    pub max_ttl: u8,
    /// Upper bound of the degree axis of the horizon table (§4.1).
    pub max_degree: u32,

    /// Total peer-connection slots this node maintains, used by termination
    /// check #4 (§4.4.3). Not a named constant in spec §6/§7's timer table;
    /// carried over from the original's `current_peermode`-derived globals
    /// (see DESIGN.md).
    pub max_connections: u32,
    /// Of `max_connections`, how many are reserved for non-dynamic-query
    /// traffic (§4.4.3, termination check #4).
    pub normal_connections: u32,

    /// Queue-depth window within which two candidates are considered tied (§4.2).
    pub mq_epsilon: u32,
    /// Per-hop attenuation applied to the theoretical horizon (§4.1).
    pub fuzzy_factor: f64,
}

impl Default for DqConfig {
    fn default() -> Self {
        DqConfig {
            max_lifetime: Duration::from_millis(600_000),
            linger_timeout: Duration::from_millis(180_000),
            status_timeout: Duration::from_millis(40_000),
            query_timeout: Duration::from_millis(3_700),
            probe_timeout: Duration::from_millis(1_500),
            pending_timeout: Duration::from_millis(1_200),
            min_timeout: Duration::from_millis(1_500),
            timeout_adjust: Duration::from_millis(100),

            max_pending: 3,
            max_stat_timeout: 2,
            stat_threshold: 3,
            min_for_guidance: 20,

            leaf_results: 50,
            local_results: 150,
            sha1_decimator: 25,
            probe_up: 3,
            max_horizon: 500_000,
            min_horizon: 3_000,
            low_results: 10,
            percent_kept: 5,
            avg_ultra_nodes: 3,

            max_ttl: 5,
            max_degree: 50,

            max_connections: 50,
            normal_connections: 5,

            mq_epsilon: 2048,
            fuzzy_factor: 0.80,
        }
    }
}
