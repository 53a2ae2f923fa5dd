//! The `Query` data model (spec §3): one active dynamic search.

use std::collections::HashSet;
use std::time::Duration;

use smallvec::SmallVec;

use crate::clock::{Instant, TimerId};
use crate::ids::{AliveHandle, Muid, NodeId, QueryId, SearchHandle};
use crate::traits::{QueryHashVector, QuerySpeedFlags};

bitflags::bitflags! {
    /// Disjoint operational flags carried by a query (spec §3).
    #[derive(Default)]
    pub struct QueryFlags: u32 {
        /// Past active querying; only absorbing late hits until destroyed.
        const LINGER            = 1 << 0;
        /// The originating leaf reports kept-result counts to us.
        const LEAF_GUIDED        = 1 << 1;
        /// A query-status request is outstanding, results timer is the status timeout.
        const WAITING_GUIDANCE   = 1 << 2;
        /// We have received at least one guidance report (solicited or not).
        const GOT_GUIDANCE       = 1 << 3;
        /// The user (leaf or local) asked us to stop; suppresses hit forwarding.
        const USR_CANCELLED      = 1 << 4;
        /// We will personally see hits for this query (OOB-proxied or non-OOB).
        const ROUTING_HITS       = 1 << 5;
        /// A bulk per-node cleanup is already removing this query from indexes.
        const ID_CLEANING        = 1 << 6;
        /// Shutdown is tearing down every query; suppress index maintenance.
        const EXITING            = 1 << 7;
        /// This query's slot has already been removed from the per-node index.
        const REMOVED            = 1 << 8;
    }
}

/// Where a query came from, replacing gtk-gnutella's `NODE_ID_SELF`
/// sentinel (spec §9 design note) with a proper sum type.
#[derive(Debug, Clone)]
pub enum QueryOrigin {
    /// Issued by the local host itself.
    Local(SearchHandle),
    /// Forwarded from a leaf attached to this ultrapeer.
    Remote {
        peer: NodeId,
        /// MUID the leaf itself knows about, when it differs from the
        /// on-wire MUID this node emits (OOB-proxied queries).
        leaf_muid: Option<Muid>,
        alive: AliveHandle,
    },
}

impl QueryOrigin {
    pub fn peer(&self) -> Option<NodeId> {
        match self {
            QueryOrigin::Local(_) => None,
            QueryOrigin::Remote { peer, .. } => Some(*peer),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, QueryOrigin::Local(_))
    }
}

/// A cached candidate entry from the previous next-UP selection (spec
/// §4.2), reused across invocations so the expensive QRP match test is
/// not repeated for peers that recur.
#[derive(Debug, Clone)]
pub struct CachedCandidate {
    pub node: NodeId,
    pub can_route: Option<bool>,
    pub pending_queue_bytes: Option<u32>,
}

/// One active dynamic search (spec §3).
pub struct Query {
    pub id: QueryId,
    pub muid: Muid,
    pub origin: QueryOrigin,
    pub qhv: QueryHashVector,
    pub query_flags: QuerySpeedFlags,

    pub queried: HashSet<NodeId>,
    pub ttl: u8,
    pub horizon: u32,
    pub up_sent: u32,
    pub last_status: u32,
    pub pending: u32,

    pub results: u32,
    pub new_results: u32,
    pub linger_results: u32,
    pub oob_results: u32,
    pub kept_results: u32,

    pub max_results: u32,
    pub fin_results: u32,

    pub flags: QueryFlags,

    pub expire_timer: Option<TimerId>,
    pub results_timer: Option<TimerId>,

    pub result_timeout: Duration,
    pub stat_timeouts: u32,

    pub start_time: Instant,
    pub stop_time: Option<Instant>,

    /// Previously computed next-UP vector, retained across iterative
    /// steps purely for the `can_route`/queue-depth cache (spec §4.2).
    pub cached_candidates: SmallVec<[CachedCandidate; 8]>,
}

impl Query {
    pub fn is_lingering(&self) -> bool {
        self.flags.contains(QueryFlags::LINGER)
    }

    pub fn is_waiting_guidance(&self) -> bool {
        self.flags.contains(QueryFlags::WAITING_GUIDANCE)
    }
}
