//! Destruction-time classification of a finished query.
//!
//! Mirrors `dq_free`'s `GNR_DYN_QUERIES_COMPLETED_*`/`GNR_DYN_QUERIES_LINGER_*`
//! counters. Pure bookkeeping computed once at destruction; this crate does
//! not wire it into any stats sink (that stays out of scope), but exposes it
//! so an embedder's own counters can do so.

use crate::query::{Query, QueryFlags};

/// How many of the target result count a query actually gathered before it
/// stopped querying (entered Linger or was force-destroyed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryCompletion {
    /// Reached (or exceeded) `max_results`.
    Full,
    /// Got some hits, but never reached `max_results`.
    Partial,
    /// No hits at all.
    Zero,
}

/// Summary of a query's whole life, returned when it is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOutcome {
    pub completion: QueryCompletion,
    /// Did this query pass through the Linger state before destruction.
    pub lingered: bool,
    /// Hits counted during Linger alone (late/OOB arrivals after the query
    /// had already stopped actively querying).
    pub linger_extra_results: u32,
    pub total_results: u32,
    pub up_sent: u32,
}

impl QueryOutcome {
    /// `avg_ultra_nodes` is the leaf-fan-out divisor (`DqConfig::avg_ultra_nodes`)
    /// used to attribute a leaf's reported `kept_results` share to us; a
    /// locally-originated query divides by 1 (it sees its own kept count
    /// directly), matching `dq_free`'s `node_id == NODE_ID_SELF ? 1 : ...`.
    pub(crate) fn classify(query: &Query, avg_ultra_nodes: u32) -> Self {
        let divisor = if query.origin.is_local() { 1 } else { avg_ultra_nodes.max(1) };
        let forced_full = query.flags.intersects(QueryFlags::USR_CANCELLED | QueryFlags::ID_CLEANING)
            || query.kept_results / divisor >= query.max_results;

        let completion = if query.results >= query.max_results || forced_full {
            QueryCompletion::Full
        } else if query.results > 0 {
            QueryCompletion::Partial
        } else {
            QueryCompletion::Zero
        };

        QueryOutcome {
            completion,
            lingered: query.is_lingering(),
            linger_extra_results: query.linger_results,
            total_results: query.results,
            up_sent: query.up_sent,
        }
    }
}
