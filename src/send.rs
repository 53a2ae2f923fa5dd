//! Send accounting (spec §4.3): metadata that rides along an outgoing
//! probe through the transport's asynchronous send path, so that on
//! disposal the controller learns whether it was actually transmitted.

use crate::horizon::HorizonTable;
use crate::ids::{NodeId, QueryId};
use crate::query::Query;

/// Metadata captured when a probe is handed to the transport. Carries a
/// plain [`QueryId`] rather than a pointer-plus-generation pair: because
/// the registry removes a query's id from its map at destruction, a
/// disposal callback's `query` field either still resolves (query alive)
/// or does not (destroyed), which is exactly the liveness check spec §9
/// asks for, without the original's "pointer could be reused" hazard.
#[derive(Debug, Copy, Clone)]
pub struct ProbeDescriptor {
    pub query: QueryId,
    pub peer: NodeId,
    pub degree: u32,
    pub ttl: u8,
}

/// Outcome of applying a disposal callback to a still-live query: whether
/// the caller must now arm the results timer to fire immediately because
/// nothing else is outstanding (spec §4.3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DisposalOutcome {
    pub reschedule_results_now: bool,
}

/// Apply a probe disposal to a *known-live* query (the caller — the
/// controller's registry lookup — has already re-validated liveness by
/// `probe.query`). Updates `pending`, `queried`, `horizon` and `up_sent`
/// per the rules in spec §4.3.
pub fn apply_disposal(
    query: &mut Query,
    horizon_table: &HorizonTable,
    probe: &ProbeDescriptor,
    was_sent: bool,
) -> DisposalOutcome {
    debug_assert!(query.pending > 0);
    query.pending -= 1;

    if was_sent {
        query.horizon = query
            .horizon
            .saturating_add(horizon_table.horizon_unchecked(probe.degree, probe.ttl));
        query.up_sent += 1;
        DisposalOutcome {
            reschedule_results_now: false,
        }
    } else {
        query.queried.remove(&probe.peer);
        let reschedule = query.pending == 0 && query.results_timer.is_some();
        DisposalOutcome {
            reschedule_results_now: reschedule,
        }
    }
}
