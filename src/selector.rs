//! Next-UP candidate selection (spec §4.2).
//!
//! Two variants share the same eligibility filter and per-candidate
//! caching: the general iterative selector (sorted by queue depth with a
//! QRP-match tiebreaker) and the probe selector (QRP-prefiltered, sorted
//! by queue depth alone).

use crate::config::DqConfig;
use crate::ids::NodeId;
use crate::query::{CachedCandidate, Query};
use crate::traits::{PeerRegistry, QrpMatcher, Transport};

/// A candidate neighbor, with its previous-invocation cache carried
/// forward (spec §4.2: "Caching is essential").
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node: NodeId,
    pub can_route: Option<bool>,
    pub pending_queue_bytes: Option<u32>,
}

fn base_eligible<T: Transport, P: PeerRegistry>(
    node: NodeId,
    transport: &T,
    peers: &P,
) -> bool {
    let attrs = match peers.peer_attributes(node) {
        Some(a) => a,
        None => return false,
    };
    if !attrs.handshake_complete || !attrs.writable {
        return false;
    }
    if transport.in_tx_flow_control(node) || transport.hops_flow(node) == 0 {
        return false;
    }
    true
}

/// Fill candidates for the iterative step: every eligible ultrapeer not
/// already in `query.queried`, cached `can_route`/queue-depth state
/// carried over from `query.cached_candidates` when the same peer
/// recurs.
pub fn fill_next_up<T: Transport, P: PeerRegistry>(
    query: &mut Query,
    transport: &T,
    peers: &P,
) -> Vec<Candidate> {
    let all = peers.all_ultrapeers();
    let mut out = Vec::with_capacity(all.len());

    for node in all {
        if query.queried.contains(&node) {
            continue;
        }
        if !base_eligible(node, transport, peers) {
            continue;
        }

        let prior = query
            .cached_candidates
            .iter()
            .find(|c| c.node == node);

        out.push(Candidate {
            node,
            can_route: prior.and_then(|c| c.can_route),
            pending_queue_bytes: prior.and_then(|c| c.pending_queue_bytes),
        });
    }

    // Replace the cache with exactly what we found this round; stale
    // entries for peers that dropped out are naturally not carried
    // forward.
    query.cached_candidates = out
        .iter()
        .map(|c| CachedCandidate {
            node: c.node,
            can_route: c.can_route,
            pending_queue_bytes: c.pending_queue_bytes,
        })
        .collect();

    out
}

/// Sort candidates by ascending queue depth, with a QRP-match tiebreaker
/// within `mq_epsilon` bytes of each other. Lazily computes and caches
/// `can_route` the first time a comparison needs it.
pub fn sort_next_up<Q: QrpMatcher>(
    candidates: &mut Vec<Candidate>,
    query: &Query,
    transport: &impl Transport,
    qrp: &Q,
    config: &DqConfig,
) {
    for c in candidates.iter_mut() {
        if c.pending_queue_bytes.is_none() {
            c.pending_queue_bytes = Some(transport.pending_bytes(c.node));
        }
    }

    // Resolve can_route lazily but deterministically up front so the
    // comparator stays a pure total order (sort_by requires this); this
    // differs cosmetically from the original's resolve-during-compare
    // trick but preserves its "only call qrp once per candidate" contract.
    for c in candidates.iter_mut() {
        if c.can_route.is_none() {
            c.can_route = Some(qrp.can_route(c.node, &query.qhv));
        }
    }

    candidates.sort_by(|a, b| {
        let qa = a.pending_queue_bytes.unwrap_or(0);
        let qb = b.pending_queue_bytes.unwrap_or(0);
        let diff = (qa as i64 - qb as i64).abs();
        if diff < config.mq_epsilon as i64 {
            let ra = a.can_route.unwrap_or(false);
            let rb = b.can_route.unwrap_or(false);
            if ra == rb {
                qa.cmp(&qb)
            } else if ra {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        } else {
            qa.cmp(&qb)
        }
    });
}

/// Fill candidates for the initial probe: ultrapeers that already match
/// the query's QRP vector, regardless of `query.queried` (the probe
/// always runs once, before anything has been queried). Bounded by
/// `config.max_connections`, mirroring the original's `nv = walloc(ncount
/// * sizeof nv[0])` where `ncount` is the node's connection-slot count
/// (`original_source/src/core/dq.c`), not an arbitrary small constant.
pub fn fill_probe_up<T: Transport, P: PeerRegistry, Q: QrpMatcher>(
    query: &Query,
    transport: &T,
    peers: &P,
    qrp: &Q,
    config: &DqConfig,
) -> Vec<NodeId> {
    let cap = config.max_connections as usize;
    let mut out = Vec::with_capacity(cap.min(64));

    for node in peers.all_ultrapeers() {
        if out.len() >= cap {
            break;
        }
        if !base_eligible(node, transport, peers) {
            continue;
        }
        if !qrp.can_route(node, &query.qhv) {
            continue;
        }
        out.push(node);
    }

    out
}

/// Sort probe candidates by ascending queue depth only (no QRP
/// tiebreaker: every candidate already matched by construction).
pub fn sort_probe_up<T: Transport>(candidates: &mut [NodeId], transport: &T) {
    let mut keyed: Vec<(NodeId, u32)> = candidates
        .iter()
        .map(|&n| (n, transport.pending_bytes(n)))
        .collect();
    keyed.sort_by_key(|&(_, bytes)| bytes);
    for (slot, (node, _)) in candidates.iter_mut().zip(keyed) {
        *slot = node;
    }
}
