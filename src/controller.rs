//! The `DqController` facade (spec §4.4, §6): owns every live query and
//! exposes the ten operations embedding applications drive it through.
//!
//! Encapsulated in a value created once at startup (spec §9: "Encapsulate in
//! a `DqController` value... not ambient globals") rather than the
//! process-wide singleton the original uses.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::clock::{Clock, Instant, TimerKind, TimerWheel};
use crate::config::DqConfig;
use crate::error::DqError;
use crate::horizon::HorizonTable;
use crate::ids::{AliveHandle, Muid, NodeId, QueryId, QueryIdGen, SearchHandle};
use crate::outcome::QueryOutcome;
use crate::query::{Query, QueryFlags, QueryOrigin};
use crate::registry::Registry;
use crate::selector;
use crate::send::{self, ProbeDescriptor};
use crate::traits::{
    HitStatus, LocalSearch, OobProxy, PeerRegistry, QrpMatcher, QueryHashVector, QuerySpeedFlags,
    Transport, VendorMessages,
};

/// Small constant floor used by the TTL-selection heuristic so a
/// near-zero `results_per_host` does not blow `want_hosts` up to infinity.
const RATE_EPSILON: f64 = 1e-6;

/// Sentinel kept-count meaning "stop the query entirely" (spec §4.4.7).
const STOP_SENTINEL: u32 = 0xFFFF;

type Disposal = (ProbeDescriptor, bool);

/// Owns every live dynamic query plus the collaborators it needs (spec §6):
/// a message transport, the peer/QRP/OOB/local-search/vendor-message
/// interfaces, and a clock. Generic over all of them so an embedder pays no
/// dynamic-dispatch cost wiring in its real implementations, while this
/// crate's own tests plug in fakes (see `tests/support`).
pub struct DqController<C, T, P, Q, O, L, V> {
    config: DqConfig,
    horizon: HorizonTable,
    clock: C,
    timers: TimerWheel,
    registry: Registry,
    ids: QueryIdGen,

    transport: T,
    peers: P,
    qrp: Q,
    oob: O,
    local: L,
    vendor: V,

    disposals: Rc<RefCell<VecDeque<Disposal>>>,
    destroyed: VecDeque<(QueryId, QueryOutcome)>,
    closed: bool,
}

impl<C, T, P, Q, O, L, V> DqController<C, T, P, Q, O, L, V>
where
    C: Clock,
    T: Transport,
    P: PeerRegistry,
    Q: QrpMatcher,
    O: OobProxy,
    L: LocalSearch,
    V: VendorMessages,
{
    pub fn new(clock: C, transport: T, peers: P, qrp: Q, oob: O, local: L, vendor: V) -> Self {
        Self::with_config(DqConfig::default(), clock, transport, peers, qrp, oob, local, vendor)
    }

    pub fn with_config(
        config: DqConfig,
        clock: C,
        transport: T,
        peers: P,
        qrp: Q,
        oob: O,
        local: L,
        vendor: V,
    ) -> Self {
        let horizon = HorizonTable::new(&config);
        DqController {
            config,
            horizon,
            clock,
            timers: TimerWheel::new(),
            registry: Registry::new(),
            ids: QueryIdGen::default(),
            transport,
            peers,
            qrp,
            oob,
            local,
            vendor,
            disposals: Rc::new(RefCell::new(VecDeque::new())),
            destroyed: VecDeque::new(),
            closed: false,
        }
    }

    /// Re-open a controller previously [`close`](Self::close)d. A fresh
    /// controller is already initialized; `init`/`close` exist so an
    /// embedder can symmetrically tear down and restart one instance.
    pub fn init(&mut self) {
        self.closed = false;
    }

    /// Destroy every live query (marking it `EXITING` to suppress re-entrant
    /// index maintenance, per spec §4.4.9), then refuse further launches
    /// until [`init`](Self::init) is called again.
    pub fn close(&mut self) {
        let ids: Vec<QueryId> = self.registry.iter_ids().collect();
        for id in ids {
            if let Some(q) = self.registry.get_mut(id) {
                q.flags.insert(QueryFlags::EXITING);
            }
            self.destroy_query(id);
        }
        if !self.registry.is_empty() {
            warn!(target: "dq", "shutdown leaves {} orphaned quer(y/ies) in the registry", self.registry.len());
        }
        self.closed = true;
    }

    /// Drain the outcomes of queries destroyed since the last call (spec
    /// §4.4 [ADDED]: the `Destroyed` lifecycle event, paired with its
    /// [`QueryOutcome`]).
    pub fn drain_destroyed(&mut self) -> Vec<(QueryId, QueryOutcome)> {
        self.destroyed.drain(..).collect()
    }

    /// Advance time: fire every timer due at the clock's current time and
    /// drive the corresponding state transition. An embedding event loop
    /// calls this (and [`next_deadline`](Self::next_deadline) to know when
    /// to call it again) the way it would poll any other timer wheel.
    ///
    /// Also drains any disposal callbacks that resolved since the last
    /// drain: a transport that completes `enqueue` synchronously (as this
    /// crate's own test fakes mostly do) is drained inline by
    /// `dispatch_probe` already, but a transport that resolves on a later
    /// tick needs some point where the controller is re-entered to notice;
    /// this is that point.
    pub fn poll_timers(&mut self) {
        self.drain_disposals();
        let now = self.clock.now();
        let fired = self.timers.fire_due(now);
        for (_timer_id, qid, kind) in fired {
            match kind {
                TimerKind::Results => self.on_results_timer(qid),
                TimerKind::Expire => {
                    trace!(target: "dq", "expire/linger timer fired for {}", qid);
                    let already_lingering = self
                        .registry
                        .get(qid)
                        .map(|q| q.is_lingering())
                        .unwrap_or(false);
                    if already_lingering {
                        self.destroy_query(qid);
                    } else {
                        self.terminate(qid);
                    }
                }
            }
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Read-only access to a live query's state, for introspection by an
    /// embedder (or a test) without exposing the registry itself.
    pub fn query(&self, id: QueryId) -> Option<&Query> {
        self.registry.get(id)
    }

    pub fn query_count(&self) -> usize {
        self.registry.len()
    }

    /// Mutable access to the clock driving this controller — chiefly so
    /// tests using [`crate::clock::FakeClock`] can advance time by hand.
    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    // ---- Lifecycle: launch -------------------------------------------------

    /// Launch a query forwarded to us from an attached leaf (spec §4.4.1).
    pub fn launch_from_peer(
        &mut self,
        peer: NodeId,
        alive: AliveHandle,
        muid: Muid,
        leaf_muid: Option<Muid>,
        qhv: QueryHashVector,
        query_flags: QuerySpeedFlags,
        ttl: u8,
    ) -> Result<QueryId, DqError> {
        if self.closed {
            return Err(DqError::AlreadyClosed);
        }

        let id = self.ids.next();
        let ttl = ttl.min(self.config.max_ttl).max(1);

        let has_urn = qhv.has_urn;
        let max_results = Self::initial_max_results(&self.config, self.config.leaf_results, has_urn);
        let fin_results = max_results * 100 / self.config.percent_kept.max(1);

        let vendor_supports = self
            .peers
            .peer_attributes(peer)
            .map(|a| a.vendor_supports_guidance)
            .unwrap_or(false);

        let mut flags = QueryFlags::empty();
        if query_flags.contains(QuerySpeedFlags::LEAF_GUIDED) || vendor_supports {
            flags.insert(QueryFlags::LEAF_GUIDED);
        }

        let already_proxied = self.oob.muid_proxied(muid).is_some();
        let mut installed_proxy = false;
        if !flags.contains(QueryFlags::LEAF_GUIDED) && !already_proxied {
            if query_flags.contains(QuerySpeedFlags::OOB_REPLY) {
                self.oob.create_proxy(peer);
                installed_proxy = true;
            }
            // else: no proxy to install; the OOB flag, if clear, already
            // routes hits back through ordinary paths.
        }

        // Per spec §9's documented source ambiguity (boolean AND where
        // bitwise AND looks intended): we preserve the observable contract
        // rather than guess at the bug — set ROUTING_HITS when we proxy OOB
        // ourselves, or when the query never escapes our own visibility via
        // OOB at all.
        if installed_proxy || !query_flags.contains(QuerySpeedFlags::OOB_REPLY) {
            flags.insert(QueryFlags::ROUTING_HITS);
        }

        let targets = self.qrp.build_leaf_target(&qhv, 1, ttl, Some(peer));
        debug!(target: "dq", "query {} forwarded to {} local leaf target(s)", id, targets.len());

        let query = Query {
            id,
            muid,
            origin: QueryOrigin::Remote {
                peer,
                leaf_muid,
                alive,
            },
            qhv,
            query_flags,
            queried: Default::default(),
            ttl,
            horizon: 0,
            up_sent: 0,
            last_status: 0,
            pending: 0,
            results: 0,
            new_results: 0,
            linger_results: 0,
            oob_results: 0,
            kept_results: 0,
            max_results,
            fin_results,
            flags,
            expire_timer: None,
            results_timer: None,
            result_timeout: self.config.query_timeout,
            stat_timeouts: 0,
            start_time: self.clock.now(),
            stop_time: None,
            cached_candidates: Default::default(),
        };

        self.register_and_arm(query);
        self.probe(id);
        Ok(id)
    }

    /// Launch a query issued by the local host itself (spec §4.4.1).
    pub fn launch_local(
        &mut self,
        handle: SearchHandle,
        muid: Muid,
        qhv: QueryHashVector,
        ttl: u8,
    ) -> Result<QueryId, DqError> {
        if self.closed {
            return Err(DqError::AlreadyClosed);
        }

        let id = self.ids.next();
        let ttl = ttl.min(self.config.max_ttl).max(1);
        let has_urn = qhv.has_urn;
        let max_results = Self::initial_max_results(&self.config, self.config.local_results, has_urn);
        let fin_results = max_results * 100 / self.config.percent_kept.max(1);

        let targets = self.qrp.build_leaf_target(&qhv, 0, ttl, None);
        debug!(target: "dq", "local query {} forwarded to {} local leaf target(s)", id, targets.len());

        let query = Query {
            id,
            muid,
            origin: QueryOrigin::Local(handle),
            qhv,
            query_flags: QuerySpeedFlags::empty(),
            queried: Default::default(),
            ttl,
            horizon: 0,
            up_sent: 0,
            last_status: 0,
            pending: 0,
            results: 0,
            new_results: 0,
            linger_results: 0,
            oob_results: 0,
            kept_results: 0,
            max_results,
            fin_results,
            // A local search always sees its own hits.
            flags: QueryFlags::ROUTING_HITS,
            expire_timer: None,
            results_timer: None,
            result_timeout: self.config.query_timeout,
            stat_timeouts: 0,
            start_time: self.clock.now(),
            stop_time: None,
            cached_candidates: Default::default(),
        };

        self.register_and_arm(query);
        self.probe(id);
        Ok(id)
    }

    fn initial_max_results(config: &DqConfig, base: u32, has_urn: bool) -> u32 {
        if has_urn {
            (base / config.sha1_decimator.max(1)).max(1)
        } else {
            base
        }
    }

    fn register_and_arm(&mut self, query: Query) {
        let id = query.id;
        self.registry.insert(query);
        let deadline = self.clock.now() + self.config.max_lifetime;
        if let Some(q) = self.registry.get_mut(id) {
            q.expire_timer = Some(self.timers.insert(deadline, id, TimerKind::Expire));
        }
    }

    // ---- Probe (spec §4.4.2) -----------------------------------------------

    fn probe(&mut self, id: QueryId) {
        let query = match self.registry.get_mut(id) {
            Some(q) => q,
            None => return,
        };

        let candidates =
            selector::fill_probe_up(query, &self.transport, &self.peers, &self.qrp, &self.config);
        if candidates.is_empty() {
            trace!(target: "dq", "query {} has no probe candidates, falling through to iterative step", id);
            self.send_next(id);
            return;
        }

        let mut list = candidates;
        selector::sort_probe_up(&mut list, &self.transport);

        let count = list.len() as u32;
        let probe_up = self.config.probe_up;
        let query = self.registry.get_mut(id).unwrap();
        if count > probe_up * 6 {
            query.ttl = query.ttl.saturating_sub(2).max(1);
        } else if count > probe_up * 3 {
            query.ttl = query.ttl.saturating_sub(1).max(1);
        }
        let ttl = query.ttl;

        let mut sent = 0u32;
        for &peer in list.iter().take(probe_up as usize) {
            self.dispatch_probe(id, peer, ttl);
            sent += 1;
        }

        if sent == 0 {
            self.send_next(id);
            return;
        }

        let multiplier = sent.min(probe_up);
        let deadline = self.clock.now() + (self.config.probe_timeout + self.config.query_timeout) * multiplier;
        self.rearm_results_timer(id, deadline);
    }

    // ---- Send accounting (spec §4.3) --------------------------------------

    fn dispatch_probe(&mut self, id: QueryId, peer: NodeId, ttl: u8) {
        let degree = self
            .peers
            .peer_attributes(peer)
            .map(|a| a.degree)
            .unwrap_or(1)
            .max(1);

        if let Some(query) = self.registry.get_mut(id) {
            query.queried.insert(peer);
            query.pending += 1;
        } else {
            return;
        }

        let descriptor = ProbeDescriptor {
            query: id,
            peer,
            degree,
            ttl,
        };
        let disposals = self.disposals.clone();
        trace!(target: "dq", "query {} probing {} at ttl {}", id, peer, ttl);
        self.transport.enqueue(
            peer,
            ttl,
            Box::new(move |was_sent| {
                disposals.borrow_mut().push_back((descriptor, was_sent));
            }),
        );
        self.drain_disposals();
    }

    fn drain_disposals(&mut self) {
        loop {
            let next = self.disposals.borrow_mut().pop_front();
            let (descriptor, was_sent) = match next {
                Some(d) => d,
                None => break,
            };
            let query = match self.registry.get_mut(descriptor.query) {
                Some(q) => q,
                None => continue, // query already gone; discard silently (spec §4.3, §7)
            };
            let outcome = send::apply_disposal(query, &self.horizon, &descriptor, was_sent);
            if outcome.reschedule_results_now {
                let now = self.clock.now();
                self.rearm_results_timer(descriptor.query, now);
            }
        }
    }

    fn rearm_results_timer(&mut self, id: QueryId, deadline: Instant) {
        if let Some(query) = self.registry.get_mut(id) {
            if let Some(old) = query.results_timer.take() {
                self.timers.cancel(old);
            }
            query.results_timer = Some(self.timers.insert(deadline, id, TimerKind::Results));
        }
    }

    // ---- Iterative step (spec §4.4.3) -------------------------------------

    fn send_next(&mut self, id: QueryId) {
        let query = match self.registry.get(id) {
            Some(q) => q,
            None => return,
        };
        if query.is_lingering() {
            return;
        }

        if !self.peers.self_is_ultrapeer() {
            self.terminate(id);
            return;
        }

        let effective_kept = self.effective_kept_results(id);
        let query = self.registry.get(id).unwrap();

        if query.horizon >= self.config.max_horizon || effective_kept >= query.max_results {
            self.terminate(id);
            return;
        }
        if query.results + query.oob_results >= query.fin_results {
            self.terminate(id);
            return;
        }
        let max_conn = self.config.max_connections;
        let normal_conn = self.config.normal_connections;
        if query.up_sent >= max_conn.saturating_sub(normal_conn) {
            self.terminate(id);
            return;
        }

        if query.pending >= self.config.max_pending {
            let deadline = self.clock.now() + query.result_timeout;
            self.rearm_results_timer(id, deadline);
            return;
        }

        let query = self.registry.get_mut(id).unwrap();
        let mut candidates = selector::fill_next_up(query, &self.transport, &self.peers);
        if candidates.is_empty() {
            self.terminate(id);
            return;
        }
        let query = self.registry.get(id).unwrap();
        selector::sort_next_up(&mut candidates, query, &self.transport, &self.qrp, &self.config);

        let connections = candidates.len() as u32;
        let mut chosen = None;
        for candidate in &candidates {
            let attrs = match self.peers.peer_attributes(candidate.node) {
                Some(a) => a,
                None => continue,
            };
            let query = self.registry.get(id).unwrap();
            let ttl = self.select_ttl(id, attrs.degree.max(1), attrs.max_ttl.min(query.ttl).max(1), connections);
            if ttl == 1 && attrs.qrp_capable {
                let query = self.registry.get(id).unwrap();
                if !self.qrp.can_route(candidate.node, &query.qhv) {
                    continue;
                }
            }
            chosen = Some((candidate.node, ttl));
            break;
        }

        let (peer, ttl) = match chosen {
            Some(v) => v,
            None => {
                // Every remaining candidate was QRP-filtered this round;
                // retry shortly rather than stalling with no armed timer.
                let query = self.registry.get(id).unwrap();
                let deadline = self.clock.now() + query.result_timeout;
                self.rearm_results_timer(id, deadline);
                return;
            }
        };

        self.dispatch_probe(id, peer, ttl);

        let query = match self.registry.get_mut(id) {
            Some(q) => q,
            None => return,
        };
        let yield_below_expectation = query.horizon > self.config.min_horizon
            && (query.results as u64) * self.config.min_horizon.max(1) as u64
                < self.config.low_results as u64 * query.horizon as u64;
        if yield_below_expectation {
            let floored = query
                .result_timeout
                .checked_sub(self.config.timeout_adjust)
                .unwrap_or(Duration::from_millis(0));
            query.result_timeout = floored.max(self.config.min_timeout);
        }

        let deadline = self.clock.now()
            + query.result_timeout
            + self.config.pending_timeout * query.pending.saturating_sub(1);
        self.rearm_results_timer(id, deadline);
    }

    /// TTL selection (spec §4.4.4).
    fn select_ttl(&mut self, id: QueryId, degree: u32, ttl_ceiling: u8, connections: u32) -> u8 {
        let effective_kept = self.effective_kept_results(id);
        let query = self.registry.get(id).unwrap();

        let results_per_host = query.results as f64 / query.horizon.max(1) as f64;
        let needed = (query.max_results as f64 - effective_kept as f64).max(0.0);
        let want_hosts = needed / results_per_host.max(RATE_EPSILON);
        let want_per_node = want_hosts / connections.max(1) as f64;

        for ttl in (1..=ttl_ceiling).rev() {
            let reach = self.horizon.horizon_unchecked(degree, ttl) as f64;
            if reach <= want_per_node {
                return ttl;
            }
        }
        ttl_ceiling
    }

    /// Feedback-aware kept-result estimate (spec §4.4.3).
    fn effective_kept_results(&self, id: QueryId) -> u32 {
        let query = match self.registry.get(id) {
            Some(q) => q,
            None => return 0,
        };
        match &query.origin {
            QueryOrigin::Local(handle) => self.local.kept_results(*handle),
            QueryOrigin::Remote { .. } => {
                if query.flags.contains(QueryFlags::LEAF_GUIDED)
                    && query.flags.contains(QueryFlags::GOT_GUIDANCE)
                {
                    query.kept_results / self.config.avg_ultra_nodes.max(1) + query.new_results
                } else {
                    query.results
                }
            }
        }
    }

    // ---- Results timer expiry (spec §4.4.5) --------------------------------

    fn on_results_timer(&mut self, id: QueryId) {
        let query = match self.registry.get_mut(id) {
            Some(q) => q,
            None => return,
        };
        query.results_timer = None;

        let mut just_timed_out_of_guidance = false;
        if query.is_waiting_guidance() {
            query.flags.remove(QueryFlags::WAITING_GUIDANCE);
            query.stat_timeouts += 1;
            just_timed_out_of_guidance = true;
            if !query.flags.contains(QueryFlags::GOT_GUIDANCE)
                && query.stat_timeouts >= self.config.max_stat_timeout
            {
                query.flags.remove(QueryFlags::LEAF_GUIDED);
                if let Some(peer) = query.origin.peer() {
                    self.peers.set_leaf_guidance(peer, false);
                }
            }
        }

        let query = self.registry.get(id).unwrap();
        if !query.flags.intersects(QueryFlags::LEAF_GUIDED | QueryFlags::ROUTING_HITS) {
            warn!(target: "dq", "query {} has neither guidance nor hit routing, terminating", id);
            self.terminate(id);
            return;
        }

        let leaf_guided = query.flags.contains(QueryFlags::LEAF_GUIDED);
        let stale_since_status = query.up_sent.saturating_sub(query.last_status);
        let needs_more_evidence = stale_since_status < self.config.stat_threshold
            || query.new_results < self.config.min_for_guidance;

        if just_timed_out_of_guidance || !leaf_guided || needs_more_evidence {
            self.send_next(id);
            return;
        }

        let (peer, alive) = match &query.origin {
            QueryOrigin::Remote { peer, alive, .. } => (*peer, *alive),
            QueryOrigin::Local(_) => {
                self.send_next(id);
                return;
            }
        };

        if !self.peers.peer_is_alive(peer) {
            self.destroy_query(id);
            return;
        }

        let leaf_muid = match &query.origin {
            QueryOrigin::Remote { leaf_muid, .. } => leaf_muid.unwrap_or(query.muid),
            QueryOrigin::Local(_) => query.muid,
        };

        if let Some(q) = self.registry.get_mut(id) {
            q.flags.insert(QueryFlags::WAITING_GUIDANCE);
        }
        trace!(target: "dq", "query {} requesting guidance from {}", id, peer);
        self.vendor.send_query_status_request(peer, leaf_muid);

        let (avg, last) = self.peers.round_trip_estimate(alive);
        let rtt_based = Duration::from_millis(((avg as u64 + last as u64) / 2).max(1));
        let deadline = self.clock.now() + self.config.status_timeout.max(rtt_based);
        self.rearm_results_timer(id, deadline);
    }

    // ---- Feedback ingress (spec §4.4.6, §4.4.7) ----------------------------

    /// Regular hit ingress; returns whether the caller should still forward
    /// these hits (spec §4.4.6).
    pub fn on_hits(&mut self, muid: Muid, count: u32, status: HitStatus) -> bool {
        let id = match self.registry.by_any_muid(muid) {
            Some(id) => id,
            None => return false,
        };
        let query = match self.registry.get_mut(id) {
            Some(q) => q,
            None => return false,
        };

        // Suppress forwarding only when the requester is firewalled and the
        // two sides don't *both* support firewalled-to-firewalled transfers
        // (original: `dq_count_results`'s two-clause OR over requester and
        // responder FW2FW support). Firewall suppression genuinely skips
        // counting, unlike USR_CANCELLED below.
        let query_firewalled = query.query_flags.contains(QuerySpeedFlags::FIREWALLED);
        let requester_fw2fw = query.query_flags.contains(QuerySpeedFlags::FW_TO_FW);
        let both_support_fw2fw = requester_fw2fw && status.fw_to_fw_supported;
        if status.firewalled_responder && query_firewalled && !both_support_fw2fw {
            return false;
        }

        if query.is_lingering() {
            query.linger_results = query.linger_results.saturating_add(count);
        } else {
            query.results = query.results.saturating_add(count);
            query.new_results = query.new_results.saturating_add(count);
        }

        // Counters update unconditionally; only the return value (whether
        // the caller should forward these hits) is gated on cancellation.
        !query.flags.contains(QueryFlags::USR_CANCELLED)
    }

    /// OOB indication ingress; returns whether the caller should claim these
    /// hits (spec §4.4.6).
    pub fn on_oob_indication(&mut self, muid: Muid, count: u32) -> bool {
        let id = match self.registry.by_any_muid(muid) {
            Some(id) => id,
            None => return false,
        };
        let query = match self.registry.get_mut(id) {
            Some(q) => q,
            None => return false,
        };
        query.oob_results = query.oob_results.saturating_add(count);

        // Counters update unconditionally; only the return value (whether
        // the caller should claim these hits) is gated on cancellation.
        !query.flags.contains(QueryFlags::USR_CANCELLED)
    }

    /// OOB claim ingress: previously-indicated hits have now actually
    /// arrived (spec §4.4.6).
    pub fn on_oob_claim(&mut self, muid: Muid, count: u32) {
        if let Some(id) = self.registry.by_any_muid(muid) {
            if let Some(query) = self.registry.get_mut(id) {
                query.oob_results = query.oob_results.saturating_sub(count);
            }
        }
    }

    /// Authenticated query-status feedback from a leaf (spec §4.4.7).
    pub fn on_query_status(&mut self, muid: Muid, from_peer: NodeId, kept: u32) {
        let id = match self.registry.by_any_muid(muid) {
            Some(id) => id,
            None => return,
        };
        let query = match self.registry.get_mut(id) {
            Some(q) => q,
            None => return,
        };

        if let Some(owner) = query.origin.peer() {
            if owner != from_peer {
                return; // not authenticated; drop
            }
        }

        query.kept_results = kept;
        query.new_results = 0;
        query.flags.insert(QueryFlags::GOT_GUIDANCE);
        query.last_status = query.up_sent;

        let was_guided = query.flags.contains(QueryFlags::LEAF_GUIDED);
        if !was_guided {
            query.flags.insert(QueryFlags::LEAF_GUIDED);
            if let Some(peer) = query.origin.peer() {
                self.peers.set_leaf_guidance(peer, true);
            }
        }

        if kept == STOP_SENTINEL {
            query.flags.insert(QueryFlags::USR_CANCELLED);
            if let Some(t) = query.results_timer.take() {
                self.timers.cancel(t);
            }
            self.terminate(id);
            return;
        }

        if query.is_waiting_guidance() {
            if let Some(t) = query.results_timer.take() {
                self.timers.cancel(t);
            }
            query.flags.remove(QueryFlags::WAITING_GUIDANCE);
            self.send_next(id);
        }
    }

    /// How many more results are wanted for this query right now (spec §6).
    /// `Err(DqError::QueryNotFound)` if `muid` resolves to no live query.
    pub fn results_wanted(&mut self, muid: Muid, out_wanted: &mut u32) -> Result<(), DqError> {
        let id = self.registry.by_any_muid(muid).ok_or(DqError::QueryNotFound)?;
        let query = self.registry.get(id).ok_or(DqError::QueryNotFound)?;

        if query.flags.contains(QueryFlags::USR_CANCELLED) {
            *out_wanted = 0;
            return Ok(());
        }

        let effective_kept = self.effective_kept_results(id);
        let query = self.registry.get(id).ok_or(DqError::QueryNotFound)?;
        if effective_kept < query.max_results {
            *out_wanted = query.max_results - effective_kept;
        } else if query.flags.contains(QueryFlags::GOT_GUIDANCE) && query.kept_results < query.fin_results {
            // We've nominally delivered enough, but OOB replies keep
            // arriving cheaply; keep claiming until the finalizing
            // threshold is actually reached.
            *out_wanted = 1;
        } else {
            *out_wanted = 0;
        }
        Ok(())
    }

    // ---- Termination, linger, peer loss, shutdown (spec §4.4.8, §4.4.9) ---

    fn terminate(&mut self, id: QueryId) {
        let now = self.clock.now();
        let query = match self.registry.get_mut(id) {
            Some(q) => q,
            None => return,
        };
        if query.is_lingering() {
            return; // already terminated; idempotent
        }

        query.flags.insert(QueryFlags::LINGER);
        query.stop_time = Some(now);
        if let Some(t) = query.results_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(t) = query.expire_timer.take() {
            self.timers.cancel(t);
        }

        let delay = if query.flags.contains(QueryFlags::USR_CANCELLED) {
            Duration::from_millis(1)
        } else {
            self.config.linger_timeout
        };
        warn!(target: "dq", "query {} entering linger for {:?}", id, delay);
        let deadline = now + delay;
        query.expire_timer = Some(self.timers.insert(deadline, id, TimerKind::Expire));
    }

    fn destroy_query(&mut self, id: QueryId) -> Option<QueryOutcome> {
        let query = self.registry.remove(id)?;
        if let Some(t) = query.results_timer {
            self.timers.cancel(t);
        }
        if let Some(t) = query.expire_timer {
            self.timers.cancel(t);
        }
        let outcome = QueryOutcome::classify(&query, self.config.avg_ultra_nodes);
        debug!(target: "dq", "query {} destroyed: {:?}", id, outcome);
        self.destroyed.push_back((id, outcome));
        Some(outcome)
    }

    /// A neighboring peer has disconnected: destroy every query it
    /// originated (spec §4.4.9). A no-op, idempotently, if it already was.
    pub fn peer_removed(&mut self, peer: NodeId) {
        let ids = self.registry.take_node_queries(peer);
        for id in ids {
            if let Some(q) = self.registry.get_mut(id) {
                q.flags.insert(QueryFlags::ID_CLEANING);
            }
            self.destroy_query(id);
        }
    }

    /// The local host closed one of its own searches: cancel any dynamic
    /// query still running on its behalf.
    pub fn local_search_closed(&mut self, handle: SearchHandle) {
        let ids: Vec<QueryId> = self
            .registry
            .iter()
            .filter(|q| matches!(&q.origin, QueryOrigin::Local(h) if *h == handle))
            .map(|q| q.id)
            .collect();
        for id in ids {
            if let Some(q) = self.registry.get_mut(id) {
                q.flags.insert(QueryFlags::USR_CANCELLED);
            }
            self.terminate(id);
        }
    }
}
