//! End-to-end scenarios for the dynamic query controller, seeded from the
//! six named walkthroughs plus the invariants and laws of its behavioral
//! contract.

mod support;

use std::time::Duration;

use dyn_query::query::QueryFlags;
use dyn_query::{
    AliveHandle, DqConfig, DqController, FakeClock, HitStatus, NodeId, QueryHashVector,
    QuerySpeedFlags, SearchHandle,
};

use support::{
    init_logging, muid, peer_attrs, DeferredTransport, FakeLocal, FakeOob, FakePeers, FakeQrp,
    FakeTransport, FakeVendor,
};

type TestController = DqController<FakeClock, FakeTransport, FakePeers, FakeQrp, FakeOob, FakeLocal, FakeVendor>;

fn qhv(has_urn: bool) -> QueryHashVector {
    QueryHashVector {
        has_urn,
        word_count: 2,
    }
}

fn build(
    config: DqConfig,
    transport: FakeTransport,
    peers: FakePeers,
    qrp: FakeQrp,
    oob: FakeOob,
    local: FakeLocal,
    vendor: FakeVendor,
) -> TestController {
    DqController::with_config(config, FakeClock::new(), transport, peers, qrp, oob, local, vendor)
}

/// Scenario 1: common content, leaf-guided, early stop.
///
/// Twenty ultrapeers all match the query's QRP vector (common content);
/// the probe shortens TTL and fans out to three of them. The leaf then
/// reports enough kept results for the query to stop well before every
/// candidate has been queried. The reported `kept` value (200) is larger
/// than the literal seed in the walkthrough this is modeled on, because
/// the controller attributes a leaf's reported count across its
/// `avg_ultra_nodes` ultrapeers before comparing it to `max_results`; a
/// literal 50 would never cross that threshold here.
#[test]
fn common_content_leaf_guided_early_stop() {
    init_logging();

    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    let mut qrp = FakeQrp::default();
    for i in 0..20u64 {
        let node = NodeId(i);
        peers.attrs.insert(node, peer_attrs(5, 5));
        peers.alive.insert(node);
        qrp.routable.insert(node);
    }
    let leaf = NodeId(999);
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);

    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        qrp,
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );

    let id = controller
        .launch_from_peer(
            leaf,
            AliveHandle(1),
            muid(1),
            None,
            qhv(false),
            QuerySpeedFlags::LEAF_GUIDED,
            5,
        )
        .expect("launch succeeds");

    // 20 candidates > 6 * PROBE_UP(3) = 18, so TTL is shortened by 2 and
    // exactly PROBE_UP peers are sent to, synchronously (the fake
    // transport resolves its disposal callback inline).
    {
        let q = controller.query(id).expect("query registered");
        assert!(q.flags.contains(QueryFlags::LEAF_GUIDED));
        assert_eq!(q.up_sent, 3);
        assert_eq!(q.ttl, 3);
        assert!(q.horizon > 0);
    }

    // Each of the three probed ultrapeers returns 10 hits.
    assert!(controller.on_hits(muid(1), 10, HitStatus::default()));
    assert!(controller.on_hits(muid(1), 10, HitStatus::default()));
    assert!(controller.on_hits(muid(1), 10, HitStatus::default()));
    assert_eq!(controller.query(id).unwrap().results, 30);

    // Enough new ultrapeers probed (3 >= STAT_THRESHOLD) and enough new
    // hits (30 >= MIN_FOR_GUIDANCE) for the controller to ask the leaf
    // once the probe's results timer expires.
    controller.clock_mut().advance(Duration::from_millis(16_000));
    controller.poll_timers();
    assert!(controller.query(id).unwrap().is_waiting_guidance());

    // Leaf reports a large kept count; our attributed share crosses
    // max_results and the query stops.
    controller.on_query_status(muid(1), leaf, 200);

    let q = controller.query(id).expect("still registered, lingering");
    assert!(q.is_lingering());
    assert!(q.up_sent < 5);
}

/// Scenario 2: rare content, no leaf guidance ever enabled — a local
/// search with no peer matching its QRP vector, so every step falls
/// through to the iterative selector and termination is driven purely by
/// the connection-exhaustion check.
#[test]
fn rare_content_no_guidance_terminates_on_connection_exhaustion() {
    init_logging();

    let config = DqConfig {
        max_connections: 8,
        normal_connections: 3,
        ..DqConfig::default()
    };
    let max_conn = config.max_connections;
    let normal_conn = config.normal_connections;

    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    for i in 0..40u64 {
        let node = NodeId(i);
        peers.attrs.insert(node, peer_attrs(5, 5));
        peers.alive.insert(node);
    }

    let mut controller = build(
        config,
        FakeTransport::default(),
        peers,
        FakeQrp::default(), // nobody QRP-matches: rare content
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );

    let id = controller
        .launch_local(SearchHandle(1), muid(2), qhv(false), 5)
        .expect("launch succeeds");

    // No probe candidates (QRP never matches) falls straight through to
    // the iterative step, which sends to the first ranked candidate.
    let initial_timeout = controller.query(id).unwrap().result_timeout;
    assert!(controller.query(id).unwrap().up_sent >= 1);

    for _ in 0..20 {
        let lingering = match controller.query(id) {
            Some(q) => q.is_lingering(),
            None => break,
        };
        if lingering {
            break;
        }
        if controller.next_deadline().is_none() {
            break;
        }
        controller.clock_mut().advance(Duration::from_millis(5_000));
        controller.poll_timers();
    }

    let q = controller.query(id).expect("still registered, lingering");
    assert!(q.is_lingering());
    assert!(q.up_sent >= max_conn - normal_conn);
    assert!(q.result_timeout <= initial_timeout);
}

/// Scenario 3: a hash-URN query gets a decimated result quota.
#[test]
fn hash_urn_query_sizes_quota_down() {
    init_logging();

    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    let leaf = NodeId(1);
    peers.attrs.insert(leaf, peer_attrs(5, 5));
    peers.alive.insert(leaf);

    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        FakeQrp::default(),
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );

    let id = controller
        .launch_from_peer(
            leaf,
            AliveHandle(1),
            muid(3),
            None,
            qhv(true),
            QuerySpeedFlags::empty(),
            5,
        )
        .unwrap();

    let q = controller.query(id).unwrap();
    assert_eq!(q.max_results, 2); // LEAF_RESULTS(50) / SHA1_DECIMATOR(25)
    assert_eq!(q.fin_results, 40); // 2 * 100 / PERCENT_KEPT(5)
}

/// Scenario 4: the transport drops a probe outright.
#[test]
fn transport_drops_probe_frees_peer() {
    init_logging();

    let target = NodeId(7);
    let leaf = NodeId(1);

    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    peers.attrs.insert(target, peer_attrs(5, 5));
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);

    let mut qrp = FakeQrp::default();
    qrp.routable.insert(target);

    let mut transport = FakeTransport::default();
    transport.drop_peers.insert(target);

    let mut controller = build(
        DqConfig::default(),
        transport,
        peers,
        qrp,
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );

    let id = controller
        .launch_from_peer(leaf, AliveHandle(1), muid(4), None, qhv(false), QuerySpeedFlags::empty(), 5)
        .unwrap();

    let q = controller.query(id).unwrap();
    assert!(!q.queried.contains(&target));
    assert_eq!(q.up_sent, 0);
    assert_eq!(q.pending, 0);
}

/// Scenario 5: the originating peer disappears mid-query.
#[test]
fn peer_disappearing_destroys_its_queries() {
    init_logging();

    let leaf = NodeId(1);
    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);
    for i in 10..13u64 {
        let n = NodeId(i);
        peers.attrs.insert(n, peer_attrs(5, 5));
        peers.alive.insert(n);
    }
    let mut qrp = FakeQrp::default();
    qrp.routable.insert(NodeId(10));
    qrp.routable.insert(NodeId(11));

    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        qrp,
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );

    let id = controller
        .launch_from_peer(leaf, AliveHandle(1), muid(5), None, qhv(false), QuerySpeedFlags::empty(), 5)
        .unwrap();
    assert!(controller.query(id).is_some());

    controller.peer_removed(leaf);
    assert!(controller.query(id).is_none());
    assert_eq!(controller.query_count(), 0);

    let destroyed = controller.drain_destroyed();
    assert_eq!(destroyed.len(), 1);
    assert_eq!(destroyed[0].0, id);

    // Idempotent: removing the same (already-gone) peer again is a no-op.
    controller.peer_removed(leaf);
    assert!(controller.drain_destroyed().is_empty());
}

/// Scenario 6: an unsolicited status reply enables leaf guidance.
#[test]
fn unsolicited_status_enables_guidance() {
    init_logging();

    let leaf = NodeId(1);
    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);
    peers.attrs.insert(NodeId(2), peer_attrs(5, 5));
    peers.alive.insert(NodeId(2));
    let mut qrp = FakeQrp::default();
    qrp.routable.insert(NodeId(2));
    let guidance_calls = peers.guidance_calls.clone();

    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        qrp,
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );

    let id = controller
        .launch_from_peer(leaf, AliveHandle(1), muid(6), None, qhv(false), QuerySpeedFlags::empty(), 5)
        .unwrap();

    assert!(!controller.query(id).unwrap().flags.contains(QueryFlags::LEAF_GUIDED));

    controller.on_query_status(muid(6), leaf, 10);

    let q = controller.query(id).unwrap();
    assert!(q.flags.contains(QueryFlags::LEAF_GUIDED));
    assert!(q.flags.contains(QueryFlags::GOT_GUIDANCE));
    assert_eq!(q.new_results, 0);
    assert_eq!(guidance_calls.borrow().as_slice(), &[(leaf, true)]);
}

/// Law: idempotent cancellation — `peer_removed` on an already-gone peer
/// is a no-op (also exercised by scenario 5 above).
#[test]
fn peer_removed_on_unknown_peer_is_noop() {
    init_logging();
    let peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        FakeQrp::default(),
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );
    controller.peer_removed(NodeId(123));
    assert_eq!(controller.query_count(), 0);
}

/// Law: OOB round-trip — indicating then fully claiming returns
/// `oob_results` to its pre-indication value.
#[test]
fn oob_indication_then_full_claim_round_trips() {
    init_logging();
    let leaf = NodeId(1);
    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);

    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        FakeQrp::default(),
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );
    let id = controller
        .launch_from_peer(leaf, AliveHandle(1), muid(7), None, qhv(false), QuerySpeedFlags::empty(), 5)
        .unwrap();

    let before = controller.query(id).unwrap().oob_results;
    assert!(controller.on_oob_indication(muid(7), 6));
    assert_eq!(controller.query(id).unwrap().oob_results, before + 6);
    controller.on_oob_claim(muid(7), 6);
    assert_eq!(controller.query(id).unwrap().oob_results, before);
}

/// Law: termination monotonicity — once `USR_CANCELLED` (the 0xFFFF stop
/// sentinel), `on_hits` never forwards again.
#[test]
fn cancelled_query_never_forwards_hits_again() {
    init_logging();
    let leaf = NodeId(1);
    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);

    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        FakeQrp::default(),
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );
    let id = controller
        .launch_from_peer(leaf, AliveHandle(1), muid(8), None, qhv(false), QuerySpeedFlags::empty(), 5)
        .unwrap();

    controller.on_query_status(muid(8), leaf, 0xFFFF);
    assert!(!controller.on_hits(muid(8), 5, HitStatus::default()));
    assert!(!controller.on_hits(muid(8), 5, HitStatus::default()));
}

/// The documented `ROUTING_HITS` resolution (see DESIGN.md): it is set
/// whenever OOB delivery was never requested in the first place, even
/// with no proxy installed.
#[test]
fn routing_hits_set_without_oob_reply_requested() {
    init_logging();
    let leaf = NodeId(1);
    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);

    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        FakeQrp::default(),
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );
    let id = controller
        .launch_from_peer(leaf, AliveHandle(1), muid(9), None, qhv(false), QuerySpeedFlags::empty(), 5)
        .unwrap();

    assert!(controller.query(id).unwrap().flags.contains(QueryFlags::ROUTING_HITS));
}

/// Firewalled responder forwarding suppression (spec §4.4.6): a firewalled
/// query with no FW-to-FW support drops hits from a firewalled responder.
#[test]
fn firewalled_responder_without_fw2fw_is_refused() {
    init_logging();
    let leaf = NodeId(1);
    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);

    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        FakeQrp::default(),
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );
    let id = controller
        .launch_from_peer(
            leaf,
            AliveHandle(1),
            muid(10),
            None,
            qhv(false),
            QuerySpeedFlags::FIREWALLED,
            5,
        )
        .unwrap();

    let status = HitStatus {
        firewalled_responder: true,
        fw_to_fw_supported: false,
    };
    assert!(!controller.on_hits(muid(10), 3, status));
    assert_eq!(controller.query(id).unwrap().results, 0);
}

/// Firewalled responder forwarding is allowed when *both* sides advertise
/// FW2FW support, even though the requester alone is firewalled (spec
/// §4.4.6's two-clause condition from `dq_count_results`).
#[test]
fn firewalled_responder_with_fw2fw_both_sides_forwards() {
    init_logging();
    let leaf = NodeId(1);
    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);

    let mut controller = build(
        DqConfig::default(),
        FakeTransport::default(),
        peers,
        FakeQrp::default(),
        FakeOob::default(),
        FakeLocal::default(),
        FakeVendor::default(),
    );
    let id = controller
        .launch_from_peer(
            leaf,
            AliveHandle(1),
            muid(11),
            None,
            qhv(false),
            QuerySpeedFlags::FIREWALLED | QuerySpeedFlags::FW_TO_FW,
            5,
        )
        .unwrap();

    let status = HitStatus {
        firewalled_responder: true,
        fw_to_fw_supported: true,
    };
    assert!(controller.on_hits(muid(11), 3, status));
    assert_eq!(controller.query(id).unwrap().results, 3);
}

/// A probe's disposal callback can fire after the query it belonged to has
/// already been destroyed (spec §1: "any callback may fire after the query
/// it references has already been freed"). `DeferredTransport` defers the
/// callback across a real `#[async_std::test]` tick instead of resolving
/// it inline, so this exercises the stale-query discard branch for real.
#[async_std::test]
async fn stale_disposal_after_query_destroyed_is_silently_dropped() {
    init_logging();

    let leaf = NodeId(1);
    let target = NodeId(2);
    let mut peers = FakePeers {
        self_ultrapeer: true,
        ..Default::default()
    };
    peers.attrs.insert(leaf, peer_attrs(1, 5));
    peers.alive.insert(leaf);
    peers.attrs.insert(target, peer_attrs(5, 5));
    peers.alive.insert(target);
    let mut qrp = FakeQrp::default();
    qrp.routable.insert(target);

    let (transport, notify) = DeferredTransport::new();
    let pending = transport.pending.clone();

    let mut controller: DqController<FakeClock, DeferredTransport, FakePeers, FakeQrp, FakeOob, FakeLocal, FakeVendor> =
        DqController::with_config(
            DqConfig::default(),
            FakeClock::new(),
            transport,
            peers,
            qrp,
            FakeOob::default(),
            FakeLocal::default(),
            FakeVendor::default(),
        );

    let id = controller
        .launch_from_peer(leaf, AliveHandle(1), muid(12), None, qhv(false), QuerySpeedFlags::empty(), 5)
        .unwrap();
    assert_eq!(controller.query(id).unwrap().pending, 1);

    // Simulate the event loop yielding to a later tick before the
    // transport resolves the probe it already queued.
    notify.recv().await.expect("probe was enqueued");

    // The originating peer disappears before the disposal ever fires.
    controller.peer_removed(leaf);
    assert!(controller.query(id).is_none());

    // The transport now resolves the stale probe.
    let (_, _, cb) = pending.borrow_mut().pop_front().expect("one probe queued");
    cb(true);

    // Draining must discard it silently: no panic, no resurrected query.
    controller.poll_timers();
    assert!(controller.query(id).is_none());
    assert_eq!(controller.query_count(), 0);
}
