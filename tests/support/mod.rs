//! In-memory fakes for the six collaborator traits (spec §6), used only by
//! this crate's own tests — never shipped as a real transport, peer
//! registry, QRP table, or OOB proxy.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use dyn_query::{AliveHandle, Muid, NodeId, PeerAttributes, QueryHashVector, SearchHandle};
use dyn_query::{LocalSearch, OobProxy, PeerRegistry, QrpMatcher, Transport, VendorMessages};

#[derive(Default)]
pub struct FakeTransport {
    pub queue_bytes: HashMap<NodeId, u32>,
    pub flow_control: HashMap<NodeId, bool>,
    pub hops_flow: HashMap<NodeId, u8>,
    pub drop_peers: HashSet<NodeId>,
    pub sent_log: Rc<RefCell<Vec<(NodeId, u8)>>>,
}

impl Transport for FakeTransport {
    fn enqueue(&mut self, peer: NodeId, ttl: u8, disposal_cb: Box<dyn FnOnce(bool)>) {
        self.sent_log.borrow_mut().push((peer, ttl));
        let was_sent = !self.drop_peers.contains(&peer);
        disposal_cb(was_sent);
    }

    fn pending_bytes(&self, peer: NodeId) -> u32 {
        *self.queue_bytes.get(&peer).unwrap_or(&0)
    }

    fn in_tx_flow_control(&self, peer: NodeId) -> bool {
        *self.flow_control.get(&peer).unwrap_or(&false)
    }

    fn hops_flow(&self, peer: NodeId) -> u8 {
        *self.hops_flow.get(&peer).unwrap_or(&1)
    }
}

/// A transport whose disposal callbacks don't resolve inline: `enqueue`
/// only stores them, and a oneshot-style channel signals that a probe
/// arrived so an `#[async_std::test]` can await a later tick before the
/// test fires the callback itself — simulating the exact hazard spec §1
/// calls out (a disposal callback firing after its query was destroyed).
pub struct DeferredTransport {
    pub queue_bytes: HashMap<NodeId, u32>,
    pub pending: Rc<RefCell<VecDeque<(NodeId, u8, Box<dyn FnOnce(bool)>)>>>,
    notify: async_std::channel::Sender<()>,
}

impl DeferredTransport {
    pub fn new() -> (Self, async_std::channel::Receiver<()>) {
        let (notify, rx) = async_std::channel::bounded(8);
        (
            DeferredTransport {
                queue_bytes: HashMap::new(),
                pending: Rc::new(RefCell::new(VecDeque::new())),
                notify,
            },
            rx,
        )
    }
}

impl Transport for DeferredTransport {
    fn enqueue(&mut self, peer: NodeId, ttl: u8, disposal_cb: Box<dyn FnOnce(bool)>) {
        self.pending.borrow_mut().push_back((peer, ttl, disposal_cb));
        let _ = self.notify.try_send(());
    }

    fn pending_bytes(&self, peer: NodeId) -> u32 {
        *self.queue_bytes.get(&peer).unwrap_or(&0)
    }

    fn in_tx_flow_control(&self, _peer: NodeId) -> bool {
        false
    }

    fn hops_flow(&self, _peer: NodeId) -> u8 {
        1
    }
}

#[derive(Default)]
pub struct FakePeers {
    pub attrs: HashMap<NodeId, PeerAttributes>,
    pub alive: HashSet<NodeId>,
    pub self_ultrapeer: bool,
    pub rtt: HashMap<AliveHandle, (u32, u32)>,
    pub guidance_calls: Rc<RefCell<Vec<(NodeId, bool)>>>,
}

impl PeerRegistry for FakePeers {
    fn self_is_ultrapeer(&self) -> bool {
        self.self_ultrapeer
    }

    fn all_ultrapeers(&self) -> Vec<NodeId> {
        self.attrs.keys().copied().collect()
    }

    fn peer_attributes(&self, peer: NodeId) -> Option<PeerAttributes> {
        self.attrs.get(&peer).copied()
    }

    fn peer_is_alive(&self, peer: NodeId) -> bool {
        self.alive.contains(&peer)
    }

    fn set_leaf_guidance(&mut self, peer: NodeId, supported: bool) {
        self.guidance_calls.borrow_mut().push((peer, supported));
    }

    fn round_trip_estimate(&self, alive: AliveHandle) -> (u32, u32) {
        *self.rtt.get(&alive).unwrap_or(&(100, 100))
    }
}

#[derive(Default)]
pub struct FakeQrp {
    pub routable: HashSet<NodeId>,
    pub leaf_targets: Vec<NodeId>,
}

impl QrpMatcher for FakeQrp {
    fn can_route(&self, peer: NodeId, _qhv: &QueryHashVector) -> bool {
        self.routable.contains(&peer)
    }

    fn build_leaf_target(
        &self,
        _qhv: &QueryHashVector,
        _hops: u8,
        _ttl: u8,
        _exclude: Option<NodeId>,
    ) -> Vec<NodeId> {
        self.leaf_targets.clone()
    }
}

#[derive(Default)]
pub struct FakeOob {
    pub proxied: HashMap<Muid, Muid>,
    pub proxies_created: Rc<RefCell<Vec<NodeId>>>,
}

impl OobProxy for FakeOob {
    fn muid_proxied(&self, muid: Muid) -> Option<Muid> {
        self.proxied.get(&muid).copied()
    }

    fn create_proxy(&mut self, origin: NodeId) {
        self.proxies_created.borrow_mut().push(origin);
    }
}

#[derive(Default)]
pub struct FakeLocal {
    pub kept: HashMap<SearchHandle, u32>,
}

impl LocalSearch for FakeLocal {
    fn kept_results(&self, handle: SearchHandle) -> u32 {
        *self.kept.get(&handle).unwrap_or(&0)
    }
}

#[derive(Default)]
pub struct FakeVendor {
    pub requests: Rc<RefCell<Vec<(NodeId, Muid)>>>,
}

impl VendorMessages for FakeVendor {
    fn send_query_status_request(&mut self, peer: NodeId, muid: Muid) {
        self.requests.borrow_mut().push((peer, muid));
    }
}

pub fn peer_attrs(degree: u32, max_ttl: u8) -> PeerAttributes {
    PeerAttributes {
        degree,
        max_ttl,
        handshake_complete: true,
        writable: true,
        vendor_supports_guidance: false,
        qrp_capable: false,
    }
}

pub fn muid(byte: u8) -> Muid {
    let mut bytes = [0u8; 16];
    bytes[0] = byte;
    Muid(bytes)
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
