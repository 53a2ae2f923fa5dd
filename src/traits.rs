//! Contracts for the collaborators this crate consumes but does not
//! implement (spec §1, §6). Everything here is an interface; this crate
//! ships only in-memory fakes of them (see `tests/support`), never a real
//! transport, QRP table, OOB proxy, or peer registry.

use crate::ids::{AliveHandle, Muid, NodeId, SearchHandle};

/// A peer's slow-changing attributes, as seen by the peer registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PeerAttributes {
    /// Advertised fan-out (number of other ultrapeers/leaves it forwards to).
    pub degree: u32,
    /// Maximum TTL this peer will honor on a forwarded query.
    pub max_ttl: u8,
    /// Has this peer completed the initial handshake.
    pub handshake_complete: bool,
    /// Is the connection currently writable (not torn down).
    pub writable: bool,
    /// Has this peer advertised support for the leaf-guidance vendor messages.
    pub vendor_supports_guidance: bool,
    /// Is this peer QRP-capable (its query-routing table can be tested at all).
    pub qrp_capable: bool,
}

/// Non-blocking message dispatch with asynchronous send confirmation.
///
/// `enqueue` must invoke `disposal_cb` exactly once, with `was_sent` true
/// if the transport actually wrote the message to the wire and false if
/// it was dropped (e.g. the connection died first). This is the
/// controller's only way of finding out what happened to a probe (spec §4.3).
pub trait Transport {
    /// Queue `message` (here, simply the chosen TTL byte — this crate does
    /// not own wire framing) for `peer`, invoking `disposal_cb` once the
    /// transport has resolved whether it was sent.
    fn enqueue(&mut self, peer: NodeId, ttl: u8, disposal_cb: Box<dyn FnOnce(bool)>);

    /// Bytes currently queued for `peer` but not yet written to the wire.
    fn pending_bytes(&self, peer: NodeId) -> u32;

    /// Is `peer` currently in send-side flow control.
    fn in_tx_flow_control(&self, peer: NodeId) -> bool;

    /// The peer's last-advertised `hops_flow` value (0 means "send nothing").
    fn hops_flow(&self, peer: NodeId) -> u8;
}

/// The set of known neighboring peers and their attributes.
pub trait PeerRegistry {
    /// Is the local host itself still operating in ultrapeer mode. A host
    /// demoted to leaf mid-query must abandon its outstanding dynamic
    /// queries (spec §4.4.3, termination check #1).
    fn self_is_ultrapeer(&self) -> bool;

    /// All connected ultrapeers, in unspecified order.
    fn all_ultrapeers(&self) -> Vec<NodeId>;

    /// Attributes of a given peer, if it is still connected.
    fn peer_attributes(&self, peer: NodeId) -> Option<PeerAttributes>;

    /// Is the given peer still connected at all (used for liveness checks
    /// before sending a status request, spec §4.4.5).
    fn peer_is_alive(&self, peer: NodeId) -> bool;

    /// Record whether `peer` supports (or no longer appears to support)
    /// leaf-guided querying.
    fn set_leaf_guidance(&mut self, peer: NodeId, supported: bool);

    /// Average and last observed round-trip time to `peer`, used to size
    /// the query-status reply timeout.
    fn round_trip_estimate(&self, alive: AliveHandle) -> (u32, u32);
}

/// Query Routing Protocol matching: predicts whether a neighbor's content
/// could satisfy a query's hash vector.
pub trait QrpMatcher {
    /// Can `peer` (or one of its leaves) answer a query summarized by
    /// `qhv`.
    fn can_route(&self, peer: NodeId, qhv: &QueryHashVector) -> bool;

    /// Select which of our own leaves (other than `exclude`, if any)
    /// should receive this query directly, based on their QRP tables.
    fn build_leaf_target(
        &self,
        qhv: &QueryHashVector,
        hops: u8,
        ttl: u8,
        exclude: Option<NodeId>,
    ) -> Vec<NodeId>;
}

/// Out-of-band hit delivery proxying.
pub trait OobProxy {
    /// If `muid` belongs to a query this node is OOB-proxying on behalf of
    /// a leaf, the leaf's own MUID (distinct from our on-wire one).
    fn muid_proxied(&self, muid: Muid) -> Option<Muid>;

    /// Start proxying OOB delivery for a query originated by `origin`.
    fn create_proxy(&mut self, origin: NodeId);
}

/// Accessor for a local (non-leaf-originated) search's own result count.
pub trait LocalSearch {
    /// How many results this search has kept so far, after the local
    /// filter chain.
    fn kept_results(&self, handle: SearchHandle) -> u32;
}

/// Gnutella vendor-message senders this controller needs.
pub trait VendorMessages {
    /// Ask `peer` how many results it has kept for the query identified by
    /// `muid` (spec §4.4.5).
    fn send_query_status_request(&mut self, peer: NodeId, muid: Muid);
}

/// Opaque query-hash-vector, owned by the query for its whole lifetime
/// (spec §3). This crate treats its contents as a black box; only the QRP
/// matcher interprets them.
#[derive(Debug, Clone)]
pub struct QueryHashVector {
    pub has_urn: bool,
    pub word_count: u32,
}

/// Result-set status flags gathered while parsing a query hit, relevant
/// to the firewall-forwarding suppression rule (spec §4.4.6).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HitStatus {
    pub firewalled_responder: bool,
    pub fw_to_fw_supported: bool,
}

/// Speed-field flags carried by the originating query, relevant to both
/// leaf-guidance determination (§4.4.1) and the firewall-forwarding rule
/// (§4.4.6).
bitflags::bitflags! {
    #[derive(Default)]
    pub struct QuerySpeedFlags: u16 {
        const MARKED       = 0b0000_0001;
        const FIREWALLED   = 0b0000_0010;
        const XML          = 0b0000_0100;
        const LEAF_GUIDED  = 0b0000_1000;
        const GGEP_H       = 0b0001_0000;
        const OOB_REPLY    = 0b0010_0000;
        const FW_TO_FW     = 0b0100_0000;
    }
}
