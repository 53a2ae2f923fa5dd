//! Adaptive per-query dynamic querying for a Gnutella-style ultrapeer.
//!
//! A leaf's (or the local host's) keyword search is not flooded blindly:
//! [`DqController`] fans it out to a small, carefully chosen set of
//! neighboring ultrapeers, escalating reach only as needed, until a result
//! quota is met or the theoretical horizon is exhausted. See
//! [`DqController`] for the public API; [`traits`] documents the
//! collaborators an embedding application must supply (transport, peer
//! registry, QRP matcher, OOB proxy, local search, vendor messages).

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod horizon;
pub mod ids;
pub mod outcome;
pub mod query;
pub mod registry;
pub mod selector;
pub mod send;
pub mod traits;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::DqConfig;
pub use controller::DqController;
pub use error::DqError;
pub use ids::{AliveHandle, Muid, NodeId, QueryId, SearchHandle};
pub use outcome::{QueryCompletion, QueryOutcome};
pub use traits::{
    HitStatus, LocalSearch, OobProxy, PeerAttributes, PeerRegistry, QrpMatcher, QueryHashVector,
    QuerySpeedFlags, Transport, VendorMessages,
};
