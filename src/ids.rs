//! Small identifier newtypes shared across the controller.
//!
//! None of these carry behavior of their own; they exist so that a
//! `NodeId`, a `QueryId` and a raw `u32` can never be silently swapped at a
//! call site.

use std::fmt;

/// Identifies a neighboring peer for the lifetime of its connection.
///
/// Stable across the peer's lifetime (per spec §4.2): a peer that
/// reconnects gets a new id, it never reuses an old one while this
/// controller still references it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The network-visible Gnutella message id (16 raw bytes).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Muid(pub [u8; 16]);

impl fmt::Debug for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Opaque handle to a local search, supplied by the embedding application.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SearchHandle(pub u64);

/// Opaque handle to a peer's round-trip ping statistics, used only to
/// compute the query-status reply timeout (spec §4.4.5).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AliveHandle(pub u64);

/// Unique identifier for an active dynamic query.
///
/// Generated by a wrapping counter, never reused while a query bearing it
/// is still registered. Because the registry removes a query's id from
/// every index at destruction time, a `QueryId` doubles as the
/// generation tag that the design notes (spec §9) call for: a stale
/// `QueryId` simply will not be found in the registry any more, which is
/// exactly the liveness check late-firing callbacks need.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u32);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DQ[{}]", self.0)
    }
}

/// Monotonic source of [`QueryId`]s, wrapping on overflow like the
/// teacher's `QueryPool::next_query_id`.
#[derive(Debug, Default)]
pub(crate) struct QueryIdGen(u32);

impl QueryIdGen {
    pub(crate) fn next(&mut self) -> QueryId {
        let id = QueryId(self.0);
        self.0 = self.0.wrapping_add(1);
        id
    }
}
