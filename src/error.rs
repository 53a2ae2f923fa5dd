//! Error types for the dynamic query controller.
//!
//! Per spec §7, almost everything this crate observes is an *expected*
//! event (a dropped message, a stale MUID, a timed-out status request) and
//! is handled inline rather than surfaced as an `Err`. `DqError` is
//! reserved for the small set of ways the public API itself can be misused.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DqError {
    /// `horizon(degree, ttl)` was called with `degree == 0`.
    #[error("invalid degree {0}: horizon is only defined for degree >= 1")]
    InvalidDegree(u32),

    /// `horizon(degree, ttl)` or TTL selection was called with `ttl == 0`.
    #[error("invalid ttl {0}: horizon is only defined for ttl >= 1")]
    InvalidTtl(u32),

    /// Feedback referenced a query id that the registry has never seen
    /// (as opposed to one it has seen and since dropped, which is a
    /// silent no-op per spec §7).
    #[error("no such query")]
    QueryNotFound,

    /// A lifecycle operation was attempted after `close()`.
    #[error("controller already closed")]
    AlreadyClosed,
}
