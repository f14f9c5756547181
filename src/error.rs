//! # Error Taxonomy
//!
//! Every asynchronous node operation resolves to `Result<T, Error>` exactly
//! once. Synchronous local accessors never return this type; they report
//! failure through `bool`, `Option` or an empty collection instead.

use crate::protocols::RejectReason;

/// Failure tags surfaced by node operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No RPC response arrived within the per-RPC timeout, or the transport failed.
    #[error("rpc timed out")]
    Timeout,

    /// The node or value is absent after a full search.
    #[error("not found")]
    NotFound,

    /// A mutation request failed signature validation. The store is untouched.
    #[error("signature validation failed")]
    SignatureInvalid,

    /// The operation requires a joined node.
    #[error("node has not joined the overlay")]
    NotJoined,

    /// Join was requested while a join is in progress or already complete.
    #[error("node is already joining or joined")]
    AlreadyJoining,

    /// No room in the target bucket and the eviction probe found the incumbent alive.
    #[error("routing table bucket is full")]
    RoutingTableFull,

    /// Malformed key, value, ttl or contact.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A read-only (client) node was asked to hold data.
    #[error("read-only node does not hold values")]
    ReadOnly,

    /// Joining could not reach any bootstrap contact.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// A fan-out mutation did not collect enough acknowledgements.
    #[error("quorum not reached: {acks} of {targets} acknowledged")]
    QuorumNotReached { acks: usize, targets: usize },
}

impl From<RejectReason> for Error {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::SignatureInvalid => Error::SignatureInvalid,
            RejectReason::ReadOnly => Error::ReadOnly,
            RejectReason::NotFound => Error::NotFound,
            RejectReason::InvalidArgument => {
                Error::InvalidArgument("rejected by remote node".to_string())
            }
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
