//! Protocol trait definitions consumed by the node.
//!
//! The node never talks to sockets. Outbound RPCs go through the
//! [`KademliaRpc`] trait, implemented by whatever transport the embedder
//! wires in; the transport delivers inbound requests to the node's
//! `handle_*` methods.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`KademliaRpc`] | Outbound ping / find / store / delete / update RPCs |
//! | [`AlternativeStore`] | Out-of-band key presence check preempting FindValue |

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::{SignedRequest, SignedValue};
use crate::identity::{Contact, NodeId};

/// Why a remote node refused a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    SignatureInvalid,
    ReadOnly,
    NotFound,
    InvalidArgument,
}

/// Outcome of a mutating RPC that reached the remote node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcAck {
    Accepted,
    Rejected(RejectReason),
}

impl RpcAck {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RpcAck::Accepted)
    }
}

/// Reply to a FindValue RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FindValueReply {
    /// The queried node holds the key.
    Values(Vec<Vec<u8>>),
    /// The queried node's alternative store holds the key; fetch from this contact.
    Redirect(Contact),
    /// The queried node does not hold the key; these are closer candidates.
    CloserNodes(Vec<Contact>),
}

/// Payload of a Store RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StoreRequest {
    Unsigned {
        key: NodeId,
        value: Vec<u8>,
        ttl: i32,
    },
    Signed {
        key: NodeId,
        value: SignedValue,
        request: SignedRequest,
        ttl: i32,
    },
}

impl StoreRequest {
    pub fn key(&self) -> &NodeId {
        match self {
            StoreRequest::Unsigned { key, .. } | StoreRequest::Signed { key, .. } => key,
        }
    }
}

/// Kademlia RPCs issued by the lookup engine.
///
/// `Err` means the RPC did not complete (timeout, transport failure); an
/// explicit refusal by the remote node is `Ok(RpcAck::Rejected(_))`.
#[async_trait]
pub trait KademliaRpc: Send + Sync + 'static {
    /// Check liveness of a contact.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// Probe a bare endpoint (used to test a contact's local address).
    async fn ping_addr(&self, addr: SocketAddr) -> Result<()>;

    /// Ask `to` for the contacts it knows closest to `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Ask `to` for the values under `key`, or closer nodes.
    async fn find_value(&self, to: &Contact, key: NodeId) -> Result<FindValueReply>;

    async fn store(&self, to: &Contact, request: StoreRequest) -> Result<RpcAck>;

    async fn delete(
        &self,
        to: &Contact,
        key: NodeId,
        value: SignedValue,
        request: SignedRequest,
    ) -> Result<RpcAck>;

    async fn update(
        &self,
        to: &Contact,
        key: NodeId,
        old_value: SignedValue,
        new_value: SignedValue,
        request: SignedRequest,
        ttl: i32,
    ) -> Result<RpcAck>;
}

/// External key-presence check consulted before the native store.
pub trait AlternativeStore: Send + Sync {
    fn has(&self, key: &NodeId) -> bool;
}
