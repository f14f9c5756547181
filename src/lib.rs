//! # Kadnode - Kademlia DHT Node
//!
//! Kadnode implements one participant in a Kademlia overlay:
//!
//! - **Identity**: 160-bit identifiers under the XOR metric
//! - **Routing**: k-bucket routing table with probe-before-evict
//! - **Lookup**: α-parallel iterative search for nodes and values
//! - **Storage**: TTL-bound local value store with optional Ed25519 ownership
//! - **Connectivity**: LOCAL/REMOTE classification of contacts sharing a LAN
//!
//! ## Architecture
//!
//! The node is transport-agnostic. Outbound RPCs go through the
//! [`KademliaRpc`] trait supplied by the embedder, and the transport hands
//! inbound requests to [`Node::handle_request`]. [`Node`] is a cheap clone
//! handle; its components are guarded by separate locks and background
//! maintenance (bucket refresh, republish, expiry) runs on the tokio runtime
//! that created it.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Public facade: lifecycle, network and local operations |
//! | `identity` | Node ids, XOR distance, contacts, keypairs |
//! | `crypto` | Value and request signatures, pluggable validator |
//! | `routing` | k-bucket routing table |
//! | `connectivity` | Address book and LOCAL/REMOTE classifier |
//! | `store` | Local value store with TTL and signature gating |
//! | `lookup` | Iterative lookup engine and mutation fan-out |
//! | `protocols` | RPC and alternative-store traits |
//! | `messages` | Serializable RPC envelope and bootstrap file codec |
//! | `config` | Node configuration and defaults |
//! | `error` | Error taxonomy |

pub mod config;
pub mod connectivity;
pub mod crypto;
pub mod error;
pub mod identity;
mod lookup;
pub mod messages;
mod node;
pub mod protocols;
pub mod routing;
pub mod store;

pub use config::{NodeConfig, NodeType, StoreQuorum};
pub use crypto::{Ed25519Validator, SignatureValidator, SignedRequest, SignedValue};
pub use error::{Error, Result};
pub use identity::{ConnectionType, Contact, Keypair, NodeId};
pub use node::{FindValueOutcome, JoinState, Node};
pub use protocols::{AlternativeStore, FindValueReply, KademliaRpc, RejectReason, RpcAck, StoreRequest};
pub use routing::AddContactStatus;
