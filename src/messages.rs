//! # RPC Envelope and Bootstrap File
//!
//! Serializable request/response types for the [`KademliaRpc`] contract,
//! for transports that move bytes rather than calling a peer's node
//! directly. Messages are encoded with bincode under a size limit.
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong` |
//! | `FindNode` | `Nodes` |
//! | `FindValue` | `Value` |
//! | `Store` / `Delete` / `Update` | `Ack` |
//!
//! The bootstrap file is a bincode-encoded `Vec<Contact>`. It is read at
//! join and rewritten at leave.
//!
//! [`KademliaRpc`]: crate::protocols::KademliaRpc

use std::io::ErrorKind;
use std::path::Path;

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::crypto::{SignedRequest, SignedValue};
use crate::error::{Error, Result};
use crate::identity::{Contact, NodeId};
use crate::protocols::{FindValueReply, RpcAck, StoreRequest};

/// Maximum size of a single stored value (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer accepted by the decoder; a value plus framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Decode with the size limit enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KademliaRequest {
    Ping {
        from: Contact,
    },
    FindNode {
        from: Contact,
        target: NodeId,
    },
    FindValue {
        from: Contact,
        key: NodeId,
    },
    Store {
        from: Contact,
        request: StoreRequest,
    },
    Delete {
        from: Contact,
        key: NodeId,
        value: SignedValue,
        request: SignedRequest,
    },
    Update {
        from: Contact,
        key: NodeId,
        old_value: SignedValue,
        new_value: SignedValue,
        request: SignedRequest,
        ttl: i32,
    },
}

impl KademliaRequest {
    pub fn sender(&self) -> &Contact {
        match self {
            KademliaRequest::Ping { from }
            | KademliaRequest::FindNode { from, .. }
            | KademliaRequest::FindValue { from, .. }
            | KademliaRequest::Store { from, .. }
            | KademliaRequest::Delete { from, .. }
            | KademliaRequest::Update { from, .. } => from,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KademliaResponse {
    Pong,
    Nodes(Vec<Contact>),
    Value(FindValueReply),
    Ack(RpcAck),
    Error { message: String },
}

pub fn serialize_request(request: &KademliaRequest) -> Result<Vec<u8>, bincode::Error> {
    serialize(request)
}

pub fn deserialize_request(data: &[u8]) -> Result<KademliaRequest, bincode::Error> {
    deserialize_bounded(data)
}

pub fn serialize_response(response: &KademliaResponse) -> Result<Vec<u8>, bincode::Error> {
    serialize(response)
}

pub fn deserialize_response(data: &[u8]) -> Result<KademliaResponse, bincode::Error> {
    deserialize_bounded(data)
}

pub fn encode_bootstrap_contacts(contacts: &[Contact]) -> Result<Vec<u8>, bincode::Error> {
    serialize(&contacts)
}

pub fn decode_bootstrap_contacts(data: &[u8]) -> Result<Vec<Contact>, bincode::Error> {
    deserialize_bounded(data)
}

/// Read bootstrap contacts; a missing file is an empty list.
pub async fn load_bootstrap_contacts(path: &Path) -> Result<Vec<Contact>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => decode_bootstrap_contacts(&bytes)
            .map_err(|e| Error::Bootstrap(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Bootstrap(format!("{}: {e}", path.display()))),
    }
}

pub async fn save_bootstrap_contacts(path: &Path, contacts: &[Contact]) -> Result<()> {
    let bytes = encode_bootstrap_contacts(contacts)
        .map_err(|e| Error::Bootstrap(format!("encode: {e}")))?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| Error::Bootstrap(format!("{}: {e}", path.display())))
}
