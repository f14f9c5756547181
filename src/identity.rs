//! # Identifiers, Distance and Contacts
//!
//! This module defines the identity types shared by every other component:
//!
//! - [`NodeId`]: 160-bit identifier used for both nodes and storage keys
//! - [`Contact`]: a peer's identifier plus its external, local and
//!   rendezvous endpoints and connectivity metadata
//! - [`Keypair`]: Ed25519 signing keypair used for signed values
//!
//! ## Distance Model
//!
//! The distance between two identifiers is their bitwise XOR read as an
//! unsigned big-endian integer. [`distance_cmp`] compares two distances and
//! [`closer`] decides which of two identifiers is nearer to a target. All
//! orderings in the routing table and the lookup engine go through these
//! two functions.
//!
//! ## Invariants
//!
//! - `NodeId::from_bytes(b).as_bytes() == b`
//! - `a.distance(&b) == b.distance(&a)` and `a.distance(&a)` is zero
//! - `closer(t, a, b)` is `Ordering::Less` iff `t ^ a < t ^ b`

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Width of an identifier in bytes.
pub const ID_LEN: usize = 20;

/// Width of an identifier in bits (also the number of routing buckets).
pub const ID_BITS: usize = ID_LEN * 8;

/// XOR distance between two identifiers.
pub type Distance = [u8; ID_LEN];

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returns current time as seconds since Unix epoch.
#[inline]
pub(crate) fn now_secs() -> u64 {
    now_ms() / 1000
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from a slice, rejecting any length other than [`ID_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Derive a key from arbitrary content (BLAKE3, truncated to [`ID_LEN`] bytes).
    pub fn hash_of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..ID_LEN]);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading bits shared with `other` (`ID_BITS` when equal).
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// First eight bytes in hex, for log fields.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compare two XOR distances as unsigned big-endian integers.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.cmp(b)
}

/// Which of `a` and `b` is nearer to `target`.
///
/// `Ordering::Less` means `a` is closer, `Ordering::Greater` means `b` is.
#[inline]
pub fn closer(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    distance_cmp(&target.distance(a), &target.distance(b))
}

/// Sort contacts nearest-first relative to `target`.
pub fn sort_by_distance(contacts: &mut [Contact], target: &NodeId) {
    contacts.sort_by(|a, b| closer(target, &a.id, &b.id));
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short_hex())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Whether a contact can be reached on its locally-bound endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    Unknown,
    /// Reachable on its local address (same LAN).
    Local,
    /// Reachable only on its external address.
    Remote,
}

/// A peer as known to this node.
///
/// Identity is the `id`; `last_seen_ms`, `rtt_ms` and `connection` are
/// metadata that the routing table and address book update in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    /// Advertised (public) endpoint.
    pub external: SocketAddr,
    /// Locally-bound endpoint.
    pub local: SocketAddr,
    /// Rendezvous server endpoint, if the peer sits behind one.
    pub rendezvous: Option<SocketAddr>,
    /// Last time this contact was verified (0 = never).
    #[serde(default)]
    pub last_seen_ms: u64,
    /// Most recent measured round-trip time.
    #[serde(default)]
    pub rtt_ms: f32,
    #[serde(default)]
    pub connection: ConnectionType,
}

impl Contact {
    pub fn new(id: NodeId, external: SocketAddr, local: SocketAddr) -> Self {
        Self {
            id,
            external,
            local,
            rendezvous: None,
            last_seen_ms: 0,
            rtt_ms: 0.0,
            connection: ConnectionType::Unknown,
        }
    }

    /// A contact whose local and external endpoints coincide.
    pub fn single(id: NodeId, addr: SocketAddr) -> Self {
        Self::new(id, addr, addr)
    }

    pub fn with_rendezvous(mut self, rendezvous: SocketAddr) -> Self {
        self.rendezvous = Some(rendezvous);
        self
    }

    /// Mark the contact as seen now with the given round-trip time.
    pub(crate) fn touch(&mut self, rtt_ms: f32) {
        self.last_seen_ms = now_ms();
        self.rtt_ms = rtt_ms;
    }

    /// Placeholder endpoint used before a node learns its own addresses.
    pub(crate) fn unspecified_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Ed25519 keypair used to sign values and mutation requests.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}
