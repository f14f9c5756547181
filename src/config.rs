//! Node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::identity::{Contact, Keypair};

/// Default replication width and bucket capacity.
pub const DEFAULT_K: usize = 16;

/// Default number of concurrent RPCs per lookup round.
pub const DEFAULT_ALPHA: usize = 3;

/// Per-RPC timeout; an unresponsive contact is dropped from the lookup after this.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on a whole lookup before the current shortlist is returned.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Safety cap on lookup rounds.
pub const DEFAULT_MAX_LOOKUP_ITERATIONS: usize = 20;

/// Bucket refresh and record republish period.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How often expired records are swept from the local store.
pub const DEFAULT_EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Role of a node in the overlay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeType {
    /// Full node: routes and stores values for the overlay.
    #[default]
    Vault,
    /// Read-only node: routes and queries but never holds values.
    Client,
}

/// Acknowledgement policy for store/delete/update fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreQuorum {
    /// Success if any target acknowledges.
    #[default]
    AtLeastOne,
    /// Success if more than half of the targets acknowledge.
    Majority,
    /// Success only if every target acknowledges.
    All,
}

impl StoreQuorum {
    pub fn is_met(self, acks: usize, targets: usize) -> bool {
        match self {
            StoreQuorum::AtLeastOne => acks >= 1,
            StoreQuorum::Majority => acks * 2 > targets,
            StoreQuorum::All => targets > 0 && acks == targets,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub k: usize,
    pub alpha: usize,
    pub node_type: NodeType,
    pub store_quorum: StoreQuorum,
    pub rpc_timeout: Duration,
    pub lookup_timeout: Duration,
    pub max_lookup_iterations: usize,
    pub refresh_interval: Duration,
    pub expiry_check_interval: Duration,
    /// Advertised endpoint; `JoinFirstNode` overrides it.
    pub external_addr: SocketAddr,
    /// Endpoint the transport is bound to.
    pub local_addr: SocketAddr,
    pub rendezvous_addr: Option<SocketAddr>,
    /// Present when this node signs its own values.
    pub keypair: Option<Keypair>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            node_type: NodeType::Vault,
            store_quorum: StoreQuorum::AtLeastOne,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            max_lookup_iterations: DEFAULT_MAX_LOOKUP_ITERATIONS,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            expiry_check_interval: DEFAULT_EXPIRY_CHECK_INTERVAL,
            external_addr: Contact::unspecified_addr(),
            local_addr: Contact::unspecified_addr(),
            rendezvous_addr: None,
            keypair: None,
        }
    }
}

impl NodeConfig {
    /// Config for a node bound to a single address (no NAT in between).
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            external_addr: addr,
            local_addr: addr,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::InvalidArgument("k must be non-zero".into()));
        }
        if self.alpha == 0 {
            return Err(Error::InvalidArgument("alpha must be non-zero".into()));
        }
        if self.rpc_timeout.is_zero() || self.lookup_timeout.is_zero() {
            return Err(Error::InvalidArgument("timeouts must be non-zero".into()));
        }
        if self.refresh_interval.is_zero() || self.expiry_check_interval.is_zero() {
            return Err(Error::InvalidArgument("maintenance intervals must be non-zero".into()));
        }
        Ok(())
    }
}
