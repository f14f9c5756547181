//! # Connectivity Classifier
//!
//! Decides whether a contact is reachable on its locally-bound endpoint
//! (same LAN) or only on its advertised external endpoint, and remembers
//! the answer.
//!
//! The [`AddressBook`] is kept separate from the routing table. It holds:
//!
//! - "db-only" contacts added without touching the live routing table
//! - cached LOCAL/REMOTE decisions keyed by contact id (LRU-bounded)
//! - forced REMOTE overrides for an (id, ip) pair, which survive
//!   re-evaluation and LRU eviction until cleared
//!
//! Decision order for a contact (see `Node::check_contact_local_address`):
//!
//! ```text
//!   forced override ──► REMOTE
//!   cached decision ──► cached value
//!   external ip differs from ours ──► REMOTE (cached, no probe)
//!   probe local endpoint ──► LOCAL on reply, REMOTE on failure (cached)
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tracing::trace;

use crate::identity::{ConnectionType, Contact, NodeId};
use crate::protocols::KademliaRpc;

/// Upper bound on address book entries; least recently used entries are evicted.
pub const MAX_ADDRESS_BOOK_ENTRIES: usize = 4096;

#[derive(Clone, Debug, Default)]
struct AddressBookEntry {
    contact: Option<Contact>,
    classification: ConnectionType,
    /// Decision was made while the contact advertised a rendezvous server.
    via_rendezvous: bool,
}

#[derive(Debug)]
pub struct AddressBook {
    entries: LruCache<NodeId, AddressBookEntry>,
    /// Forced REMOTE pins; never evicted, only cleared explicitly.
    pinned: HashMap<NodeId, IpAddr>,
}

impl Default for AddressBook {
    fn default() -> Self {
        Self::new(MAX_ADDRESS_BOOK_ENTRIES)
    }
}

impl AddressBook {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            pinned: HashMap::new(),
        }
    }

    /// Record a contact without making it visible to lookups. Returns `true` if it was new.
    pub fn record_contact(&mut self, contact: Contact) -> bool {
        let is_new = !self.entries.contains(&contact.id);
        let entry = self.entries.get_or_insert_mut(contact.id, AddressBookEntry::default);
        if contact.rendezvous.is_some() {
            entry.via_rendezvous = true;
        }
        let is_new = is_new || entry.contact.is_none();
        entry.contact = Some(contact);
        is_new
    }

    pub fn contact(&self, id: &NodeId) -> Option<Contact> {
        self.entries.peek(id).and_then(|e| e.contact.clone())
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.entries
            .iter()
            .filter_map(|(_, e)| e.contact.clone())
            .collect()
    }

    /// Known decision for `id` probed at `local_ip`, if any.
    pub fn classification(&mut self, id: &NodeId, local_ip: IpAddr) -> Option<ConnectionType> {
        if self.pinned.get(id) == Some(&local_ip) {
            return Some(ConnectionType::Remote);
        }
        let entry = self.entries.get(id)?;
        match entry.classification {
            ConnectionType::Unknown => None,
            known => Some(known),
        }
    }

    pub fn record_classification(
        &mut self,
        id: NodeId,
        classification: ConnectionType,
        via_rendezvous: bool,
    ) {
        let entry = self.entries.get_or_insert_mut(id, AddressBookEntry::default);
        entry.classification = classification;
        entry.via_rendezvous = via_rendezvous;
    }

    /// Pin `id` at `ip` to REMOTE until [`AddressBook::clear_override`].
    pub fn force_remote(&mut self, id: NodeId, ip: IpAddr) {
        self.pinned.insert(id, ip);
        let entry = self.entries.get_or_insert_mut(id, AddressBookEntry::default);
        entry.classification = ConnectionType::Remote;
    }

    /// Drop a forced override and the cached decision so the next check re-evaluates.
    pub fn clear_override(&mut self, id: &NodeId) -> bool {
        if self.pinned.remove(id).is_none() {
            return false;
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.classification = ConnectionType::Unknown;
        }
        true
    }

    /// Forget decisions that relied on a rendezvous server. Forced overrides stay.
    pub fn invalidate_rendezvous_dependents(&mut self) -> usize {
        let mut invalidated = 0;
        for (id, entry) in self.entries.iter_mut() {
            if entry.via_rendezvous && !self.pinned.contains_key(id) {
                entry.classification = ConnectionType::Unknown;
                entry.via_rendezvous = false;
                invalidated += 1;
            }
        }
        invalidated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decision available from addresses alone: peers behind a different
/// public address cannot share our LAN.
pub(crate) fn classify_without_probe(our_external: IpAddr, their_external: IpAddr) -> Option<ConnectionType> {
    if our_external.is_unspecified() || their_external.is_unspecified() {
        return None;
    }
    (our_external != their_external).then_some(ConnectionType::Remote)
}

/// Try the contact's local endpoint; LOCAL on reply, REMOTE otherwise.
pub(crate) async fn probe_local_endpoint<N: KademliaRpc>(
    network: &N,
    local: SocketAddr,
    timeout: Duration,
) -> ConnectionType {
    match tokio::time::timeout(timeout, network.ping_addr(local)).await {
        Ok(Ok(())) => ConnectionType::Local,
        Ok(Err(e)) => {
            trace!(addr = %local, error = %e, "local endpoint probe failed");
            ConnectionType::Remote
        }
        Err(_) => {
            trace!(addr = %local, "local endpoint probe timed out");
            ConnectionType::Remote
        }
    }
}
