//! # Node Facade
//!
//! [`Node`] is the public surface of a Kademlia participant. It owns the
//! routing table, the connectivity address book and the local value store,
//! and drives the lookup engine against the embedder's [`KademliaRpc`]
//! transport.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::new(NodeConfig::with_addr(addr), Arc::new(transport))?;
//! node.join(Path::new("bootstrap.bin")).await?;
//!
//! let key = NodeId::hash_of(b"greeting");
//! node.store_value(key, b"hello".to_vec(), 3600).await?;
//! let found = node.find_value(key, false).await?;
//!
//! node.leave().await?;
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!   Unjoined ──join──► Joining ──ok──► Joined ──leave──► Leaving ──► Unjoined
//!                         └───failure───► Unjoined
//! ```
//!
//! Network operations fail fast with [`Error::NotJoined`] outside `Joined`.
//! Local accessors (routing table, store, address book) work in any state.
//!
//! ## Concurrency
//!
//! `Node` is a cheap `Clone` handle over shared state. Each component sits
//! behind its own lock: reads run concurrently, structural mutation is
//! serialized. No lock is held across an `.await`.
//!
//! ## Inbound RPCs
//!
//! The transport delivers requests to the `handle_*` methods (or to
//! [`Node::handle_request`] with a [`KademliaRequest`] envelope). Every
//! handler records the caller in the routing table.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{NodeConfig, NodeType};
use crate::connectivity::{AddressBook, classify_without_probe, probe_local_endpoint};
use crate::crypto::{SignatureValidator, SignedRequest, SignedValue, sign_request, sign_value};
use crate::error::{Error, Result};
use crate::identity::{ConnectionType, Contact, NodeId, now_secs};
use crate::lookup::{FanOutResult, Found, LookupOutcome, LookupParams, QueryKind, fan_out, iterative_lookup};
use crate::messages::{KademliaRequest, KademliaResponse, MAX_VALUE_SIZE, load_bootstrap_contacts, save_bootstrap_contacts};
use crate::protocols::{AlternativeStore, FindValueReply, KademliaRpc, RejectReason, RpcAck, StoreRequest};
use crate::routing::{AddContactStatus, PendingEviction, RoutingTable, random_id_for_bucket};
use crate::store::{LocalStore, is_valid_ttl};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    Unjoined,
    Joining,
    Joined,
    Leaving,
}

/// Successful result of [`Node::find_value`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueOutcome {
    Values(Vec<Vec<u8>>),
    /// The key lives in an alternative store; fetch it from this contact.
    AlternativeStore(Contact),
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct NodeInner<N: KademliaRpc> {
    config: NodeConfig,
    params: LookupParams,
    network: Arc<N>,
    runtime: Handle,
    contact: RwLock<Contact>,
    routing: RwLock<RoutingTable>,
    address_book: Mutex<AddressBook>,
    store: RwLock<LocalStore>,
    state: Mutex<JoinState>,
    alternative_store: RwLock<Option<Arc<dyn AlternativeStore>>>,
    validator: RwLock<Option<Arc<dyn SignatureValidator>>>,
    bootstrap_path: Mutex<Option<PathBuf>>,
    rendezvous_alive: AtomicBool,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

pub struct Node<N: KademliaRpc> {
    inner: Arc<NodeInner<N>>,
}

impl<N: KademliaRpc> Clone for Node<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<N: KademliaRpc> std::fmt::Debug for Node<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.node_id())
            .field("state", &self.join_state())
            .finish_non_exhaustive()
    }
}

impl<N: KademliaRpc> Node<N> {
    /// Create an unjoined node. Must be called from within a tokio runtime.
    pub fn new(config: NodeConfig, network: Arc<N>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| Error::InvalidArgument("node must be created inside a tokio runtime".into()))?;

        let id = NodeId::random();
        let mut contact = Contact::new(id, config.external_addr, config.local_addr);
        contact.rendezvous = config.rendezvous_addr;

        let inner = NodeInner {
            params: LookupParams::from(&config),
            routing: RwLock::new(RoutingTable::new(id, config.k)),
            contact: RwLock::new(contact),
            network,
            runtime,
            address_book: Mutex::new(AddressBook::default()),
            store: RwLock::new(LocalStore::new()),
            state: Mutex::new(JoinState::Unjoined),
            alternative_store: RwLock::new(None),
            validator: RwLock::new(None),
            bootstrap_path: Mutex::new(None),
            rendezvous_alive: AtomicBool::new(true),
            maintenance: Mutex::new(Vec::new()),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn from_inner(inner: Arc<NodeInner<N>>) -> Self {
        Self { inner }
    }

    pub fn set_signature_validator(&self, validator: Option<Arc<dyn SignatureValidator>>) {
        *write(&self.inner.validator) = validator;
    }

    pub fn set_alternative_store(&self, store: Option<Arc<dyn AlternativeStore>>) {
        *write(&self.inner.alternative_store) = store;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn contact_info(&self) -> Contact {
        read(&self.inner.contact).clone()
    }

    pub fn node_id(&self) -> NodeId {
        read(&self.inner.contact).id
    }

    pub fn ip(&self) -> IpAddr {
        read(&self.inner.contact).external.ip()
    }

    pub fn port(&self) -> u16 {
        read(&self.inner.contact).external.port()
    }

    pub fn local_ip(&self) -> IpAddr {
        read(&self.inner.contact).local.ip()
    }

    pub fn local_port(&self) -> u16 {
        read(&self.inner.contact).local.port()
    }

    pub fn rendezvous_ip(&self) -> Option<IpAddr> {
        read(&self.inner.contact).rendezvous.map(|a| a.ip())
    }

    pub fn rendezvous_port(&self) -> Option<u16> {
        read(&self.inner.contact).rendezvous.map(|a| a.port())
    }

    pub fn join_state(&self) -> JoinState {
        *lock(&self.inner.state)
    }

    pub fn is_joined(&self) -> bool {
        self.join_state() == JoinState::Joined
    }

    pub fn node_type(&self) -> NodeType {
        self.inner.config.node_type
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn network(&self) -> Arc<N> {
        Arc::clone(&self.inner.network)
    }

    pub fn alternative_store(&self) -> Option<Arc<dyn AlternativeStore>> {
        read(&self.inner.alternative_store).clone()
    }

    pub fn routing_table_size(&self) -> usize {
        read(&self.inner.routing).len()
    }

    pub fn using_signatures(&self) -> bool {
        self.inner.config.keypair.is_some()
    }

    /// Sign `value` with the configured keypair.
    pub fn sign_value(&self, value: Vec<u8>) -> Option<SignedValue> {
        self.inner.config.keypair.as_ref().map(|kp| sign_value(kp, value))
    }

    /// Prove ownership of `key` with the configured keypair.
    pub fn sign_request(&self, key: &NodeId) -> Option<SignedRequest> {
        self.inner.config.keypair.as_ref().map(|kp| sign_request(kp, key))
    }

    fn validator(&self) -> Option<Arc<dyn SignatureValidator>> {
        read(&self.inner.validator).clone()
    }

    fn is_vault(&self) -> bool {
        self.inner.config.node_type == NodeType::Vault
    }

    fn ensure_joined(&self) -> Result<()> {
        if self.is_joined() { Ok(()) } else { Err(Error::NotJoined) }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Join under a fresh random identifier.
    pub async fn join(&self, bootstrap_path: &Path) -> Result<()> {
        self.join_with_id(NodeId::random(), bootstrap_path).await
    }

    /// Join using the contacts in `bootstrap_path` (plus any already in the
    /// routing table). Fails with [`Error::Bootstrap`] if none responds.
    pub async fn join_with_id(&self, id: NodeId, bootstrap_path: &Path) -> Result<()> {
        self.begin_join(id, bootstrap_path)?;

        let result = async {
            let mut contacts = load_bootstrap_contacts(bootstrap_path).await?;
            contacts.extend(read(&self.inner.routing).all_contacts());
            self.bootstrap(contacts, false).await
        }
        .await;

        self.finish_join(result)
    }

    /// Originate a new overlay with a random identifier.
    pub async fn join_first_node(&self, bootstrap_path: &Path, external: SocketAddr) -> Result<()> {
        self.join_first_node_with_id(NodeId::random(), bootstrap_path, external).await
    }

    /// Originate a new overlay: this node advertises `external`, records
    /// itself as the first bootstrap contact and is Joined even if no other
    /// contact answers.
    pub async fn join_first_node_with_id(
        &self,
        id: NodeId,
        bootstrap_path: &Path,
        external: SocketAddr,
    ) -> Result<()> {
        self.begin_join(id, bootstrap_path)?;
        {
            let mut contact = write(&self.inner.contact);
            contact.external = external;
            if contact.local.ip().is_unspecified() {
                contact.local = external;
            }
        }

        let known = match load_bootstrap_contacts(bootstrap_path).await {
            Ok(contacts) => contacts,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable bootstrap file");
                Vec::new()
            }
        };
        let me = self.contact_info();
        let mut persisted = vec![me.clone()];
        persisted.extend(known.iter().filter(|c| c.id != me.id).cloned());
        if let Err(e) = save_bootstrap_contacts(bootstrap_path, &persisted).await {
            warn!(error = %e, "failed to record first node in bootstrap file");
        }

        let mut contacts = known;
        contacts.extend(read(&self.inner.routing).all_contacts());
        let result = match self.bootstrap(contacts, true).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "first node bootstrap incomplete");
                Ok(())
            }
        };
        self.finish_join(result)
    }

    fn begin_join(&self, id: NodeId, bootstrap_path: &Path) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state != JoinState::Unjoined {
                return Err(Error::AlreadyJoining);
            }
            *state = JoinState::Joining;
        }
        *lock(&self.inner.bootstrap_path) = Some(bootstrap_path.to_path_buf());
        self.rekey(id);
        debug!(node = %id.short_hex(), path = %bootstrap_path.display(), "joining overlay");
        Ok(())
    }

    fn finish_join(&self, result: Result<()>) -> Result<()> {
        let node = self.node_id();
        match result {
            Ok(()) => {
                *lock(&self.inner.state) = JoinState::Joined;
                self.spawn_maintenance();
                info!(
                    node = %node.short_hex(),
                    contacts = self.routing_table_size(),
                    "joined overlay"
                );
                Ok(())
            }
            Err(e) => {
                *lock(&self.inner.state) = JoinState::Unjoined;
                warn!(node = %node.short_hex(), error = %e, "join failed");
                Err(e)
            }
        }
    }

    /// Switch to identifier `id`, re-bucketing any contacts already known.
    fn rekey(&self, id: NodeId) {
        write(&self.inner.contact).id = id;
        let mut routing = write(&self.inner.routing);
        if routing.self_id() == id {
            return;
        }
        let mut fresh = RoutingTable::new(id, self.inner.config.k);
        for contact in routing.all_contacts() {
            let rtt = contact.rtt_ms;
            fresh.add_contact(contact, rtt);
        }
        *routing = fresh;
    }

    /// Ping `contacts` in parallel, keep responders, then look up our own id.
    async fn bootstrap(&self, contacts: Vec<Contact>, tolerate_silence: bool) -> Result<()> {
        let me = self.node_id();
        let mut unique = HashSet::new();
        let contacts: Vec<Contact> = contacts
            .into_iter()
            .filter(|c| c.id != me && unique.insert(c.id))
            .collect();
        if contacts.is_empty() {
            return if tolerate_silence {
                Ok(())
            } else {
                Err(Error::Bootstrap("no bootstrap contacts".into()))
            };
        }

        let total = contacts.len();
        let pinged = fan_out(&self.inner.network, self.inner.config.rpc_timeout, contacts, |net, c| async move {
            net.ping(&c).await.map(|()| RpcAck::Accepted)
        })
        .await;
        debug!(node = %me.short_hex(), total, alive = pinged.acks, "bootstrap contacts pinged");

        if pinged.responded.is_empty() && !tolerate_silence {
            return Err(Error::Bootstrap(format!("none of {total} bootstrap contacts responded")));
        }
        self.record_responders(&pinged.responded);

        let outcome = self.lookup(me, QueryKind::FindNode).await;
        trace!(node = %me.short_hex(), found = outcome.closest.len(), "self lookup finished");
        Ok(())
    }

    /// Leave the overlay: persist routing contacts as bootstrap candidates,
    /// drop all stored values and return to `Unjoined`.
    pub async fn leave(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state != JoinState::Joined {
                return Err(Error::NotJoined);
            }
            *state = JoinState::Leaving;
        }
        for handle in lock(&self.inner.maintenance).drain(..) {
            handle.abort();
        }

        let contacts = read(&self.inner.routing).all_contacts();
        let path = lock(&self.inner.bootstrap_path).clone();
        if let Some(path) = path
            && !contacts.is_empty()
            && let Err(e) = save_bootstrap_contacts(&path, &contacts).await
        {
            warn!(error = %e, "failed to persist bootstrap contacts");
        }

        write(&self.inner.store).clear();
        let id = self.node_id();
        *write(&self.inner.routing) = RoutingTable::new(id, self.inner.config.k);
        *lock(&self.inner.state) = JoinState::Unjoined;
        info!(node = %id.short_hex(), persisted = contacts.len(), "left overlay");
        Ok(())
    }

    /// Mark the rendezvous server dead (or alive again). A dead server is
    /// dropped from our contact and every classification that relied on it
    /// is re-evaluated on next use.
    pub fn handle_dead_rendezvous_server(&self, dead: bool) {
        self.inner.rendezvous_alive.store(!dead, Ordering::SeqCst);
        if dead {
            write(&self.inner.contact).rendezvous = None;
            let invalidated = lock(&self.inner.address_book).invalidate_rendezvous_dependents();
            debug!(invalidated, "rendezvous server dead, classifications reset");
        } else {
            write(&self.inner.contact).rendezvous = self.inner.config.rendezvous_addr;
        }
    }

    pub fn rendezvous_alive(&self) -> bool {
        self.inner.rendezvous_alive.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Routing table (local)
    // ------------------------------------------------------------------

    /// Offer a contact. `only_db` records it in the address book only.
    ///
    /// A full bucket returns [`AddContactStatus::BucketFull`] at once and
    /// probes the bucket's oldest contact in the background; the newcomer
    /// replaces it if the probe fails.
    pub fn add_contact(&self, contact: Contact, rtt_ms: f32, only_db: bool) -> AddContactStatus {
        if only_db {
            return self.add_db_contact(contact);
        }
        let (status, pending) = write(&self.inner.routing).add_contact(contact, rtt_ms);
        if let Some(pending) = pending {
            self.spawn_eviction_probe(pending);
        }
        status
    }

    /// Like [`Node::add_contact`] but waits for an eviction probe and
    /// returns the final status.
    pub async fn add_contact_probed(&self, contact: Contact, rtt_ms: f32, only_db: bool) -> AddContactStatus {
        if only_db {
            return self.add_db_contact(contact);
        }
        let (status, pending) = write(&self.inner.routing).add_contact(contact, rtt_ms);
        match pending {
            Some(pending) => probe_and_apply(&self.inner, pending).await,
            None => status,
        }
    }

    fn add_db_contact(&self, contact: Contact) -> AddContactStatus {
        if contact.id == self.node_id() {
            return AddContactStatus::Ignored;
        }
        if lock(&self.inner.address_book).record_contact(contact) {
            AddContactStatus::Added
        } else {
            AddContactStatus::Updated
        }
    }

    fn spawn_eviction_probe(&self, pending: PendingEviction) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                probe_and_apply(&inner, pending).await;
            }
        });
    }

    pub fn remove_contact(&self, id: &NodeId) -> bool {
        write(&self.inner.routing).remove_contact(id)
    }

    pub fn get_contact(&self, id: &NodeId) -> Option<Contact> {
        read(&self.inner.routing).get_contact(id)
    }

    /// Contact recorded with `only_db`.
    pub fn get_db_contact(&self, id: &NodeId) -> Option<Contact> {
        lock(&self.inner.address_book).contact(id)
    }

    /// Up to k known contacts nearest `key`, nearest first, skipping `exclude`.
    pub fn get_nodes_from_routing_table(&self, key: &NodeId, exclude: &[Contact]) -> Vec<Contact> {
        let exclude: HashSet<NodeId> = exclude.iter().map(|c| c.id).collect();
        read(&self.inner.routing).get_nodes(key, &exclude, self.inner.config.k)
    }

    pub fn get_random_contacts(&self, count: usize, exclude: &[Contact]) -> Vec<Contact> {
        let exclude: HashSet<NodeId> = exclude.iter().map(|c| c.id).collect();
        read(&self.inner.routing).random_contacts(count, &exclude)
    }

    fn record_responders(&self, responded: &[(Contact, f32)]) {
        if !matches!(self.join_state(), JoinState::Joining | JoinState::Joined) {
            return;
        }
        for (contact, rtt_ms) in responded {
            self.add_contact(contact.clone(), *rtt_ms, false);
        }
    }

    // ------------------------------------------------------------------
    // Value store (local)
    // ------------------------------------------------------------------

    pub fn find_value_local(&self, key: &NodeId) -> Vec<Vec<u8>> {
        read(&self.inner.store).find(key)
    }

    /// Store a record on this node only. Client nodes hold no data.
    pub fn store_value_local(&self, key: NodeId, value: Vec<u8>, ttl: i32) -> bool {
        self.is_vault() && write(&self.inner.store).store(key, value, ttl)
    }

    pub fn refresh_value_local(&self, key: NodeId, value: Vec<u8>, ttl: i32) -> bool {
        self.is_vault() && write(&self.inner.store).refresh(key, value, ttl)
    }

    pub fn key_value_ttl(&self, key: &NodeId, value: &[u8]) -> i64 {
        read(&self.inner.store).ttl(key, value)
    }

    pub fn key_last_refresh_time(&self, key: &NodeId, value: &[u8]) -> u64 {
        read(&self.inner.store).last_refresh_time(key, value)
    }

    pub fn key_expire_time(&self, key: &NodeId, value: &[u8]) -> i64 {
        read(&self.inner.store).expire_time(key, value)
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    /// Classify contact `id` as reachable on its local endpoint or not.
    /// Decisions are cached; only an unknown contact sharing our public
    /// address is probed.
    pub async fn check_contact_local_address(
        &self,
        id: &NodeId,
        local_ip: IpAddr,
        local_port: u16,
        external_ip: IpAddr,
    ) -> ConnectionType {
        let cached = lock(&self.inner.address_book).classification(id, local_ip);
        if let Some(known) = cached {
            return known;
        }

        let via_rendezvous = self
            .get_contact(id)
            .or_else(|| self.get_db_contact(id))
            .is_some_and(|c| c.rendezvous.is_some());
        let decision = match classify_without_probe(self.ip(), external_ip) {
            Some(decision) => decision,
            None => {
                let addr = SocketAddr::new(local_ip, local_port);
                probe_local_endpoint(&*self.inner.network, addr, self.inner.config.rpc_timeout).await
            }
        };

        lock(&self.inner.address_book).record_classification(*id, decision, via_rendezvous);
        write(&self.inner.routing).set_connection(id, decision);
        debug!(peer = %id.short_hex(), ?decision, "contact classified");
        decision
    }

    /// Pin contact `id` at `ip` to REMOTE, overriding later LOCAL checks.
    pub fn update_contact_to_remote(&self, id: &NodeId, ip: IpAddr) {
        lock(&self.inner.address_book).force_remote(*id, ip);
        write(&self.inner.routing).set_connection(id, ConnectionType::Remote);
    }

    /// Remove a REMOTE pin so the next check re-evaluates.
    pub fn clear_contact_override(&self, id: &NodeId) -> bool {
        lock(&self.inner.address_book).clear_override(id)
    }

    // ------------------------------------------------------------------
    // Network operations
    // ------------------------------------------------------------------

    async fn lookup(&self, target: NodeId, kind: QueryKind) -> LookupOutcome {
        let me = self.node_id();
        let seed = read(&self.inner.routing).closest(&target, self.inner.config.k);
        let outcome = iterative_lookup(&self.inner.network, &self.inner.params, me, target, seed, kind).await;
        if !outcome.failed.is_empty() {
            trace!(lookup = %target.short_hex(), failed = outcome.failed.len(), "unresponsive contacts skipped");
        }
        self.record_responders(&outcome.responded);
        outcome
    }

    /// The k contacts nearest `key` across the overlay, nearest first.
    pub async fn find_k_closest_nodes(&self, key: NodeId) -> Result<Vec<Contact>> {
        self.ensure_joined()?;
        Ok(self.lookup(key, QueryKind::FindNode).await.closest)
    }

    /// Resolve a node's contact details; `local` answers from the routing table only.
    pub async fn get_node_contact_details(&self, id: NodeId, local: bool) -> Result<Contact> {
        if id == self.node_id() {
            return Ok(self.contact_info());
        }
        if local {
            return self.get_contact(&id).ok_or(Error::NotFound);
        }
        self.ensure_joined()?;

        let outcome = self.lookup(id, QueryKind::FindNode).await;
        outcome
            .responded
            .iter()
            .map(|(c, _)| c)
            .chain(outcome.closest.iter())
            .find(|c| c.id == id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    pub async fn ping(&self, contact: &Contact) -> Result<()> {
        self.ensure_joined()?;
        let start = Instant::now();
        match tokio::time::timeout(self.inner.config.rpc_timeout, self.inner.network.ping(contact)).await {
            Ok(Ok(())) => {
                let rtt_ms = start.elapsed().as_secs_f32() * 1000.0;
                self.add_contact(contact.clone(), rtt_ms, false);
                Ok(())
            }
            Ok(Err(e)) => {
                trace!(peer = %contact.id.short_hex(), error = %e, "ping failed");
                Err(Error::Timeout)
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    pub async fn ping_id(&self, id: NodeId) -> Result<()> {
        let contact = self.get_node_contact_details(id, false).await?;
        self.ping(&contact).await
    }

    /// Look up `key`: alternative store first (when asked), then this
    /// node's records, then the overlay.
    pub async fn find_value(&self, key: NodeId, check_alternative_store: bool) -> Result<FindValueOutcome> {
        self.ensure_joined()?;
        if check_alternative_store && self.alternative_store().is_some_and(|alt| alt.has(&key)) {
            return Ok(FindValueOutcome::AlternativeStore(self.contact_info()));
        }
        let local = self.find_value_local(&key);
        if !local.is_empty() {
            return Ok(FindValueOutcome::Values(local));
        }

        let outcome = self.lookup(key, QueryKind::FindValue).await;
        match outcome.found {
            Some(Found::Values { values, holder }) => {
                debug!(key = %key.short_hex(), holder = %holder.id.short_hex(), "value found");
                Ok(FindValueOutcome::Values(values))
            }
            Some(Found::Redirect(holder)) => Ok(FindValueOutcome::AlternativeStore(holder)),
            None => Err(Error::NotFound),
        }
    }

    async fn replica_targets(&self, key: NodeId) -> Vec<Contact> {
        self.lookup(key, QueryKind::FindNode).await.closest
    }

    /// Store an unsigned value at the k nodes closest to `key`.
    pub async fn store_value(&self, key: NodeId, value: Vec<u8>, ttl: i32) -> Result<()> {
        self.ensure_joined()?;
        check_mutation(&value, ttl)?;

        let targets = self.replica_targets(key).await;
        let request = StoreRequest::Unsigned { key, value: value.clone(), ttl };
        let mut result = self.fan_out_store(targets, request).await;
        if self.is_vault() {
            result.record_local(write(&self.inner.store).store_unsigned_at(key, value, ttl, now_secs()));
        }
        self.conclude("store", &key, result)
    }

    /// Store a signed value; `request` must prove ownership of `key`.
    pub async fn store_signed_value(
        &self,
        key: NodeId,
        value: SignedValue,
        request: SignedRequest,
        ttl: i32,
    ) -> Result<()> {
        self.ensure_joined()?;
        check_mutation(&value.value, ttl)?;
        let validator = self.validator().ok_or(Error::SignatureInvalid)?;

        let targets = self.replica_targets(key).await;
        let mut result = self
            .fan_out_store(
                targets,
                StoreRequest::Signed {
                    key,
                    value: value.clone(),
                    request: request.clone(),
                    ttl,
                },
            )
            .await;
        if self.is_vault() {
            let local = write(&self.inner.store).store_signed(&*validator, key, &value, &request, ttl);
            result.record_local(local);
        }
        self.conclude("signed store", &key, result)
    }

    /// Delete a signed record everywhere it is replicated.
    pub async fn delete_value(&self, key: NodeId, value: SignedValue, request: SignedRequest) -> Result<()> {
        self.ensure_joined()?;
        let validator = self.validator().ok_or(Error::SignatureInvalid)?;

        let targets = self.replica_targets(key).await;
        let (v, r) = (value.clone(), request.clone());
        let mut result = fan_out(&self.inner.network, self.inner.config.rpc_timeout, targets, move |net, c| {
            let (v, r) = (v.clone(), r.clone());
            async move { net.delete(&c, key, v, r).await }
        })
        .await;
        self.record_responders(&result.responded);
        if self.is_vault() {
            let local = write(&self.inner.store).delete_signed(&*validator, &key, &value, &request);
            result.record_local(local);
        }
        self.conclude("delete", &key, result)
    }

    /// Replace `old_value` with `new_value` everywhere it is replicated.
    pub async fn update_value(
        &self,
        key: NodeId,
        old_value: SignedValue,
        new_value: SignedValue,
        request: SignedRequest,
        ttl: i32,
    ) -> Result<()> {
        self.ensure_joined()?;
        check_mutation(&new_value.value, ttl)?;
        let validator = self.validator().ok_or(Error::SignatureInvalid)?;

        let targets = self.replica_targets(key).await;
        let (o, n, r) = (old_value.clone(), new_value.clone(), request.clone());
        let mut result = fan_out(&self.inner.network, self.inner.config.rpc_timeout, targets, move |net, c| {
            let (o, n, r) = (o.clone(), n.clone(), r.clone());
            async move { net.update(&c, key, o, n, r, ttl).await }
        })
        .await;
        self.record_responders(&result.responded);
        if self.is_vault() {
            let local = write(&self.inner.store).update_signed(&*validator, &key, &old_value, &new_value, &request, ttl);
            result.record_local(local);
        }
        self.conclude("update", &key, result)
    }

    async fn fan_out_store(&self, targets: Vec<Contact>, request: StoreRequest) -> FanOutResult {
        let result = fan_out(&self.inner.network, self.inner.config.rpc_timeout, targets, move |net, c| {
            let request = request.clone();
            async move { net.store(&c, request).await }
        })
        .await;
        self.record_responders(&result.responded);
        result
    }

    fn conclude(&self, op: &'static str, key: &NodeId, result: FanOutResult) -> Result<()> {
        let (acks, targets) = (result.acks, result.targets);
        let outcome = result.into_result(self.inner.config.store_quorum);
        match &outcome {
            Ok(()) => debug!(op, key = %key.short_hex(), acks, targets, "mutation accepted"),
            Err(Error::SignatureInvalid) => warn!(op, key = %key.short_hex(), "mutation rejected: signature invalid"),
            Err(e) => debug!(op, key = %key.short_hex(), acks, targets, error = %e, "mutation failed"),
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Inbound RPC handlers
    // ------------------------------------------------------------------

    fn record_caller(&self, from: &Contact) {
        self.record_responders(&[(from.clone(), from.rtt_ms)]);
    }

    pub fn handle_ping(&self, from: &Contact) {
        self.record_caller(from);
    }

    pub fn handle_find_node(&self, from: &Contact, target: NodeId) -> Vec<Contact> {
        self.record_caller(from);
        let exclude: HashSet<NodeId> = [from.id].into_iter().collect();
        read(&self.inner.routing).get_nodes(&target, &exclude, self.inner.config.k)
    }

    /// Answer a FindValue. A key held by the alternative store always
    /// redirects to us, whatever the lookup initiator asked for locally.
    pub fn handle_find_value(&self, from: &Contact, key: NodeId) -> FindValueReply {
        self.record_caller(from);
        if self.alternative_store().is_some_and(|alt| alt.has(&key)) {
            return FindValueReply::Redirect(self.contact_info());
        }
        let values = self.find_value_local(&key);
        if !values.is_empty() {
            return FindValueReply::Values(values);
        }
        let exclude: HashSet<NodeId> = [from.id].into_iter().collect();
        FindValueReply::CloserNodes(read(&self.inner.routing).get_nodes(&key, &exclude, self.inner.config.k))
    }

    pub fn handle_store(&self, from: &Contact, request: StoreRequest) -> RpcAck {
        self.record_caller(from);
        if !self.is_vault() {
            return RpcAck::Rejected(RejectReason::ReadOnly);
        }
        let result = match request {
            StoreRequest::Unsigned { key, value, ttl } => {
                write(&self.inner.store).store_unsigned_at(key, value, ttl, now_secs())
            }
            StoreRequest::Signed { key, value, request, ttl } => match self.validator() {
                Some(validator) => write(&self.inner.store).store_signed(&*validator, key, &value, &request, ttl),
                None => Err(RejectReason::SignatureInvalid),
            },
        };
        to_ack(result)
    }

    pub fn handle_delete(&self, from: &Contact, key: NodeId, value: SignedValue, request: SignedRequest) -> RpcAck {
        self.record_caller(from);
        if !self.is_vault() {
            return RpcAck::Rejected(RejectReason::ReadOnly);
        }
        let result = match self.validator() {
            Some(validator) => write(&self.inner.store).delete_signed(&*validator, &key, &value, &request),
            None => Err(RejectReason::SignatureInvalid),
        };
        to_ack(result)
    }

    pub fn handle_update(
        &self,
        from: &Contact,
        key: NodeId,
        old_value: SignedValue,
        new_value: SignedValue,
        request: SignedRequest,
        ttl: i32,
    ) -> RpcAck {
        self.record_caller(from);
        if !self.is_vault() {
            return RpcAck::Rejected(RejectReason::ReadOnly);
        }
        let result = match self.validator() {
            Some(validator) => {
                write(&self.inner.store).update_signed(&*validator, &key, &old_value, &new_value, &request, ttl)
            }
            None => Err(RejectReason::SignatureInvalid),
        };
        to_ack(result)
    }

    /// Dispatch an inbound envelope to the matching handler.
    pub fn handle_request(&self, request: KademliaRequest) -> KademliaResponse {
        match request {
            KademliaRequest::Ping { from } => {
                self.handle_ping(&from);
                KademliaResponse::Pong
            }
            KademliaRequest::FindNode { from, target } => KademliaResponse::Nodes(self.handle_find_node(&from, target)),
            KademliaRequest::FindValue { from, key } => KademliaResponse::Value(self.handle_find_value(&from, key)),
            KademliaRequest::Store { from, request } => KademliaResponse::Ack(self.handle_store(&from, request)),
            KademliaRequest::Delete {
                from,
                key,
                value,
                request,
            } => KademliaResponse::Ack(self.handle_delete(&from, key, value, request)),
            KademliaRequest::Update {
                from,
                key,
                old_value,
                new_value,
                request,
                ttl,
            } => KademliaResponse::Ack(self.handle_update(&from, key, old_value, new_value, request, ttl)),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn spawn_maintenance(&self) {
        let weak = Arc::downgrade(&self.inner);
        let expiry = self.inner.runtime.spawn(periodic(
            Weak::clone(&weak),
            self.inner.config.expiry_check_interval,
            |node| async move {
                let removed = write(&node.inner.store).sweep_expired_at(now_secs());
                if removed > 0 {
                    debug!(removed, "expired records swept");
                }
            },
        ));
        let refresh = self.inner.runtime.spawn(periodic(weak, self.inner.config.refresh_interval, |node| async move {
            node.refresh_buckets().await;
            node.republish().await;
        }));
        lock(&self.inner.maintenance).extend([expiry, refresh]);
    }

    /// Random lookup in every bucket not touched for a refresh interval.
    async fn refresh_buckets(&self) {
        let interval = self.inner.config.refresh_interval;
        let stale = read(&self.inner.routing).stale_bucket_indices(interval);
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "refreshing stale routing buckets");
        let me = self.node_id();
        for bucket_idx in stale {
            let target = random_id_for_bucket(&me, bucket_idx);
            self.lookup(target, QueryKind::FindNode).await;
            write(&self.inner.routing).mark_bucket_refreshed(bucket_idx);
        }
    }

    /// Push records not refreshed for a refresh interval back to their k closest nodes.
    async fn republish(&self) {
        if !self.is_vault() {
            return;
        }
        let now = now_secs();
        let due = read(&self.inner.store).due_for_republish_at(now, self.inner.config.refresh_interval.as_secs());
        if due.is_empty() {
            return;
        }

        let mut by_key: HashMap<NodeId, Vec<_>> = HashMap::new();
        for (key, record) in due {
            by_key.entry(key).or_default().push(record);
        }
        debug!(keys = by_key.len(), "republishing records");

        for (key, records) in by_key {
            let targets = self.replica_targets(key).await;
            for record in records {
                let request = match (record.signed_value(), record.signed_request()) {
                    (Some(value), Some(request)) => StoreRequest::Signed {
                        key,
                        value,
                        request,
                        ttl: record.ttl,
                    },
                    _ => StoreRequest::Unsigned {
                        key,
                        value: record.value.clone(),
                        ttl: record.ttl,
                    },
                };
                let result = self.fan_out_store(targets.clone(), request).await;
                trace!(key = %key.short_hex(), acks = result.acks, "record republished");
                write(&self.inner.store).refresh_at(key, record.value, record.ttl, now);
            }
        }
    }
}

fn check_mutation(value: &[u8], ttl: i32) -> Result<()> {
    if !is_valid_ttl(ttl) {
        return Err(Error::InvalidArgument(format!("invalid ttl {ttl}")));
    }
    if value.is_empty() || value.len() > MAX_VALUE_SIZE {
        return Err(Error::InvalidArgument(format!("value size {} out of range", value.len())));
    }
    Ok(())
}

fn to_ack(result: std::result::Result<(), RejectReason>) -> RpcAck {
    match result {
        Ok(()) => RpcAck::Accepted,
        Err(reason) => RpcAck::Rejected(reason),
    }
}

/// Probe the oldest contact of a full bucket and settle the eviction.
async fn probe_and_apply<N: KademliaRpc>(inner: &NodeInner<N>, pending: PendingEviction) -> AddContactStatus {
    let alive = matches!(
        tokio::time::timeout(inner.config.rpc_timeout, inner.network.ping(&pending.oldest)).await,
        Ok(Ok(()))
    );
    trace!(
        oldest = %pending.oldest.id.short_hex(),
        newcomer = %pending.new_contact.id.short_hex(),
        alive,
        "bucket eviction probe"
    );
    write(&inner.routing).apply_probe_result(pending, alive)
}

/// Run `tick` every `period` (first run after one period) while the node lives.
async fn periodic<N, F, Fut>(weak: Weak<NodeInner<N>>, period: Duration, tick: F)
where
    N: KademliaRpc,
    F: Fn(Node<N>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        tick(Node::from_inner(inner)).await;
    }
}
