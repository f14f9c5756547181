//! Integration tests for the Node public API.
//!
//! Nodes are wired together through an in-memory mesh: every RPC is
//! delivered straight to the addressed node's `handle_*` method, so
//! multi-node scenarios run without sockets.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Result as AnyResult, anyhow};
use async_trait::async_trait;
use kadnode::messages::load_bootstrap_contacts;
use kadnode::{
    AddContactStatus, AlternativeStore, ConnectionType, Contact, Ed25519Validator, Error, FindValueOutcome,
    FindValueReply, JoinState, KademliaRpc, Keypair, Node, NodeConfig, NodeId, NodeType, RpcAck, SignedRequest,
    SignedValue, StoreQuorum, StoreRequest,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(30000);

fn next_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], PORT_COUNTER.fetch_add(1, Ordering::SeqCst)))
}

fn bootstrap_path() -> PathBuf {
    std::env::temp_dir().join(format!("kadnode-it-{}.bin", NodeId::random().short_hex()))
}

fn test_config() -> NodeConfig {
    NodeConfig {
        rpc_timeout: Duration::from_millis(200),
        lookup_timeout: Duration::from_secs(2),
        ..NodeConfig::with_addr(next_addr())
    }
}

#[derive(Default)]
struct Registry {
    nodes: RwLock<HashMap<SocketAddr, Node<Mesh>>>,
    down: RwLock<HashSet<SocketAddr>>,
    calls: Mutex<Vec<(&'static str, SocketAddr)>>,
}

impl Registry {
    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls_of(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(o, _)| *o == op).count()
    }

    fn take_down(&self, addr: SocketAddr) {
        self.down.write().unwrap().insert(addr);
    }
}

/// Transport of one node in the mesh.
struct Mesh {
    addr: SocketAddr,
    registry: Arc<Registry>,
}

impl Mesh {
    fn me(&self) -> AnyResult<Contact> {
        self.registry
            .nodes
            .read()
            .unwrap()
            .get(&self.addr)
            .map(|n| n.contact_info())
            .ok_or_else(|| anyhow!("sender not registered"))
    }

    fn peer(&self, op: &'static str, addr: SocketAddr) -> AnyResult<Node<Mesh>> {
        self.registry.calls.lock().unwrap().push((op, addr));
        if self.registry.down.read().unwrap().contains(&addr) {
            return Err(anyhow!("{addr} is down"));
        }
        self.registry
            .nodes
            .read()
            .unwrap()
            .get(&addr)
            .cloned()
            .ok_or_else(|| anyhow!("no node at {addr}"))
    }
}

#[async_trait]
impl KademliaRpc for Mesh {
    async fn ping(&self, to: &Contact) -> AnyResult<()> {
        let me = self.me()?;
        self.peer("ping", to.external)?.handle_ping(&me);
        Ok(())
    }

    async fn ping_addr(&self, addr: SocketAddr) -> AnyResult<()> {
        self.peer("ping_addr", addr).map(|_| ())
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> AnyResult<Vec<Contact>> {
        let me = self.me()?;
        Ok(self.peer("find_node", to.external)?.handle_find_node(&me, target))
    }

    async fn find_value(&self, to: &Contact, key: NodeId) -> AnyResult<FindValueReply> {
        let me = self.me()?;
        Ok(self.peer("find_value", to.external)?.handle_find_value(&me, key))
    }

    async fn store(&self, to: &Contact, request: StoreRequest) -> AnyResult<RpcAck> {
        let me = self.me()?;
        Ok(self.peer("store", to.external)?.handle_store(&me, request))
    }

    async fn delete(&self, to: &Contact, key: NodeId, value: SignedValue, request: SignedRequest) -> AnyResult<RpcAck> {
        let me = self.me()?;
        Ok(self.peer("delete", to.external)?.handle_delete(&me, key, value, request))
    }

    async fn update(
        &self,
        to: &Contact,
        key: NodeId,
        old_value: SignedValue,
        new_value: SignedValue,
        request: SignedRequest,
        ttl: i32,
    ) -> AnyResult<RpcAck> {
        let me = self.me()?;
        Ok(self
            .peer("update", to.external)?
            .handle_update(&me, key, old_value, new_value, request, ttl))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spawn_node(registry: &Arc<Registry>, config: NodeConfig) -> Node<Mesh> {
    init_tracing();
    let addr = config.external_addr;
    let mesh = Mesh {
        addr,
        registry: Arc::clone(registry),
    };
    let node = Node::new(config, Arc::new(mesh)).expect("node");
    node.set_signature_validator(Some(Arc::new(Ed25519Validator)));
    registry.nodes.write().unwrap().insert(addr, node.clone());
    node
}

/// A first node plus `extra` nodes joined through it.
async fn overlay(registry: &Arc<Registry>, extra: usize) -> (Vec<Node<Mesh>>, PathBuf) {
    let path = bootstrap_path();
    let first_config = test_config();
    let first_addr = first_config.external_addr;
    let first = spawn_node(registry, first_config);
    first.join_first_node(&path, first_addr).await.expect("first node");

    let mut nodes = vec![first];
    for _ in 0..extra {
        let node = spawn_node(registry, test_config());
        node.join(&path).await.expect("join");
        nodes.push(node);
    }
    (nodes, path)
}

/// An identifier sharing exactly `bucket` leading bits with `me`.
fn id_in_bucket(me: &NodeId, bucket: usize) -> NodeId {
    let mut bytes = *NodeId::random().as_bytes();
    let mine = me.as_bytes();
    for bit in 0..=bucket {
        let (byte, mask) = (bit / 8, 0x80u8 >> (bit % 8));
        let want = if bit == bucket { !mine[byte] & mask } else { mine[byte] & mask };
        bytes[byte] = (bytes[byte] & !mask) | want;
    }
    NodeId::from_bytes(bytes)
}

struct Holds(HashSet<NodeId>);

impl AlternativeStore for Holds {
    fn has(&self, key: &NodeId) -> bool {
        self.0.contains(key)
    }
}

#[tokio::test]
async fn added_contact_is_returned() {
    let registry = Arc::new(Registry::default());
    let node = spawn_node(&registry, test_config());
    let b = Contact::single(NodeId::random(), next_addr());

    assert_eq!(node.add_contact(b.clone(), 10.0, false), AddContactStatus::Added);
    let found = node.get_contact(&b.id).expect("contact present");
    assert_eq!(found.id, b.id);
    assert_eq!(found.external, b.external);

    assert_eq!(node.add_contact(b.clone(), 12.0, false), AddContactStatus::Updated);
    assert_eq!(node.routing_table_size(), 1);
    assert!(node.remove_contact(&b.id));
    assert!(node.get_contact(&b.id).is_none());
    assert!(!node.remove_contact(&b.id));
}

#[tokio::test]
async fn unjoined_node_issues_no_network_io() {
    let registry = Arc::new(Registry::default());
    let node = spawn_node(&registry, test_config());

    let result = node.join(&bootstrap_path()).await;
    assert!(matches!(result, Err(Error::Bootstrap(_))));
    assert_eq!(node.join_state(), JoinState::Unjoined);

    let key = NodeId::hash_of(b"k");
    assert_eq!(node.store_value(key, b"v".to_vec(), 60).await, Err(Error::NotJoined));
    assert_eq!(node.find_value(key, true).await, Err(Error::NotJoined));
    assert_eq!(node.get_node_contact_details(key, false).await, Err(Error::NotJoined));
    assert_eq!(registry.call_count(), 0);
}

#[tokio::test]
async fn nodes_join_through_first_node() {
    let registry = Arc::new(Registry::default());
    let (nodes, path) = overlay(&registry, 3).await;

    let persisted = load_bootstrap_contacts(&path).await.expect("bootstrap file");
    assert_eq!(persisted[0].id, nodes[0].node_id());

    for node in &nodes {
        assert!(node.is_joined());
        assert!(node.routing_table_size() >= 1);
    }
    assert_eq!(nodes[1].join(&path).await, Err(Error::AlreadyJoining));
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn find_k_closest_returns_nearest_k() {
    let registry = Arc::new(Registry::default());
    let k = 4;
    let querier_config = NodeConfig { k, ..test_config() };
    let querier_addr = querier_config.external_addr;
    let querier = spawn_node(&registry, querier_config);
    let me = NodeId::random();
    let path = bootstrap_path();
    querier
        .join_first_node_with_id(me, &path, querier_addr)
        .await
        .expect("first node");

    let mut known = Vec::new();
    for bucket in 0..3 {
        for _ in 0..k {
            let peer = spawn_node(&registry, test_config());
            let contact = Contact::single(id_in_bucket(&me, bucket), peer.contact_info().external);
            assert_eq!(querier.add_contact(contact.clone(), 5.0, false), AddContactStatus::Added);
            known.push(contact);
        }
    }
    assert_eq!(querier.routing_table_size(), 3 * k);

    let target = id_in_bucket(&me, 1);
    let found = querier.find_k_closest_nodes(target).await.expect("lookup");
    assert_eq!(found.len(), k);

    let found_ids: HashSet<NodeId> = found.iter().map(|c| c.id).collect();
    let farthest_found = found.last().expect("non-empty").id.distance(&target);
    for pair in found.windows(2) {
        assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
    }
    for excluded in known.iter().filter(|c| !found_ids.contains(&c.id)) {
        assert!(excluded.id.distance(&target) > farthest_found);
    }
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn value_stored_by_client_is_found_by_another_client() {
    let registry = Arc::new(Registry::default());
    let (vaults, path) = overlay(&registry, 2).await;

    let client_config = || NodeConfig {
        node_type: NodeType::Client,
        ..test_config()
    };
    let writer = spawn_node(&registry, client_config());
    writer.join(&path).await.expect("writer join");
    let reader = spawn_node(&registry, client_config());
    reader.join(&path).await.expect("reader join");

    let key = NodeId::hash_of(b"greeting");
    writer.store_value(key, b"hello".to_vec(), 3600).await.expect("store");
    assert!(writer.find_value_local(&key).is_empty());
    assert!(vaults.iter().any(|v| v.find_value_local(&key) == vec![b"hello".to_vec()]));

    assert_eq!(
        reader.find_value(key, false).await,
        Ok(FindValueOutcome::Values(vec![b"hello".to_vec()]))
    );
    assert_eq!(
        reader.find_value(NodeId::hash_of(b"missing"), false).await,
        Err(Error::NotFound)
    );
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn delete_with_wrong_key_leaves_value() {
    let registry = Arc::new(Registry::default());
    let (nodes, path) = overlay(&registry, 1).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let owner = Keypair::generate();
    let intruder = Keypair::generate();
    let key = NodeId::hash_of(&owner.public_key_bytes());
    let value = kadnode::crypto::sign_value(&owner, b"original".to_vec());
    let request = kadnode::crypto::sign_request(&owner, &key);

    b.store_signed_value(key, value.clone(), request, 3600)
        .await
        .expect("signed store");
    assert_eq!(a.find_value_local(&key), vec![b"original".to_vec()]);

    let forged = kadnode::crypto::sign_request(&intruder, &key);
    assert_eq!(b.delete_value(key, value, forged).await, Err(Error::SignatureInvalid));
    assert_eq!(a.find_value_local(&key), vec![b"original".to_vec()]);
    assert_eq!(b.find_value_local(&key), vec![b"original".to_vec()]);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn owner_updates_and_deletes_signed_value() {
    let registry = Arc::new(Registry::default());
    let (nodes, path) = overlay(&registry, 1).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    let owner = Keypair::generate();
    let key = NodeId::hash_of(b"profile");
    let v1 = kadnode::crypto::sign_value(&owner, b"v1".to_vec());
    let v2 = kadnode::crypto::sign_value(&owner, b"v2".to_vec());
    let request = kadnode::crypto::sign_request(&owner, &key);

    a.store_signed_value(key, v1.clone(), request.clone(), -1)
        .await
        .expect("store");
    a.update_value(key, v1, v2.clone(), request.clone(), -1)
        .await
        .expect("update");
    assert_eq!(b.find_value_local(&key), vec![b"v2".to_vec()]);
    assert_eq!(b.key_value_ttl(&key, b"v2"), -1);

    a.delete_value(key, v2, request).await.expect("delete");
    assert!(a.find_value_local(&key).is_empty());
    assert!(b.find_value_local(&key).is_empty());
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn signed_operations_fail_closed_without_validator() {
    let registry = Arc::new(Registry::default());
    let (nodes, path) = overlay(&registry, 1).await;
    nodes[0].set_signature_validator(None);

    let owner = Keypair::generate();
    let key = NodeId::hash_of(b"k");
    let value = kadnode::crypto::sign_value(&owner, b"v".to_vec());
    let request = kadnode::crypto::sign_request(&owner, &key);
    assert_eq!(
        nodes[0].store_signed_value(key, value, request, 60).await,
        Err(Error::SignatureInvalid)
    );
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn all_quorum_fails_when_a_replica_is_read_only() {
    let registry = Arc::new(Registry::default());
    let path = bootstrap_path();
    let strict_config = NodeConfig {
        store_quorum: StoreQuorum::All,
        ..test_config()
    };
    let strict_addr = strict_config.external_addr;
    let strict = spawn_node(&registry, strict_config);
    strict.join_first_node(&path, strict_addr).await.expect("first node");

    let client = spawn_node(
        &registry,
        NodeConfig {
            node_type: NodeType::Client,
            ..test_config()
        },
    );
    client.join(&path).await.expect("client join");

    let result = strict.store_value(NodeId::hash_of(b"k"), b"v".to_vec(), 60).await;
    assert_eq!(result, Err(Error::QuorumNotReached { acks: 1, targets: 2 }));
    assert_eq!(registry.calls_of("store"), 1);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn alternative_store_short_circuits_find_value() {
    let registry = Arc::new(Registry::default());
    let (nodes, path) = overlay(&registry, 2).await;
    let node = &nodes[0];
    let key = NodeId::hash_of(b"elsewhere");
    node.set_alternative_store(Some(Arc::new(Holds([key].into_iter().collect()))));

    let before = registry.call_count();
    let outcome = node.find_value(key, true).await.expect("find");
    assert_eq!(outcome, FindValueOutcome::AlternativeStore(node.contact_info()));
    assert_eq!(registry.call_count(), before);

    assert_eq!(
        nodes[1].find_value(key, true).await,
        Ok(FindValueOutcome::AlternativeStore(node.contact_info()))
    );
    // The holder redirects even when the initiator skips its own alternative store.
    assert_eq!(
        nodes[1].find_value(key, false).await,
        Ok(FindValueOutcome::AlternativeStore(node.contact_info()))
    );
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn contact_details_and_ping_over_network() {
    let registry = Arc::new(Registry::default());
    let (nodes, path) = overlay(&registry, 3).await;
    let (asker, wanted) = (&nodes[3], &nodes[1]);

    let details = asker
        .get_node_contact_details(wanted.node_id(), false)
        .await
        .expect("details");
    assert_eq!(details.external, wanted.contact_info().external);
    asker.ping_id(wanted.node_id()).await.expect("ping by id");

    registry.take_down(details.external);
    assert_eq!(asker.ping(&details).await, Err(Error::Timeout));
    assert_eq!(
        asker.get_node_contact_details(NodeId::random(), true).await,
        Err(Error::NotFound)
    );
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn leave_persists_contacts_and_allows_rejoin() {
    let registry = Arc::new(Registry::default());
    let (nodes, path) = overlay(&registry, 1).await;
    let (a, b) = (&nodes[0], &nodes[1]);
    assert!(b.store_value_local(NodeId::hash_of(b"k"), b"v".to_vec(), 60));

    b.leave().await.expect("leave");
    assert_eq!(b.join_state(), JoinState::Unjoined);
    assert_eq!(b.routing_table_size(), 0);
    assert!(b.find_value_local(&NodeId::hash_of(b"k")).is_empty());

    let persisted = load_bootstrap_contacts(&path).await.expect("bootstrap file");
    assert!(persisted.iter().any(|c| c.id == a.node_id()));

    b.join(&path).await.expect("rejoin");
    assert!(b.is_joined());
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn network_operations_refused_after_leave() {
    let registry = Arc::new(Registry::default());
    let (nodes, path) = overlay(&registry, 2).await;
    let leaver = &nodes[2];
    let key = NodeId::hash_of(b"after-leave");
    leaver.leave().await.expect("leave");

    let before = registry.call_count();
    assert_eq!(leaver.store_value(key, b"v".to_vec(), 60).await, Err(Error::NotJoined));
    assert_eq!(leaver.find_value(key, false).await, Err(Error::NotJoined));
    assert_eq!(leaver.find_k_closest_nodes(key).await, Err(Error::NotJoined));
    assert_eq!(registry.call_count(), before);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn forced_remote_skips_probe() {
    let registry = Arc::new(Registry::default());
    let node = spawn_node(&registry, test_config());
    let lan_peer = spawn_node(&registry, test_config());
    let lan_addr = lan_peer.contact_info().local;
    let shared_ip: IpAddr = node.ip();

    let id = NodeId::random();
    node.update_contact_to_remote(&id, lan_addr.ip());
    let decision = node
        .check_contact_local_address(&id, lan_addr.ip(), lan_addr.port(), shared_ip)
        .await;
    assert_eq!(decision, ConnectionType::Remote);
    assert_eq!(registry.calls_of("ping_addr"), 0);

    let other = NodeId::random();
    let decision = node
        .check_contact_local_address(&other, lan_addr.ip(), lan_addr.port(), shared_ip)
        .await;
    assert_eq!(decision, ConnectionType::Local);
    assert_eq!(registry.calls_of("ping_addr"), 1);
}
