//! # Iterative Lookup Engine
//!
//! Every network-facing operation is built from two primitives:
//!
//! - [`iterative_lookup`]: the α-parallel nearest-node search behind
//!   FindKClosestNodes, FindValue, GetNodeContactDetails and Ping-by-id
//! - [`fan_out`]: one RPC to each target in parallel, aggregated under a
//!   [`StoreQuorum`] (Store / Delete / Update)
//!
//! ## Search Rounds
//!
//! ```text
//!   shortlist = k closest known to target
//!   loop:
//!     pick ≤ α unqueried contacts, nearest first
//!     query them concurrently (per-RPC timeout)
//!     failures leave the shortlist for good
//!     merge learned contacts, re-sort, keep k
//!     stop if the nearest entry is no closer than the nearest live one
//! ```
//!
//! FindValue stops at the first node that returns values or a redirect.
//! The engine never touches the routing table: it reports which contacts
//! responded (with round-trip times) and the caller records them.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{NodeConfig, StoreQuorum};
use crate::error::{Error, Result};
use crate::identity::{Contact, Distance, NodeId, distance_cmp, sort_by_distance};
use crate::protocols::{FindValueReply, KademliaRpc, RejectReason, RpcAck};

/// Tunables for one lookup.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LookupParams {
    pub k: usize,
    pub alpha: usize,
    pub rpc_timeout: Duration,
    pub lookup_timeout: Duration,
    pub max_iterations: usize,
}

impl From<&NodeConfig> for LookupParams {
    fn from(config: &NodeConfig) -> Self {
        Self {
            k: config.k,
            alpha: config.alpha,
            rpc_timeout: config.rpc_timeout,
            lookup_timeout: config.lookup_timeout,
            max_iterations: config.max_lookup_iterations,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueryKind {
    FindNode,
    FindValue,
}

/// A FindValue hit.
#[derive(Clone, Debug)]
pub(crate) enum Found {
    Values { values: Vec<Vec<u8>>, holder: Contact },
    Redirect(Contact),
}

#[derive(Debug, Default)]
pub(crate) struct LookupOutcome {
    /// Up to k closest live-or-unqueried contacts, nearest first.
    pub closest: Vec<Contact>,
    pub found: Option<Found>,
    /// Contacts that answered, with measured round-trip time in ms.
    pub responded: Vec<(Contact, f32)>,
    /// Contacts that failed or timed out.
    pub failed: Vec<Contact>,
}

enum QueryReply {
    Nodes(Vec<Contact>),
    Value(FindValueReply),
}

async fn query<N: KademliaRpc>(
    network: &N,
    contact: &Contact,
    target: NodeId,
    kind: QueryKind,
) -> anyhow::Result<QueryReply> {
    match kind {
        QueryKind::FindNode => network.find_node(contact, target).await.map(QueryReply::Nodes),
        QueryKind::FindValue => network.find_value(contact, target).await.map(QueryReply::Value),
    }
}

fn best_distance(shortlist: &[Contact], target: &NodeId) -> Option<Distance> {
    shortlist.first().map(|c| c.id.distance(target))
}

/// Iterative α-parallel search for `target` starting from `seed`.
pub(crate) async fn iterative_lookup<N: KademliaRpc>(
    network: &Arc<N>,
    params: &LookupParams,
    self_id: NodeId,
    target: NodeId,
    seed: Vec<Contact>,
    kind: QueryKind,
) -> LookupOutcome {
    let started = Instant::now();
    let mut outcome = LookupOutcome::default();

    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queried: HashSet<NodeId> = HashSet::new();
    let mut failed: HashSet<NodeId> = HashSet::new();

    let mut shortlist: Vec<Contact> = seed
        .into_iter()
        .filter(|c| c.id != self_id && seen.insert(c.id))
        .collect();
    sort_by_distance(&mut shortlist, &target);
    shortlist.truncate(params.k);

    let mut iteration = 0;

    loop {
        iteration += 1;
        if iteration > params.max_iterations {
            warn!(
                target = %target.short_hex(),
                iterations = iteration,
                "iterative lookup exceeded max iterations"
            );
            break;
        }
        if started.elapsed() > params.lookup_timeout {
            debug!(
                target = %target.short_hex(),
                elapsed_ms = started.elapsed().as_millis(),
                found = shortlist.len(),
                "iterative lookup timeout, returning current results"
            );
            break;
        }

        let candidates: Vec<Contact> = shortlist
            .iter()
            .filter(|c| !queried.contains(&c.id))
            .take(params.alpha)
            .cloned()
            .collect();
        if candidates.is_empty() {
            break;
        }
        for c in &candidates {
            queried.insert(c.id);
        }

        let mut join_set = JoinSet::new();
        let candidates_len = candidates.len();
        for (idx, contact) in candidates.into_iter().enumerate() {
            let net = Arc::clone(network);
            let rpc_timeout = params.rpc_timeout;
            join_set.spawn(async move {
                let start = Instant::now();
                let result = match tokio::time::timeout(rpc_timeout, query(&*net, &contact, target, kind)).await {
                    Ok(r) => r,
                    Err(_) => Err(anyhow!("query timeout")),
                };
                (idx, contact, start.elapsed(), result)
            });
        }

        type QueryResult = (Contact, Duration, anyhow::Result<QueryReply>);
        let mut results: Vec<Option<QueryResult>> = Vec::with_capacity(candidates_len);
        results.resize_with(candidates_len, || None);
        while let Some(joined) = join_set.join_next().await {
            if let Ok((idx, contact, elapsed, result)) = joined {
                results[idx] = Some((contact, elapsed, result));
            }
        }

        let mut learned_this_round = Vec::new();
        for (contact, elapsed, result) in results.into_iter().flatten() {
            let learned = match result {
                Ok(reply) => {
                    trace!(peer = %contact.id.short_hex(), rtt_ms = elapsed.as_millis(), "lookup query answered");
                    outcome
                        .responded
                        .push((contact.clone(), elapsed.as_secs_f32() * 1000.0));
                    match reply {
                        QueryReply::Nodes(nodes) => nodes,
                        QueryReply::Value(FindValueReply::CloserNodes(nodes)) => nodes,
                        QueryReply::Value(FindValueReply::Values(values)) if !values.is_empty() => {
                            outcome.found = Some(Found::Values { values, holder: contact });
                            outcome.closest = shortlist;
                            return outcome;
                        }
                        QueryReply::Value(FindValueReply::Values(_)) => Vec::new(),
                        QueryReply::Value(FindValueReply::Redirect(holder)) => {
                            outcome.found = Some(Found::Redirect(holder));
                            outcome.closest = shortlist;
                            return outcome;
                        }
                    }
                }
                Err(e) => {
                    trace!(peer = %contact.id.short_hex(), error = %e, "lookup query failed");
                    failed.insert(contact.id);
                    outcome.failed.push(contact);
                    continue;
                }
            };

            learned_this_round.extend(learned);
        }

        // Progress is measured against the nearest contact still alive.
        shortlist.retain(|c| !failed.contains(&c.id));
        let live_best = best_distance(&shortlist, &target);
        for node in learned_this_round {
            if node.id == self_id || failed.contains(&node.id) {
                continue;
            }
            if seen.insert(node.id) {
                shortlist.push(node);
            }
        }
        sort_by_distance(&mut shortlist, &target);
        shortlist.truncate(params.k);

        let new_best = best_distance(&shortlist, &target);
        let improved = match (new_best, live_best) {
            (Some(new), Some(old)) => distance_cmp(&new, &old).is_lt(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !improved {
            break;
        }
    }

    debug!(
        target = %target.short_hex(),
        found = shortlist.len(),
        queried = queried.len(),
        failed = failed.len(),
        "iterative lookup completed"
    );
    outcome.closest = shortlist;
    outcome
}

/// Aggregate of a parallel mutation RPC.
#[derive(Debug, Default)]
pub(crate) struct FanOutResult {
    pub targets: usize,
    pub acks: usize,
    pub rejections: Vec<RejectReason>,
    pub timeouts: usize,
    pub responded: Vec<(Contact, f32)>,
}

impl FanOutResult {
    /// Count this node as a replica that applied (or refused) the mutation.
    pub fn record_local(&mut self, result: std::result::Result<(), RejectReason>) {
        self.targets += 1;
        match result {
            Ok(()) => self.acks += 1,
            Err(reason) => self.rejections.push(reason),
        }
    }

    pub fn into_result(self, quorum: StoreQuorum) -> Result<()> {
        if quorum.is_met(self.acks, self.targets) {
            return Ok(());
        }
        if self.acks == 0 {
            if self.rejections.contains(&RejectReason::SignatureInvalid) {
                return Err(Error::SignatureInvalid);
            }
            if let Some(reason) = self.rejections.first() {
                return Err(Error::from(*reason));
            }
            if self.timeouts > 0 {
                return Err(Error::Timeout);
            }
        }
        Err(Error::QuorumNotReached {
            acks: self.acks,
            targets: self.targets,
        })
    }
}

/// Issue `call` to every target concurrently, each under `rpc_timeout`.
pub(crate) async fn fan_out<N, F, Fut>(
    network: &Arc<N>,
    rpc_timeout: Duration,
    targets: Vec<Contact>,
    call: F,
) -> FanOutResult
where
    N: KademliaRpc,
    F: Fn(Arc<N>, Contact) -> Fut,
    Fut: Future<Output = anyhow::Result<RpcAck>> + Send + 'static,
{
    let mut result = FanOutResult {
        targets: targets.len(),
        ..FanOutResult::default()
    };
    let mut join_set = JoinSet::new();
    for contact in targets {
        let fut = call(Arc::clone(network), contact.clone());
        join_set.spawn(async move {
            let start = Instant::now();
            let outcome = tokio::time::timeout(rpc_timeout, fut).await;
            (contact, start.elapsed(), outcome)
        });
    }

    while let Some(joined) = join_set.join_next().await {
        let Ok((contact, elapsed, outcome)) = joined else {
            result.timeouts += 1;
            continue;
        };
        match outcome {
            Ok(Ok(ack)) => {
                result.responded.push((contact.clone(), elapsed.as_secs_f32() * 1000.0));
                match ack {
                    RpcAck::Accepted => result.acks += 1,
                    RpcAck::Rejected(reason) => {
                        trace!(peer = %contact.id.short_hex(), ?reason, "mutation rejected by peer");
                        result.rejections.push(reason);
                    }
                }
            }
            Ok(Err(e)) => {
                trace!(peer = %contact.id.short_hex(), error = %e, "mutation rpc failed");
                result.timeouts += 1;
            }
            Err(_) => {
                trace!(peer = %contact.id.short_hex(), "mutation rpc timed out");
                result.timeouts += 1;
            }
        }
    }

    debug!(
        targets = result.targets,
        acks = result.acks,
        rejected = result.rejections.len(),
        timeouts = result.timeouts,
        "fan-out completed"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SignedRequest, SignedValue};
    use crate::protocols::StoreRequest;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    /// Static topology: each node answers FindNode with the contacts it knows.
    #[derive(Default)]
    struct Topology {
        knows: HashMap<NodeId, Vec<Contact>>,
        values: HashMap<NodeId, (NodeId, Vec<u8>)>,
        dead: HashSet<NodeId>,
        calls: Mutex<Vec<NodeId>>,
    }

    impl Topology {
        fn check(&self, to: &Contact) -> anyhow::Result<()> {
            self.calls.lock().expect("lock").push(to.id);
            if self.dead.contains(&to.id) {
                Err(anyhow!("unreachable"))
            } else {
                Ok(())
            }
        }

        fn closest_known(&self, to: &Contact, target: &NodeId, k: usize) -> Vec<Contact> {
            let mut known = self.knows.get(&to.id).cloned().unwrap_or_default();
            sort_by_distance(&mut known, target);
            known.truncate(k);
            known
        }
    }

    #[async_trait]
    impl KademliaRpc for Topology {
        async fn ping(&self, to: &Contact) -> anyhow::Result<()> {
            self.check(to)
        }

        async fn ping_addr(&self, _addr: SocketAddr) -> anyhow::Result<()> {
            Ok(())
        }

        async fn find_node(&self, to: &Contact, target: NodeId) -> anyhow::Result<Vec<Contact>> {
            self.check(to)?;
            Ok(self.closest_known(to, &target, 4))
        }

        async fn find_value(&self, to: &Contact, key: NodeId) -> anyhow::Result<FindValueReply> {
            self.check(to)?;
            if let Some((holder, value)) = self.values.get(&key)
                && *holder == to.id
            {
                return Ok(FindValueReply::Values(vec![value.clone()]));
            }
            Ok(FindValueReply::CloserNodes(self.closest_known(to, &key, 4)))
        }

        async fn store(&self, to: &Contact, _request: StoreRequest) -> anyhow::Result<RpcAck> {
            self.check(to)?;
            Ok(RpcAck::Accepted)
        }

        async fn delete(
            &self,
            to: &Contact,
            _key: NodeId,
            _value: SignedValue,
            _request: SignedRequest,
        ) -> anyhow::Result<RpcAck> {
            self.check(to)?;
            Ok(RpcAck::Rejected(RejectReason::SignatureInvalid))
        }

        async fn update(
            &self,
            to: &Contact,
            _key: NodeId,
            _old: SignedValue,
            _new: SignedValue,
            _request: SignedRequest,
            _ttl: i32,
        ) -> anyhow::Result<RpcAck> {
            self.check(to)?;
            Ok(RpcAck::Accepted)
        }
    }

    fn contact(id: NodeId) -> Contact {
        let addr: SocketAddr = "10.1.1.1:9000".parse().expect("addr");
        Contact::single(id, addr)
    }

    fn params(k: usize) -> LookupParams {
        LookupParams {
            k,
            alpha: 3,
            rpc_timeout: Duration::from_millis(200),
            lookup_timeout: Duration::from_secs(5),
            max_iterations: 20,
        }
    }

    /// Every node knows every other node.
    fn full_mesh(n: usize) -> (Topology, Vec<Contact>) {
        let contacts: Vec<Contact> = (0..n).map(|_| contact(NodeId::random())).collect();
        let mut topo = Topology::default();
        for c in &contacts {
            let others = contacts.iter().filter(|o| o.id != c.id).cloned().collect();
            topo.knows.insert(c.id, others);
        }
        (topo, contacts)
    }

    #[tokio::test]
    async fn find_node_converges_on_true_k_closest() {
        let (topo, contacts) = full_mesh(40);
        let network = Arc::new(topo);
        let target = NodeId::random();
        let seed = contacts[..3].to_vec();

        let outcome =
            iterative_lookup(&network, &params(5), NodeId::random(), target, seed, QueryKind::FindNode).await;

        let mut expected = contacts.clone();
        sort_by_distance(&mut expected, &target);
        let want: Vec<NodeId> = expected[..5].iter().map(|c| c.id).collect();
        let got: Vec<NodeId> = outcome.closest.iter().map(|c| c.id).collect();
        assert_eq!(got, want);
        assert!(outcome.found.is_none());
        assert!(!outcome.responded.is_empty());
    }

    #[tokio::test]
    async fn dead_contacts_are_dropped_and_not_requeried() {
        let (mut topo, contacts) = full_mesh(12);
        let target = NodeId::random();
        let mut sorted = contacts.clone();
        sort_by_distance(&mut sorted, &target);
        let dead = sorted[0].id;
        topo.dead.insert(dead);
        let network = Arc::new(topo);

        let outcome =
            iterative_lookup(&network, &params(4), NodeId::random(), target, contacts, QueryKind::FindNode).await;

        assert!(outcome.closest.iter().all(|c| c.id != dead));
        assert_eq!(outcome.failed.iter().filter(|c| c.id == dead).count(), 1);
        let calls = network.calls.lock().expect("lock");
        assert_eq!(calls.iter().filter(|id| **id == dead).count(), 1);
    }

    fn id_with_prefix(first: u8) -> NodeId {
        let mut bytes = [0u8; crate::identity::ID_LEN];
        bytes[0] = first;
        NodeId::from_bytes(bytes)
    }

    #[tokio::test]
    async fn dead_nearest_seed_does_not_stall_progress() {
        let target = id_with_prefix(0x00);
        let dead = contact(id_with_prefix(0x02));
        let a = contact(id_with_prefix(0x40));
        let b = contact(id_with_prefix(0x10));
        let c = contact(id_with_prefix(0x01));

        let mut topo = Topology::default();
        topo.dead.insert(dead.id);
        topo.knows.insert(a.id, vec![b.clone()]);
        topo.knows.insert(b.id, vec![c.clone()]);
        let network = Arc::new(topo);

        let outcome = iterative_lookup(
            &network,
            &params(2),
            id_with_prefix(0xFF),
            target,
            vec![dead.clone(), a.clone()],
            QueryKind::FindNode,
        )
        .await;

        let got: Vec<NodeId> = outcome.closest.iter().map(|c| c.id).collect();
        assert_eq!(got, vec![c.id, b.id]);
        assert_eq!(outcome.failed.len(), 1);
    }

    #[tokio::test]
    async fn find_value_stops_at_first_holder() {
        let (mut topo, contacts) = full_mesh(20);
        let key = NodeId::random();
        let holder = contacts[7].id;
        topo.values.insert(key, (holder, b"v".to_vec()));
        let network = Arc::new(topo);

        let outcome = iterative_lookup(
            &network,
            &params(20),
            NodeId::random(),
            key,
            vec![contacts[7].clone()],
            QueryKind::FindValue,
        )
        .await;

        match outcome.found {
            Some(Found::Values { values, holder: h }) => {
                assert_eq!(values, vec![b"v".to_vec()]);
                assert_eq!(h.id, holder);
            }
            other => panic!("expected values, got {other:?}"),
        }
        assert_eq!(network.calls.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn own_id_is_never_queried() {
        let (topo, contacts) = full_mesh(6);
        let me = contacts[0].id;
        let network = Arc::new(topo);
        let outcome =
            iterative_lookup(&network, &params(8), me, NodeId::random(), contacts, QueryKind::FindNode).await;
        assert!(outcome.closest.iter().all(|c| c.id != me));
        assert!(network.calls.lock().expect("lock").iter().all(|id| *id != me));
    }

    #[tokio::test]
    async fn empty_seed_returns_nothing() {
        let network = Arc::new(Topology::default());
        let outcome =
            iterative_lookup(&network, &params(8), NodeId::random(), NodeId::random(), Vec::new(), QueryKind::FindNode)
                .await;
        assert!(outcome.closest.is_empty());
        assert!(network.calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn fan_out_counts_acks_and_failures() {
        let (mut topo, contacts) = full_mesh(5);
        topo.dead.insert(contacts[0].id);
        let network = Arc::new(topo);
        let request = StoreRequest::Unsigned {
            key: NodeId::random(),
            value: b"v".to_vec(),
            ttl: 60,
        };

        let result = fan_out(&network, Duration::from_millis(200), contacts, |net, c| {
            let request = request.clone();
            async move { net.store(&c, request).await }
        })
        .await;

        assert_eq!(result.targets, 5);
        assert_eq!(result.acks, 4);
        assert_eq!(result.timeouts, 1);
        assert!(result.into_result(StoreQuorum::Majority).is_ok());
    }

    #[test]
    fn quorum_failure_maps_to_most_specific_error() {
        let rejected = FanOutResult {
            targets: 3,
            rejections: vec![RejectReason::NotFound, RejectReason::SignatureInvalid],
            timeouts: 1,
            ..FanOutResult::default()
        };
        assert_eq!(rejected.into_result(StoreQuorum::AtLeastOne), Err(Error::SignatureInvalid));

        let silent = FanOutResult {
            targets: 2,
            timeouts: 2,
            ..FanOutResult::default()
        };
        assert_eq!(silent.into_result(StoreQuorum::AtLeastOne), Err(Error::Timeout));

        let partial = FanOutResult {
            targets: 4,
            acks: 1,
            timeouts: 3,
            ..FanOutResult::default()
        };
        assert_eq!(
            partial.into_result(StoreQuorum::All),
            Err(Error::QuorumNotReached { acks: 1, targets: 4 })
        );

        let mut local_only = FanOutResult::default();
        local_only.record_local(Ok(()));
        assert!(local_only.into_result(StoreQuorum::All).is_ok());
    }
}
