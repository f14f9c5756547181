//! # Routing Table (XOR-Metric k-Buckets)
//!
//! Kademlia routing table keyed by the length of the common prefix between
//! the local identifier and a contact's identifier.
//!
//! ```text
//!   Bucket 0:   contacts differing from us in the first bit (half the keyspace)
//!   Bucket 1:   contacts sharing exactly one leading bit
//!   ...
//!   Bucket 159: contacts sharing 159 leading bits (closest)
//! ```
//!
//! Each bucket holds at most `k` contacts ordered least-recently-seen first.
//! When a bucket is full the newcomer is parked in a [`PendingEviction`] and
//! the caller probes the oldest contact; [`RoutingTable::apply_probe_result`]
//! either keeps the incumbent or swaps in the newcomer.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tokio::time::Instant;

use crate::identity::{ConnectionType, Contact, ID_BITS, ID_LEN, NodeId, sort_by_distance};

/// Result of offering a contact to the routing table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddContactStatus {
    /// Inserted as a new entry.
    Added,
    /// Already present; metadata refreshed and moved to most-recently-seen.
    Updated,
    /// Bucket full and the incumbent is (or may be) alive.
    BucketFull,
    /// Not eligible (our own id).
    Ignored,
}

/// A newcomer waiting on a liveness probe of its bucket's oldest contact.
///
/// Only the table that issued it will apply it; a table rebuilt by rekey or
/// leave treats it as stale.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    epoch: u64,
    pub oldest: Contact,
    pub new_contact: Contact,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full { oldest: Box<Contact> },
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn touch(&mut self, mut contact: Contact, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            let existing = self.contacts.remove(pos);
            if contact.connection == ConnectionType::Unknown {
                contact.connection = existing.connection;
            }
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Inserted;
        }

        match self.contacts.first() {
            Some(oldest) => BucketTouchOutcome::Full {
                oldest: Box::new(oldest.clone()),
            },
            // k == 0 is rejected by config validation; treat as full.
            None => BucketTouchOutcome::Full {
                oldest: Box::new(contact),
            },
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Random identifier that falls into bucket `bucket_idx` relative to `self_id`.
pub(crate) fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let self_bytes = self_id.as_bytes();
    let mut distance = [0u8; ID_LEN];
    rand::thread_rng().fill(&mut distance[..]);

    let bucket_idx = bucket_idx.min(ID_BITS - 1);
    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; ID_LEN];
    for i in 0..ID_LEN {
        target[i] = self_bytes[i] ^ distance[i];
    }
    NodeId::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    epoch: u64,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| RoutingBucket::new()).collect();
        Self {
            self_id,
            k,
            epoch: rand::random(),
            buckets,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        let idx = self.self_id.common_prefix_len(id);
        (idx < ID_BITS).then_some(idx)
    }

    /// Offer a contact. A full bucket yields a [`PendingEviction`] for the
    /// caller to resolve with a probe of the oldest entry.
    pub fn add_contact(
        &mut self,
        mut contact: Contact,
        rtt_ms: f32,
    ) -> (AddContactStatus, Option<PendingEviction>) {
        let Some(idx) = self.bucket_index(&contact.id) else {
            return (AddContactStatus::Ignored, None);
        };
        contact.touch(rtt_ms);
        match self.buckets[idx].touch(contact.clone(), self.k) {
            BucketTouchOutcome::Inserted => (AddContactStatus::Added, None),
            BucketTouchOutcome::Refreshed => (AddContactStatus::Updated, None),
            BucketTouchOutcome::Full { oldest } => (
                AddContactStatus::BucketFull,
                Some(PendingEviction {
                    epoch: self.epoch,
                    oldest: *oldest,
                    new_contact: contact,
                }),
            ),
        }
    }

    /// Resolve a pending eviction once the oldest contact has been probed.
    pub fn apply_probe_result(&mut self, pending: PendingEviction, oldest_alive: bool) -> AddContactStatus {
        if pending.epoch != self.epoch {
            return AddContactStatus::Ignored;
        }
        let Some(idx) = self.bucket_index(&pending.new_contact.id) else {
            return AddContactStatus::Ignored;
        };
        let k = self.k;
        let bucket = &mut self.buckets[idx];
        if oldest_alive {
            bucket.refresh(&pending.oldest.id);
            return AddContactStatus::BucketFull;
        }

        bucket.remove(&pending.oldest.id);
        if bucket.contacts.iter().any(|c| c.id == pending.new_contact.id) {
            return AddContactStatus::Updated;
        }
        if bucket.contacts.len() < k {
            bucket.contacts.push(pending.new_contact);
            bucket.mark_refreshed();
            AddContactStatus::Added
        } else {
            AddContactStatus::BucketFull
        }
    }

    pub fn remove_contact(&mut self, id: &NodeId) -> bool {
        match self.bucket_index(id) {
            Some(idx) => self.buckets[idx].remove(id),
            None => false,
        }
    }

    pub fn set_connection(&mut self, id: &NodeId, connection: ConnectionType) -> bool {
        let Some(idx) = self.bucket_index(id) else {
            return false;
        };
        match self.buckets[idx].contacts.iter_mut().find(|c| c.id == *id) {
            Some(contact) => {
                contact.connection = connection;
                true
            }
            None => false,
        }
    }

    pub fn get_contact(&self, id: &NodeId) -> Option<Contact> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx].contacts.iter().find(|c| c.id == *id).cloned()
    }

    /// Up to `count` contacts nearest to `key`, nearest first, skipping `exclude`.
    ///
    /// Buckets are visited in order of increasing distance from `key`: the
    /// bucket sharing `key`'s prefix, then every deeper bucket, then the
    /// shallower ones one at a time. Each group is strictly farther than the
    /// previous, so the walk stops at the first group that fills `count`.
    pub fn get_nodes(&self, key: &NodeId, exclude: &HashSet<NodeId>, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }
        let prefix = self.self_id.common_prefix_len(key);

        let mut groups: Vec<Vec<usize>> = Vec::with_capacity(prefix + 2);
        if prefix < ID_BITS {
            groups.push(vec![prefix]);
            groups.push((prefix + 1..ID_BITS).collect());
        }
        for idx in (0..prefix.min(ID_BITS)).rev() {
            groups.push(vec![idx]);
        }

        let mut found = Vec::new();
        for group in groups {
            for idx in group {
                found.extend(
                    self.buckets[idx]
                        .contacts
                        .iter()
                        .filter(|c| !exclude.contains(&c.id))
                        .cloned(),
                );
            }
            if found.len() >= count {
                break;
            }
        }

        sort_by_distance(&mut found, key);
        found.truncate(count);
        found
    }

    /// `count` k-closest contacts to `key` (no exclusions).
    pub fn closest(&self, key: &NodeId, count: usize) -> Vec<Contact> {
        self.get_nodes(key, &HashSet::new(), count)
    }

    /// Up to `count` distinct contacts drawn uniformly from the table.
    pub fn random_contacts(&self, count: usize, exclude: &HashSet<NodeId>) -> Vec<Contact> {
        let mut pool: Vec<&Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| !exclude.contains(&c.id))
            .collect();
        pool.shuffle(&mut rand::thread_rng());
        pool.into_iter().take(count).cloned().collect()
    }

    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|b| b.contacts.iter().cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(|b| b.contacts.len()).collect()
    }

    pub(crate) fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.contacts.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub(crate) fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }
}
