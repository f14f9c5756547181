//! # Local Value Store
//!
//! Records this node holds on behalf of the overlay. A key maps to any
//! number of distinct values; each value is an independent record with its
//! own TTL and refresh time.
//!
//! ## TTL Model
//!
//! | ttl | meaning |
//! |-----|---------|
//! | `-1` | never expires |
//! | `> 0` | expires once `now > last_refresh + ttl` |
//! | `0`, `< -1` | invalid |
//!
//! Expiry is lazy: reads skip expired records and a periodic sweep
//! removes them. Until swept, an expired record counts as absent; storing
//! or refreshing it again starts a fresh record. Refreshing a live record
//! only moves `last_refresh`; the record keeps its original ttl.
//!
//! ## Key Ownership
//!
//! The first record under a key decides its owner: the signer's public key
//! for signed stores, nobody for unsigned ones. Later stores must come from
//! the same owner, and delete/update must be signed by it.
//!
//! Every time-dependent operation has an `*_at(now)` form taking epoch
//! seconds; the plain form uses the wall clock.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::crypto::{SignatureValidator, SignedRequest, SignedValue, validate_request, validate_value};
use crate::identity::{NodeId, now_secs};
use crate::messages::MAX_VALUE_SIZE;
use crate::protocols::RejectReason;

/// TTL marking a record that never expires.
pub const TTL_INFINITE: i32 = -1;

pub fn is_valid_ttl(ttl: i32) -> bool {
    ttl == TTL_INFINITE || ttl > 0
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub value: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    pub signer: Option<Vec<u8>>,
    /// Signer's proof for this key, kept so the record can be republished.
    pub request_signature: Option<Vec<u8>>,
    pub ttl: i32,
    pub stored_at: u64,
    pub last_refresh: u64,
}

impl StoredRecord {
    fn new(value: Vec<u8>, ttl: i32, now: u64) -> Self {
        Self {
            value,
            signature: None,
            signer: None,
            request_signature: None,
            ttl,
            stored_at: now,
            last_refresh: now,
        }
    }

    /// Epoch seconds after which the record is gone; `None` if it never expires.
    pub fn expires_at(&self) -> Option<u64> {
        (self.ttl != TTL_INFINITE).then(|| self.last_refresh.saturating_add(self.ttl as u64))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at().is_some_and(|at| now > at)
    }

    /// The record as it travels in a Store RPC when republished.
    pub fn signed_value(&self) -> Option<SignedValue> {
        self.signature.as_ref().map(|signature| SignedValue {
            value: self.value.clone(),
            signature: signature.clone(),
        })
    }

    pub fn signed_request(&self) -> Option<SignedRequest> {
        match (&self.signer, &self.request_signature) {
            (Some(public_key), Some(signature)) => Some(SignedRequest {
                public_key: public_key.clone(),
                signature: signature.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct LocalStore {
    records: HashMap<NodeId, Vec<StoredRecord>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, key: &NodeId, value: &[u8]) -> Option<&StoredRecord> {
        self.records.get(key)?.iter().find(|r| r.value == value)
    }

    fn live_record(&self, key: &NodeId, value: &[u8], now: u64) -> Option<&StoredRecord> {
        self.record(key, value).filter(|r| !r.is_expired(now))
    }

    fn record_mut(&mut self, key: &NodeId, value: &[u8]) -> Option<&mut StoredRecord> {
        self.records.get_mut(key)?.iter_mut().find(|r| r.value == value)
    }

    fn drop_expired(&mut self, key: &NodeId, now: u64) {
        if let Some(records) = self.records.get_mut(key) {
            records.retain(|r| !r.is_expired(now));
            if records.is_empty() {
                self.records.remove(key);
            }
        }
    }

    /// Signer owning `key`: `None` if the key is empty, `Some(None)` if unsigned.
    fn owner(&self, key: &NodeId) -> Option<Option<&[u8]>> {
        self.records
            .get(key)
            .and_then(|records| records.first())
            .map(|r| r.signer.as_deref())
    }

    fn check_value(value: &[u8], ttl: i32) -> Result<(), RejectReason> {
        if !is_valid_ttl(ttl) {
            debug!(ttl, "store rejected: invalid ttl");
            return Err(RejectReason::InvalidArgument);
        }
        if value.is_empty() || value.len() > MAX_VALUE_SIZE {
            debug!(size = value.len(), max = MAX_VALUE_SIZE, "store rejected: bad value size");
            return Err(RejectReason::InvalidArgument);
        }
        Ok(())
    }

    pub fn store(&mut self, key: NodeId, value: Vec<u8>, ttl: i32) -> bool {
        self.store_at(key, value, ttl, now_secs())
    }

    /// Insert an unsigned record. A re-store of a held (key, value) refreshes it.
    pub fn store_at(&mut self, key: NodeId, value: Vec<u8>, ttl: i32, now: u64) -> bool {
        self.store_unsigned_at(key, value, ttl, now).is_ok()
    }

    pub(crate) fn store_unsigned_at(
        &mut self,
        key: NodeId,
        value: Vec<u8>,
        ttl: i32,
        now: u64,
    ) -> Result<(), RejectReason> {
        Self::check_value(&value, ttl)?;
        self.drop_expired(&key, now);
        if let Some(Some(_)) = self.owner(&key) {
            debug!(key = %key.short_hex(), "unsigned store rejected: key has a signing owner");
            return Err(RejectReason::SignatureInvalid);
        }
        if let Some(existing) = self.record_mut(&key, &value) {
            existing.last_refresh = now;
            return Ok(());
        }
        self.records
            .entry(key)
            .or_default()
            .push(StoredRecord::new(value, ttl, now));
        Ok(())
    }

    pub fn refresh(&mut self, key: NodeId, value: Vec<u8>, ttl: i32) -> bool {
        self.refresh_at(key, value, ttl, now_secs())
    }

    /// Move `last_refresh` of a held record to `now`, keeping its ttl; store it if absent.
    pub fn refresh_at(&mut self, key: NodeId, value: Vec<u8>, ttl: i32, now: u64) -> bool {
        self.drop_expired(&key, now);
        if let Some(existing) = self.record_mut(&key, &value) {
            existing.last_refresh = now;
            return true;
        }
        self.store_at(key, value, ttl, now)
    }

    pub fn find(&self, key: &NodeId) -> Vec<Vec<u8>> {
        self.find_at(key, now_secs())
    }

    /// Values under `key` that have not expired.
    pub fn find_at(&self, key: &NodeId, now: u64) -> Vec<Vec<u8>> {
        self.records
            .get(key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| !r.is_expired(now))
                    .map(|r| r.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn ttl(&self, key: &NodeId, value: &[u8]) -> i64 {
        self.ttl_at(key, value, now_secs())
    }

    /// Stored ttl; `0` if absent or expired, `-1` if infinite.
    pub fn ttl_at(&self, key: &NodeId, value: &[u8], now: u64) -> i64 {
        self.live_record(key, value, now).map_or(0, |r| i64::from(r.ttl))
    }

    pub fn last_refresh_time(&self, key: &NodeId, value: &[u8]) -> u64 {
        self.last_refresh_time_at(key, value, now_secs())
    }

    /// Epoch seconds of the last refresh; `0` if absent or expired.
    pub fn last_refresh_time_at(&self, key: &NodeId, value: &[u8], now: u64) -> u64 {
        self.live_record(key, value, now).map_or(0, |r| r.last_refresh)
    }

    pub fn expire_time(&self, key: &NodeId, value: &[u8]) -> i64 {
        self.expire_time_at(key, value, now_secs())
    }

    /// Epoch seconds of expiry; `0` if absent or expired, `-1` if infinite.
    pub fn expire_time_at(&self, key: &NodeId, value: &[u8], now: u64) -> i64 {
        match self.live_record(key, value, now) {
            None => 0,
            Some(r) => r.expires_at().map_or(-1, |at| at as i64),
        }
    }

    pub fn store_signed(
        &mut self,
        validator: &dyn SignatureValidator,
        key: NodeId,
        value: &SignedValue,
        request: &SignedRequest,
        ttl: i32,
    ) -> Result<(), RejectReason> {
        self.store_signed_at(validator, key, value, request, ttl, now_secs())
    }

    /// Insert a signed record after checking the request, the value signature and key ownership.
    pub fn store_signed_at(
        &mut self,
        validator: &dyn SignatureValidator,
        key: NodeId,
        value: &SignedValue,
        request: &SignedRequest,
        ttl: i32,
        now: u64,
    ) -> Result<(), RejectReason> {
        Self::check_value(&value.value, ttl)?;
        Self::authorise(validator, &key, request)?;
        if !validate_value(validator, value, &request.public_key) {
            warn!(key = %key.short_hex(), "signed store rejected: value signature invalid");
            return Err(RejectReason::SignatureInvalid);
        }
        self.drop_expired(&key, now);
        if let Some(owner) = self.owner(&key)
            && owner != Some(request.public_key.as_slice())
        {
            warn!(key = %key.short_hex(), "signed store rejected: key owned by another signer");
            return Err(RejectReason::SignatureInvalid);
        }

        if let Some(existing) = self.record_mut(&key, &value.value) {
            existing.signature = Some(value.signature.clone());
            existing.request_signature = Some(request.signature.clone());
            existing.last_refresh = now;
            return Ok(());
        }
        let mut record = StoredRecord::new(value.value.clone(), ttl, now);
        record.signature = Some(value.signature.clone());
        record.signer = Some(request.public_key.clone());
        record.request_signature = Some(request.signature.clone());
        self.records.entry(key).or_default().push(record);
        Ok(())
    }

    /// Remove a signed record; the request must come from the record's signer.
    pub fn delete_signed(
        &mut self,
        validator: &dyn SignatureValidator,
        key: &NodeId,
        value: &SignedValue,
        request: &SignedRequest,
    ) -> Result<(), RejectReason> {
        Self::authorise(validator, key, request)?;
        let record = self.record(key, &value.value).ok_or(RejectReason::NotFound)?;
        Self::check_owner(key, record, request)?;
        if !validate_value(validator, value, &request.public_key) {
            warn!(key = %key.short_hex(), "delete rejected: value signature invalid");
            return Err(RejectReason::SignatureInvalid);
        }

        if let Some(records) = self.records.get_mut(key) {
            records.retain(|r| r.value != value.value);
            if records.is_empty() {
                self.records.remove(key);
            }
        }
        Ok(())
    }

    pub fn update_signed(
        &mut self,
        validator: &dyn SignatureValidator,
        key: &NodeId,
        old_value: &SignedValue,
        new_value: &SignedValue,
        request: &SignedRequest,
        ttl: i32,
    ) -> Result<(), RejectReason> {
        self.update_signed_at(validator, key, old_value, new_value, request, ttl, now_secs())
    }

    /// Replace `old_value` with `new_value` under `key`; both must be signed by the record's signer.
    #[allow(clippy::too_many_arguments)]
    pub fn update_signed_at(
        &mut self,
        validator: &dyn SignatureValidator,
        key: &NodeId,
        old_value: &SignedValue,
        new_value: &SignedValue,
        request: &SignedRequest,
        ttl: i32,
        now: u64,
    ) -> Result<(), RejectReason> {
        Self::check_value(&new_value.value, ttl)?;
        Self::authorise(validator, key, request)?;
        self.drop_expired(key, now);
        let record = self.record(key, &old_value.value).ok_or(RejectReason::NotFound)?;
        Self::check_owner(key, record, request)?;
        if !validate_value(validator, old_value, &request.public_key)
            || !validate_value(validator, new_value, &request.public_key)
        {
            warn!(key = %key.short_hex(), "update rejected: value signature invalid");
            return Err(RejectReason::SignatureInvalid);
        }

        let Some(records) = self.records.get_mut(key) else {
            return Err(RejectReason::NotFound);
        };
        if old_value.value != new_value.value {
            records.retain(|r| r.value != new_value.value);
        }
        if let Some(record) = records.iter_mut().find(|r| r.value == old_value.value) {
            record.value = new_value.value.clone();
            record.signature = Some(new_value.signature.clone());
            record.request_signature = Some(request.signature.clone());
            record.ttl = ttl;
            record.stored_at = now;
            record.last_refresh = now;
        }
        Ok(())
    }

    fn authorise(
        validator: &dyn SignatureValidator,
        key: &NodeId,
        request: &SignedRequest,
    ) -> Result<(), RejectReason> {
        if validate_request(validator, key, request) {
            Ok(())
        } else {
            warn!(key = %key.short_hex(), "mutation rejected: request signature invalid");
            Err(RejectReason::SignatureInvalid)
        }
    }

    fn check_owner(key: &NodeId, record: &StoredRecord, request: &SignedRequest) -> Result<(), RejectReason> {
        if record.signer.as_deref() == Some(request.public_key.as_slice()) {
            Ok(())
        } else {
            warn!(key = %key.short_hex(), "mutation rejected: requester is not the signer");
            Err(RejectReason::SignatureInvalid)
        }
    }

    /// Drop expired records; returns how many were removed.
    pub fn sweep_expired_at(&mut self, now: u64) -> usize {
        let mut removed = 0;
        self.records.retain(|_, records| {
            let before = records.len();
            records.retain(|r| !r.is_expired(now));
            removed += before - records.len();
            !records.is_empty()
        });
        removed
    }

    /// Live records not refreshed for at least `interval_secs`.
    pub fn due_for_republish_at(&self, now: u64, interval_secs: u64) -> Vec<(NodeId, StoredRecord)> {
        self.records
            .iter()
            .flat_map(|(key, records)| records.iter().map(move |r| (*key, r)))
            .filter(|(_, r)| !r.is_expired(now) && now.saturating_sub(r.last_refresh) >= interval_secs)
            .map(|(key, r)| (key, r.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of records across all keys.
    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
