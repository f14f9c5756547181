//! # Signed Values and Request Validation
//!
//! Signed records are stored as a [`SignedValue`] (payload plus the signer's
//! signature over it) and every mutation of signed state carries a
//! [`SignedRequest`] that proves possession of the signer's key for the
//! target storage key.
//!
//! The node never hard-codes an algorithm: it consumes the
//! [`SignatureValidator`] capability supplied by the embedder.
//! [`Ed25519Validator`] is the stock implementation matching [`Keypair`].
//!
//! ## Domain Separation
//!
//! Value signatures and request signatures use distinct prefixes so a
//! signature over a value can never be replayed as a mutation request.

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::identity::{Keypair, NodeId};

/// Domain separation prefix for value signatures.
pub const VALUE_SIGNATURE_DOMAIN: &[u8] = b"kadnode-value-v1:";

/// Domain separation prefix for mutation request signatures.
pub const REQUEST_SIGNATURE_DOMAIN: &[u8] = b"kadnode-request-v1:";

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    InvalidLength,
    VerificationFailed,
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// A value together with its signer's signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedValue {
    pub value: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Proof that the caller holds the private key behind `public_key`,
/// bound to one storage key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Validates a signature over `data` against a public key.
///
/// Supplied by the embedder; implementations must be pure and fail closed.
pub trait SignatureValidator: Send + Sync {
    fn validate(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// [`SignatureValidator`] for Ed25519 keys (strict verification).
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Validator;

impl SignatureValidator for Ed25519Validator {
    fn validate(&self, data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        verify_ed25519(public_key, data, signature).is_ok()
    }
}

fn verify_ed25519(
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let verifying_key =
        VerifyingKey::try_from(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    verifying_key
        .verify_strict(data, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignatureError::VerificationFailed)
}

fn with_domain(domain: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = domain.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut prefixed = Vec::with_capacity(len);
    prefixed.extend_from_slice(domain);
    for part in parts {
        prefixed.extend_from_slice(part);
    }
    prefixed
}

/// Bytes covered by a value signature.
pub fn value_payload(value: &[u8]) -> Vec<u8> {
    with_domain(VALUE_SIGNATURE_DOMAIN, &[value])
}

/// Bytes covered by a request signature: domain || key || public key.
pub fn request_payload(key: &NodeId, public_key: &[u8]) -> Vec<u8> {
    with_domain(REQUEST_SIGNATURE_DOMAIN, &[key.as_bytes(), public_key])
}

pub fn sign_value(keypair: &Keypair, value: Vec<u8>) -> SignedValue {
    let signature = keypair.sign(&value_payload(&value)).to_bytes().to_vec();
    SignedValue { value, signature }
}

pub fn sign_request(keypair: &Keypair, key: &NodeId) -> SignedRequest {
    let public_key = keypair.public_key_bytes().to_vec();
    let signature = keypair
        .sign(&request_payload(key, &public_key))
        .to_bytes()
        .to_vec();
    SignedRequest {
        public_key,
        signature,
    }
}

/// Check that `signed` was produced by the holder of `public_key`.
pub fn validate_value(
    validator: &dyn SignatureValidator,
    signed: &SignedValue,
    public_key: &[u8],
) -> bool {
    validator.validate(&value_payload(&signed.value), &signed.signature, public_key)
}

/// Check that `request` authorises a mutation of `key`.
pub fn validate_request(
    validator: &dyn SignatureValidator,
    key: &NodeId,
    request: &SignedRequest,
) -> bool {
    validator.validate(
        &request_payload(key, &request.public_key),
        &request.signature,
        &request.public_key,
    )
}
