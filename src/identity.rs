//! # Node Identity and Peer Certificates
//!
//! This module defines the identity types used throughout SecureDHT:
//!
//! - [`NodeId`]: 160-bit identifier placed in the XOR metric space
//! - [`Contact`]: A reachable peer (`NodeId` + socket address)
//! - [`Keypair`]: Ed25519 signing keypair backing a node certificate
//! - [`IdentityStore`]: This node's credentials plus the cache of verified peer certificates
//!
//! ## Identity Model
//!
//! A NodeID is NOT derived from the public key. It is assigned when the node
//! credentials are created and bound to the key by a CA-issued certificate:
//! the hex NodeID is carried in the certificate subject's DN-qualifier
//! attribute. A peer is trusted for a NodeID only when its certificate
//! chains to a local trust root AND the embedded NodeID equals the claimed one.
//!
//! ## Certificate Cache
//!
//! Peer certificates are fetched lazily (FIND_CERT, ping with attached cert,
//! bootstrap seeds), verified against the trust store, cached in memory and
//! persisted once into the node's `others/` directory.
//!
//! ## Invariants
//!
//! - Two nodes are equal only if their NodeIDs are bit-identical
//! - Verification fails closed: no certificate means no trust
//! - A cached certificate always matches the NodeID it is cached under

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::certstore::CertificateStore;
use crate::crypto::{extract_public_key_from_cert, node_id_from_cert, verify_signature, TrustStore};

/// Length of a NodeID (and of a DHT key) in bytes.
pub const NODE_ID_LEN: usize = 20;

// ============================================================================
// NodeId
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random NodeID, used when node credentials are created.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    #[inline]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; NODE_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short form used in log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Compare two XOR distances lexicographically.
///
/// `Less` means the first distance is the closer one.
#[inline]
pub fn distance_cmp(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> std::cmp::Ordering {
    for i in 0..NODE_ID_LEN {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

// ============================================================================
// Contact
// ============================================================================

/// A peer as seen by the routing table: `(node_id, ip, port)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(node_id: NodeId, addr: SocketAddr) -> Self {
        Self { node_id, addr }
    }

    #[inline]
    pub fn distance_to(&self, target: &NodeId) -> [u8; NODE_ID_LEN] {
        self.node_id.xor_distance(target)
    }
}

// ============================================================================
// Keypair
// ============================================================================

pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
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

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_secret_key_bytes(&self.secret_key_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// IdentityStore
// ============================================================================

/// Raised when this node is asked to sign without a private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningError {
    KeyUnavailable,
}

impl std::fmt::Display for SigningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningError::KeyUnavailable => write!(f, "private key is not available for signing"),
        }
    }
}

impl std::error::Error for SigningError {}

/// Result of checking a peer signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    /// No certificate is known for the signer. Callees answer with a signed NACK.
    UnknownSigner,
    /// Bad signature, untrusted certificate, or NodeID mismatch.
    Invalid,
}

pub struct IdentityStore {
    node_id: NodeId,
    keypair: Option<Keypair>,
    own_cert: Vec<u8>,
    trust: TrustStore,
    certs: RwLock<HashMap<NodeId, Vec<u8>>>,
    persist: Option<CertificateStore>,
}

impl IdentityStore {
    /// Build an identity store from in-memory credentials.
    ///
    /// The NodeID is taken from `own_cert`; the certificate must carry one.
    pub fn new(
        own_cert: Vec<u8>,
        keypair: Option<Keypair>,
        trust: TrustStore,
        persist: Option<CertificateStore>,
    ) -> anyhow::Result<Self> {
        let node_id = node_id_from_cert(&own_cert)
            .ok_or_else(|| anyhow::anyhow!("own certificate does not carry a NodeID"))?;
        if let Some(kp) = &keypair
            && extract_public_key_from_cert(&own_cert) != Some(kp.public_key_bytes())
        {
            anyhow::bail!("own certificate does not match the private key");
        }
        let mut certs = HashMap::new();
        certs.insert(node_id, own_cert.clone());
        Ok(Self {
            node_id,
            keypair,
            own_cert,
            trust,
            certs: RwLock::new(certs),
            persist,
        })
    }

    /// Load credentials and trust roots from a certificate directory.
    pub fn load(store: CertificateStore) -> anyhow::Result<Self> {
        let (own_cert, keypair) = store.load_own()?;
        let mut trust = TrustStore::new();
        for root in store.load_trust_roots()? {
            trust.add_root(root)?;
        }
        if !trust.verify(&own_cert) {
            anyhow::bail!("own certificate is not issued by a trusted root");
        }
        Self::new(own_cert, Some(keypair), trust, Some(store))
    }

    pub fn own_node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn own_certificate(&self) -> &[u8] {
        &self.own_cert
    }

    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SigningError> {
        let keypair = self.keypair.as_ref().ok_or(SigningError::KeyUnavailable)?;
        Ok(keypair.sign(payload).to_bytes().to_vec())
    }

    /// `true` only if `signature` over `payload` verifies for `node_id`.
    pub fn verify(
        &self,
        node_id: &NodeId,
        payload: &[u8],
        signature: &[u8],
        cert_override: Option<&[u8]>,
    ) -> bool {
        self.check(node_id, payload, signature, cert_override) == Verification::Valid
    }

    /// Resolve the signer's certificate and check the signature.
    ///
    /// Resolution order: `cert_override`, memory cache, persisted `others/`.
    pub fn check(
        &self,
        node_id: &NodeId,
        payload: &[u8],
        signature: &[u8],
        cert_override: Option<&[u8]>,
    ) -> Verification {
        let cert = match cert_override {
            Some(cert) => {
                if !self.is_trusted_for(cert, node_id) {
                    warn!(peer = %node_id.short(), "attached certificate rejected");
                    return Verification::Invalid;
                }
                cert.to_vec()
            }
            None => match self.certificate_for(node_id) {
                Some(cert) => cert,
                None => return Verification::UnknownSigner,
            },
        };

        let Some(public_key) = extract_public_key_from_cert(&cert) else {
            return Verification::Invalid;
        };
        match verify_signature(&public_key, payload, signature) {
            Ok(()) => Verification::Valid,
            Err(e) => {
                debug!(peer = %node_id.short(), error = %e, "signature check failed");
                Verification::Invalid
            }
        }
    }

    pub fn has_certificate(&self, node_id: &NodeId) -> bool {
        self.certificate_for(node_id).is_some()
    }

    /// Cached or persisted certificate for `node_id`.
    pub fn certificate_for(&self, node_id: &NodeId) -> Option<Vec<u8>> {
        if let Ok(certs) = self.certs.read()
            && let Some(cert) = certs.get(node_id)
        {
            return Some(cert.clone());
        }

        let persisted = self.persist.as_ref()?.load_peer_cert(node_id)?;
        if !self.is_trusted_for(&persisted, node_id) {
            warn!(peer = %node_id.short(), "persisted certificate no longer trusted");
            return None;
        }
        if let Ok(mut certs) = self.certs.write() {
            certs.insert(*node_id, persisted.clone());
        }
        Some(persisted)
    }

    /// Verify and cache a peer certificate.
    ///
    /// Returns `true` if the certificate was not known before. Rejected
    /// certificates are logged and leave the cache untouched.
    pub fn cache_certificate(&self, cert: &[u8], node_id: &NodeId) -> bool {
        if !self.is_trusted_for(cert, node_id) {
            warn!(peer = %node_id.short(), "refusing to cache untrusted certificate");
            return false;
        }

        let Ok(mut certs) = self.certs.write() else {
            return false;
        };
        if certs.contains_key(node_id) {
            return false;
        }
        certs.insert(*node_id, cert.to_vec());
        drop(certs);

        if let Some(store) = &self.persist
            && let Err(e) = store.store_peer_cert(node_id, cert)
        {
            warn!(peer = %node_id.short(), error = %e, "failed to persist peer certificate");
        }
        debug!(peer = %node_id.short(), "cached peer certificate");
        true
    }

    fn is_trusted_for(&self, cert: &[u8], node_id: &NodeId) -> bool {
        node_id_from_cert(cert).as_ref() == Some(node_id) && self.trust.verify(cert)
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("node_id", &self.node_id)
            .field("can_sign", &self.keypair.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CertificateAuthority;

    fn store_for(ca: &CertificateAuthority) -> (IdentityStore, NodeId) {
        let keypair = Keypair::generate();
        let node_id = NodeId::random();
        let cert = ca.issue(&node_id, &keypair, None).expect("issue");
        let mut trust = TrustStore::new();
        trust.add_root(ca.certificate_der().to_vec()).expect("root");
        let store = IdentityStore::new(cert, Some(keypair), trust, None).expect("store");
        (store, node_id)
    }

    #[test]
    fn test_node_id_hex_roundtrip() {
        let id = NodeId::random();
        let parsed = NodeId::from_hex(&id.to_hex()).expect("parse");
        assert_eq!(id, parsed);
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_node_id_xor_distance() {
        let a = NodeId::from_bytes([0xFF; NODE_ID_LEN]);
        let b = NodeId::from_bytes([0x00; NODE_ID_LEN]);

        assert_eq!(a.xor_distance(&a), [0u8; NODE_ID_LEN]);
        assert_eq!(a.xor_distance(&b), [0xFF; NODE_ID_LEN]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
    }

    #[test]
    fn test_distance_cmp_orders_big_endian() {
        let mut near = [0u8; NODE_ID_LEN];
        near[NODE_ID_LEN - 1] = 0xFF;
        let mut far = [0u8; NODE_ID_LEN];
        far[0] = 0x01;
        assert_eq!(distance_cmp(&near, &far), std::cmp::Ordering::Less);
        assert_eq!(distance_cmp(&far, &near), std::cmp::Ordering::Greater);
        assert_eq!(distance_cmp(&far, &far), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_sign_and_verify_own_payload() {
        let ca = CertificateAuthority::generate("test-domain").expect("ca");
        let (store, node_id) = store_for(&ca);

        let signature = store.sign(b"payload").expect("sign");
        assert!(store.verify(&node_id, b"payload", &signature, None));
        assert!(!store.verify(&node_id, b"other payload", &signature, None));
    }

    #[test]
    fn test_unknown_signer_is_reported() {
        let ca = CertificateAuthority::generate("test-domain").expect("ca");
        let (alice, _) = store_for(&ca);
        let (bob, bob_id) = store_for(&ca);

        let signature = bob.sign(b"hello").expect("sign");
        assert_eq!(
            alice.check(&bob_id, b"hello", &signature, None),
            Verification::UnknownSigner
        );

        assert!(alice.cache_certificate(bob.own_certificate(), &bob_id));
        assert!(!alice.cache_certificate(bob.own_certificate(), &bob_id));
        assert_eq!(
            alice.check(&bob_id, b"hello", &signature, None),
            Verification::Valid
        );
    }

    #[test]
    fn test_certificate_with_wrong_node_id_is_rejected() {
        let ca = CertificateAuthority::generate("test-domain").expect("ca");
        let (alice, _) = store_for(&ca);
        let (bob, _) = store_for(&ca);
        let impostor = NodeId::random();

        assert!(!alice.cache_certificate(bob.own_certificate(), &impostor));
        let signature = bob.sign(b"hello").expect("sign");
        assert_eq!(
            alice.check(&impostor, b"hello", &signature, Some(bob.own_certificate())),
            Verification::Invalid
        );
    }

    #[test]
    fn test_foreign_ca_certificate_is_rejected() {
        let ca = CertificateAuthority::generate("test-domain").expect("ca");
        let rogue = CertificateAuthority::generate("test-domain").expect("rogue ca");
        let (alice, _) = store_for(&ca);
        let (mallory, mallory_id) = store_for(&rogue);

        assert!(!alice.cache_certificate(mallory.own_certificate(), &mallory_id));
        assert!(!alice.has_certificate(&mallory_id));
    }

    #[test]
    fn test_signing_without_key_fails() {
        let ca = CertificateAuthority::generate("test-domain").expect("ca");
        let keypair = Keypair::generate();
        let node_id = NodeId::random();
        let cert = ca.issue(&node_id, &keypair, None).expect("issue");
        let store = IdentityStore::new(cert, None, TrustStore::new(), None).expect("store");

        assert_eq!(store.sign(b"x"), Err(SigningError::KeyUnavailable));
    }
}
