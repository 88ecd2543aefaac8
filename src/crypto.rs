//! # Certificate Infrastructure
//!
//! This module provides the cryptographic primitives behind node identities:
//!
//! - **Signatures**: Ed25519 verification against a certificate's public key
//! - **Authority**: A domain CA that issues node certificates
//! - **Trust**: A store of CA roots used to validate peer certificates
//! - **NodeID binding**: Extraction of the NodeID from a certificate subject
//!
//! ## Identity Model
//!
//! - Every node certificate is issued by the domain CA
//! - The subject carries the hex NodeID as its DN-qualifier (OID 2.5.4.46)
//! - The subject public key is the Ed25519 key used to sign DHT payloads
//!
//! ## Security Properties
//!
//! - Only Ed25519 is accepted, both for node keys and for CA signatures
//! - A certificate is trusted only if its issuer is a configured root, the
//!   validity window covers "now" and the root key verifies its signature

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Keypair, NodeId};

/// DN-qualifier attribute carrying the hex NodeID.
pub const NODE_ID_OID: &str = "2.5.4.46";
const NODE_ID_OID_ARCS: [u64; 4] = [2, 5, 4, 46];

// ============================================================================
// Signature Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
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

/// Verify an Ed25519 signature over `data` with a raw 32-byte public key.
pub fn verify_signature(
    public_key: &[u8; 32],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let verifying_key = VerifyingKey::try_from(public_key.as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    verifying_key
        .verify_strict(data, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Wrap a raw Ed25519 secret in a PKCS#8 v1 document and hand it to rcgen.
fn rcgen_keypair(keypair: &Keypair) -> Result<rcgen::KeyPair> {
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&keypair.secret_key_bytes());

    rcgen::KeyPair::try_from(pkcs8.as_slice())
        .context("failed to create Ed25519 key pair for certificate")
}

// ============================================================================
// Certificate Authority
// ============================================================================

/// Domain CA used by `ca-init` and `node-init`.
///
/// The CA certificate is rebuilt from the stored key on every load; node
/// certificates name the CA subject as issuer and are signed by the CA key,
/// so the rebuilt certificate validates against the distributed root.
pub struct CertificateAuthority {
    domain: String,
    keypair: Keypair,
    signing_key: rcgen::KeyPair,
    certificate: rcgen::Certificate,
}

impl CertificateAuthority {
    pub fn generate(domain: &str) -> Result<Self> {
        Self::new(domain, Keypair::generate())
    }

    pub fn new(domain: &str, keypair: Keypair) -> Result<Self> {
        let signing_key = rcgen_keypair(&keypair)?;

        let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
            .context("failed to create CA certificate params")?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, domain);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

        let certificate = params
            .self_signed(&signing_key)
            .context("failed to self-sign CA certificate")?;

        Ok(Self {
            domain: domain.to_string(),
            keypair,
            signing_key,
            certificate,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn certificate_der(&self) -> &[u8] {
        self.certificate.der().as_ref()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Issue a node certificate binding `node_id` to `node_key`.
    pub fn issue(&self, node_id: &NodeId, node_key: &Keypair, name: Option<&str>) -> Result<Vec<u8>> {
        let node_kp = rcgen_keypair(node_key)?;
        let id_hex = node_id.to_hex();

        let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
            .context("failed to create node certificate params")?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(
            rcgen::DnType::CommonName,
            name.map(str::to_string).unwrap_or_else(|| id_hex.clone()),
        );
        params
            .distinguished_name
            .push(rcgen::DnType::OrganizationName, self.domain.as_str());
        params.distinguished_name.push(
            rcgen::DnType::CustomDnType(NODE_ID_OID_ARCS.to_vec()),
            rcgen::DnValue::Utf8String(id_hex),
        );

        let cert = params
            .signed_by(&node_kp, &self.certificate, &self.signing_key)
            .context("failed to sign node certificate")?;
        Ok(cert.der().to_vec())
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Trust Store
// ============================================================================

struct TrustRoot {
    subject: Vec<u8>,
    public_key: [u8; 32],
}

/// CA roots used to validate peer certificates.
#[derive(Default)]
pub struct TrustStore {
    roots: Vec<TrustRoot>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, der: Vec<u8>) -> Result<()> {
        use x509_parser::prelude::*;

        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| anyhow::anyhow!("invalid trust root: {e}"))?;
        let public_key = extract_public_key_from_cert(&der)
            .context("trust root does not carry an Ed25519 key")?;
        self.roots.push(TrustRoot {
            subject: cert.subject().as_raw().to_vec(),
            public_key,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// `true` if `der` was issued by one of the roots and is currently valid.
    pub fn verify(&self, der: &[u8]) -> bool {
        use x509_parser::prelude::*;

        let Ok((_, cert)) = X509Certificate::from_der(der) else {
            return false;
        };
        if !cert.validity().is_valid() {
            return false;
        }
        let issuer = cert.issuer().as_raw();
        let tbs: &[u8] = cert.tbs_certificate.as_ref();
        let signature: &[u8] = cert.signature_value.data.as_ref();

        self.roots
            .iter()
            .filter(|root| root.subject.as_slice() == issuer)
            .any(|root| verify_signature(&root.public_key, tbs, signature).is_ok())
    }
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("roots", &self.roots.len())
            .finish()
    }
}

// ============================================================================
// Certificate Inspection
// ============================================================================

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;

    let spki = cert.public_key();
    let key_bytes = &spki.subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// NodeID named by the certificate's DN-qualifier, if any.
pub fn node_id_from_cert(cert_der: &[u8]) -> Option<NodeId> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    cert.subject()
        .iter_attributes()
        .find(|attr| attr.attr_type().to_id_string() == NODE_ID_OID)
        .and_then(|attr| attr.as_str().ok())
        .and_then(|hex_id| NodeId::from_hex(hex_id).ok())
}
