//! # SecureDHT - Signed, Replicated Kademlia Storage
//!
//! SecureDHT is a Kademlia-style distributed hash table where every RPC is
//! authenticated:
//!
//! - **Identity**: NodeIDs are carried in X.509 certificates issued by a shared CA
//! - **Challenges**: each request and response is signed over a fresh challenge
//! - **Trust bootstrap**: unknown senders receive a signed NACK and retry with their certificate
//! - **Storage**: last-writer-wins scalars plus set-valued keys with append/remove merges
//! - **Discovery**: SSDP-style multicast search for seed nodes
//!
//! ## Architecture
//!
//! Routing and storage state is owned by a single actor (`DhtNode`); every
//! other component talks to it through a cloneable handle. The secure RPC
//! layer sits between the actor and a pluggable transport, so lookups and
//! replication run unchanged over TCP or an in-process test network.
//!
//! ## Security Model
//!
//! - Requests from signers with unknown certificates are never applied
//! - Forged or mismatched signatures are dropped without a response
//! - Certificates are verified against local trust roots before caching
//! - Frames and stored values are size-bounded before deserialization
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: bootstrap, set/get, append/remove, indexes |
//! | `identity` | NodeIDs, contacts, keypairs and the certificate cache |
//! | `crypto` | Certificate authority, trust roots, signature checks |
//! | `certstore` | On-disk certificate directory |
//! | `challenge` | Signed payload construction per RPC kind |
//! | `dht` | XOR-metric routing table, local store and their actor |
//! | `secure_rpc` | Authenticated caller and callee sides of every RPC |
//! | `lookup` | Iterative node and value crawls |
//! | `config` | Node parameters and retry policy |
//! | `discovery` | SSDP-style seed discovery |
//! | `protocols` | Transport and handler traits |
//! | `rpc` | TCP transport implementing the protocols |
//! | `messages` | Wire types and bounded decoding |

mod certstore;
mod challenge;
mod config;
mod crypto;
mod dht;
mod discovery;
mod identity;
mod lookup;
mod messages;
mod node;
mod protocols;
mod rpc;
mod secure_rpc;

#[cfg(test)]
mod testing;

pub use certstore::CertificateStore;
pub use challenge::{new_challenge, payload_for, ChallengeError, RpcKind, SignedValue};
pub use config::{DhtConfig, RetryPolicy, DEFAULT_ALPHA, DEFAULT_K};
pub use crypto::{node_id_from_cert, CertificateAuthority, SignatureError, TrustStore};
pub use dht::{cert_key, key_digest, Key, StoredValue};
pub use discovery::{
    parse_http_response, DiscoveredService, DiscoveryConfig, ServiceRecord, SsdpResponder,
    SsdpSearch, CA_SERVICE_UUID, DHT_SERVICE_UUID,
};
pub use identity::{Contact, IdentityStore, Keypair, NodeId, SigningError, Verification};
pub use lookup::{ConcatLookup, IterativeLookup, LookupParams, ValueLookup};
pub use messages::{DhtNodeRequest, DhtNodeResponse, RequestHeader};
pub use node::{BootstrapPeer, DhtError, SecureDhtNode};
pub use protocols::{DhtNodeRpc, DhtRequestHandler};
pub use rpc::RpcNode;
pub use secure_rpc::{CallOutcome, FindValueReply, SecureRpc};
