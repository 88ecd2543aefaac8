//! In-process network and credentials shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::crypto::{CertificateAuthority, TrustStore};
use crate::dht::{DhtNode, DEFAULT_VALUE_TTL};
use crate::identity::{Contact, IdentityStore, Keypair, NodeId};
use crate::messages::{DhtNodeRequest, DhtNodeResponse};
use crate::protocols::{DhtNodeRpc, DhtRequestHandler};
use crate::secure_rpc::SecureRpc;

static NEXT_PORT: AtomicU16 = AtomicU16::new(20_000);

pub(crate) fn next_addr() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::SeqCst);
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub(crate) struct TestCa {
    ca: CertificateAuthority,
}

impl TestCa {
    pub(crate) fn new() -> Self {
        Self {
            ca: CertificateAuthority::generate("test-domain").expect("test ca"),
        }
    }

    pub(crate) fn trust(&self) -> TrustStore {
        let mut trust = TrustStore::new();
        trust.add_root(self.ca.certificate_der().to_vec()).expect("root");
        trust
    }

    pub(crate) fn identity(&self) -> Arc<IdentityStore> {
        self.identity_for(NodeId::random())
    }

    pub(crate) fn identity_for(&self, node_id: NodeId) -> Arc<IdentityStore> {
        let keypair = Keypair::generate();
        let cert = self.ca.issue(&node_id, &keypair, None).expect("issue");
        Arc::new(IdentityStore::new(cert, Some(keypair), self.trust(), None).expect("identity"))
    }
}

#[derive(Default)]
struct Registry {
    handlers: Mutex<HashMap<SocketAddr, Arc<dyn DhtRequestHandler>>>,
    failures: Mutex<HashSet<SocketAddr>>,
    calls: Mutex<Vec<(SocketAddr, &'static str)>>,
}

/// Delivers requests straight to registered handlers.
///
/// Failed addresses and handlers that drop a request both surface as
/// transport errors, like a timed-out TCP call.
#[derive(Clone, Default)]
pub(crate) struct TestNetwork {
    registry: Arc<Registry>,
}

impl TestNetwork {
    pub(crate) fn register(&self, addr: SocketAddr, handler: Arc<dyn DhtRequestHandler>) {
        self.registry.handlers.lock().expect("lock").insert(addr, handler);
    }

    pub(crate) fn set_failure(&self, addr: SocketAddr, fail: bool) {
        let mut failures = self.registry.failures.lock().expect("lock");
        if fail {
            failures.insert(addr);
        } else {
            failures.remove(&addr);
        }
    }

    pub(crate) fn calls_to(&self, addr: SocketAddr) -> Vec<&'static str> {
        self.registry
            .calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|(to, _)| *to == addr)
            .map(|(_, name)| *name)
            .collect()
    }
}

#[async_trait]
impl DhtNodeRpc for TestNetwork {
    async fn call(&self, to: &Contact, request: DhtNodeRequest) -> Result<DhtNodeResponse> {
        self.registry.calls.lock().expect("lock").push((to.addr, request.name()));
        if self.registry.failures.lock().expect("lock").contains(&to.addr) {
            return Err(anyhow!("simulated timeout to {}", to.addr));
        }
        let handler = self
            .registry
            .handlers
            .lock()
            .expect("lock")
            .get(&to.addr)
            .cloned()
            .ok_or_else(|| anyhow!("no node at {}", to.addr))?;
        let from = request.header().sender.addr;
        handler
            .handle_request(from, request)
            .await
            .ok_or_else(|| anyhow!("request dropped by {}", to.addr))
    }
}

/// One node wired into a [`TestNetwork`].
pub(crate) struct TestPeer {
    pub(crate) rpc: SecureRpc<TestNetwork>,
    pub(crate) identity: Arc<IdentityStore>,
    pub(crate) dht: DhtNode,
    pub(crate) contact: Contact,
}

impl TestPeer {
    pub(crate) fn spawn(network: &TestNetwork, ca: &TestCa, k: usize) -> Self {
        Self::spawn_with_identity(network, ca.identity(), k)
    }

    pub(crate) fn spawn_with_identity(network: &TestNetwork, identity: Arc<IdentityStore>, k: usize) -> Self {
        let contact = Contact::new(identity.own_node_id(), next_addr());
        let dht = DhtNode::new(contact.node_id, k, DEFAULT_VALUE_TTL);
        let rpc = SecureRpc::new(
            identity.clone(),
            dht.clone(),
            Arc::new(network.clone()),
            contact.clone(),
            k,
        );
        network.register(contact.addr, Arc::new(rpc.clone()));
        Self { rpc, identity, dht, contact }
    }

    /// Cache `other`'s certificate and add it to the routing table.
    pub(crate) async fn know(&self, other: &TestPeer) {
        self.identity
            .cache_certificate(other.identity.own_certificate(), &other.contact.node_id);
        self.dht.add_contact(other.contact.clone()).await;
    }
}
