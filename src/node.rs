//! # High-Level Node API
//!
//! [`SecureDhtNode`] is the entry point for using the DHT. It ties together
//! the identity store, the routing/storage actor, the secure RPC layer and
//! the iterative lookups.
//!
//! ## Quick Start
//!
//! ```ignore
//! let identity = Arc::new(IdentityStore::load(CertificateStore::open("node-a")?)?);
//! let node = SecureDhtNode::bind("0.0.0.0:5000".parse()?, identity, DhtConfig::default()).await?;
//!
//! node.bootstrap(&[BootstrapPeer { addr: seed_addr, certificate: seed_cert }]).await;
//! node.append("kalas", vec![json!("apa")]).await?;
//! let members = node.get_concat("kalas").await?;
//! ```
//!
//! ## Replication
//!
//! Writes look up the `k` nodes nearest to the key and send the write to
//! each of them. The local store is written as well when this node is among
//! those nearest. A write that no node accepts fails, unless the node is
//! authoritative, in which case it lands in the local store alone.
//!
//! ## Background Tasks
//!
//! - **Server**: TCP accept loop feeding the secure RPC callee
//! - **Bucket refresh**: random-ID lookups in buckets idle for an hour
//! - **Republish**: re-replicates entries older than the republish interval;
//!   the same pass sweeps expired entries

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::crypto::node_id_from_cert;
use crate::dht::{cert_key, key_digest, random_id_for_bucket, DhtNode, Key, StoredValue};
use crate::identity::{distance_cmp, Contact, IdentityStore, NodeId};
use crate::lookup::{IterativeLookup, LookupParams, ValueLookup};
use crate::protocols::DhtNodeRpc;
use crate::rpc::{self, RpcNode};
use crate::secure_rpc::{CallOutcome, SecureRpc};

/// A seed node: where to reach it and the certificate it will sign with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub addr: SocketAddr,
    pub certificate: Vec<u8>,
}

/// Failures surfaced by [`SecureDhtNode`] operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhtError {
    /// The routing table is empty and this node is not authoritative.
    NoNeighborsKnown,
    /// No node accepted the operation.
    OperationFailed(String),
}

impl std::fmt::Display for DhtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DhtError::NoNeighborsKnown => write!(f, "no neighbors known"),
            DhtError::OperationFailed(msg) => write!(f, "operation failed: {msg}"),
        }
    }
}

impl std::error::Error for DhtError {}

#[derive(Clone, Debug)]
enum Write {
    Store(Option<StoredValue>),
    Append(StoredValue),
    Remove(StoredValue),
}

impl Write {
    fn name(&self) -> &'static str {
        match self {
            Write::Store(Some(_)) => "set",
            Write::Store(None) => "delete",
            Write::Append(_) => "append",
            Write::Remove(_) => "remove",
        }
    }
}

struct NodeInner<N: DhtNodeRpc> {
    rpc: SecureRpc<N>,
    config: DhtConfig,
}

pub struct SecureDhtNode<N: DhtNodeRpc = RpcNode> {
    inner: Arc<NodeInner<N>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SecureDhtNode<RpcNode> {
    /// Bind a TCP listener on `addr` and start serving.
    ///
    /// Binding to port 0 picks a free port; the chosen address is what the
    /// node advertises to peers.
    pub async fn bind(addr: SocketAddr, identity: Arc<IdentityStore>, config: DhtConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr().context("failed to get local address")?;
        let contact = Contact::new(identity.own_node_id(), local_addr);
        let network = Arc::new(RpcNode::new(config.rpc_timeout));

        let node = Self::with_network(contact, identity, network, config).await;
        let handler = Arc::new(node.inner.rpc.clone());
        let server = tokio::spawn(async move {
            if let Err(e) = rpc::serve(listener, handler).await {
                warn!(error = %e, "server stopped");
            }
        });
        node.track(server);

        info!(node = %node.node_id(), addr = %local_addr, "node listening");
        Ok(node)
    }
}

impl<N: DhtNodeRpc> SecureDhtNode<N> {
    /// Build a node over an existing transport. No server is started.
    pub async fn with_network(
        contact: Contact,
        identity: Arc<IdentityStore>,
        network: Arc<N>,
        config: DhtConfig,
    ) -> Self {
        let node_id = contact.node_id;
        let dht = DhtNode::new(node_id, config.k, config.value_ttl);
        let own_cert = hex::encode(identity.own_certificate());
        dht.set_local(cert_key(&node_id), Some(StoredValue::scalar(&Value::String(own_cert))))
            .await;

        let rpc = SecureRpc::new(identity, dht, network, contact, config.k);
        let inner = Arc::new(NodeInner { rpc, config });
        let node = Self {
            inner: inner.clone(),
            tasks: Mutex::new(Vec::new()),
        };
        node.track(tokio::spawn(maintenance(inner)));
        node
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.rpc.node_id()
    }

    pub fn contact(&self) -> &Contact {
        self.inner.rpc.self_contact()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.contact().addr
    }

    pub fn identity(&self) -> &IdentityStore {
        self.inner.rpc.identity()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// The callee side of this node, for wiring into a custom transport.
    pub fn request_handler(&self) -> SecureRpc<N> {
        self.inner.rpc.clone()
    }

    /// Contacts currently in the routing table.
    pub async fn known_peers(&self) -> Vec<NodeId> {
        self.inner.rpc.dht().all_node_ids().await.into_iter().collect()
    }

    /// Join the network through `seeds`.
    ///
    /// Each seed's certificate is cached and the seed is pinged with this
    /// node's own certificate attached, retrying per the bootstrap policy.
    /// If any seed answered, a lookup for our own id fills the routing
    /// table. Returns the number of seeds that answered.
    pub async fn bootstrap(&self, seeds: &[BootstrapPeer]) -> usize {
        if seeds.is_empty() {
            return 0;
        }
        let rpc = &self.inner.rpc;
        let own_cert = rpc.identity().own_certificate().to_vec();
        let mut reached = 0;

        for seed in seeds {
            let Some(seed_id) = node_id_from_cert(&seed.certificate) else {
                warn!(addr = %seed.addr, "seed certificate carries no node id");
                continue;
            };
            if seed_id == self.node_id() {
                continue;
            }
            rpc.identity().cache_certificate(&seed.certificate, &seed_id);
            if !rpc.identity().has_certificate(&seed_id) {
                warn!(addr = %seed.addr, "seed certificate is not trusted");
                continue;
            }

            let contact = Contact::new(seed_id, seed.addr);
            let answered = self
                .inner
                .config
                .bootstrap_retry
                .retry(|attempt| {
                    let contact = &contact;
                    let cert = own_cert.clone();
                    async move {
                        debug!(addr = %contact.addr, attempt, "pinging seed");
                        rpc.call_ping(contact, Some(cert)).await.into_success()
                    }
                })
                .await;
            match answered {
                Some(_) => reached += 1,
                None => warn!(addr = %seed.addr, peer = %seed_id.short(), "seed did not answer"),
            }
        }

        if reached > 0 {
            let found = self.inner.lookup().find_nodes(self.node_id()).await;
            info!(seeds = reached, found = found.len(), "bootstrap complete");
        }
        reached
    }

    pub async fn set(&self, key: &str, value: &Value) -> Result<(), DhtError> {
        self.inner
            .replicate(key_digest(key), Write::Store(Some(StoredValue::scalar(value))))
            .await
    }

    /// Store a deletion marker for `key`.
    pub async fn delete(&self, key: &str) -> Result<(), DhtError> {
        self.inner.replicate(key_digest(key), Write::Store(None)).await
    }

    /// First value found for `key`. `Ok(None)` covers both missing and deleted keys;
    /// a lookup that nobody answered fails.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, DhtError> {
        let key = key_digest(key);
        let rpc = &self.inner.rpc;
        if let Some(local) = rpc.dht().get_local(&key).await {
            return Ok(local.map(|v| v.to_json()));
        }
        if !self.inner.has_neighbors(&key).await {
            return if self.inner.config.authoritative {
                Ok(None)
            } else {
                Err(DhtError::NoNeighborsKnown)
            };
        }
        match self.inner.lookup().find_value(key).await {
            ValueLookup::Found(value) => Ok(value.map(|v| v.to_json())),
            ValueLookup::Exhausted => Ok(None),
            ValueLookup::NoResponders if self.inner.config.authoritative => Ok(None),
            ValueLookup::NoResponders => Err(DhtError::OperationFailed("get: no node answered".into())),
        }
    }

    pub async fn append(&self, key: &str, values: Vec<Value>) -> Result<(), DhtError> {
        self.inner
            .replicate(key_digest(key), Write::Append(StoredValue::set(values)))
            .await
    }

    pub async fn remove(&self, key: &str, values: Vec<Value>) -> Result<(), DhtError> {
        self.inner
            .replicate(key_digest(key), Write::Remove(StoredValue::set(values)))
            .await
    }

    /// Union of the set stored under `key` across its holders.
    ///
    /// A key in scalar mode yields the majority value as a single element.
    pub async fn get_concat(&self, key: &str) -> Result<Vec<Value>, DhtError> {
        let key = key_digest(key);
        let rpc = &self.inner.rpc;
        let local = rpc.dht().get_local(&key).await;

        let resolved = if self.inner.has_neighbors(&key).await {
            let lookup = self.inner.lookup().find_value_concat(key, local.clone()).await;
            if lookup.responders == 0 && local.is_none() && !self.inner.config.authoritative {
                return Err(DhtError::OperationFailed("get_concat: no node answered".into()));
            }
            lookup.value
        } else if local.is_some() || self.inner.config.authoritative {
            match local.flatten() {
                Some(value) => value,
                None => StoredValue::Set(Default::default()),
            }
        } else {
            return Err(DhtError::NoNeighborsKnown);
        };
        Ok(as_list(&resolved))
    }

    /// Append `value` under every prefix level of `index`.
    ///
    /// Levels are `prefix/a`, `prefix/a/b`, ... Every level is attempted;
    /// the first failure is reported.
    pub async fn add_index(&self, prefix: &str, index: &[&str], value: Value) -> Result<(), DhtError> {
        let mut first_error = None;
        for key in index_keys(prefix, index) {
            if let Err(e) = self.append(&key, vec![value.clone()]).await {
                debug!(key = %key, error = %e, "index level append failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn remove_index(&self, prefix: &str, index: &[&str], value: Value) -> Result<(), DhtError> {
        let mut first_error = None;
        for key in index_keys(prefix, index) {
            if let Err(e) = self.remove(&key, vec![value.clone()]).await {
                debug!(key = %key, error = %e, "index level remove failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn get_index(&self, prefix: &str, index: &[&str]) -> Result<Vec<Value>, DhtError> {
        self.get_concat(&format!("{}/{}", prefix, index.join("/"))).await
    }

    /// Stop the server, the maintenance tasks and the routing actor.
    pub async fn stop(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
        self.inner.rpc.dht().quit().await;
        info!(node = %self.node_id(), "node stopped");
    }
}

impl<N: DhtNodeRpc> NodeInner<N> {
    fn lookup(&self) -> IterativeLookup<N> {
        IterativeLookup::new(self.rpc.clone(), LookupParams::from(&self.config))
    }

    async fn has_neighbors(&self, key: &Key) -> bool {
        !self
            .rpc
            .dht()
            .find_neighbors(&NodeId::from_bytes(*key), None, 1)
            .await
            .is_empty()
    }

    async fn apply_local(&self, key: Key, write: &Write) {
        let dht = self.rpc.dht();
        let result = match write.clone() {
            Write::Store(value) => {
                dht.set_local(key, value).await;
                Ok(())
            }
            Write::Append(value) => dht.append_local(key, value).await,
            Write::Remove(value) => dht.remove_local(key, value).await,
        };
        if let Err(e) = result {
            warn!(key = %hex::encode(&key[..8]), error = %e, "local write rejected");
        }
    }

    /// Send `write` to the k nearest nodes for `key`.
    async fn replicate(&self, key: Key, write: Write) -> Result<(), DhtError> {
        let target = NodeId::from_bytes(key);
        if !self.has_neighbors(&key).await {
            if self.config.authoritative {
                self.apply_local(key, &write).await;
                return Ok(());
            }
            return Err(DhtError::NoNeighborsKnown);
        }

        let nodes = self.lookup().find_nodes(target).await;
        if nodes.is_empty() {
            if self.config.authoritative {
                debug!(key = %hex::encode(&key[..8]), op = write.name(), "no live nodes, stored locally");
                self.apply_local(key, &write).await;
                return Ok(());
            }
            return Err(DhtError::OperationFailed(format!("{}: no node answered", write.name())));
        }

        let own_distance = self.rpc.node_id().xor_distance(&target);
        let store_locally = nodes.len() < self.config.k
            || nodes
                .last()
                .is_some_and(|furthest| distance_cmp(&own_distance, &furthest.distance_to(&target)).is_lt());
        if store_locally {
            self.apply_local(key, &write).await;
        }

        let mut calls = JoinSet::new();
        for contact in nodes {
            let rpc = self.rpc.clone();
            let write = write.clone();
            calls.spawn(async move {
                let outcome: CallOutcome<()> = match write {
                    Write::Store(value) => rpc.call_store(&contact, key, value).await,
                    Write::Append(value) => rpc.call_append(&contact, key, value).await,
                    Write::Remove(value) => rpc.call_remove(&contact, key, value).await,
                };
                outcome.is_success()
            });
        }

        let mut accepted = 0usize;
        let mut attempted = 0usize;
        while let Some(joined) = calls.join_next().await {
            attempted += 1;
            if matches!(joined, Ok(true)) {
                accepted += 1;
            }
        }
        debug!(
            key = %hex::encode(&key[..8]),
            op = write.name(),
            accepted,
            attempted,
            local = store_locally,
            "replicated"
        );
        if accepted > 0 {
            Ok(())
        } else {
            Err(DhtError::OperationFailed(format!(
                "{} rejected by all {attempted} nodes",
                write.name()
            )))
        }
    }

    async fn refresh_buckets(&self) {
        let dht = self.rpc.dht();
        for bucket in dht.stale_buckets(self.config.bucket_refresh_interval).await {
            let target = random_id_for_bucket(&self.rpc.node_id(), bucket);
            let found = self.lookup().find_nodes(target).await;
            dht.mark_bucket_refreshed(bucket).await;
            debug!(bucket, found = found.len(), "refreshed bucket");
        }
    }

    async fn republish(&self) {
        let dht = self.rpc.dht();
        let entries = dht.entries_older_than(self.config.republish_interval).await;
        if entries.is_empty() {
            return;
        }
        debug!(entries = entries.len(), "republishing");
        for (key, value) in entries {
            let write = match value {
                Some(value) if dht.is_set_mode(&key).await && value.is_list_like() => Write::Append(value),
                other => Write::Store(other),
            };
            if let Err(e) = self.replicate(key, write).await {
                debug!(key = %hex::encode(&key[..8]), error = %e, "republish failed");
            }
        }
    }
}

async fn maintenance<N: DhtNodeRpc>(inner: Arc<NodeInner<N>>) {
    let start = tokio::time::Instant::now();
    let mut refresh = tokio::time::interval_at(
        start + inner.config.bucket_refresh_interval,
        inner.config.bucket_refresh_interval,
    );
    let mut republish = tokio::time::interval_at(
        start + inner.config.republish_interval,
        inner.config.republish_interval,
    );
    loop {
        tokio::select! {
            _ = refresh.tick() => inner.refresh_buckets().await,
            _ = republish.tick() => inner.republish().await,
        }
    }
}

fn index_keys(prefix: &str, index: &[&str]) -> Vec<String> {
    (1..=index.len())
        .map(|level| format!("{}/{}", prefix, index[..level].join("/")))
        .collect()
}

fn as_list(value: &StoredValue) -> Vec<Value> {
    match value.as_elements() {
        Some(elements) => elements
            .iter()
            .map(|e| serde_json::from_str(e).unwrap_or_else(|_| Value::String(e.clone())))
            .collect(),
        None => vec![value.to_json()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{next_addr, TestCa, TestNetwork};
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    async fn spawn_node(net: &TestNetwork, ca: &TestCa, config: DhtConfig) -> SecureDhtNode<TestNetwork> {
        let identity = ca.identity();
        let contact = Contact::new(identity.own_node_id(), next_addr());
        let node = SecureDhtNode::with_network(contact.clone(), identity, Arc::new(net.clone()), config).await;
        net.register(contact.addr, Arc::new(node.request_handler()));
        node
    }

    fn seed(node: &SecureDhtNode<TestNetwork>) -> BootstrapPeer {
        BootstrapPeer {
            addr: node.local_addr(),
            certificate: node.identity().own_certificate().to_vec(),
        }
    }

    fn as_set(values: Vec<Value>) -> HashSet<String> {
        values.into_iter().map(|v| v.to_string()).collect()
    }

    async fn trio() -> (TestNetwork, [SecureDhtNode<TestNetwork>; 3]) {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let a = spawn_node(&net, &ca, DhtConfig::default()).await;
        let b = spawn_node(&net, &ca, DhtConfig::default()).await;
        let c = spawn_node(&net, &ca, DhtConfig::default()).await;
        assert_eq!(a.bootstrap(&[seed(&b)]).await, 1);
        assert_eq!(c.bootstrap(&[seed(&b)]).await, 1);
        (net, [a, b, c])
    }

    #[tokio::test]
    async fn kalas_append_then_remove_converges() {
        let (_net, [a, b, c]) = trio().await;

        a.append("kalas", vec![json!("apa")]).await.unwrap();
        assert_eq!(b.get_concat("kalas").await.unwrap(), vec![json!("apa")]);

        c.remove("kalas", vec![json!("apa")]).await.unwrap();
        for node in [&a, &b, &c] {
            assert!(node.get_concat("kalas").await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn appends_from_different_nodes_are_unioned_once() {
        let (_net, [a, b, c]) = trio().await;

        a.append("members", vec![json!("x"), json!("y")]).await.unwrap();
        b.append("members", vec![json!("y"), json!("z")]).await.unwrap();
        b.append("members", vec![json!("z")]).await.unwrap();

        let members = c.get_concat("members").await.unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(as_set(members), as_set(vec![json!("x"), json!("y"), json!("z")]));
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let (_net, [a, b, c]) = trio().await;

        a.set("answer", &json!({"n": 42})).await.unwrap();
        assert_eq!(c.get("answer").await.unwrap(), Some(json!({"n": 42})));
        assert_eq!(b.get("answer").await.unwrap(), Some(json!({"n": 42})));

        b.delete("answer").await.unwrap();
        assert_eq!(a.get("answer").await.unwrap(), None);
        assert_eq!(c.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lone_node_needs_authority() {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let lone = spawn_node(&net, &ca, DhtConfig::default()).await;
        assert_eq!(lone.set("k", &json!(1)).await, Err(DhtError::NoNeighborsKnown));
        assert_eq!(lone.get("k").await, Err(DhtError::NoNeighborsKnown));

        let root = spawn_node(&net, &ca, DhtConfig { authoritative: true, ..DhtConfig::default() }).await;
        root.set("k", &json!(1)).await.unwrap();
        assert_eq!(root.get("k").await.unwrap(), Some(json!(1)));
        root.append("s", vec![json!("a")]).await.unwrap();
        assert_eq!(root.get_concat("s").await.unwrap(), vec![json!("a")]);
    }

    #[tokio::test]
    async fn empty_bootstrap_is_a_no_op() {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let node = spawn_node(&net, &ca, DhtConfig::default()).await;
        assert_eq!(node.bootstrap(&[]).await, 0);
        assert!(node.known_peers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_seed_is_retried_then_skipped() {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let node = spawn_node(&net, &ca, DhtConfig::default()).await;
        let dead = spawn_node(&net, &ca, DhtConfig::default()).await;
        net.set_failure(dead.local_addr(), true);

        assert_eq!(node.bootstrap(&[seed(&dead)]).await, 0);
        assert_eq!(net.calls_to(dead.local_addr()).len(), 3);
    }

    #[tokio::test]
    async fn own_certificate_is_published_locally() {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let node = spawn_node(&net, &ca, DhtConfig::default()).await;
        let stored = node
            .request_handler()
            .dht()
            .get_local(&cert_key(&node.node_id()))
            .await
            .flatten()
            .unwrap();
        assert_eq!(stored.to_json(), json!(hex::encode(node.identity().own_certificate())));
    }

    #[tokio::test]
    async fn index_levels_are_maintained() {
        let (_net, [a, b, _c]) = trio().await;

        a.add_index("node", &["org", "site"], json!("n1")).await.unwrap();
        a.add_index("node", &["org", "other"], json!("n2")).await.unwrap();

        assert_eq!(as_set(b.get_index("node", &["org"]).await.unwrap()), as_set(vec![json!("n1"), json!("n2")]));
        assert_eq!(b.get_index("node", &["org", "site"]).await.unwrap(), vec![json!("n1")]);

        b.remove_index("node", &["org", "site"], json!("n1")).await.unwrap();
        assert_eq!(a.get_index("node", &["org"]).await.unwrap(), vec![json!("n2")]);
        assert!(a.get_index("node", &["org", "site"]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_and_reads_fail_when_every_neighbor_is_down() {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let a = spawn_node(&net, &ca, DhtConfig::default()).await;
        let b = spawn_node(&net, &ca, DhtConfig::default()).await;
        assert_eq!(a.bootstrap(&[seed(&b)]).await, 1);
        net.set_failure(b.local_addr(), true);

        assert!(matches!(a.set("k", &json!(1)).await, Err(DhtError::OperationFailed(_))));
        assert_eq!(a.request_handler().dht().get_local(&key_digest("k")).await, None);

        // b was evicted by the failed write; put it back to exercise the reads
        a.request_handler().dht().add_contact(b.contact().clone()).await;
        assert!(matches!(a.get("k").await, Err(DhtError::OperationFailed(_))));
        a.request_handler().dht().add_contact(b.contact().clone()).await;
        assert!(matches!(a.get_concat("k").await, Err(DhtError::OperationFailed(_))));
    }

    #[tokio::test]
    async fn authoritative_node_keeps_writes_when_neighbors_are_down() {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let root = spawn_node(&net, &ca, DhtConfig { authoritative: true, ..DhtConfig::default() }).await;
        let b = spawn_node(&net, &ca, DhtConfig::default()).await;
        assert_eq!(root.bootstrap(&[seed(&b)]).await, 1);
        net.set_failure(b.local_addr(), true);

        root.set("k", &json!("kept")).await.unwrap();
        assert_eq!(root.get("k").await.unwrap(), Some(json!("kept")));
    }

    #[tokio::test(start_paused = true)]
    async fn republish_pushes_old_local_entries_to_neighbors() {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let config = DhtConfig {
            republish_interval: Duration::from_secs(60),
            ..DhtConfig::default()
        };
        let a = spawn_node(&net, &ca, config).await;
        let b = spawn_node(&net, &ca, DhtConfig::default()).await;
        assert_eq!(a.bootstrap(&[seed(&b)]).await, 1);

        let key = key_digest("orphan");
        let value = StoredValue::scalar(&json!("v"));
        a.request_handler().dht().set_local(key, Some(value.clone())).await;
        assert_eq!(b.request_handler().dht().get_local(&key).await, None);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let mut pushed = None;
        for _ in 0..100 {
            pushed = b.request_handler().dht().get_local(&key).await;
            if pushed.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(pushed, Some(Some(value)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_buckets_are_refreshed_with_a_lookup() {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let config = DhtConfig {
            bucket_refresh_interval: Duration::from_secs(60),
            ..DhtConfig::default()
        };
        let a = spawn_node(&net, &ca, config).await;
        let b = spawn_node(&net, &ca, DhtConfig::default()).await;
        assert_eq!(a.bootstrap(&[seed(&b)]).await, 1);
        let lookups = |net: &TestNetwork| {
            net.calls_to(b.local_addr())
                .into_iter()
                .filter(|name| *name == "find_node")
                .count()
        };
        let before = lookups(&net);

        // the bucket is idle for more than the interval only at the second tick
        tokio::time::sleep(Duration::from_secs(121)).await;
        let mut after = before;
        for _ in 0..100 {
            after = lookups(&net);
            if after > before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(after > before);
    }

    #[test]
    fn index_keys_cover_every_level() {
        assert_eq!(
            index_keys("p", &["a", "b", "c"]),
            vec!["p/a".to_string(), "p/a/b".into(), "p/a/b/c".into()]
        );
    }
}
