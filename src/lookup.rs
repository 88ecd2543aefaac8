//! # Iterative Lookup
//!
//! Bounded-concurrency Kademlia crawls on top of [`SecureRpc`].
//!
//! ```text
//! seed alpha nearest -> round: query up to alpha uncontacted in parallel
//!                    -> merge returned contacts, drop non-responders
//!                    -> nearest set unchanged? query every uncontacted once
//!                    -> nothing left to query: done
//! ```
//!
//! Three variants share the round machinery:
//!
//! | Crawl | Stops when | Returns |
//! |-------|-----------|---------|
//! | [`IterativeLookup::find_nodes`] | heap exhausted | k nearest responders |
//! | [`IterativeLookup::find_value`] | first verified value | that value |
//! | [`IterativeLookup::find_value_concat`] | alpha values in one round, or exhausted | union or majority value |
//!
//! Every crawl is bounded by a round limit and a wall-clock deadline.
//! Responses within a round are handled in arrival order; once a crawl
//! finishes, in-flight queries are aborted and late answers are ignored.

use std::collections::HashSet;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::dht::{Key, StoredValue};
use crate::identity::{distance_cmp, Contact, NodeId};
use crate::protocols::DhtNodeRpc;
use crate::secure_rpc::{CallOutcome, FindValueReply, SecureRpc};

/// Crawl parameters, usually taken from [`DhtConfig`].
#[derive(Clone, Copy, Debug)]
pub struct LookupParams {
    pub k: usize,
    pub alpha: usize,
    pub max_rounds: usize,
    pub timeout: Duration,
}

impl From<&DhtConfig> for LookupParams {
    fn from(config: &DhtConfig) -> Self {
        Self {
            k: config.k,
            alpha: config.alpha.max(1),
            max_rounds: config.max_lookup_rounds,
            timeout: config.lookup_timeout,
        }
    }
}

// ============================================================================
// Node Heap
// ============================================================================

/// Candidates ordered by distance to the target.
///
/// Only the `k` nearest entries take part in a crawl; the rest are kept in
/// case nearer entries drop out.
#[derive(Debug)]
pub(crate) struct NodeHeap {
    target: NodeId,
    k: usize,
    nodes: Vec<Contact>,
    contacted: HashSet<NodeId>,
}

impl NodeHeap {
    pub(crate) fn new(target: NodeId, k: usize) -> Self {
        Self {
            target,
            k: k.max(1),
            nodes: Vec::new(),
            contacted: HashSet::new(),
        }
    }

    fn max_len(&self) -> usize {
        (self.k + 1) * self.k
    }

    pub(crate) fn push(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        for contact in contacts {
            if self.nodes.iter().any(|c| c.node_id == contact.node_id) {
                continue;
            }
            self.nodes.push(contact);
        }
        let target = self.target;
        self.nodes
            .sort_by(|a, b| distance_cmp(&a.distance_to(&target), &b.distance_to(&target)));
        let max_len = self.max_len();
        self.nodes.truncate(max_len);
    }

    pub(crate) fn remove(&mut self, id: &NodeId) {
        self.nodes.retain(|c| c.node_id != *id);
    }

    pub(crate) fn mark_contacted(&mut self, id: NodeId) {
        self.contacted.insert(id);
    }

    fn nearest(&self) -> impl Iterator<Item = &Contact> {
        self.nodes.iter().take(self.k)
    }

    pub(crate) fn ids(&self) -> Vec<NodeId> {
        self.nearest().map(|c| c.node_id).collect()
    }

    pub(crate) fn uncontacted(&self, limit: usize) -> Vec<Contact> {
        self.nearest()
            .filter(|c| !self.contacted.contains(&c.node_id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn all_contacted(&self) -> bool {
        self.nearest().all(|c| self.contacted.contains(&c.node_id))
    }

    /// Nearest entries that were queried and are still present (responded).
    pub(crate) fn responders(&self) -> Vec<Contact> {
        self.nearest()
            .filter(|c| self.contacted.contains(&c.node_id))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Crawl Rounds
// ============================================================================

#[derive(Clone, Copy)]
enum Mode {
    Nodes,
    Value,
}

enum Probe {
    Nodes(Vec<Contact>),
    Value(Option<StoredValue>),
    Failed,
}

/// Per-crawl state: candidate heap, round count and deadline.
struct Crawl {
    heap: NodeHeap,
    last_ids: Option<Vec<NodeId>>,
    round: usize,
    deadline: Instant,
}

impl Crawl {
    /// Next batch to query, or `None` when the crawl is over.
    fn next_batch(&mut self, params: &LookupParams) -> Option<Vec<Contact>> {
        if self.round >= params.max_rounds {
            debug!(lookup = %self.heap.target.short(), rounds = self.round, "lookup hit round limit");
            return None;
        }
        if Instant::now() >= self.deadline {
            debug!(lookup = %self.heap.target.short(), "lookup deadline reached");
            return None;
        }
        if self.heap.all_contacted() {
            return None;
        }

        let ids = self.heap.ids();
        let stalled = self.last_ids.as_ref() == Some(&ids);
        let count = if stalled { usize::MAX } else { params.alpha };
        self.last_ids = Some(ids);

        let batch = self.heap.uncontacted(count);
        if batch.is_empty() {
            return None;
        }
        for contact in &batch {
            self.heap.mark_contacted(contact.node_id);
        }
        self.round += 1;
        Some(batch)
    }
}

/// Outcome of a first-value crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueLookup {
    /// A verified value; `None` is a stored deletion.
    Found(Option<StoredValue>),
    /// Nodes answered but none held the key.
    Exhausted,
    /// Every queried node failed, or there was nobody to ask.
    NoResponders,
}

/// Outcome of a concatenating crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatLookup {
    pub value: StoredValue,
    /// Number of non-deleted values that went into `value`.
    pub sources: usize,
    /// Nodes that gave a verified answer, with or without a value.
    pub responders: usize,
}

pub struct IterativeLookup<N: DhtNodeRpc> {
    rpc: SecureRpc<N>,
    params: LookupParams,
}

impl<N: DhtNodeRpc> IterativeLookup<N> {
    pub fn new(rpc: SecureRpc<N>, params: LookupParams) -> Self {
        Self { rpc, params }
    }

    async fn start(&self, target: NodeId) -> Crawl {
        let mut heap = NodeHeap::new(target, self.params.k);
        let seeds = self
            .rpc
            .dht()
            .find_neighbors(&target, None, self.params.alpha)
            .await;
        heap.push(seeds);
        Crawl {
            heap,
            last_ids: None,
            round: 0,
            deadline: Instant::now() + self.params.timeout,
        }
    }

    fn spawn_round(&self, batch: Vec<Contact>, mode: Mode, target: NodeId) -> JoinSet<(Contact, Probe)> {
        let mut queries = JoinSet::new();
        for contact in batch {
            let rpc = self.rpc.clone();
            queries.spawn(async move {
                let probe = match mode {
                    Mode::Nodes => match rpc.call_find_node(&contact, target).await {
                        CallOutcome::Success(nodes) => Probe::Nodes(nodes),
                        _ => Probe::Failed,
                    },
                    Mode::Value => match rpc.call_find_value(&contact, *target.as_bytes()).await {
                        CallOutcome::Success(FindValueReply::Value(value)) => Probe::Value(value),
                        CallOutcome::Success(FindValueReply::Nodes(nodes)) => Probe::Nodes(nodes),
                        _ => Probe::Failed,
                    },
                };
                (contact, probe)
            });
        }
        queries
    }

    /// Next answer of the round, or `None` when the round is drained or the deadline passed.
    async fn next_answer(
        queries: &mut JoinSet<(Contact, Probe)>,
        deadline: Instant,
    ) -> Option<(Contact, Probe)> {
        loop {
            match tokio::time::timeout_at(deadline, queries.join_next()).await {
                Ok(Some(Ok(answer))) => return Some(answer),
                Ok(Some(Err(e))) => {
                    trace!(error = %e, "lookup query task failed");
                }
                Ok(None) => return None,
                Err(_) => {
                    queries.abort_all();
                    return None;
                }
            }
        }
    }

    fn absorb(&self, crawl: &mut Crawl, contact: &Contact, nodes: Vec<Contact>) {
        let self_id = self.rpc.node_id();
        crawl.heap.push(nodes.into_iter().filter(|c| c.node_id != self_id && c.node_id != contact.node_id));
    }

    /// The k nearest nodes to `target` that answered.
    pub async fn find_nodes(&self, target: NodeId) -> Vec<Contact> {
        let mut crawl = self.start(target).await;

        while let Some(batch) = crawl.next_batch(&self.params) {
            let mut queries = self.spawn_round(batch, Mode::Nodes, target);
            while let Some((contact, probe)) = Self::next_answer(&mut queries, crawl.deadline).await {
                match probe {
                    Probe::Nodes(nodes) => self.absorb(&mut crawl, &contact, nodes),
                    Probe::Value(_) | Probe::Failed => crawl.heap.remove(&contact.node_id),
                }
            }
        }

        let found = crawl.heap.responders();
        debug!(lookup = %target.short(), found = found.len(), rounds = crawl.round, "node lookup finished");
        found
    }

    /// Crawl until the first verified value for `key`.
    pub async fn find_value(&self, key: Key) -> ValueLookup {
        let target = NodeId::from_bytes(key);
        let mut crawl = self.start(target).await;
        let mut answered = false;

        while let Some(batch) = crawl.next_batch(&self.params) {
            let mut queries = self.spawn_round(batch, Mode::Value, target);
            while let Some((contact, probe)) = Self::next_answer(&mut queries, crawl.deadline).await {
                match probe {
                    Probe::Value(value) => {
                        queries.abort_all();
                        trace!(key = %hex::encode(&key[..8]), peer = %contact.node_id.short(), "value found");
                        return ValueLookup::Found(value);
                    }
                    Probe::Nodes(nodes) => {
                        answered = true;
                        self.absorb(&mut crawl, &contact, nodes);
                    }
                    Probe::Failed => crawl.heap.remove(&contact.node_id),
                }
            }
        }
        if answered {
            ValueLookup::Exhausted
        } else {
            ValueLookup::NoResponders
        }
    }

    /// Collect values from many holders and merge them.
    ///
    /// `local` is this node's own entry for `key`, if any. Deleted entries
    /// are ignored. The crawl ends early only when a single round yields
    /// `alpha` values; values from every round are kept. The nearest
    /// responder without a value is sent the merged result in the background.
    pub async fn find_value_concat(&self, key: Key, local: Option<Option<StoredValue>>) -> ConcatLookup {
        let target = NodeId::from_bytes(key);
        let mut crawl = self.start(target).await;
        let mut found: Vec<StoredValue> = Vec::new();
        let mut responders = 0usize;
        let mut without_value: Vec<Contact> = Vec::new();

        while let Some(batch) = crawl.next_batch(&self.params) {
            let mut round_values = 0usize;
            let mut queries = self.spawn_round(batch, Mode::Value, target);
            while let Some((contact, probe)) = Self::next_answer(&mut queries, crawl.deadline).await {
                match probe {
                    Probe::Value(value) => {
                        responders += 1;
                        if let Some(value) = value {
                            round_values += 1;
                            found.push(value);
                        }
                    }
                    Probe::Nodes(nodes) => {
                        responders += 1;
                        without_value.push(contact.clone());
                        self.absorb(&mut crawl, &contact, nodes);
                    }
                    Probe::Failed => crawl.heap.remove(&contact.node_id),
                }
            }
            if round_values >= self.params.alpha {
                break;
            }
        }

        if let Some(Some(value)) = local {
            found.push(value);
        }
        let sources = found.len();
        let value = resolve_values(found);

        if sources > 0 {
            without_value.sort_by(|a, b| distance_cmp(&a.distance_to(&target), &b.distance_to(&target)));
            if let Some(nearest) = without_value.into_iter().next() {
                self.spawn_repair(nearest, key, value.clone());
            }
        }
        ConcatLookup { value, sources, responders }
    }

    fn spawn_repair(&self, contact: Contact, key: Key, value: StoredValue) {
        let rpc = self.rpc.clone();
        tokio::spawn(async move {
            let outcome = if value.is_list_like() {
                rpc.call_append(&contact, key, value).await
            } else {
                rpc.call_store(&contact, key, Some(value)).await
            };
            trace!(
                peer = %contact.node_id.short(),
                key = %hex::encode(&key[..8]),
                ok = outcome.is_success(),
                "read repair"
            );
        });
    }
}

/// Merge values gathered by a concatenating crawl.
///
/// Several list-like values are unioned. Otherwise the most frequent value
/// wins, earliest seen on ties. No values yield an empty set.
pub fn resolve_values(values: Vec<StoredValue>) -> StoredValue {
    match values.len() {
        0 => StoredValue::Set(Default::default()),
        1 => values.into_iter().next().unwrap_or(StoredValue::Set(Default::default())),
        _ => {
            let lists: Option<Vec<_>> = values.iter().map(StoredValue::as_elements).collect();
            if let Some(lists) = lists {
                return StoredValue::Set(lists.into_iter().flatten().collect());
            }

            let mut tally: Vec<(&StoredValue, usize)> = Vec::new();
            for value in &values {
                match tally.iter_mut().find(|(seen, _)| *seen == value) {
                    Some((_, count)) => *count += 1,
                    None => tally.push((value, 1)),
                }
            }
            let mut winner = tally[0];
            for entry in &tally[1..] {
                if entry.1 > winner.1 {
                    winner = *entry;
                }
            }
            winner.0.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::key_digest;
    use crate::testing::{TestCa, TestNetwork, TestPeer};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn params(k: usize) -> LookupParams {
        LookupParams {
            k,
            alpha: 3,
            max_rounds: 20,
            timeout: Duration::from_secs(5),
        }
    }

    /// `n` peers, each knowing its ring successors within `fanout`.
    async fn ring(n: usize, fanout: usize, k: usize) -> (TestNetwork, Vec<TestPeer>) {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let peers: Vec<TestPeer> = (0..n).map(|_| TestPeer::spawn(&net, &ca, k)).collect();
        for (i, peer) in peers.iter().enumerate() {
            for step in 1..=fanout {
                let other = &peers[(i + step) % n];
                peer.know(other).await;
                other.know(peer).await;
            }
        }
        (net, peers)
    }

    fn elements(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| json!(s).to_string()).collect()
    }

    #[test]
    fn heap_keeps_nearest_and_tracks_contacts() {
        let target = NodeId::from_bytes([0; 20]);
        let mut heap = NodeHeap::new(target, 2);
        let addr = "127.0.0.1:1".parse().unwrap();
        let near = Contact::new(NodeId::from_bytes([1; 20]), addr);
        let mid = Contact::new(NodeId::from_bytes([2; 20]), addr);
        let far = Contact::new(NodeId::from_bytes([0xF0; 20]), addr);
        heap.push([far.clone(), near.clone(), mid.clone(), near.clone()]);

        assert_eq!(heap.ids(), vec![near.node_id, mid.node_id]);
        assert_eq!(heap.uncontacted(5), vec![near.clone(), mid.clone()]);

        heap.mark_contacted(near.node_id);
        heap.remove(&mid.node_id);
        assert_eq!(heap.ids(), vec![near.node_id, far.node_id]);
        assert_eq!(heap.responders(), vec![near]);
        assert!(!heap.all_contacted());
    }

    #[test]
    fn resolve_unions_lists_and_votes_scalars() {
        let merged = resolve_values(vec![
            StoredValue::set([json!("a"), json!("b")]),
            StoredValue::Scalar(r#"["c"]"#.into()),
        ]);
        assert_eq!(merged, StoredValue::Set(elements(&["a", "b", "c"])));

        let x = StoredValue::scalar(&json!("x"));
        let y = StoredValue::scalar(&json!("y"));
        let voted = resolve_values(vec![x.clone(), y.clone(), y.clone()]);
        assert_eq!(voted, y);

        // tie goes to the first seen
        let tie = resolve_values(vec![x.clone(), StoredValue::set([json!("z")]), y]);
        assert_eq!(tie, x);

        assert_eq!(resolve_values(Vec::new()), StoredValue::Set(BTreeSet::new()));
    }

    #[tokio::test]
    async fn find_nodes_returns_at_most_k_responders() {
        let (_net, peers) = ring(12, 2, 4).await;
        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(4));

        let target = peers[6].contact.node_id;
        let found = lookup.find_nodes(target).await;

        assert!(!found.is_empty());
        assert!(found.len() <= 4);
        assert!(found.iter().all(|c| c.node_id != peers[0].contact.node_id));
        for pair in found.windows(2) {
            assert!(distance_cmp(&pair[0].distance_to(&target), &pair[1].distance_to(&target)).is_lt());
        }
    }

    #[tokio::test]
    async fn lookup_terminates_when_nodes_never_answer() {
        let (net, peers) = ring(10, 3, 5).await;
        for peer in peers.iter().skip(1).step_by(2) {
            net.set_failure(peer.contact.addr, true);
        }
        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(5));

        let found = lookup.find_nodes(NodeId::random()).await;

        assert!(found.len() <= 5);
        let failed: HashSet<_> = peers.iter().skip(1).step_by(2).map(|p| p.contact.node_id).collect();
        assert!(found.iter().all(|c| !failed.contains(&c.node_id)));
        // silent neighbors end up out of the routing table once queried
        let silent = &peers[1];
        assert_eq!(peers[0].rpc.call_ping(&silent.contact, None).await, CallOutcome::NoResponse);
        assert!(peers[0].dht.is_new_node(&silent.contact.node_id).await);
    }

    #[tokio::test]
    async fn lookup_with_empty_table_returns_nothing() {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let lonely = TestPeer::spawn(&net, &ca, 20);
        let lookup = IterativeLookup::new(lonely.rpc.clone(), params(20));

        assert!(lookup.find_nodes(NodeId::random()).await.is_empty());
        assert_eq!(lookup.find_value(key_digest("x")).await, ValueLookup::NoResponders);
        assert_eq!(lookup.find_value_concat(key_digest("x"), None).await.responders, 0);
    }

    #[tokio::test]
    async fn missing_key_is_exhausted_not_unanswered() {
        let (net, peers) = ring(5, 2, 5).await;
        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(5));
        assert_eq!(lookup.find_value(key_digest("absent")).await, ValueLookup::Exhausted);

        for peer in &peers[1..] {
            net.set_failure(peer.contact.addr, true);
        }
        assert_eq!(lookup.find_value(key_digest("absent")).await, ValueLookup::NoResponders);
    }

    #[tokio::test]
    async fn find_value_stops_at_first_value() {
        let (_net, peers) = ring(8, 2, 8).await;
        let key = key_digest("answer");
        let value = StoredValue::scalar(&json!(42));
        for peer in &peers[3..6] {
            peer.dht.set_local(key, Some(value.clone())).await;
        }
        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(8));

        assert_eq!(lookup.find_value(key).await, ValueLookup::Found(Some(value)));
    }

    #[tokio::test]
    async fn concat_merges_sets_and_includes_local_value() {
        let (_net, peers) = ring(6, 5, 6).await;
        let key = key_digest("kalas");
        peers[1].dht.append_local(key, StoredValue::set([json!("apa")])).await.unwrap();
        peers[2].dht.append_local(key, StoredValue::set([json!("bepa")])).await.unwrap();
        peers[3].dht.set_local(key, None).await;

        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(6));
        let local = Some(Some(StoredValue::set([json!("cepa")])));
        let result = lookup.find_value_concat(key, local).await;

        let expected = elements(&["apa", "bepa", "cepa"]);
        assert!(result.value.as_elements().unwrap().is_subset(&expected));
        assert!(result.value.as_elements().unwrap().contains("\"cepa\""));
        assert!(result.sources >= 1);
    }

    #[tokio::test]
    async fn concat_without_values_is_empty_set() {
        let (_net, peers) = ring(4, 3, 4).await;
        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(4));

        let result = lookup.find_value_concat(key_digest("nothing"), None).await;
        assert_eq!(result.value, StoredValue::Set(BTreeSet::new()));
        assert_eq!(result.sources, 0);
        assert_eq!(result.responders, 3);
    }

    /// Every peer trusts every other; edges in `links` become routing entries.
    async fn mesh(n: usize, links: &[(usize, usize)]) -> (TestNetwork, Vec<TestPeer>) {
        let net = TestNetwork::default();
        let ca = TestCa::new();
        let peers: Vec<TestPeer> = (0..n).map(|_| TestPeer::spawn(&net, &ca, n)).collect();
        for a in &peers {
            for b in &peers {
                if a.contact.node_id != b.contact.node_id {
                    a.identity.cache_certificate(b.identity.own_certificate(), &b.contact.node_id);
                }
            }
        }
        for &(from, to) in links {
            peers[from].dht.add_contact(peers[to].contact.clone()).await;
        }
        (net, peers)
    }

    async fn eventually_stored(peer: &TestPeer, key: Key) -> Option<StoredValue> {
        for _ in 0..200 {
            if let Some(Some(value)) = peer.dht.get_local(&key).await {
                return Some(value);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn concat_keeps_crawling_until_one_round_yields_alpha_values() {
        // p0 -> p1, p2, p3; p2 -> p4, p7; p3 -> p5; p7 -> p6
        let (_net, peers) = mesh(8, &[(0, 1), (0, 2), (0, 3), (2, 4), (2, 7), (3, 5), (7, 6)]).await;
        let key = key_digest("spread");
        for (holder, member) in [(1, "a"), (4, "b"), (5, "c"), (6, "z")] {
            peers[holder].dht.append_local(key, StoredValue::set([json!(member)])).await.unwrap();
        }

        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(8));
        let result = lookup.find_value_concat(key, None).await;

        assert_eq!(result.value, StoredValue::Set(elements(&["a", "b", "c", "z"])));
        assert_eq!(result.sources, 4);
    }

    #[tokio::test]
    async fn deleted_answers_do_not_end_the_crawl() {
        // p0 -> p1, p2, p3; p3 -> p4, p5, p6; p6 -> p7
        let (_net, peers) = mesh(8, &[(0, 1), (0, 2), (0, 3), (3, 4), (3, 5), (3, 6), (6, 7)]).await;
        let key = key_digest("tombstones");
        for holder in [1, 2, 4, 5] {
            peers[holder].dht.set_local(key, None).await;
        }
        peers[7].dht.append_local(key, StoredValue::set([json!("kept")])).await.unwrap();

        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(8));
        let result = lookup.find_value_concat(key, None).await;

        assert_eq!(result.value, StoredValue::Set(elements(&["kept"])));
        assert_eq!(result.sources, 1);
    }

    #[tokio::test]
    async fn read_repair_stores_majority_scalar() {
        let (net, peers) = mesh(4, &[(0, 1), (0, 2), (0, 3)]).await;
        let key = key_digest("vote");
        let x = StoredValue::scalar(&json!("x"));
        peers[1].dht.set_local(key, Some(x.clone())).await;
        peers[2].dht.set_local(key, Some(x.clone())).await;

        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(4));
        let result = lookup.find_value_concat(key, None).await;
        assert_eq!(result.value, x);

        assert_eq!(eventually_stored(&peers[3], key).await, Some(x));
        assert!(net.calls_to(peers[3].contact.addr).contains(&"store"));
        assert!(!net.calls_to(peers[3].contact.addr).contains(&"append"));
    }

    #[tokio::test]
    async fn read_repair_appends_set_union() {
        let (net, peers) = mesh(4, &[(0, 1), (0, 2), (0, 3)]).await;
        let key = key_digest("union");
        peers[1].dht.append_local(key, StoredValue::set([json!("a")])).await.unwrap();
        peers[2].dht.append_local(key, StoredValue::set([json!("b")])).await.unwrap();

        let lookup = IterativeLookup::new(peers[0].rpc.clone(), params(4));
        let result = lookup.find_value_concat(key, None).await;
        assert_eq!(result.value, StoredValue::Set(elements(&["a", "b"])));

        let repaired = eventually_stored(&peers[3], key).await.unwrap();
        assert_eq!(repaired.as_elements(), Some(elements(&["a", "b"])));
        assert!(net.calls_to(peers[3].contact.addr).contains(&"append"));
    }
}
