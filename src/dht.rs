//! # Routing Table and Local Storage
//!
//! This module holds the node-local state of the DHT:
//!
//! - **Keys**: 160-bit BLAKE3 digests of user keys
//! - **Routing Table**: 160 k-buckets indexed by XOR distance prefix
//! - **Local Store**: TTL-bounded key/value storage with set-mode bookkeeping
//!
//! ## Actor Architecture
//!
//! - `DhtNode`: Cheap-to-clone handle used by the RPC layer, lookups and the façade
//! - `DhtNodeActor`: Owns the routing table and the local store
//! - Commands are processed sequentially, so bucket mutation and merges never race
//!
//! ## Stored Values
//!
//! A value is either a scalar (one canonical JSON document) or a set of
//! canonical JSON elements. `None` is a stored tombstone written by `delete`
//! and is distinct from a key that was never stored.
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | `set` | overwrite, set-mode marking unchanged |
//! | `merge_append` | union with the existing elements, marks set-mode |
//! | `merge_remove` | difference with the existing elements, marks set-mode |

use std::collections::{BTreeSet, BinaryHeap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::{distance_cmp, Contact, NodeId, NODE_ID_LEN};

/// Key type for DHT storage (160-bit digest).
pub type Key = [u8; NODE_ID_LEN];

/// Hash a user key into the DHT keyspace.
pub fn key_digest(key: &str) -> Key {
    let digest = blake3::hash(key.as_bytes());
    let mut out = [0u8; NODE_ID_LEN];
    out.copy_from_slice(&digest.as_bytes()[..NODE_ID_LEN]);
    out
}

/// Key under which a node publishes its own certificate.
pub fn cert_key(node_id: &NodeId) -> Key {
    key_digest(&format!("{}cert", node_id.to_hex()))
}

// ============================================================================
// Stored Values
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    /// One canonical JSON document.
    Scalar(String),
    /// Canonical JSON elements, kept sorted.
    Set(BTreeSet<String>),
}

impl StoredValue {
    pub fn scalar(value: &Value) -> Self {
        StoredValue::Scalar(value.to_string())
    }

    pub fn set<I: IntoIterator<Item = Value>>(elements: I) -> Self {
        StoredValue::Set(elements.into_iter().map(|v| v.to_string()).collect())
    }

    /// Elements of a list-like value. `None` for non-list scalars.
    pub fn as_elements(&self) -> Option<BTreeSet<String>> {
        match self {
            StoredValue::Set(elements) => Some(elements.clone()),
            StoredValue::Scalar(json) => match serde_json::from_str::<Value>(json) {
                Ok(Value::Array(items)) => Some(items.iter().map(Value::to_string).collect()),
                _ => None,
            },
        }
    }

    pub fn is_list_like(&self) -> bool {
        self.as_elements().is_some()
    }

    pub fn to_json(&self) -> Value {
        match self {
            StoredValue::Scalar(json) => parse_or_string(json),
            StoredValue::Set(elements) => {
                Value::Array(elements.iter().map(|e| parse_or_string(e)).collect())
            }
        }
    }
}

fn parse_or_string(json: &str) -> Value {
    serde_json::from_str(json).unwrap_or_else(|_| Value::String(json.to_string()))
}

/// The incoming value of an append/remove is not a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendDecodeError;

impl std::fmt::Display for AppendDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "append/remove value is not a list")
    }
}

impl std::error::Error for AppendDecodeError {}

// ============================================================================
// Routing Table (XOR-Metric)
// ============================================================================
//
// Bucket i holds contacts whose distance from us has i leading zero bits.
// Bucket 0 covers half the keyspace, bucket 159 the single closest slot.
//
// A full bucket does not evict immediately: the caller receives a
// PendingBucketUpdate, pings the least-recently-seen contact and reports the
// outcome through apply_ping_result.

const BUCKET_COUNT: usize = NODE_ID_LEN * 8;

#[derive(Debug, Clone)]
struct RoutingBucket {
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full {
        new_contact: Box<Contact>,
        oldest: Box<Contact>,
    },
}

/// A full bucket waiting on a liveness probe of its oldest contact.
#[derive(Clone, Debug)]
pub struct PendingBucketUpdate {
    bucket_index: usize,
    pub(crate) oldest: Contact,
    pub(crate) new_contact: Contact,
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

    fn touch(&mut self, contact: Contact, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.node_id == contact.node_id) {
            // Latest address wins; the contact moves to the tail.
            self.contacts.remove(pos);
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            self.mark_refreshed();
            return BucketTouchOutcome::Inserted;
        }

        match self.contacts.first().cloned() {
            Some(oldest) => BucketTouchOutcome::Full {
                new_contact: Box::new(contact),
                oldest: Box::new(oldest),
            },
            // k == 0: nothing can be stored
            None => BucketTouchOutcome::Refreshed,
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.node_id == id) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.node_id == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }
}

fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

/// Random id that falls into `bucket_idx` relative to `self_id`.
pub(crate) fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let bucket_idx = bucket_idx.min(BUCKET_COUNT - 1);
    let self_bytes = self_id.as_bytes();

    let mut distance = [0u8; NODE_ID_LEN];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_bytes[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; NODE_ID_LEN];
    for i in 0..NODE_ID_LEN {
        target[i] = self_bytes[i] ^ distance[i];
    }
    NodeId::from_bytes(target)
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let buckets = (0..BUCKET_COUNT).map(|_| RoutingBucket::new()).collect();
        Self { self_id, k, buckets }
    }

    /// Insert or refresh a contact.
    ///
    /// Returns a pending update when the target bucket is full; the new
    /// contact is only admitted if the oldest one fails its ping.
    pub fn add_contact(&mut self, contact: Contact) -> Option<PendingBucketUpdate> {
        if contact.node_id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, &contact.node_id);
        match self.buckets[idx].touch(contact, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full { new_contact, oldest } => Some(PendingBucketUpdate {
                bucket_index: idx,
                oldest: *oldest,
                new_contact: *new_contact,
            }),
        }
    }

    pub fn remove_contact(&mut self, id: &NodeId) -> bool {
        if *id == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].remove(id)
    }

    pub fn is_new_node(&self, id: &NodeId) -> bool {
        *id != self.self_id && self.lookup_contact(id).is_none()
    }

    /// Up to `k` contacts ordered by XOR distance to `target`, ascending.
    pub fn find_neighbors(&self, target: &NodeId, exclude: Option<&NodeId>, k: usize) -> Vec<Contact> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistContact {
            dist: [u8; NODE_ID_LEN],
            contact: Contact,
        }

        impl Ord for DistContact {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistContact {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistContact> = BinaryHeap::with_capacity(k + 1);

        for bucket in &self.buckets {
            for contact in &bucket.contacts {
                if exclude == Some(&contact.node_id) {
                    continue;
                }
                let dist = contact.distance_to(target);
                if heap.len() < k {
                    heap.push(DistContact { dist, contact: contact.clone() });
                } else if let Some(max_entry) = heap.peek()
                    && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
                {
                    heap.push(DistContact { dist, contact: contact.clone() });
                    heap.pop();
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|dc| dc.contact).collect()
    }

    pub fn all_node_ids(&self) -> HashSet<NodeId> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().map(|c| c.node_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.node_id);
            return;
        }

        bucket.remove(&pending.oldest.node_id);
        let already_present = bucket
            .contacts
            .iter()
            .any(|contact| contact.node_id == pending.new_contact.node_id);
        if !already_present && bucket.contacts.len() < self.k {
            bucket.contacts.push(pending.new_contact);
            bucket.mark_refreshed();
        }
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.contacts.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }

    fn lookup_contact(&self, id: &NodeId) -> Option<Contact> {
        if *id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| c.node_id == *id)
            .cloned()
    }
}

// ============================================================================
// Local Storage
// ============================================================================

/// Default time-to-live for stored entries (one week).
pub const DEFAULT_VALUE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How often expired entries are swept on access.
const EXPIRATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Hard cap on stored entries; least recently used entries go first.
const LOCAL_STORE_MAX_ENTRIES: usize = 100_000;

#[derive(Clone, Debug)]
struct StoredEntry {
    value: Option<StoredValue>,
    stored_at: Instant,
    expires_at: Instant,
}

pub struct LocalStore {
    cache: LruCache<Key, StoredEntry>,
    set_keys: HashSet<Key>,
    ttl: Duration,
    last_expiration_check: Instant,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_VALUE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(LOCAL_STORE_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            set_keys: HashSet::new(),
            ttl,
            last_expiration_check: Instant::now(),
        }
    }

    /// Outer `None`: never stored (or expired). `Some(None)`: deleted.
    pub fn get(&mut self, key: &Key) -> Option<Option<StoredValue>> {
        self.maybe_expire_entries();
        let now = Instant::now();
        if let Some(entry) = self.cache.get(key)
            && now < entry.expires_at
        {
            return Some(entry.value.clone());
        }
        if self.cache.pop(key).is_some() {
            self.set_keys.remove(key);
        }
        None
    }

    pub fn set(&mut self, key: Key, value: Option<StoredValue>) {
        self.maybe_expire_entries();
        let now = Instant::now();
        if let Some((evicted, _)) = self.cache.push(
            key,
            StoredEntry {
                value,
                stored_at: now,
                expires_at: now + self.ttl,
            },
        ) && evicted != key
        {
            self.set_keys.remove(&evicted);
        }
    }

    pub fn mark_set_mode(&mut self, key: Key) {
        self.set_keys.insert(key);
    }

    pub fn is_set_mode(&self, key: &Key) -> bool {
        self.set_keys.contains(key)
    }

    pub fn merge_append(&mut self, key: Key, incoming: StoredValue) -> Result<(), AppendDecodeError> {
        let incoming = incoming.as_elements().ok_or(AppendDecodeError)?;
        let merged = match self.get(&key) {
            Some(Some(existing)) => {
                let mut elements = existing_elements(&existing);
                elements.extend(incoming);
                elements
            }
            _ => incoming,
        };
        self.set(key, Some(StoredValue::Set(merged)));
        self.mark_set_mode(key);
        Ok(())
    }

    pub fn merge_remove(&mut self, key: Key, incoming: StoredValue) -> Result<(), AppendDecodeError> {
        let incoming = incoming.as_elements().ok_or(AppendDecodeError)?;
        let remaining = match self.get(&key) {
            Some(Some(existing)) => match existing.as_elements() {
                Some(elements) => elements.difference(&incoming).cloned().collect(),
                None => BTreeSet::new(),
            },
            _ => BTreeSet::new(),
        };
        self.set(key, Some(StoredValue::Set(remaining)));
        self.mark_set_mode(key);
        Ok(())
    }

    /// Copy of all live entries at call time.
    pub fn snapshot(&mut self) -> Vec<(Key, Option<StoredValue>)> {
        self.expire_entries();
        self.cache
            .iter()
            .map(|(key, entry)| (*key, entry.value.clone()))
            .collect()
    }

    /// Live entries last written more than `age` ago.
    pub fn entries_older_than(&mut self, age: Duration) -> Vec<(Key, Option<StoredValue>)> {
        self.expire_entries();
        let now = Instant::now();
        self.cache
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.stored_at) >= age)
            .map(|(key, entry)| (*key, entry.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    fn maybe_expire_entries(&mut self) {
        if self.last_expiration_check.elapsed() < EXPIRATION_CHECK_INTERVAL {
            return;
        }
        self.expire_entries();
    }

    fn expire_entries(&mut self) {
        let now = Instant::now();
        self.last_expiration_check = now;

        let expired_keys: Vec<Key> = self
            .cache
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| *key)
            .collect();

        if expired_keys.is_empty() {
            return;
        }
        let expired_count = expired_keys.len();
        for key in expired_keys {
            self.cache.pop(&key);
            self.set_keys.remove(&key);
        }
        debug!(expired_count, remaining = self.len(), "removed expired entries");
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A non-list scalar counts as a single element.
fn existing_elements(existing: &StoredValue) -> BTreeSet<String> {
    match existing.as_elements() {
        Some(elements) => elements,
        None => match existing {
            StoredValue::Scalar(json) => BTreeSet::from([json.clone()]),
            StoredValue::Set(elements) => elements.clone(),
        },
    }
}

// ============================================================================
// Actor
// ============================================================================

/// Result of offering a contact to the routing table.
#[derive(Debug)]
pub struct ContactAdded {
    pub is_new: bool,
    pub pending: Option<PendingBucketUpdate>,
}

#[derive(Clone)]
pub struct DhtNode {
    cmd_tx: mpsc::Sender<Command>,
    id: NodeId,
}

struct DhtNodeActor {
    routing: RoutingTable,
    store: LocalStore,
    cmd_rx: mpsc::Receiver<Command>,
}

enum Command {
    // Routing
    AddContact(Contact, oneshot::Sender<ContactAdded>),
    RemoveContact(NodeId),
    IsNewNode(NodeId, oneshot::Sender<bool>),
    FindNeighbors(NodeId, Option<NodeId>, usize, oneshot::Sender<Vec<Contact>>),
    AllNodeIds(oneshot::Sender<HashSet<NodeId>>),
    LookupContact(NodeId, oneshot::Sender<Option<Contact>>),

    // Storage
    GetLocal(Key, oneshot::Sender<Option<Option<StoredValue>>>),
    SetLocal(Key, Option<StoredValue>, oneshot::Sender<()>),
    AppendLocal(Key, StoredValue, oneshot::Sender<Result<(), AppendDecodeError>>),
    RemoveLocal(Key, StoredValue, oneshot::Sender<Result<(), AppendDecodeError>>),
    IsSetMode(Key, oneshot::Sender<bool>),
    MarkSetMode(Key),
    Snapshot(oneshot::Sender<Vec<(Key, Option<StoredValue>)>>),
    EntriesOlderThan(Duration, oneshot::Sender<Vec<(Key, Option<StoredValue>)>>),

    // Maintenance
    GetStaleBuckets(Duration, oneshot::Sender<Vec<usize>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingBucketUpdate, bool),

    Quit,
}

impl DhtNode {
    pub fn new(id: NodeId, k: usize, value_ttl: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let actor = DhtNodeActor {
            routing: RoutingTable::new(id, k),
            store: LocalStore::with_ttl(value_ttl),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx, id }
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(make(tx)).await.is_err() {
            return None;
        }
        rx.await.ok()
    }

    pub async fn add_contact(&self, contact: Contact) -> ContactAdded {
        self.request(|tx| Command::AddContact(contact, tx))
            .await
            .unwrap_or(ContactAdded { is_new: false, pending: None })
    }

    pub async fn remove_contact(&self, id: &NodeId) {
        let _ = self.cmd_tx.send(Command::RemoveContact(*id)).await;
    }

    pub async fn is_new_node(&self, id: &NodeId) -> bool {
        self.request(|tx| Command::IsNewNode(*id, tx)).await.unwrap_or(false)
    }

    pub async fn find_neighbors(&self, target: &NodeId, exclude: Option<&NodeId>, k: usize) -> Vec<Contact> {
        self.request(|tx| Command::FindNeighbors(*target, exclude.copied(), k, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn all_node_ids(&self) -> HashSet<NodeId> {
        self.request(Command::AllNodeIds).await.unwrap_or_default()
    }

    pub async fn lookup_contact(&self, id: &NodeId) -> Option<Contact> {
        self.request(|tx| Command::LookupContact(*id, tx)).await.flatten()
    }

    pub async fn get_local(&self, key: &Key) -> Option<Option<StoredValue>> {
        self.request(|tx| Command::GetLocal(*key, tx)).await.flatten()
    }

    pub async fn set_local(&self, key: Key, value: Option<StoredValue>) {
        let _ = self.request(|tx| Command::SetLocal(key, value, tx)).await;
    }

    pub async fn append_local(&self, key: Key, value: StoredValue) -> Result<(), AppendDecodeError> {
        self.request(|tx| Command::AppendLocal(key, value, tx))
            .await
            .unwrap_or(Err(AppendDecodeError))
    }

    pub async fn remove_local(&self, key: Key, value: StoredValue) -> Result<(), AppendDecodeError> {
        self.request(|tx| Command::RemoveLocal(key, value, tx))
            .await
            .unwrap_or(Err(AppendDecodeError))
    }

    pub async fn is_set_mode(&self, key: &Key) -> bool {
        self.request(|tx| Command::IsSetMode(*key, tx)).await.unwrap_or(false)
    }

    pub async fn mark_set_mode(&self, key: Key) {
        let _ = self.cmd_tx.send(Command::MarkSetMode(key)).await;
    }

    pub async fn snapshot(&self) -> Vec<(Key, Option<StoredValue>)> {
        self.request(Command::Snapshot).await.unwrap_or_default()
    }

    pub async fn entries_older_than(&self, age: Duration) -> Vec<(Key, Option<StoredValue>)> {
        self.request(|tx| Command::EntriesOlderThan(age, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.request(|tx| Command::GetStaleBuckets(threshold, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn mark_bucket_refreshed(&self, bucket_idx: usize) {
        let _ = self.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
    }

    pub async fn apply_ping_result(&self, pending: PendingBucketUpdate, alive: bool) {
        let _ = self.cmd_tx.send(Command::ApplyPingResult(pending, alive)).await;
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl DhtNodeActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::AddContact(contact, reply) => {
                    let is_new = self.routing.is_new_node(&contact.node_id);
                    let pending = self.routing.add_contact(contact);
                    let _ = reply.send(ContactAdded { is_new, pending });
                }
                Command::RemoveContact(id) => {
                    if self.routing.remove_contact(&id) {
                        trace!(peer = %id.short(), "removed contact");
                    }
                }
                Command::IsNewNode(id, reply) => {
                    let _ = reply.send(self.routing.is_new_node(&id));
                }
                Command::FindNeighbors(target, exclude, k, reply) => {
                    let _ = reply.send(self.routing.find_neighbors(&target, exclude.as_ref(), k));
                }
                Command::AllNodeIds(reply) => {
                    let _ = reply.send(self.routing.all_node_ids());
                }
                Command::LookupContact(id, reply) => {
                    let _ = reply.send(self.routing.lookup_contact(&id));
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.store.get(&key));
                }
                Command::SetLocal(key, value, reply) => {
                    self.store.set(key, value);
                    let _ = reply.send(());
                }
                Command::AppendLocal(key, value, reply) => {
                    let _ = reply.send(self.store.merge_append(key, value));
                }
                Command::RemoveLocal(key, value, reply) => {
                    let _ = reply.send(self.store.merge_remove(key, value));
                }
                Command::IsSetMode(key, reply) => {
                    let _ = reply.send(self.store.is_set_mode(&key));
                }
                Command::MarkSetMode(key) => {
                    self.store.mark_set_mode(key);
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.store.snapshot());
                }
                Command::EntriesOlderThan(age, reply) => {
                    let _ = reply.send(self.store.entries_older_than(age));
                }
                Command::GetStaleBuckets(threshold, reply) => {
                    let _ = reply.send(self.routing.stale_bucket_indices(threshold));
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.routing.mark_bucket_refreshed(idx);
                }
                Command::ApplyPingResult(pending, alive) => {
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::Quit => {
                    break;
                }
            }
        }
    }
}
