//! # Secure RPC Layer
//!
//! One authenticated round-trip per RPC, on both sides of the wire.
//!
//! ## Caller side
//!
//! ```text
//! BUILD_PAYLOAD -> SIGN -> SEND -> { NO RESPONSE | RESPONSE -> VERIFY }
//! ```
//!
//! Each call draws a fresh challenge. The request is signed over
//! `payload_for(callee, challenge, <kind>_request, key)` and the response is
//! accepted only if it verifies over the matching `signed_*_response`
//! payload for the same challenge. Transport failures evict the callee from
//! the routing table and yield [`CallOutcome::NoResponse`].
//!
//! A verified NACK means the callee does not know our certificate yet: we
//! push it with a ping and retry the original request once.
//!
//! ## Callee side
//!
//! | Verification | Action |
//! |--------------|--------|
//! | unknown signer | answer with a signed NACK, apply nothing |
//! | invalid | drop without answering |
//! | valid | add the sender as a contact, then serve the RPC |
//!
//! ## Key transfer
//!
//! When a peer's certificate is cached for the first time, locally stored
//! keys that the newcomer is now responsible for are pushed to it.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::challenge::{new_challenge, payload_for, RpcKind, SignedValue};
use crate::crypto::node_id_from_cert;
use crate::dht::{cert_key, DhtNode, Key, StoredValue};
use crate::identity::{distance_cmp, Contact, IdentityStore, NodeId, Verification};
use crate::messages::{DhtNodeRequest, DhtNodeResponse, RequestHeader, MAX_VALUE_SIZE};
use crate::protocols::{DhtNodeRpc, DhtRequestHandler};

/// Result of one secure call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    Success(T),
    /// The callee still does not know our certificate after a retry.
    Nack,
    /// The response failed verification or had the wrong shape.
    Rejected,
    /// Transport failure or timeout; the callee was evicted.
    NoResponse,
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }

    pub fn into_success(self) -> Option<T> {
        match self {
            CallOutcome::Success(value) => Some(value),
            _ => None,
        }
    }

    /// `(success, payload)` view of the outcome.
    pub fn into_parts(self) -> (bool, Option<T>) {
        match self {
            CallOutcome::Success(value) => (true, Some(value)),
            _ => (false, None),
        }
    }
}

/// Answer to FIND_VALUE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindValueReply {
    /// The callee holds the key; `None` is a stored deletion.
    Value(Option<StoredValue>),
    /// The callee does not hold the key; screened closer contacts.
    Nodes(Vec<Contact>),
}

enum Failure {
    Nack,
    Rejected,
    NoResponse,
}

impl Failure {
    fn into_outcome<T>(self) -> CallOutcome<T> {
        match self {
            Failure::Nack => CallOutcome::Nack,
            Failure::Rejected => CallOutcome::Rejected,
            Failure::NoResponse => CallOutcome::NoResponse,
        }
    }
}

struct Sent {
    challenge: String,
    response: DhtNodeResponse,
}

pub struct SecureRpc<N: DhtNodeRpc> {
    identity: Arc<IdentityStore>,
    dht: DhtNode,
    network: Arc<N>,
    self_contact: Contact,
    k: usize,
}

impl<N: DhtNodeRpc> Clone for SecureRpc<N> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            dht: self.dht.clone(),
            network: self.network.clone(),
            self_contact: self.self_contact.clone(),
            k: self.k,
        }
    }
}

impl<N: DhtNodeRpc> SecureRpc<N> {
    pub fn new(
        identity: Arc<IdentityStore>,
        dht: DhtNode,
        network: Arc<N>,
        self_contact: Contact,
        k: usize,
    ) -> Self {
        Self {
            identity,
            dht,
            network,
            self_contact,
            k,
        }
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn dht(&self) -> &DhtNode {
        &self.dht
    }

    pub fn self_contact(&self) -> &Contact {
        &self.self_contact
    }

    pub fn node_id(&self) -> NodeId {
        self.self_contact.node_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    // ------------------------------------------------------------------
    // Caller side
    // ------------------------------------------------------------------

    pub async fn call_ping(&self, contact: &Contact, own_cert: Option<Vec<u8>>) -> CallOutcome<NodeId> {
        let sent = match self
            .exchange(contact, RpcKind::PingRequest, None, |header| DhtNodeRequest::Ping {
                header,
                cert: own_cert.clone(),
            })
            .await
        {
            Ok(sent) => sent,
            Err(failure) => return failure.into_outcome(),
        };

        match &sent.response {
            DhtNodeResponse::Pong { id, signature }
                if *id == contact.node_id
                    && self.verify_response(contact, &sent.challenge, RpcKind::PingResponse, None, signature, None) =>
            {
                self.welcome(contact).await;
                CallOutcome::Success(*id)
            }
            other => self.reject(contact, "ping", other),
        }
    }

    pub async fn call_store(&self, contact: &Contact, key: Key, value: Option<StoredValue>) -> CallOutcome<()> {
        self.write_call(contact, RpcKind::StoreRequest, key, move |header| DhtNodeRequest::Store {
            header,
            key,
            value: value.clone(),
        })
        .await
    }

    pub async fn call_append(&self, contact: &Contact, key: Key, value: StoredValue) -> CallOutcome<()> {
        self.write_call(contact, RpcKind::AppendRequest, key, move |header| DhtNodeRequest::Append {
            header,
            key,
            value: value.clone(),
        })
        .await
    }

    pub async fn call_remove(&self, contact: &Contact, key: Key, value: StoredValue) -> CallOutcome<()> {
        self.write_call(contact, RpcKind::RemoveRequest, key, move |header| DhtNodeRequest::Remove {
            header,
            key,
            value: value.clone(),
        })
        .await
    }

    async fn write_call<F>(&self, contact: &Contact, kind: RpcKind, key: Key, build: F) -> CallOutcome<()>
    where
        F: Fn(RequestHeader) -> DhtNodeRequest + Send + Sync,
    {
        let sent = match self.exchange(contact, kind, Some(&key), build).await {
            Ok(sent) => sent,
            Err(failure) => return failure.into_outcome(),
        };
        match &sent.response {
            DhtNodeResponse::Stored { signature }
                if self.verify_response(contact, &sent.challenge, RpcKind::StoreResponse, None, signature, None) =>
            {
                self.welcome(contact).await;
                CallOutcome::Success(())
            }
            other => self.reject(contact, kind.as_str(), other),
        }
    }

    /// FIND_NODE, signed as a `find_value_request` over the target id.
    pub async fn call_find_node(&self, contact: &Contact, target: NodeId) -> CallOutcome<Vec<Contact>> {
        let key: Key = *target.as_bytes();
        let sent = match self
            .exchange(contact, RpcKind::FindValueRequest, Some(&key), |header| {
                DhtNodeRequest::FindNode { header, target }
            })
            .await
        {
            Ok(sent) => sent,
            Err(failure) => return failure.into_outcome(),
        };

        match sent.response {
            DhtNodeResponse::Bucket { bucket, signature }
                if self.verify_response(
                    contact,
                    &sent.challenge,
                    RpcKind::BucketResponse,
                    Some(SignedValue::Bucket(&bucket)),
                    &signature,
                    None,
                ) =>
            {
                self.welcome(contact).await;
                CallOutcome::Success(self.screen_bucket(bucket).await)
            }
            other => self.reject(contact, "find_node", &other),
        }
    }

    pub async fn call_find_value(&self, contact: &Contact, key: Key) -> CallOutcome<FindValueReply> {
        let sent = match self
            .exchange(contact, RpcKind::FindValueRequest, Some(&key), |header| {
                DhtNodeRequest::FindValue { header, key }
            })
            .await
        {
            Ok(sent) => sent,
            Err(failure) => return failure.into_outcome(),
        };

        match sent.response {
            DhtNodeResponse::Value { value, signature }
                if self.verify_response(
                    contact,
                    &sent.challenge,
                    RpcKind::ValueResponse,
                    Some(SignedValue::Stored(value.as_ref())),
                    &signature,
                    None,
                ) =>
            {
                self.welcome(contact).await;
                CallOutcome::Success(FindValueReply::Value(value))
            }
            DhtNodeResponse::Bucket { bucket, signature }
                if self.verify_response(
                    contact,
                    &sent.challenge,
                    RpcKind::BucketResponse,
                    Some(SignedValue::Bucket(&bucket)),
                    &signature,
                    None,
                ) =>
            {
                self.welcome(contact).await;
                CallOutcome::Success(FindValueReply::Nodes(self.screen_bucket(bucket).await))
            }
            other => self.reject(contact, "find_value", &other),
        }
    }

    /// Fetch, verify and cache `contact`'s certificate.
    pub async fn call_find_cert(&self, contact: &Contact) -> CallOutcome<Vec<u8>> {
        let key = cert_key(&contact.node_id);
        let own_cert = self.identity.own_certificate().to_vec();
        let sent = match self
            .exchange(contact, RpcKind::FindCertRequest, Some(&key), |header| {
                DhtNodeRequest::FindCert {
                    header,
                    key,
                    cert: Some(own_cert.clone()),
                }
            })
            .await
        {
            Ok(sent) => sent,
            Err(failure) => return failure.into_outcome(),
        };

        let (cert, signature) = match sent.response {
            DhtNodeResponse::Certificate { cert, signature } => (cert, signature),
            other => return self.reject(contact, "find_cert", &other),
        };
        if node_id_from_cert(&cert) != Some(contact.node_id) {
            warn!(peer = %contact.node_id.short(), "certificate does not name the contacted node");
            return CallOutcome::Rejected;
        }
        if !self.verify_response(
            contact,
            &sent.challenge,
            RpcKind::CertResponse,
            Some(SignedValue::Certificate(&cert)),
            &signature,
            Some(&cert),
        ) {
            return CallOutcome::Rejected;
        }

        let newly_cached = self.identity.cache_certificate(&cert, &contact.node_id);
        self.welcome(contact).await;
        if newly_cached {
            self.spawn_transfer(contact.clone());
        }
        CallOutcome::Success(cert)
    }

    /// Sign, send, and handle one NACK round.
    async fn exchange<F>(
        &self,
        to: &Contact,
        kind: RpcKind,
        key: Option<&Key>,
        build: F,
    ) -> Result<Sent, Failure>
    where
        F: Fn(RequestHeader) -> DhtNodeRequest + Send + Sync,
    {
        let sent = self.send_once(to, kind, key, &build).await?;
        if !matches!(sent.response, DhtNodeResponse::Nack { .. }) {
            return Ok(sent);
        }
        if !self.verify_response(to, &sent.challenge, RpcKind::NackResponse, None, sent.response.signature(), None) {
            debug!(peer = %to.node_id.short(), "ignoring unverifiable NACK");
            return Err(Failure::Rejected);
        }

        debug!(peer = %to.node_id.short(), rpc = kind.as_str(), "peer lacks our certificate, sending it");
        self.welcome(to).await;
        if !self.push_own_certificate(to).await {
            return Err(Failure::Nack);
        }

        let retry = self.send_once(to, kind, key, &build).await?;
        if matches!(retry.response, DhtNodeResponse::Nack { .. }) {
            return Err(Failure::Nack);
        }
        Ok(retry)
    }

    async fn send_once<F>(&self, to: &Contact, kind: RpcKind, key: Option<&Key>, build: &F) -> Result<Sent, Failure>
    where
        F: Fn(RequestHeader) -> DhtNodeRequest + Send + Sync,
    {
        let challenge = new_challenge();
        let payload = match payload_for(&to.node_id, &challenge, kind, key, None) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(rpc = kind.as_str(), error = %e, "cannot build request payload");
                return Err(Failure::Rejected);
            }
        };
        let signature = match self.identity.sign(&payload) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(rpc = kind.as_str(), error = %e, "cannot sign request");
                return Err(Failure::Rejected);
            }
        };
        let header = RequestHeader {
            sender: self.self_contact.clone(),
            challenge: challenge.clone(),
            signature,
        };

        match self.network.call(to, build(header)).await {
            Ok(response) => Ok(Sent { challenge, response }),
            Err(e) => {
                debug!(peer = %to.node_id.short(), addr = %to.addr, error = %e, "no response, evicting contact");
                self.dht.remove_contact(&to.node_id).await;
                Err(Failure::NoResponse)
            }
        }
    }

    /// Signed ping carrying our certificate.
    async fn push_own_certificate(&self, to: &Contact) -> bool {
        let cert = self.identity.own_certificate().to_vec();
        self.probe(to, Some(cert)).await
    }

    /// Ping without NACK handling or welcoming.
    async fn probe(&self, to: &Contact, cert: Option<Vec<u8>>) -> bool {
        let build = |header| DhtNodeRequest::Ping { header, cert: cert.clone() };
        match self.send_once(to, RpcKind::PingRequest, None, &build).await {
            Ok(Sent {
                challenge,
                response: DhtNodeResponse::Pong { id, signature },
            }) => {
                id == to.node_id
                    && self.verify_response(to, &challenge, RpcKind::PingResponse, None, &signature, None)
            }
            _ => false,
        }
    }

    fn verify_response(
        &self,
        from: &Contact,
        challenge: &str,
        kind: RpcKind,
        value: Option<SignedValue<'_>>,
        signature: &[u8],
        cert_override: Option<&[u8]>,
    ) -> bool {
        let payload = match payload_for(&self.node_id(), challenge, kind, None, value) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(peer = %from.node_id.short(), error = %e, "cannot rebuild response payload");
                return false;
            }
        };
        match self.identity.check(&from.node_id, &payload, signature, cert_override) {
            Verification::Valid => true,
            Verification::UnknownSigner => {
                debug!(peer = %from.node_id.short(), rpc = kind.as_str(), "response from peer with unknown certificate");
                false
            }
            Verification::Invalid => {
                warn!(peer = %from.node_id.short(), rpc = kind.as_str(), "response signature rejected");
                false
            }
        }
    }

    fn reject<T>(&self, contact: &Contact, rpc: &str, response: &DhtNodeResponse) -> CallOutcome<T> {
        debug!(
            peer = %contact.node_id.short(),
            rpc,
            response = ?std::mem::discriminant(response),
            "rejecting response"
        );
        CallOutcome::Rejected
    }

    /// Drop ourselves and fetch certificates for unknown contacts.
    ///
    /// Contacts whose certificate cannot be obtained are left out.
    async fn screen_bucket(&self, mut bucket: Vec<Contact>) -> Vec<Contact> {
        bucket.truncate(self.k);
        let mut screened = Vec::with_capacity(bucket.len());
        let mut fetches = JoinSet::new();

        for contact in bucket {
            if contact.node_id == self.node_id() {
                continue;
            }
            if self.identity.has_certificate(&contact.node_id) {
                screened.push(contact);
            } else {
                let rpc = self.clone();
                fetches.spawn(async move {
                    let ok = rpc.call_find_cert(&contact).await.is_success();
                    (contact, ok)
                });
            }
        }

        while let Some(joined) = fetches.join_next().await {
            if let Ok((contact, true)) = joined {
                screened.push(contact);
            }
        }
        screened
    }

    /// Add a verified peer to the routing table, probing a full bucket's oldest entry.
    async fn welcome(&self, contact: &Contact) {
        if contact.node_id == self.node_id() {
            return;
        }
        let added = self.dht.add_contact(contact.clone()).await;
        if added.is_new {
            trace!(peer = %contact.node_id.short(), addr = %contact.addr, "new contact");
        }
        if let Some(pending) = added.pending {
            let rpc = self.clone();
            tokio::spawn(async move {
                let alive = rpc.probe(&pending.oldest, None).await;
                rpc.dht.apply_ping_result(pending, alive).await;
            });
        }
    }

    fn spawn_transfer(&self, contact: Contact) {
        let rpc = self.clone();
        tokio::spawn(async move {
            rpc.transfer_key_values(&contact).await;
        });
    }

    /// Push locally stored keys the newcomer should now hold.
    ///
    /// A key goes to `newcomer` if no other neighbors are known for it, or
    /// if `newcomer` is closer than the furthest known neighbor while this
    /// node is closer than the nearest one.
    pub async fn transfer_key_values(&self, newcomer: &Contact) {
        let entries = self.dht.snapshot().await;
        let mut sent = 0usize;

        for (key, value) in entries {
            let target = NodeId::from_bytes(key);
            let neighbors = self
                .dht
                .find_neighbors(&target, Some(&newcomer.node_id), self.k)
                .await;

            let qualifies = match (neighbors.first(), neighbors.last()) {
                (Some(nearest), Some(furthest)) => {
                    let new_dist = newcomer.distance_to(&target);
                    let own_dist = self.node_id().xor_distance(&target);
                    distance_cmp(&new_dist, &furthest.distance_to(&target)).is_lt()
                        && distance_cmp(&own_dist, &nearest.distance_to(&target)).is_lt()
                }
                _ => true,
            };
            if !qualifies {
                continue;
            }

            let set_mode = self.dht.is_set_mode(&key).await;
            let outcome = match value {
                Some(value) if set_mode && value.is_list_like() => {
                    self.call_append(newcomer, key, value).await
                }
                other => self.call_store(newcomer, key, other).await,
            };
            if outcome.is_success() {
                sent += 1;
            }
        }

        if sent > 0 {
            debug!(peer = %newcomer.node_id.short(), keys = sent, "transferred keys to new node");
        }
    }

    // ------------------------------------------------------------------
    // Callee side
    // ------------------------------------------------------------------

    fn sign_response(
        &self,
        recipient: &NodeId,
        challenge: &str,
        kind: RpcKind,
        value: Option<SignedValue<'_>>,
    ) -> Option<Vec<u8>> {
        let payload = payload_for(recipient, challenge, kind, None, value)
            .map_err(|e| warn!(rpc = kind.as_str(), error = %e, "cannot build response payload"))
            .ok()?;
        self.identity
            .sign(&payload)
            .map_err(|e| warn!(rpc = kind.as_str(), error = %e, "cannot sign response"))
            .ok()
    }

    async fn bucket_response(&self, recipient: &NodeId, challenge: &str, target: &NodeId) -> Option<DhtNodeResponse> {
        let bucket = self.dht.find_neighbors(target, Some(recipient), self.k).await;
        let signature =
            self.sign_response(recipient, challenge, RpcKind::BucketResponse, Some(SignedValue::Bucket(&bucket)))?;
        Some(DhtNodeResponse::Bucket { bucket, signature })
    }

    async fn serve_request(&self, from: SocketAddr, request: DhtNodeRequest) -> Option<DhtNodeResponse> {
        let header = request.header();
        let challenge = header.challenge.clone();
        let mut sender = header.sender.clone();
        if sender.addr.ip().is_unspecified() {
            sender.addr = SocketAddr::new(from.ip(), sender.addr.port());
        }
        let sender_id = sender.node_id;
        if sender_id == self.node_id() {
            return None;
        }

        let (kind, key): (RpcKind, Option<Key>) = match &request {
            DhtNodeRequest::Ping { .. } => (RpcKind::PingRequest, None),
            DhtNodeRequest::Store { key, .. } => (RpcKind::StoreRequest, Some(*key)),
            DhtNodeRequest::Append { key, .. } => (RpcKind::AppendRequest, Some(*key)),
            DhtNodeRequest::Remove { key, .. } => (RpcKind::RemoveRequest, Some(*key)),
            DhtNodeRequest::FindNode { target, .. } => (RpcKind::FindValueRequest, Some(*target.as_bytes())),
            DhtNodeRequest::FindValue { key, .. } => (RpcKind::FindValueRequest, Some(*key)),
            DhtNodeRequest::FindCert { key, .. } => (RpcKind::FindCertRequest, Some(*key)),
        };
        let attached = match &request {
            DhtNodeRequest::Ping { cert, .. } | DhtNodeRequest::FindCert { cert, .. } => cert.as_deref(),
            _ => None,
        };

        let payload = payload_for(&self.node_id(), &challenge, kind, key.as_ref(), None).ok()?;
        match self.identity.check(&sender_id, &payload, &header.signature, attached) {
            Verification::Valid => {}
            Verification::UnknownSigner => {
                debug!(peer = %sender_id.short(), rpc = request.name(), "unknown signer, answering with NACK");
                let signature = self.sign_response(&sender_id, &challenge, RpcKind::NackResponse, None)?;
                return Some(DhtNodeResponse::Nack { signature });
            }
            Verification::Invalid => {
                warn!(peer = %sender_id.short(), remote = %from, rpc = request.name(), "dropping request with invalid signature");
                return None;
            }
        }

        if request.value_size() > MAX_VALUE_SIZE {
            warn!(peer = %sender_id.short(), size = request.value_size(), "dropping oversized value");
            return None;
        }
        if let DhtNodeRequest::Append { value, .. } | DhtNodeRequest::Remove { value, .. } = &request
            && !value.is_list_like()
        {
            warn!(peer = %sender_id.short(), rpc = request.name(), "dropping request with non-list value");
            return None;
        }

        if let Some(cert) = attached
            && self.identity.cache_certificate(cert, &sender_id)
        {
            self.spawn_transfer(sender.clone());
        }
        self.welcome(&sender).await;

        match request {
            DhtNodeRequest::Ping { .. } => {
                let signature = self.sign_response(&sender_id, &challenge, RpcKind::PingResponse, None)?;
                Some(DhtNodeResponse::Pong { id: self.node_id(), signature })
            }
            DhtNodeRequest::Store { key, value, .. } => {
                trace!(peer = %sender_id.short(), key = %hex::encode(&key[..8]), "store");
                self.dht.set_local(key, value).await;
                let signature = self.sign_response(&sender_id, &challenge, RpcKind::StoreResponse, None)?;
                Some(DhtNodeResponse::Stored { signature })
            }
            DhtNodeRequest::Append { key, value, .. } => {
                self.dht.append_local(key, value).await.ok()?;
                let signature = self.sign_response(&sender_id, &challenge, RpcKind::StoreResponse, None)?;
                Some(DhtNodeResponse::Stored { signature })
            }
            DhtNodeRequest::Remove { key, value, .. } => {
                self.dht.remove_local(key, value).await.ok()?;
                let signature = self.sign_response(&sender_id, &challenge, RpcKind::StoreResponse, None)?;
                Some(DhtNodeResponse::Stored { signature })
            }
            DhtNodeRequest::FindNode { target, .. } => self.bucket_response(&sender_id, &challenge, &target).await,
            DhtNodeRequest::FindValue { key, .. } => match self.dht.get_local(&key).await {
                Some(value) => {
                    let signature = self.sign_response(
                        &sender_id,
                        &challenge,
                        RpcKind::ValueResponse,
                        Some(SignedValue::Stored(value.as_ref())),
                    )?;
                    Some(DhtNodeResponse::Value { value, signature })
                }
                None => {
                    self.bucket_response(&sender_id, &challenge, &NodeId::from_bytes(key))
                        .await
                }
            },
            DhtNodeRequest::FindCert { .. } => {
                let cert = self.identity.own_certificate().to_vec();
                let signature = self.sign_response(
                    &sender_id,
                    &challenge,
                    RpcKind::CertResponse,
                    Some(SignedValue::Certificate(&cert)),
                )?;
                Some(DhtNodeResponse::Certificate { cert, signature })
            }
        }
    }
}

#[async_trait]
impl<N: DhtNodeRpc> DhtRequestHandler for SecureRpc<N> {
    async fn handle_request(&self, from: SocketAddr, request: DhtNodeRequest) -> Option<DhtNodeResponse> {
        self.serve_request(from, request).await
    }
}
