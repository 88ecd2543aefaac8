//! Protocol trait definitions for the DHT networking layer.
//!
//! The secure RPC layer talks to the network only through these traits,
//! so the TCP transport and the in-process test network are interchangeable.
//!
//! | Trait | Side | Purpose |
//! |-------|------|---------|
//! | [`DhtNodeRpc`] | caller | Deliver one request and wait for one response |
//! | [`DhtRequestHandler`] | callee | Turn an inbound request into an optional response |

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Contact;
use crate::messages::{DhtNodeRequest, DhtNodeResponse};

/// Outbound transport for DHT requests.
#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// Send `request` to `to` and wait for its response.
    ///
    /// An `Err` covers every transport failure, including a peer that
    /// closed the exchange without answering.
    async fn call(&self, to: &Contact, request: DhtNodeRequest) -> Result<DhtNodeResponse>;
}

/// Inbound request processing.
#[async_trait]
pub trait DhtRequestHandler: Send + Sync + 'static {
    /// `None` means the request is dropped without an answer.
    async fn handle_request(&self, from: SocketAddr, request: DhtNodeRequest) -> Option<DhtNodeResponse>;
}
