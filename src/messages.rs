//! # Wire Protocol Messages
//!
//! Serializable request and response types for the DHT RPCs. Frames are
//! bincode-encoded with size limits to prevent memory exhaustion.
//!
//! | RPC | Request | Response |
//! |-----|---------|----------|
//! | PING | `Ping` | `Pong` / `Nack` |
//! | STORE | `Store` | `Stored` / `Nack` |
//! | APPEND | `Append` | `Stored` / `Nack` |
//! | REMOVE | `Remove` | `Stored` / `Nack` |
//! | FIND_NODE | `FindNode` | `Bucket` / `Nack` |
//! | FIND_VALUE | `FindValue` | `Value` / `Bucket` / `Nack` |
//! | FIND_CERT | `FindCert` | `Certificate` / `Nack` |
//!
//! Every request carries a [`RequestHeader`] with the sender's contact, the
//! per-call challenge and the sender's signature over the challenge payload.
//! Every response carries the responder's signature over the matching
//! `signed_*_response` payload.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::dht::{Key, StoredValue};
use crate::identity::{Contact, NodeId};

/// Maximum size of a stored value (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, value plus framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_message<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestHeader {
    pub sender: Contact,
    pub challenge: String,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtNodeRequest {
    Ping {
        header: RequestHeader,
        /// Sender certificate, attached so the callee can cache it.
        cert: Option<Vec<u8>>,
    },
    Store {
        header: RequestHeader,
        key: Key,
        value: Option<StoredValue>,
    },
    Append {
        header: RequestHeader,
        key: Key,
        value: StoredValue,
    },
    Remove {
        header: RequestHeader,
        key: Key,
        value: StoredValue,
    },
    FindNode {
        header: RequestHeader,
        target: NodeId,
    },
    FindValue {
        header: RequestHeader,
        key: Key,
    },
    FindCert {
        header: RequestHeader,
        key: Key,
        cert: Option<Vec<u8>>,
    },
}

impl DhtNodeRequest {
    pub fn header(&self) -> &RequestHeader {
        match self {
            DhtNodeRequest::Ping { header, .. }
            | DhtNodeRequest::Store { header, .. }
            | DhtNodeRequest::Append { header, .. }
            | DhtNodeRequest::Remove { header, .. }
            | DhtNodeRequest::FindNode { header, .. }
            | DhtNodeRequest::FindValue { header, .. }
            | DhtNodeRequest::FindCert { header, .. } => header,
        }
    }

    pub fn sender_id(&self) -> NodeId {
        self.header().sender.node_id
    }

    pub fn name(&self) -> &'static str {
        match self {
            DhtNodeRequest::Ping { .. } => "ping",
            DhtNodeRequest::Store { .. } => "store",
            DhtNodeRequest::Append { .. } => "append",
            DhtNodeRequest::Remove { .. } => "remove",
            DhtNodeRequest::FindNode { .. } => "find_node",
            DhtNodeRequest::FindValue { .. } => "find_value",
            DhtNodeRequest::FindCert { .. } => "find_cert",
        }
    }

    /// Largest value carried by the request, in canonical bytes.
    pub fn value_size(&self) -> usize {
        match self {
            DhtNodeRequest::Store { value: Some(v), .. }
            | DhtNodeRequest::Append { value: v, .. }
            | DhtNodeRequest::Remove { value: v, .. } => stored_value_size(v),
            _ => 0,
        }
    }
}

pub fn stored_value_size(value: &StoredValue) -> usize {
    match value {
        StoredValue::Scalar(json) => json.len(),
        StoredValue::Set(elements) => elements.iter().map(|e| e.len() + 1).sum(),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtNodeResponse {
    Pong {
        id: NodeId,
        signature: Vec<u8>,
    },
    /// Acknowledges STORE, APPEND and REMOVE.
    Stored {
        signature: Vec<u8>,
    },
    Bucket {
        bucket: Vec<Contact>,
        signature: Vec<u8>,
    },
    Value {
        value: Option<StoredValue>,
        signature: Vec<u8>,
    },
    Certificate {
        cert: Vec<u8>,
        signature: Vec<u8>,
    },
    /// "I do not know your certificate yet."
    Nack {
        signature: Vec<u8>,
    },
}

impl DhtNodeResponse {
    pub fn signature(&self) -> &[u8] {
        match self {
            DhtNodeResponse::Pong { signature, .. }
            | DhtNodeResponse::Stored { signature }
            | DhtNodeResponse::Bucket { signature, .. }
            | DhtNodeResponse::Value { signature, .. }
            | DhtNodeResponse::Certificate { signature, .. }
            | DhtNodeResponse::Nack { signature } => signature,
        }
    }
}
