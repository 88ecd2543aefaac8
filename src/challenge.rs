//! # Challenge Codec
//!
//! Builds the exact byte string that is signed for each RPC and response.
//!
//! Every payload starts with `recipient_hex || kind || challenge`. Requests
//! that name a key append the key hex; value-carrying responses append a
//! canonical rendering of the value. Signer and verifier both go through
//! [`payload_for`], so the rendering only has to be stable, not pretty.
//!
//! Value rendering:
//!
//! | Value | Rendering |
//! |-------|-----------|
//! | deleted (`None`) | `null` |
//! | scalar | its canonical JSON text |
//! | set | `[e1,e2,...]` in sorted element order, empty set adds nothing |
//! | bucket | `hexid@ip:port` joined by `,`, empty bucket adds nothing |
//! | certificate | hex DER |

use rand::rngs::OsRng;
use rand::RngCore;

use crate::dht::{Key, StoredValue};
use crate::identity::{Contact, NodeId};

/// Number of random bytes in a challenge.
pub const CHALLENGE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcKind {
    PingRequest,
    StoreRequest,
    AppendRequest,
    RemoveRequest,
    FindValueRequest,
    FindCertRequest,
    PingResponse,
    StoreResponse,
    ValueResponse,
    BucketResponse,
    CertResponse,
    NackResponse,
}

impl RpcKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcKind::PingRequest => "ping_request",
            RpcKind::StoreRequest => "store_request",
            RpcKind::AppendRequest => "append_request",
            RpcKind::RemoveRequest => "remove_request",
            RpcKind::FindValueRequest => "find_value_request",
            RpcKind::FindCertRequest => "find_cert_request",
            RpcKind::PingResponse => "signed_ping_response",
            RpcKind::StoreResponse => "signed_store_response",
            RpcKind::ValueResponse => "signed_value_response",
            RpcKind::BucketResponse => "signed_bucket_response",
            RpcKind::CertResponse => "signed_cert_response",
            RpcKind::NackResponse => "signed_NACK_response",
        }
    }

    fn requires_key(&self) -> bool {
        matches!(
            self,
            RpcKind::StoreRequest
                | RpcKind::AppendRequest
                | RpcKind::RemoveRequest
                | RpcKind::FindValueRequest
                | RpcKind::FindCertRequest
        )
    }

    fn requires_value(&self) -> bool {
        matches!(
            self,
            RpcKind::ValueResponse | RpcKind::BucketResponse | RpcKind::CertResponse
        )
    }
}

impl std::str::FromStr for RpcKind {
    type Err = ChallengeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "ping_request" => RpcKind::PingRequest,
            "store_request" => RpcKind::StoreRequest,
            "append_request" => RpcKind::AppendRequest,
            "remove_request" => RpcKind::RemoveRequest,
            "find_value_request" => RpcKind::FindValueRequest,
            "find_cert_request" => RpcKind::FindCertRequest,
            "signed_ping_response" => RpcKind::PingResponse,
            "signed_store_response" => RpcKind::StoreResponse,
            "signed_value_response" => RpcKind::ValueResponse,
            "signed_bucket_response" => RpcKind::BucketResponse,
            "signed_cert_response" => RpcKind::CertResponse,
            "signed_NACK_response" => RpcKind::NackResponse,
            other => return Err(ChallengeError::UnsupportedRpcKind(other.to_string())),
        };
        Ok(kind)
    }
}

impl std::fmt::Display for RpcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    /// The kind requires a key or value that was not supplied.
    MalformedPayload(RpcKind),
    UnsupportedRpcKind(String),
}

impl std::fmt::Display for ChallengeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeError::MalformedPayload(kind) => {
                write!(f, "malformed payload for {kind}: missing key or value")
            }
            ChallengeError::UnsupportedRpcKind(kind) => write!(f, "unsupported rpc kind: {kind}"),
        }
    }
}

impl std::error::Error for ChallengeError {}

/// A value bound into a response signature.
#[derive(Debug, Clone, Copy)]
pub enum SignedValue<'a> {
    Stored(Option<&'a StoredValue>),
    Bucket(&'a [Contact]),
    Certificate(&'a [u8]),
}

/// Fresh 8-byte challenge, hex-encoded.
pub fn new_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn payload_for(
    recipient: &NodeId,
    challenge: &str,
    kind: RpcKind,
    key: Option<&Key>,
    value: Option<SignedValue<'_>>,
) -> Result<Vec<u8>, ChallengeError> {
    let mut payload = String::with_capacity(96);
    payload.push_str(&recipient.to_hex());
    payload.push_str(kind.as_str());
    payload.push_str(challenge);

    if kind.requires_key() {
        let key = key.ok_or(ChallengeError::MalformedPayload(kind))?;
        payload.push_str(&hex::encode(key));
    }

    if kind.requires_value() {
        let value = value.ok_or(ChallengeError::MalformedPayload(kind))?;
        // Stored values carry a variant tag: `n:` deletion, `s:` scalar, `S:` set.
        match value {
            SignedValue::Stored(None) => payload.push_str("n:"),
            SignedValue::Stored(Some(StoredValue::Scalar(json))) => {
                payload.push_str("s:");
                payload.push_str(json);
            }
            SignedValue::Stored(Some(StoredValue::Set(elements))) => {
                if !elements.is_empty() {
                    payload.push_str("S:[");
                    for (i, element) in elements.iter().enumerate() {
                        if i > 0 {
                            payload.push(',');
                        }
                        payload.push_str(element);
                    }
                    payload.push(']');
                }
            }
            SignedValue::Bucket(contacts) => {
                for (i, contact) in contacts.iter().enumerate() {
                    if i > 0 {
                        payload.push(',');
                    }
                    payload.push_str(&contact.node_id.to_hex());
                    payload.push('@');
                    payload.push_str(&contact.addr.to_string());
                }
            }
            SignedValue::Certificate(der) => {
                if der.is_empty() {
                    return Err(ChallengeError::MalformedPayload(kind));
                }
                payload.push_str(&hex::encode(der));
            }
        }
    }

    Ok(payload.into_bytes())
}

/// [`payload_for`] with the kind given by name.
pub fn payload_for_kind_name(
    recipient: &NodeId,
    challenge: &str,
    kind: &str,
    key: Option<&Key>,
    value: Option<SignedValue<'_>>,
) -> Result<Vec<u8>, ChallengeError> {
    payload_for(recipient, challenge, kind.parse()?, key, value)
}
