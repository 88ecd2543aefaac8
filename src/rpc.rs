//! # RPC Layer
//!
//! TCP transport for DHT requests. Each call opens a connection, writes one
//! length-prefixed bincode request and reads one length-prefixed response.
//!
//! ## Framing
//!
//! ```text
//! +----------------+------------------------+
//! | len (u32, BE)  | bincode payload (len)  |
//! +----------------+------------------------+
//! ```
//!
//! A callee that decides to drop a request closes the connection without
//! writing a response frame; the caller observes that as a transport error.
//!
//! ## Security
//!
//! - Frame sizes are bounded before any allocation
//! - Deserialization goes through `deserialize_bounded`
//! - Reads and request processing are time-bounded

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace, warn};

use crate::identity::Contact;
use crate::messages::{self, DhtNodeRequest, DhtNodeResponse, MAX_DESERIALIZE_SIZE};
use crate::protocols::{DhtNodeRpc, DhtRequestHandler};

/// Maximum frame size in either direction.
const MAX_FRAME_SIZE: usize = MAX_DESERIALIZE_SIZE as usize;

/// Default bound on a whole outbound call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound TCP transport.
#[derive(Clone, Debug)]
pub struct RpcNode {
    timeout: Duration,
}

impl RpcNode {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn rpc_inner(&self, contact: &Contact, request: &DhtNodeRequest) -> Result<DhtNodeResponse> {
        let mut stream = TcpStream::connect(contact.addr)
            .await
            .with_context(|| format!("failed to connect to {}", contact.addr))?;

        let request_bytes =
            messages::serialize_message(request).context("failed to serialize request")?;
        write_frame(&mut stream, &request_bytes).await?;

        let response_bytes = read_frame(&mut stream)
            .await
            .with_context(|| format!("no response from {}", contact.addr))?;
        let response: DhtNodeResponse = messages::deserialize_bounded(&response_bytes)
            .context("failed to deserialize response")?;
        Ok(response)
    }
}

impl Default for RpcNode {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_TIMEOUT)
    }
}

#[async_trait]
impl DhtNodeRpc for RpcNode {
    async fn call(&self, to: &Contact, request: DhtNodeRequest) -> Result<DhtNodeResponse> {
        trace!(peer = %to.node_id.short(), addr = %to.addr, rpc = request.name(), "sending request");
        tokio::time::timeout(self.timeout, self.rpc_inner(to, &request))
            .await
            .context("RPC timed out")?
    }
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", payload.len(), MAX_FRAME_SIZE);
    }
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Accept loop. Runs until the listener fails or the task is aborted.
pub async fn serve<H: DhtRequestHandler>(listener: TcpListener, handler: Arc<H>) -> Result<()> {
    loop {
        let (stream, remote) = listener.accept().await.context("accept failed")?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, remote, handler).await {
                debug!(remote = %remote, error = %e, "connection error");
            }
        });
    }
}

pub async fn handle_connection<H: DhtRequestHandler>(
    mut stream: TcpStream,
    remote: SocketAddr,
    handler: Arc<H>,
) -> Result<()> {
    let request_bytes = match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame(&mut stream)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            warn!(remote = %remote, error = %e, "rejecting unreadable request");
            return Ok(());
        }
        Err(_) => anyhow::bail!("request read timed out"),
    };

    let request: DhtNodeRequest =
        messages::deserialize_bounded(&request_bytes).context("failed to deserialize request")?;

    let response = match tokio::time::timeout(
        REQUEST_PROCESS_TIMEOUT,
        handler.handle_request(remote, request),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => {
            warn!(remote = %remote, "request processing timed out");
            None
        }
    };

    match response {
        Some(response) => {
            let response_bytes =
                messages::serialize_message(&response).context("failed to serialize response")?;
            write_frame(&mut stream, &response_bytes).await?;
        }
        None => {
            trace!(remote = %remote, "request dropped without response");
        }
    }
    stream.shutdown().await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::messages::RequestHeader;

    struct EchoPong {
        id: NodeId,
    }

    #[async_trait]
    impl DhtRequestHandler for EchoPong {
        async fn handle_request(&self, _from: SocketAddr, request: DhtNodeRequest) -> Option<DhtNodeResponse> {
            match request {
                DhtNodeRequest::Ping { header, .. } => Some(DhtNodeResponse::Pong {
                    id: self.id,
                    signature: header.signature,
                }),
                _ => None,
            }
        }
    }

    fn header(port: u16) -> RequestHeader {
        RequestHeader {
            sender: Contact::new(NodeId::random(), format!("127.0.0.1:{port}").parse().unwrap()),
            challenge: "00".into(),
            signature: vec![9u8; 64],
        }
    }

    async fn start_server() -> (SocketAddr, NodeId, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let id = NodeId::random();
        let task = tokio::spawn(serve(listener, Arc::new(EchoPong { id })));
        (addr, id, task)
    }

    #[tokio::test]
    async fn request_response_over_tcp() {
        let (addr, id, task) = start_server().await;
        let rpc = RpcNode::default();
        let to = Contact::new(id, addr);

        let response = rpc
            .call(&to, DhtNodeRequest::Ping { header: header(1), cert: None })
            .await
            .expect("pong");
        match response {
            DhtNodeResponse::Pong { id: got, signature } => {
                assert_eq!(got, id);
                assert_eq!(signature, vec![9u8; 64]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        task.abort();
    }

    #[tokio::test]
    async fn dropped_request_is_an_error() {
        let (addr, id, task) = start_server().await;
        let rpc = RpcNode::default();
        let to = Contact::new(id, addr);

        let result = rpc
            .call(&to, DhtNodeRequest::FindNode { header: header(1), target: NodeId::random() })
            .await;
        assert!(result.is_err());
        task.abort();
    }

    #[tokio::test]
    async fn unreachable_peer_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let rpc = RpcNode::new(Duration::from_millis(500));
        let result = rpc
            .call(&Contact::new(NodeId::random(), addr), DhtNodeRequest::Ping { header: header(1), cert: None })
            .await;
        assert!(result.is_err());
    }
}
