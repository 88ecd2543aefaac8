//! # Service Discovery
//!
//! SSDP-style discovery of DHT seeds on the local network.
//!
//! A [`SsdpResponder`] listens on the multicast group and answers
//! `M-SEARCH` requests for services registered with it. A [`SsdpSearch`]
//! repeats `M-SEARCH` with exponential backoff and yields every matching
//! `200 OK` as a [`DiscoveredService`], whose address and certificate feed
//! [`SecureDhtNode::bootstrap`](crate::SecureDhtNode::bootstrap).
//!
//! ## Messages
//!
//! ```text
//! M-SEARCH * HTTP/1.1          HTTP/1.1 200 OK
//! HOST: 239.255.255.250:1900   USN: <uuid>::upnp:rootdevice
//! MAN: "ssdp:discover"         SERVER: <ip>:<port>
//! MX: 2                        SERVICE: <network>
//! ST: uuid:<service>           ST: uuid:<service>
//!                              CERTIFICATE: <hex DER>   (optional)
//! ```

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::RetryPolicy;
use crate::node::BootstrapPeer;

pub const SSDP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

/// Service UUID announced by DHT nodes.
pub const DHT_SERVICE_UUID: &str = "1693326a-abb9-11e4-8dfb-9cb654a16426";
/// Service UUID announced by certificate authorities.
pub const CA_SERVICE_UUID: &str = "58532fde-e793-11e5-965d-7cd1c3da1305";

const MX_SECONDS: u64 = 2;
const MAX_DATAGRAM: usize = 16 * 1024;
const SERVER_ID: &str = concat!("UPnP/1.0,securedht/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Multicast group, or a unicast address for loopback setups.
    pub group: SocketAddr,
    /// Where the responder listens.
    pub listen: SocketAddr,
    /// Only accept responses whose `SERVICE` header matches.
    pub network_filter: Option<String>,
    /// Upper bound on the random delay before a response is sent.
    pub max_response_delay: Duration,
    pub search_backoff: RetryPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: SocketAddr::from((SSDP_ADDR, SSDP_PORT)),
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, SSDP_PORT)),
            network_filter: None,
            max_response_delay: Duration::from_secs(5),
            search_backoff: RetryPolicy::discovery(),
        }
    }
}

/// Build the `M-SEARCH` request for `service_uuid`.
pub fn msearch(service_uuid: &str, group: SocketAddr) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\nHOST: {group}\r\nMAN: \"ssdp:discover\"\r\nMX: {MX_SECONDS}\r\nST: uuid:{service_uuid}\r\n\r\n"
    )
}

/// Split an SSDP message into its start line and lower-cased headers.
///
/// Only the header block is read; bodies are ignored.
pub fn parse_http_response(data: &str) -> (Vec<String>, HashMap<String, String>) {
    let head = data.split("\r\n\r\n").next().unwrap_or_default();
    let mut lines = head.split("\r\n");
    let command = lines
        .next()
        .unwrap_or_default()
        .split(' ')
        .map(str::to_string)
        .collect();
    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    (command, headers)
}

/// A service this host answers searches for.
#[derive(Clone, Debug)]
pub struct ServiceRecord {
    pub service_uuid: String,
    pub addr: SocketAddr,
    /// Network name advertised in the `SERVICE` header.
    pub network: String,
    pub certificate: Option<Vec<u8>>,
}

impl ServiceRecord {
    /// Address to advertise to `requester`.
    ///
    /// A wildcard bind is replaced by the local interface address that
    /// routes toward the requester.
    fn advertised_addr(&self, requester: SocketAddr) -> Option<SocketAddr> {
        if !self.addr.ip().is_unspecified() {
            return Some(self.addr);
        }
        let probe = std::net::UdpSocket::bind(SocketAddr::new(self.addr.ip(), 0)).ok()?;
        probe.connect(requester).ok()?;
        let local = probe.local_addr().ok()?;
        Some(SocketAddr::new(local.ip(), self.addr.port()))
    }

    fn render_response(&self, addr: SocketAddr) -> String {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\n\
             USN: {uuid}::upnp:rootdevice\r\n\
             SERVER: {addr}\r\n\
             SERVER-ID: {SERVER_ID}\r\n\
             EXT: \r\n\
             SERVICE: {network}\r\n\
             LOCATION: tcp://{addr}\r\n\
             CACHE-CONTROL: max-age=1800\r\n\
             ST: uuid:{uuid}\r\n\
             DATE: {date}\r\n",
            uuid = self.service_uuid,
            network = self.network,
            date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"),
        );
        if let Some(cert) = &self.certificate {
            response.push_str("CERTIFICATE: ");
            response.push_str(&hex::encode(cert));
            response.push_str("\r\n");
        }
        response.push_str("\r\n");
        response
    }
}

/// A `200 OK` that passed the searcher's filters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredService {
    pub service_uuid: String,
    pub addr: SocketAddr,
    pub network: String,
    pub certificate: Option<Vec<u8>>,
}

impl DiscoveredService {
    /// Seed for bootstrap; `None` without a certificate.
    pub fn bootstrap_peer(&self) -> Option<BootstrapPeer> {
        Some(BootstrapPeer {
            addr: self.addr,
            certificate: self.certificate.clone()?,
        })
    }
}

fn udp_socket(bind: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&bind.into())
        .with_context(|| format!("failed to bind {bind}"))?;
    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

fn join_group(socket: &UdpSocket, group: SocketAddr) -> Result<()> {
    if let SocketAddr::V4(group) = group
        && group.ip().is_multicast()
    {
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(5)?;
        socket
            .join_multicast_v4(*group.ip(), Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("failed to join multicast group {group}"))?;
    }
    Ok(())
}

// ============================================================================
// Responder
// ============================================================================

#[derive(Default)]
struct ResponderState {
    services: RwLock<Vec<ServiceRecord>>,
    ignore: RwLock<HashSet<SocketAddr>>,
}

pub struct SsdpResponder {
    local_addr: SocketAddr,
    state: Arc<ResponderState>,
    task: JoinHandle<()>,
}

impl SsdpResponder {
    pub async fn bind(config: &DiscoveryConfig) -> Result<Self> {
        let socket = udp_socket(config.listen)?;
        join_group(&socket, config.group)?;
        let local_addr = socket.local_addr()?;
        let state = Arc::new(ResponderState::default());
        let task = tokio::spawn(respond_loop(
            Arc::new(socket),
            state.clone(),
            config.max_response_delay,
        ));
        info!(addr = %local_addr, group = %config.group, "SSDP responder listening");
        Ok(Self { local_addr, state, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Answer searches for `record.service_uuid` at `record.addr`.
    ///
    /// Registering the same service and address again replaces the record.
    pub fn register(&self, record: ServiceRecord) {
        if let Ok(mut services) = self.state.services.write() {
            services.retain(|s| s.service_uuid != record.service_uuid || s.addr != record.addr);
            services.push(record);
        }
    }

    pub fn unregister(&self, service_uuid: &str) {
        if let Ok(mut services) = self.state.services.write() {
            services.retain(|s| s.service_uuid != service_uuid);
        }
    }

    /// Never answer searches sent from these addresses.
    pub fn ignore(&self, addrs: impl IntoIterator<Item = SocketAddr>) {
        if let Ok(mut ignore) = self.state.ignore.write() {
            ignore.extend(addrs);
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SsdpResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond_loop(socket: Arc<UdpSocket>, state: Arc<ResponderState>, max_delay: Duration) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "SSDP receive failed");
                continue;
            }
        };
        let text = String::from_utf8_lossy(&buf[..len]);
        let (command, headers) = parse_http_response(&text);
        if command.first().map(String::as_str) != Some("M-SEARCH") || command.get(1).map(String::as_str) != Some("*") {
            continue;
        }
        if state.ignore.read().is_ok_and(|ignore| ignore.contains(&from)) {
            continue;
        }
        let Some(target) = headers.get("st") else {
            continue;
        };
        let mx = headers
            .get("mx")
            .and_then(|mx| mx.parse::<u64>().ok())
            .unwrap_or(MX_SECONDS);

        let matching: Vec<ServiceRecord> = match state.services.read() {
            Ok(services) => services
                .iter()
                .filter(|s| target.contains(&s.service_uuid))
                // loopback services are only announced to loopback searchers
                .filter(|s| !s.addr.ip().is_loopback() || from.ip().is_loopback())
                .cloned()
                .collect(),
            Err(_) => continue,
        };

        for record in matching {
            let Some(addr) = record.advertised_addr(from) else {
                debug!(to = %from, "no local address routes to searcher");
                continue;
            };
            let response = record.render_response(addr);
            let limit = max_delay.min(Duration::from_secs(mx));
            let delay = if limit.is_zero() {
                Duration::ZERO
            } else {
                Duration::from_millis(rand::thread_rng().gen_range(0..=limit.as_millis() as u64))
            };
            let socket = socket.clone();
            trace!(to = %from, service = %record.service_uuid, delay_ms = delay.as_millis() as u64, "answering M-SEARCH");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = socket.send_to(response.as_bytes(), from).await {
                    debug!(to = %from, error = %e, "SSDP response failed");
                }
            });
        }
    }
}

// ============================================================================
// Searcher
// ============================================================================

/// A running search. Dropping it stops the search.
pub struct SsdpSearch {
    local_addr: SocketAddr,
    found: mpsc::Receiver<DiscoveredService>,
    tasks: Vec<JoinHandle<()>>,
}

impl SsdpSearch {
    /// Start searching for `service_uuid`.
    ///
    /// Responses advertising `own_addr` are skipped so a node does not
    /// discover itself.
    pub async fn start(config: &DiscoveryConfig, service_uuid: &str, own_addr: Option<SocketAddr>) -> Result<Self> {
        let bind = match config.group {
            SocketAddr::V4(group) if group.ip().is_loopback() => SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            _ => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        };
        let socket = Arc::new(udp_socket(bind)?);
        let local_addr = socket.local_addr()?;
        let (tx, found) = mpsc::channel(32);

        let sender = tokio::spawn(search_loop(
            socket.clone(),
            msearch(service_uuid, config.group),
            config.group,
            config.search_backoff.clone(),
        ));
        let receiver = tokio::spawn(collect_loop(
            socket,
            service_uuid.to_string(),
            config.network_filter.clone(),
            own_addr,
            tx,
        ));
        debug!(service = service_uuid, addr = %local_addr, "SSDP search started");
        Ok(Self {
            local_addr,
            found,
            tasks: vec![sender, receiver],
        })
    }

    /// Source address of outgoing searches.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn next(&mut self) -> Option<DiscoveredService> {
        self.found.recv().await
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.found.close();
    }
}

impl Drop for SsdpSearch {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn search_loop(socket: Arc<UdpSocket>, request: String, group: SocketAddr, backoff: RetryPolicy) {
    let mut attempt = 1;
    loop {
        if let Err(e) = socket.send_to(request.as_bytes(), group).await {
            debug!(group = %group, error = %e, "M-SEARCH send failed");
        }
        let delay = backoff.delay_for(attempt);
        trace!(attempt, next_ms = delay.as_millis() as u64, "M-SEARCH sent");
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

async fn collect_loop(
    socket: Arc<UdpSocket>,
    service_uuid: String,
    network_filter: Option<String>,
    own_addr: Option<SocketAddr>,
    tx: mpsc::Sender<DiscoveredService>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut seen: HashSet<SocketAddr> = HashSet::new();
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "SSDP receive failed");
                continue;
            }
        };
        let text = String::from_utf8_lossy(&buf[..len]);
        let (command, headers) = parse_http_response(&text);
        let ok = command.first().is_some_and(|c| c.starts_with("HTTP/1.")) && command.get(1).map(String::as_str) == Some("200");
        if !ok || !headers.get("st").is_some_and(|st| st.contains(&service_uuid)) {
            continue;
        }

        let network = headers.get("service").cloned().unwrap_or_default();
        if let Some(filter) = &network_filter
            && *filter != network
        {
            trace!(from = %from, network = %network, "response for another network");
            continue;
        }
        let Some(addr) = headers.get("server").and_then(|s| s.parse::<SocketAddr>().ok()) else {
            debug!(from = %from, "response without a usable SERVER address");
            continue;
        };
        if Some(addr) == own_addr || !seen.insert(addr) {
            continue;
        }
        let certificate = match headers.get("certificate").map(hex::decode) {
            Some(Ok(der)) => Some(der),
            Some(Err(_)) => {
                warn!(from = %from, "response carries a malformed certificate");
                continue;
            }
            None => None,
        };

        let service = DiscoveredService {
            service_uuid: service_uuid.clone(),
            addr,
            network,
            certificate,
        };
        info!(addr = %service.addr, "discovered service");
        if tx.send(service).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msearch_carries_service_target() {
        let group = SocketAddr::from((SSDP_ADDR, SSDP_PORT));
        let (command, headers) = parse_http_response(&msearch(DHT_SERVICE_UUID, group));
        assert_eq!(command, vec!["M-SEARCH", "*", "HTTP/1.1"]);
        assert_eq!(headers["host"], "239.255.255.250:1900");
        assert_eq!(headers["st"], format!("uuid:{DHT_SERVICE_UUID}"));
        assert_eq!(headers["mx"], "2");
    }

    #[test]
    fn response_headers_round_trip_through_parser() {
        let record = ServiceRecord {
            service_uuid: DHT_SERVICE_UUID.into(),
            addr: "10.0.0.5:5000".parse().unwrap(),
            network: "lab".into(),
            certificate: Some(vec![0xde, 0xad]),
        };
        let (command, headers) = parse_http_response(&record.render_response(record.addr));
        assert_eq!(command[..2], ["HTTP/1.1".to_string(), "200".to_string()]);
        assert_eq!(headers["server"], "10.0.0.5:5000");
        assert_eq!(headers["service"], "lab");
        assert_eq!(headers["certificate"], "dead");
        assert_eq!(headers["ext"], "");
        assert!(headers["date"].ends_with("GMT"));
    }

    #[test]
    fn wildcard_service_is_advertised_on_routable_address() {
        let record = ServiceRecord {
            service_uuid: DHT_SERVICE_UUID.into(),
            addr: "0.0.0.0:5000".parse().unwrap(),
            network: String::new(),
            certificate: None,
        };
        let addr = record.advertised_addr("127.0.0.1:1900".parse().unwrap()).unwrap();
        assert_eq!(addr, "127.0.0.1:5000".parse().unwrap());
    }

    #[test]
    fn parser_ignores_body_and_lowercases_names() {
        let (command, headers) = parse_http_response("HTTP/1.1 200 OK\r\nCache-Control: max-age=10\r\n\r\nbody: no");
        assert_eq!(command[1], "200");
        assert_eq!(headers.get("cache-control").map(String::as_str), Some("max-age=10"));
        assert!(!headers.contains_key("body"));
    }

    #[test]
    fn discovered_service_without_certificate_is_no_seed() {
        let service = DiscoveredService {
            service_uuid: DHT_SERVICE_UUID.into(),
            addr: "127.0.0.1:1".parse().unwrap(),
            network: String::new(),
            certificate: None,
        };
        assert!(service.bootstrap_peer().is_none());
    }

    fn loopback_config(responder: SocketAddr) -> DiscoveryConfig {
        DiscoveryConfig {
            group: responder,
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            network_filter: Some("lab".into()),
            max_response_delay: Duration::ZERO,
            search_backoff: RetryPolicy {
                base_delay: Duration::from_millis(50),
                ..RetryPolicy::discovery()
            },
        }
    }

    #[tokio::test]
    async fn search_finds_registered_service_on_loopback() {
        let responder = SsdpResponder::bind(&loopback_config(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))))
            .await
            .unwrap();
        let config = loopback_config(responder.local_addr());
        responder.register(ServiceRecord {
            service_uuid: DHT_SERVICE_UUID.into(),
            addr: "127.0.0.1:7000".parse().unwrap(),
            network: "other".into(),
            certificate: None,
        });
        responder.register(ServiceRecord {
            service_uuid: DHT_SERVICE_UUID.into(),
            addr: "127.0.0.1:7001".parse().unwrap(),
            network: "lab".into(),
            certificate: Some(vec![1, 2, 3]),
        });

        let mut search = SsdpSearch::start(&config, DHT_SERVICE_UUID, None).await.unwrap();
        let found = tokio::time::timeout(Duration::from_secs(5), search.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.addr, "127.0.0.1:7001".parse().unwrap());
        assert_eq!(found.certificate, Some(vec![1, 2, 3]));
        assert_eq!(found.network, "lab");
    }

    #[tokio::test]
    async fn ignored_searchers_get_no_answer() {
        let responder = SsdpResponder::bind(&loopback_config(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))))
            .await
            .unwrap();
        let config = loopback_config(responder.local_addr());

        let mut search = SsdpSearch::start(&config, DHT_SERVICE_UUID, None).await.unwrap();
        responder.ignore([search.local_addr()]);
        responder.register(ServiceRecord {
            service_uuid: DHT_SERVICE_UUID.into(),
            addr: "127.0.0.1:7001".parse().unwrap(),
            network: "lab".into(),
            certificate: None,
        });

        let answer = tokio::time::timeout(Duration::from_millis(500), search.next()).await;
        assert!(answer.is_err());
    }
}
