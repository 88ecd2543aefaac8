use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use securedht::{
    BootstrapPeer, CertificateAuthority, CertificateStore, DhtConfig, DiscoveredService,
    DiscoveryConfig, IdentityStore, Keypair, NodeId, SecureDhtNode, ServiceRecord, SsdpResponder,
    SsdpSearch, DHT_SERVICE_UUID,
};

/// `IP:PORT/PATH_TO_CERT_DER`; use `IP:PORT//abs/path` for absolute paths.
#[derive(Clone, Debug)]
struct SeedArg {
    addr: SocketAddr,
    cert_path: PathBuf,
}

impl FromStr for SeedArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, path_part) = s
            .split_once('/')
            .context("bootstrap peer must include a certificate (format: IP:PORT/PATH_TO_CERT_DER)")?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        if path_part.is_empty() {
            anyhow::bail!("certificate path is empty");
        }
        Ok(SeedArg {
            addr,
            cert_path: PathBuf::from(path_part),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "securedht")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a certificate authority for a domain.
    CaInit {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        domain: String,
    },
    /// Create node credentials signed by a CA.
    NodeInit {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long = "ca-dir")]
        ca_dir: PathBuf,
        /// Common name for the node certificate; defaults to the NodeID.
        #[arg(long)]
        name: Option<String>,
    },
    /// Run a DHT node.
    Run {
        #[arg(long)]
        dir: PathBuf,

        #[arg(short, long, default_value = "0.0.0.0:5000")]
        bind: SocketAddr,

        #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
        bootstrap: Vec<SeedArg>,

        #[arg(long, default_value_t = securedht::DEFAULT_K)]
        k: usize,

        #[arg(long, default_value_t = securedht::DEFAULT_ALPHA)]
        alpha: usize,

        /// Apply writes locally when no neighbors are known.
        #[arg(long)]
        authoritative: bool,

        /// Announce this node and search for seeds over SSDP.
        #[arg(long)]
        discovery: bool,

        /// Network name to announce and to accept during discovery.
        #[arg(long = "service-filter")]
        service_filter: Option<String>,

        #[arg(long, default_value = "300")]
        status_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::CaInit { dir, domain } => ca_init(dir, &domain),
        Command::NodeInit { dir, ca_dir, name } => node_init(dir, ca_dir, name.as_deref()),
        Command::Run {
            dir,
            bind,
            bootstrap,
            k,
            alpha,
            authoritative,
            discovery,
            service_filter,
            status_interval,
        } => {
            let config = DhtConfig {
                k,
                alpha,
                authoritative,
                ..DhtConfig::default()
            };
            run(dir, bind, bootstrap, config, discovery, service_filter, status_interval).await
        }
    }
}

fn ca_init(dir: PathBuf, domain: &str) -> Result<()> {
    let store = CertificateStore::open(&dir)?;
    let ca = CertificateAuthority::generate(domain)?;
    store.save_authority(domain, ca.certificate_der(), ca.keypair())?;
    store.save_trust_root(domain, ca.certificate_der())?;
    info!(domain, dir = %dir.display(), "certificate authority created");
    Ok(())
}

fn node_init(dir: PathBuf, ca_dir: PathBuf, name: Option<&str>) -> Result<()> {
    let ca_store = CertificateStore::open(&ca_dir)?;
    let (domain, ca_cert, ca_key) = ca_store
        .load_authority()
        .with_context(|| format!("no certificate authority in {}", ca_dir.display()))?;
    let ca = CertificateAuthority::new(&domain, ca_key)?;

    let node_id = NodeId::random();
    let keypair = Keypair::generate();
    let cert = ca.issue(&node_id, &keypair, name)?;

    let store = CertificateStore::open(&dir)?;
    store.save_own(&node_id, &cert, &keypair)?;
    store.save_trust_root(&domain, &ca_cert)?;
    info!(node = %node_id, domain = %domain, dir = %dir.display(), "node credentials created");
    Ok(())
}

async fn run(
    dir: PathBuf,
    bind: SocketAddr,
    seeds: Vec<SeedArg>,
    config: DhtConfig,
    discovery: bool,
    service_filter: Option<String>,
    status_interval: u64,
) -> Result<()> {
    let identity = Arc::new(IdentityStore::load(CertificateStore::open(&dir)?)?);
    let own_cert = identity.own_certificate().to_vec();
    let node = SecureDhtNode::bind(bind, identity, config).await?;
    info!("Node identity: {}", node.node_id());

    let mut peers = Vec::with_capacity(seeds.len());
    for seed in &seeds {
        let certificate = std::fs::read(&seed.cert_path)
            .with_context(|| format!("failed to read {}", seed.cert_path.display()))?;
        peers.push(BootstrapPeer { addr: seed.addr, certificate });
    }
    if !peers.is_empty() {
        let reached = node.bootstrap(&peers).await;
        if reached == 0 {
            warn!("no bootstrap peer answered");
        }
    }

    let mut _responder = None;
    let mut search = None;
    if discovery {
        let discovery_config = DiscoveryConfig {
            network_filter: service_filter.clone(),
            ..DiscoveryConfig::default()
        };
        let responder = SsdpResponder::bind(&discovery_config).await?;
        responder.register(ServiceRecord {
            service_uuid: DHT_SERVICE_UUID.to_string(),
            addr: node.local_addr(),
            network: service_filter.unwrap_or_default(),
            certificate: Some(own_cert),
        });
        let started = SsdpSearch::start(&discovery_config, DHT_SERVICE_UUID, Some(node.local_addr())).await?;
        responder.ignore([started.local_addr()]);
        _responder = Some(responder);
        search = Some(started);
    }

    let mut interval = time::interval(Duration::from_secs(status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(found) = next_discovered(&mut search) => {
                match found.bootstrap_peer() {
                    Some(peer) => {
                        node.bootstrap(&[peer]).await;
                    }
                    None => warn!(addr = %found.addr, "discovered node without certificate"),
                }
            }
            _ = interval.tick() => {
                let peers = node.known_peers().await;
                info!(peers = peers.len(), addr = %node.local_addr(), "status");
            }
        }
    }

    node.stop().await;
    Ok(())
}

async fn next_discovered(search: &mut Option<SsdpSearch>) -> Option<DiscoveredService> {
    match search {
        Some(search) => search.next().await,
        None => std::future::pending().await,
    }
}
