//! On-disk certificate layout.
//!
//! ```text
//! <root>/
//!   mine/      own certificate (node.der)
//!   private/   own private key (node.key, hex)
//!   others/    verified peer certificates (<hex node id>.der)
//!   trust/     CA roots (*.der)
//! ```
//!
//! A CA directory uses the same root with `ca.der` / `ca.key` under `mine/`
//! and `private/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::identity::{Keypair, NodeId};

const OWN_CERT: &str = "node.der";
const OWN_KEY: &str = "node.key";
const CA_CERT: &str = "ca.der";
const CA_KEY: &str = "ca.key";
const CA_DOMAIN: &str = "domain";

#[derive(Debug, Clone)]
pub struct CertificateStore {
    root: PathBuf,
}

impl CertificateStore {
    /// Open (and create if needed) a certificate directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in ["mine", "others", "private", "trust"] {
            fs::create_dir_all(root.join(sub))
                .with_context(|| format!("failed to create {}", root.join(sub).display()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save_own(&self, node_id: &NodeId, cert: &[u8], keypair: &Keypair) -> Result<()> {
        fs::write(self.root.join("mine").join(OWN_CERT), cert)
            .context("failed to write own certificate")?;
        write_key(&self.root.join("private").join(OWN_KEY), keypair)?;
        tracing::debug!(node = %node_id.short(), dir = %self.root.display(), "saved node credentials");
        Ok(())
    }

    pub fn load_own(&self) -> Result<(Vec<u8>, Keypair)> {
        let cert = fs::read(self.root.join("mine").join(OWN_CERT))
            .context("no node certificate, run node-init first")?;
        let keypair = read_key(&self.root.join("private").join(OWN_KEY))?;
        Ok((cert, keypair))
    }

    /// Install a CA root under `trust/`.
    pub fn save_trust_root(&self, name: &str, der: &[u8]) -> Result<()> {
        let path = self.root.join("trust").join(format!("{name}.der"));
        fs::write(&path, der).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn load_trust_roots(&self) -> Result<Vec<Vec<u8>>> {
        let mut roots = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(self.root.join("trust"))
            .context("failed to list trust roots")?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "der"))
            .collect();
        entries.sort();
        for path in entries {
            roots.push(fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?);
        }
        Ok(roots)
    }

    /// Persist a peer certificate. Returns `false` if one was already stored.
    pub fn store_peer_cert(&self, node_id: &NodeId, der: &[u8]) -> Result<bool> {
        let path = self.peer_path(node_id);
        if path.exists() {
            return Ok(false);
        }
        fs::write(&path, der).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(true)
    }

    pub fn load_peer_cert(&self, node_id: &NodeId) -> Option<Vec<u8>> {
        fs::read(self.peer_path(node_id)).ok()
    }

    pub fn save_authority(&self, domain: &str, cert: &[u8], keypair: &Keypair) -> Result<()> {
        fs::write(self.root.join("mine").join(CA_CERT), cert)
            .context("failed to write CA certificate")?;
        fs::write(self.root.join(CA_DOMAIN), domain).context("failed to write CA domain")?;
        write_key(&self.root.join("private").join(CA_KEY), keypair)
    }

    /// Returns `(domain, ca certificate, ca key)`.
    pub fn load_authority(&self) -> Result<(String, Vec<u8>, Keypair)> {
        let domain = fs::read_to_string(self.root.join(CA_DOMAIN))
            .context("no CA in this directory, run ca-init first")?;
        let cert = fs::read(self.root.join("mine").join(CA_CERT))
            .context("failed to read CA certificate")?;
        let keypair = read_key(&self.root.join("private").join(CA_KEY))?;
        Ok((domain.trim().to_string(), cert, keypair))
    }

    fn peer_path(&self, node_id: &NodeId) -> PathBuf {
        self.root.join("others").join(format!("{}.der", node_id.to_hex()))
    }
}

fn write_key(path: &Path, keypair: &Keypair) -> Result<()> {
    fs::write(path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write {}", path.display()))
}

fn read_key(path: &Path) -> Result<Keypair> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let bytes = hex::decode(text.trim()).context("private key is not valid hex")?;
    let secret: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("private key must be 32 bytes"))?;
    Ok(Keypair::from_secret_key_bytes(&secret))
}
