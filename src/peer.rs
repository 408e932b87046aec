//! WireGuard peer provisioning
//!
//! Each encrypted tunnel gets a fresh key pair and the next address from the
//! configured IPv4 block. Addresses are handed out sequentially and are never
//! reused while the allocator lives, so the block size caps the number of
//! encrypted tunnels created over the lifetime of the process.
//!
//! Interface manipulation goes through [`PeerBackend`] so tests can swap the
//! `wg` command line for [`MemoryPeerBackend`].

use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Base64 encoded WireGuard key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// WireGuard settings handed back to the tunnel owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerConfig {
    /// Public key of the freshly generated local key pair
    pub public_key: String,
    pub private_key: String,
    /// Address of the agent side of the link
    pub server_ip: Ipv4Addr,
    /// Address assigned to the peer
    pub client_ip: Ipv4Addr,
    /// WireGuard listen port of the agent
    pub port: u16,
}

/// Operations the allocator needs from the WireGuard interface
#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn generate_key_pair(&self) -> Result<KeyPair>;

    /// Allow `peer_public_key` on the interface with `address/32`
    async fn register_peer(&self, peer_public_key: &str, address: Ipv4Addr) -> Result<()>;

    async fn deregister_peer(&self, peer_public_key: &str) -> Result<()>;
}

/// Generate a WireGuard key pair with native x25519, no `wg` binary needed
pub fn generate_wireguard_keys() -> KeyPair {
    use rand::rngs::OsRng;
    use x25519_dalek::{PublicKey, StaticSecret};

    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Check that a key is the base64 form of 32 bytes
pub fn is_valid_wireguard_key(key: &str) -> bool {
    STANDARD
        .decode(key.trim())
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

/// Drives a real interface through the `wg` command line tool
pub struct WireGuardCli {
    interface: String,
}

impl WireGuardCli {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    async fn wg(&self, args: &[&str]) -> Result<()> {
        // Killed if the caller is dropped
        let output = Command::new("wg")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TunnelError::Provisioning(format!("failed to run wg: {}", e)))?;

        if !output.status.success() {
            return Err(TunnelError::Provisioning(format!(
                "wg {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl PeerBackend for WireGuardCli {
    async fn generate_key_pair(&self) -> Result<KeyPair> {
        Ok(generate_wireguard_keys())
    }

    async fn register_peer(&self, peer_public_key: &str, address: Ipv4Addr) -> Result<()> {
        if !is_valid_wireguard_key(peer_public_key) {
            return Err(TunnelError::Provisioning(
                "peer public key is not a valid WireGuard key".to_string(),
            ));
        }

        let allowed_ips = format!("{}/32", address);
        self.wg(&[
            "set",
            &self.interface,
            "peer",
            peer_public_key,
            "allowed-ips",
            &allowed_ips,
        ])
        .await
    }

    async fn deregister_peer(&self, peer_public_key: &str) -> Result<()> {
        self.wg(&["set", &self.interface, "peer", peer_public_key, "remove"])
            .await
    }
}

/// In-memory peer backend for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryPeerBackend {
    peers: parking_lot::Mutex<HashMap<String, Ipv4Addr>>,
    fail_keygen: AtomicBool,
    fail_register: AtomicBool,
    fail_deregister: AtomicBool,
}

impl MemoryPeerBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_keygen(&self, fail: bool) {
        self.fail_keygen.store(fail, Ordering::SeqCst);
    }

    pub fn fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deregister(&self, fail: bool) {
        self.fail_deregister.store(fail, Ordering::SeqCst);
    }

    /// Address currently allowed for a peer key
    pub fn address_of(&self, peer_public_key: &str) -> Option<Ipv4Addr> {
        self.peers.lock().get(peer_public_key).copied()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerBackend for MemoryPeerBackend {
    async fn generate_key_pair(&self) -> Result<KeyPair> {
        if self.fail_keygen.load(Ordering::SeqCst) {
            return Err(TunnelError::Provisioning("key generation failed".to_string()));
        }
        Ok(generate_wireguard_keys())
    }

    async fn register_peer(&self, peer_public_key: &str, address: Ipv4Addr) -> Result<()> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(TunnelError::Provisioning("peer registration failed".to_string()));
        }
        self.peers.lock().insert(peer_public_key.to_string(), address);
        Ok(())
    }

    async fn deregister_peer(&self, peer_public_key: &str) -> Result<()> {
        if self.fail_deregister.load(Ordering::SeqCst) {
            return Err(TunnelError::Provisioning("peer removal failed".to_string()));
        }
        self.peers.lock().remove(peer_public_key);
        Ok(())
    }
}

struct AllocatorState {
    /// Next address to hand out, `None` once the 32-bit space is spent
    next: Option<Ipv4Addr>,
    /// Peer public key registered for each tunnel
    peers: HashMap<String, String>,
}

fn next_addr(addr: Ipv4Addr) -> Option<Ipv4Addr> {
    u32::from(addr).checked_add(1).map(Ipv4Addr::from)
}

/// Sequential address and key allocator for encrypted tunnels
pub struct PeerAllocator {
    network: Ipv4Net,
    server_ip: Ipv4Addr,
    listen_port: u16,
    backend: Arc<dyn PeerBackend>,
    /// Held across key generation, allocation and registration
    state: Mutex<AllocatorState>,
}

impl PeerAllocator {
    /// Create an allocator for `cidr`.
    ///
    /// The first host address of the block belongs to the agent; peers are
    /// numbered from the address after it.
    pub fn new(cidr: &str, listen_port: u16, backend: Arc<dyn PeerBackend>) -> Result<Self> {
        let network: Ipv4Net = cidr
            .parse()
            .map_err(|e| TunnelError::InvalidRequest(format!("invalid CIDR {}: {}", cidr, e)))?;

        let server_ip = next_addr(network.network())
            .filter(|ip| network.contains(ip))
            .ok_or_else(|| {
                TunnelError::InvalidRequest(format!("network {} has no room for the server address", cidr))
            })?;

        Ok(Self {
            network,
            server_ip,
            listen_port,
            backend,
            state: Mutex::new(AllocatorState {
                next: next_addr(server_ip),
                peers: HashMap::new(),
            }),
        })
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    /// Provision a peer for `tunnel_id`.
    ///
    /// The address cursor only advances once registration succeeded. A peer key
    /// can back at most one live tunnel.
    ///
    /// Not cancellation safe: if the future is dropped while the backend call is
    /// in flight the interface state is unknown. Callers that may be cancelled
    /// should run it in a spawned task.
    pub async fn provision_peer(&self, tunnel_id: &str, peer_public_key: &str) -> Result<PeerConfig> {
        let mut state = self.state.lock().await;

        if state.peers.contains_key(tunnel_id) {
            return Err(TunnelError::Conflict(format!(
                "peer for tunnel {} already provisioned",
                tunnel_id
            )));
        }
        if state.peers.values().any(|key| key == peer_public_key) {
            return Err(TunnelError::Conflict(
                "peer public key is already in use by another tunnel".to_string(),
            ));
        }

        let address = state
            .next
            .filter(|ip| self.network.contains(ip))
            .ok_or_else(|| TunnelError::AddressSpaceExhausted {
                cidr: self.network.to_string(),
            })?;

        let keys = self.backend.generate_key_pair().await?;
        self.backend.register_peer(peer_public_key, address).await?;

        state.next = next_addr(address);
        state
            .peers
            .insert(tunnel_id.to_string(), peer_public_key.to_string());

        info!(tunnel_id, peer_ip = %address, "Added WireGuard peer");

        Ok(PeerConfig {
            public_key: keys.public_key,
            private_key: keys.private_key,
            server_ip: self.server_ip,
            client_ip: address,
            port: self.listen_port,
        })
    }

    /// Deregister the peer of `tunnel_id` from the interface.
    ///
    /// The bookkeeping entry is dropped even when the backend call fails.
    pub async fn release_peer(&self, tunnel_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let public_key = state
            .peers
            .remove(tunnel_id)
            .ok_or_else(|| TunnelError::NotFound(format!("no peer for tunnel {}", tunnel_id)))?;

        self.backend.deregister_peer(&public_key).await?;
        debug!(tunnel_id, "Removed WireGuard peer");
        Ok(())
    }

    /// Number of peers currently registered
    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }
}
