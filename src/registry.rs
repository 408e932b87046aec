//! Tunnel registry: identity, capacity and activity tracking
//!
//! Creating an encrypted tunnel awaits peer provisioning, which must not happen
//! under the registry lock. A create therefore reserves its identifier first
//! (counted against capacity), provisions the peer, and then commits. The
//! capacity and uniqueness checks run together with the reservation, so two
//! concurrent creates can never both pass them.

use crate::error::{Result, TunnelError};
use crate::peer::{PeerAllocator, PeerConfig};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info};

/// A live tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelRecord {
    pub id: String,
    pub hostname: String,
    pub target_port: u16,
    pub created_at: DateTime<Utc>,
    /// Never moves backwards
    pub last_active: DateTime<Utc>,
    pub peer: Option<PeerConfig>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Tunnels {
    records: HashMap<String, TunnelRecord>,
    /// Identifiers with a create in flight
    pending: HashSet<String>,
}

impl Tunnels {
    fn occupied(&self) -> usize {
        self.records.len() + self.pending.len()
    }
}

/// Releases a pending reservation unless the create committed
struct Reservation<'a> {
    tunnels: &'a RwLock<Tunnels>,
    id: String,
    committed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.tunnels.write().pending.remove(&self.id);
        }
    }
}

/// Registry of live tunnels
pub struct TunnelRegistry {
    tunnels: RwLock<Tunnels>,
    max_tunnels: usize,
    allocator: Arc<PeerAllocator>,
}

impl TunnelRegistry {
    pub fn new(max_tunnels: usize, allocator: Arc<PeerAllocator>) -> Self {
        Self {
            tunnels: RwLock::new(Tunnels::default()),
            max_tunnels,
            allocator,
        }
    }

    pub fn max_tunnels(&self) -> usize {
        self.max_tunnels
    }

    /// Create a tunnel, provisioning a WireGuard peer when a key is given.
    ///
    /// A provisioning failure aborts the create and leaves no record behind.
    pub async fn create_tunnel(
        &self,
        id: &str,
        hostname: &str,
        target_port: u16,
        peer_public_key: Option<&str>,
        metadata: HashMap<String, String>,
    ) -> Result<TunnelRecord> {
        let mut reservation = self.reserve(id)?;

        let peer = match peer_public_key.filter(|key| !key.is_empty()) {
            Some(key) => match self.allocator.provision_peer(id, key).await {
                Ok(config) => Some(config),
                Err(e) => {
                    error!(tunnel_id = id, error = %e, "Failed to setup WireGuard peer");
                    return Err(e);
                }
            },
            None => None,
        };

        let now = Utc::now();
        let record = TunnelRecord {
            id: id.to_string(),
            hostname: hostname.to_string(),
            target_port,
            created_at: now,
            last_active: now,
            peer,
            metadata,
        };

        {
            let mut tunnels = self.tunnels.write();
            tunnels.pending.remove(id);
            tunnels.records.insert(id.to_string(), record.clone());
        }
        reservation.committed = true;

        info!(
            tunnel_id = id,
            hostname,
            target_port,
            wireguard = record.peer.is_some(),
            "Created new tunnel"
        );

        Ok(record)
    }

    fn reserve(&self, id: &str) -> Result<Reservation<'_>> {
        let mut tunnels = self.tunnels.write();

        if tunnels.occupied() >= self.max_tunnels {
            return Err(TunnelError::CapacityExceeded {
                max: self.max_tunnels,
            });
        }

        if tunnels.records.contains_key(id) || tunnels.pending.contains(id) {
            return Err(TunnelError::Conflict(format!(
                "tunnel with ID {} already exists",
                id
            )));
        }

        tunnels.pending.insert(id.to_string());

        Ok(Reservation {
            tunnels: &self.tunnels,
            id: id.to_string(),
            committed: false,
        })
    }

    /// Release a tunnel's peer, then remove its record.
    ///
    /// Peer release failures are logged; the record is removed regardless.
    pub async fn remove_tunnel(&self, id: &str) -> Result<TunnelRecord> {
        if self.get_tunnel(id)?.peer.is_some() {
            if let Err(e) = self.allocator.release_peer(id).await {
                error!(tunnel_id = id, error = %e, "Failed to remove WireGuard peer");
            }
        }

        let record = self
            .tunnels
            .write()
            .records
            .remove(id)
            .ok_or_else(|| TunnelError::NotFound(format!("tunnel with ID {} not found", id)))?;

        info!(tunnel_id = id, "Removed tunnel");
        Ok(record)
    }

    pub fn get_tunnel(&self, id: &str) -> Result<TunnelRecord> {
        self.tunnels
            .read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(format!("tunnel with ID {} not found", id)))
    }

    /// First tunnel with a matching hostname (linear scan)
    pub fn get_tunnel_by_hostname(&self, hostname: &str) -> Result<TunnelRecord> {
        self.tunnels
            .read()
            .records
            .values()
            .find(|record| record.hostname == hostname)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(format!("no tunnel found for hostname {}", hostname)))
    }

    /// Mark a tunnel as active now; unknown identifiers are ignored
    pub fn update_last_activity(&self, id: &str) {
        if let Some(record) = self.tunnels.write().records.get_mut(id) {
            let now = Utc::now();
            if now > record.last_active {
                record.last_active = now;
            }
        }
    }

    pub fn list_tunnels(&self) -> Vec<TunnelRecord> {
        self.tunnels.read().records.values().cloned().collect()
    }

    /// Number of committed tunnels
    pub fn count(&self) -> usize {
        self.tunnels.read().records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{generate_wireguard_keys, MemoryPeerBackend};
    use std::time::Duration;

    fn registry(max: usize) -> (TunnelRegistry, Arc<MemoryPeerBackend>) {
        let backend = MemoryPeerBackend::new();
        let allocator = Arc::new(PeerAllocator::new("10.10.0.0/16", 51820, backend.clone()).unwrap());
        (TunnelRegistry::new(max, allocator), backend)
    }

    async fn create(registry: &TunnelRegistry, id: &str) -> Result<TunnelRecord> {
        registry
            .create_tunnel(id, &format!("{}.example.com", id), 8080, None, HashMap::new())
            .await
    }

    #[tokio::test]
    async fn test_create_tunnel() {
        let (registry, _) = registry(2);

        let mut metadata = HashMap::new();
        metadata.insert("env".to_string(), "test".to_string());

        let record = registry
            .create_tunnel("test-1", "test1.example.com", 8080, None, metadata)
            .await
            .unwrap();

        assert_eq!(record.id, "test-1");
        assert_eq!(record.hostname, "test1.example.com");
        assert_eq!(record.target_port, 8080);
        assert_eq!(record.metadata.get("env").map(String::as_str), Some("test"));
        assert_eq!(record.created_at, record.last_active);
        assert!(record.peer.is_none());
    }

    #[tokio::test]
    async fn test_capacity_scenario() {
        let (registry, _) = registry(1);

        create(&registry, "a").await.unwrap();
        assert!(matches!(
            create(&registry, "b").await,
            Err(TunnelError::CapacityExceeded { max: 1 })
        ));

        registry.remove_tunnel("a").await.unwrap();
        create(&registry, "b").await.unwrap();
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_keeps_existing() {
        let (registry, _) = registry(10);

        let original = create(&registry, "a").await.unwrap();
        let err = registry
            .create_tunnel("a", "other.example.com", 9090, None, HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Conflict(_)));
        assert_eq!(registry.get_tunnel("a").unwrap(), original);
    }

    #[tokio::test]
    async fn test_wireguard_tunnel() {
        let (registry, backend) = registry(10);
        let peer_key = generate_wireguard_keys().public_key;

        let record = registry
            .create_tunnel("wg", "wg.example.com", 8080, Some(&peer_key), HashMap::new())
            .await
            .unwrap();

        let peer = record.peer.unwrap();
        assert_eq!(peer.client_ip.to_string(), "10.10.0.2");
        assert_eq!(backend.address_of(&peer_key), Some(peer.client_ip));

        registry.remove_tunnel("wg").await.unwrap();
        assert_eq!(backend.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_peer_key_means_plain_tunnel() {
        let (registry, backend) = registry(10);

        let record = registry
            .create_tunnel("a", "a.example.com", 8080, Some(""), HashMap::new())
            .await
            .unwrap();

        assert!(record.peer.is_none());
        assert_eq!(backend.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_provisioning_failure_aborts_create() {
        let (registry, backend) = registry(1);
        backend.fail_register(true);

        let err = registry
            .create_tunnel("a", "a.example.com", 8080, Some("key"), HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Provisioning(_)));
        assert!(registry.get_tunnel("a").is_err());

        // The reservation must be gone, so capacity is available again
        backend.fail_register(false);
        create(&registry, "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_succeeds_when_peer_release_fails() {
        let (registry, backend) = registry(10);

        registry
            .create_tunnel("a", "a.example.com", 8080, Some("key"), HashMap::new())
            .await
            .unwrap();
        backend.fail_deregister(true);

        registry.remove_tunnel("a").await.unwrap();
        assert!(registry.get_tunnel("a").is_err());
    }

    #[tokio::test]
    async fn test_remove_missing() {
        let (registry, _) = registry(10);
        assert!(matches!(
            registry.remove_tunnel("missing").await,
            Err(TunnelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_by_hostname() {
        let (registry, _) = registry(10);
        create(&registry, "test-1").await.unwrap();
        create(&registry, "test-2").await.unwrap();

        let record = registry.get_tunnel_by_hostname("test-2.example.com").unwrap();
        assert_eq!(record.id, "test-2");
        assert!(registry.get_tunnel_by_hostname("missing.example.com").is_err());
    }

    #[tokio::test]
    async fn test_update_last_activity() {
        let (registry, _) = registry(10);
        let record = create(&registry, "a").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.update_last_activity("a");
        registry.update_last_activity("missing");

        let updated = registry.get_tunnel("a").unwrap();
        assert!(updated.last_active > record.last_active);
        assert_eq!(updated.created_at, record.created_at);
    }

    #[tokio::test]
    async fn test_list_tunnels() {
        let (registry, _) = registry(10);
        for id in ["test-1", "test-2", "test-3"] {
            create(&registry, id).await.unwrap();
        }

        let mut ids: Vec<_> = registry.list_tunnels().into_iter().map(|t| t.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["test-1", "test-2", "test-3"]);
    }

    #[tokio::test]
    async fn test_concurrent_creates_respect_capacity() {
        let (registry, _) = registry(5);
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for i in 0..20 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .create_tunnel(&format!("t{}", i), &format!("t{}.example.com", i), 8080, Some("key"), HashMap::new())
                    .await
                    .is_ok()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 5);
        assert_eq!(registry.count(), 5);
    }
}
