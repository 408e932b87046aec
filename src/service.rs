//! Tunnel lifecycle over the registry and the routing table
//!
//! The registry and the routing table are separate structures with separate
//! locks. Lifecycle changes go through [`TunnelService`], which serializes
//! them and fixes the order of the two updates: a route is installed only after
//! its tunnel record is committed, and removed before the record is. Traffic
//! therefore never resolves a route whose tunnel is gone.

use crate::error::{Result, TunnelError};
use crate::peer::{is_valid_wireguard_key, PeerConfig};
use crate::registry::{TunnelRecord, TunnelRegistry};
use crate::routes::RouteTable;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Maximum hostname length (RFC 1035)
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Lowercase a hostname, drop one trailing dot and check it only uses DNS
/// characters with no empty labels
pub fn normalize_hostname(hostname: &str) -> Option<String> {
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if hostname.split('.').any(str::is_empty) {
        return None;
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }
    Some(hostname.to_ascii_lowercase())
}

/// Parameters for a new tunnel
#[derive(Debug, Clone, Default)]
pub struct CreateTunnel {
    pub id: String,
    pub hostname: String,
    pub target_port: u16,
    pub wireguard_public_key: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Result of a successful create
#[derive(Debug, Clone)]
pub struct CreatedTunnel {
    pub tunnel_id: String,
    pub public_endpoint: String,
    pub peer: Option<PeerConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelSummary {
    pub tunnel_id: String,
    pub hostname: String,
    pub target_port: u16,
    pub public_endpoint: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub wireguard: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub num_tunnels: usize,
    pub max_tunnels: usize,
    pub uptime: Duration,
}

/// Settings the service needs from the agent configuration
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Target IP for tunnels without a WireGuard peer
    pub backend_ip: IpAddr,
    /// Port of the public HTTP listener
    pub http_port: u16,
    /// Port of the public TCP listener
    pub tcp_port: u16,
    /// Port of the management API
    pub api_port: u16,
    /// Address the public listeners are bound to, when it is a single IP
    pub bind_ip: Option<IpAddr>,
    pub tls: bool,
}

impl ServiceSettings {
    /// Whether `ip:port` is one of this agent's own listeners
    fn is_own_listener(&self, ip: IpAddr, port: u16) -> bool {
        let own_port = [self.http_port, self.tcp_port, self.api_port].contains(&port);
        let own_ip = ip.is_loopback() || ip.is_unspecified() || Some(ip) == self.bind_ip;
        own_port && own_ip
    }
}

pub struct TunnelService {
    registry: Arc<TunnelRegistry>,
    routes: Arc<RouteTable>,
    settings: ServiceSettings,
    /// Serializes create and remove
    lifecycle: Mutex<()>,
    started: Instant,
}

impl TunnelService {
    pub fn new(registry: Arc<TunnelRegistry>, routes: Arc<RouteTable>, settings: ServiceSettings) -> Self {
        Self {
            registry,
            routes,
            settings,
            lifecycle: Mutex::new(()),
            started: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Create a tunnel and install its route.
    ///
    /// If the route cannot be installed the tunnel is rolled back. Plain tunnels
    /// may not target the agent's own listeners. Awaits peer provisioning, so
    /// it should not be cancelled midway.
    pub async fn create(&self, request: CreateTunnel) -> Result<CreatedTunnel> {
        if request.id.trim().is_empty() {
            return Err(TunnelError::InvalidRequest("tunnel_id is required".to_string()));
        }
        if request.target_port == 0 {
            return Err(TunnelError::InvalidRequest(
                "target_port must be greater than 0".to_string(),
            ));
        }
        let hostname = normalize_hostname(&request.hostname).ok_or_else(|| {
            TunnelError::InvalidRequest(format!("invalid hostname: {:?}", request.hostname))
        })?;
        let peer_key = request
            .wireguard_public_key
            .as_deref()
            .filter(|key| !key.is_empty());
        match peer_key {
            Some(key) if !is_valid_wireguard_key(key) => {
                return Err(TunnelError::InvalidRequest(
                    "wireguard_public_key is not a valid WireGuard key".to_string(),
                ));
            }
            Some(_) => {}
            None if self.settings.is_own_listener(self.settings.backend_ip, request.target_port) => {
                return Err(TunnelError::InvalidRequest(format!(
                    "target {}:{} is one of this agent's listeners",
                    self.settings.backend_ip, request.target_port
                )));
            }
            None => {}
        }

        let _guard = self.lifecycle.lock().await;

        let record = self
            .registry
            .create_tunnel(
                &request.id,
                &hostname,
                request.target_port,
                peer_key,
                request.metadata,
            )
            .await?;

        let ip = match &record.peer {
            Some(peer) => IpAddr::V4(peer.client_ip),
            None => self.settings.backend_ip,
        };

        if let Err(e) = self
            .routes
            .add_route(&record.id, &record.hostname, ip, record.target_port)
        {
            warn!(tunnel_id = %record.id, error = %e, "Route rejected, rolling back tunnel");
            if let Err(rollback) = self.registry.remove_tunnel(&record.id).await {
                warn!(tunnel_id = %record.id, error = %rollback, "Tunnel rollback failed");
            }
            return Err(e);
        }

        info!(
            tunnel_id = %record.id,
            hostname = %record.hostname,
            target = %ip,
            port = record.target_port,
            "Tunnel routed"
        );

        Ok(CreatedTunnel {
            public_endpoint: self.public_endpoint(&record.hostname),
            tunnel_id: record.id,
            peer: record.peer,
        })
    }

    /// Remove a tunnel: route first, then the record
    ///
    /// Like [`TunnelService::create`], this awaits peer provisioning calls and
    /// should not be cancelled midway; the management API runs it in a spawned task.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        self.registry.get_tunnel(id)?;
        self.routes.remove_route(id);
        self.registry.remove_tunnel(id).await?;
        Ok(())
    }

    pub fn list(&self) -> Vec<TunnelSummary> {
        let mut tunnels: Vec<_> = self
            .registry
            .list_tunnels()
            .into_iter()
            .map(|record| self.summary(record))
            .collect();
        tunnels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.tunnel_id.cmp(&b.tunnel_id)));
        tunnels
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            num_tunnels: self.registry.count(),
            max_tunnels: self.registry.max_tunnels(),
            uptime: self.started.elapsed(),
        }
    }

    fn summary(&self, record: TunnelRecord) -> TunnelSummary {
        TunnelSummary {
            public_endpoint: self.public_endpoint(&record.hostname),
            wireguard: record.peer.is_some(),
            tunnel_id: record.id,
            hostname: record.hostname,
            target_port: record.target_port,
            created_at: record.created_at,
            last_active: record.last_active,
            metadata: record.metadata,
        }
    }

    fn public_endpoint(&self, hostname: &str) -> String {
        let (scheme, default_port) = if self.settings.tls {
            ("https", 443)
        } else {
            ("http", 80)
        };

        if self.settings.http_port == default_port {
            format!("{}://{}", scheme, hostname)
        } else {
            format!("{}://{}:{}", scheme, hostname, self.settings.http_port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{generate_wireguard_keys, KeyPair, MemoryPeerBackend, PeerAllocator, PeerBackend};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use tokio::sync::Notify;

    fn service(max: usize) -> (TunnelService, Arc<MemoryPeerBackend>) {
        let backend = MemoryPeerBackend::new();
        let allocator = Arc::new(PeerAllocator::new("10.10.0.0/16", 51820, backend.clone()).unwrap());
        let registry = Arc::new(TunnelRegistry::new(max, allocator));
        let routes = Arc::new(RouteTable::new());
        (TunnelService::new(registry, routes, settings()), backend)
    }

    fn settings() -> ServiceSettings {
        ServiceSettings {
            backend_ip: "127.0.0.1".parse().unwrap(),
            http_port: 443,
            tcp_port: 444,
            api_port: 9090,
            bind_ip: None,
            tls: true,
        }
    }

    fn request(id: &str, hostname: &str, port: u16) -> CreateTunnel {
        CreateTunnel {
            id: id.to_string(),
            hostname: hostname.to_string(),
            target_port: port,
            ..CreateTunnel::default()
        }
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("App.Example.COM").as_deref(), Some("app.example.com"));
        assert!(normalize_hostname("").is_none());
        assert!(normalize_hostname("bad host").is_none());
        assert!(normalize_hostname(&"a".repeat(254)).is_none());
    }

    #[tokio::test]
    async fn test_create_installs_route() {
        let (service, _) = service(10);

        let created = service
            .create(request("t1", "App.Example.com", 8080))
            .await
            .unwrap();
        assert_eq!(created.tunnel_id, "t1");
        assert_eq!(created.public_endpoint, "https://app.example.com");
        assert!(created.peer.is_none());

        let target = service.routes().lookup_by_host("app.example.com").unwrap();
        assert_eq!(target.addr(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(service.routes().lookup_by_port(8080).unwrap().tunnel_id, "t1");
    }

    #[tokio::test]
    async fn test_wireguard_tunnel_routes_to_peer_address() {
        let (service, _) = service(10);
        let mut req = request("wg", "wg.example.com", 3000);
        req.wireguard_public_key = Some(generate_wireguard_keys().public_key);

        let created = service.create(req).await.unwrap();
        let peer = created.peer.unwrap();

        let target = service.routes().lookup_by_host("wg.example.com").unwrap();
        assert_eq!(target.ip, IpAddr::V4(peer.client_ip));
    }

    #[tokio::test]
    async fn test_route_conflict_rolls_back_tunnel() {
        let (service, backend) = service(10);
        service.create(request("t1", "a.example.com", 8080)).await.unwrap();

        let mut req = request("t2", "a.example.com", 8081);
        req.wireguard_public_key = Some(generate_wireguard_keys().public_key);
        let err = service.create(req).await.unwrap_err();

        assert!(matches!(err, TunnelError::Conflict(_)));
        assert!(service.registry().get_tunnel("t2").is_err());
        assert_eq!(backend.peer_count(), 0);
        assert_eq!(service.status().num_tunnels, 1);
        assert!(service.routes().lookup_by_port(8081).is_err());
    }

    #[tokio::test]
    async fn test_remove_clears_route_and_record() {
        let (service, _) = service(10);
        service.create(request("t1", "a.example.com", 8080)).await.unwrap();

        service.remove("t1").await.unwrap();

        assert!(service.routes().lookup_by_host("a.example.com").is_err());
        assert!(service.routes().lookup_by_port(8080).is_err());
        assert!(service.registry().get_tunnel("t1").is_err());
        assert!(matches!(
            service.remove("t1").await,
            Err(TunnelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (service, _) = service(10);

        assert!(matches!(
            service.create(request("", "a.example.com", 8080)).await,
            Err(TunnelError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.create(request("t1", "a.example.com", 0)).await,
            Err(TunnelError::InvalidRequest(_))
        ));
        assert!(matches!(
            service.create(request("t1", "bad/host", 8080)).await,
            Err(TunnelError::InvalidRequest(_))
        ));
        assert_eq!(service.status().num_tunnels, 0);
    }

    #[tokio::test]
    async fn test_capacity_through_service() {
        let (service, _) = service(1);
        service.create(request("a", "a.example.com", 8080)).await.unwrap();

        assert!(matches!(
            service.create(request("b", "b.example.com", 8081)).await,
            Err(TunnelError::CapacityExceeded { .. })
        ));

        service.remove("a").await.unwrap();
        service.create(request("b", "b.example.com", 8081)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_and_status() {
        let (service, _) = service(10);
        service.create(request("a", "a.example.com", 8080)).await.unwrap();
        service.create(request("b", "b.example.com", 8081)).await.unwrap();

        let list = service.list();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|t| !t.wireguard));

        let status = service.status();
        assert_eq!(status.num_tunnels, 2);
        assert_eq!(status.max_tunnels, 10);
    }

    #[test]
    fn test_public_endpoint_includes_non_default_port() {
        let backend = MemoryPeerBackend::new();
        let allocator = Arc::new(PeerAllocator::new("10.10.0.0/16", 51820, backend).unwrap());
        let service = TunnelService::new(
            Arc::new(TunnelRegistry::new(1, allocator)),
            Arc::new(RouteTable::new()),
            ServiceSettings {
                http_port: 8000,
                tls: false,
                ..settings()
            },
        );

        assert_eq!(service.public_endpoint("a.example.com"), "http://a.example.com:8000");
    }

    #[tokio::test]
    async fn test_rejects_targets_that_loop_into_the_agent() {
        let (service, _) = service(10);

        for port in [443, 444, 9090] {
            assert!(matches!(
                service.create(request("loop", "loop.example.com", port)).await,
                Err(TunnelError::InvalidRequest(_))
            ));
        }
        assert_eq!(service.status().num_tunnels, 0);
        assert!(service.routes().is_empty());

        // A WireGuard tunnel targets its peer address, so any port is fine
        let mut req = request("wg", "wg.example.com", 444);
        req.wireguard_public_key = Some(generate_wireguard_keys().public_key);
        service.create(req).await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_ports_allowed_on_remote_backend() {
        let backend = MemoryPeerBackend::new();
        let allocator = Arc::new(PeerAllocator::new("10.10.0.0/16", 51820, backend).unwrap());
        let service = TunnelService::new(
            Arc::new(TunnelRegistry::new(10, allocator)),
            Arc::new(RouteTable::new()),
            ServiceSettings {
                backend_ip: "192.0.2.10".parse().unwrap(),
                bind_ip: Some("192.0.2.1".parse().unwrap()),
                ..settings()
            },
        );

        service.create(request("remote", "remote.example.com", 444)).await.unwrap();
    }

    #[test]
    fn test_own_listener_matches_bind_address() {
        let settings = ServiceSettings {
            bind_ip: Some("192.0.2.1".parse().unwrap()),
            ..settings()
        };
        assert!(settings.is_own_listener("192.0.2.1".parse().unwrap(), 443));
        assert!(settings.is_own_listener("0.0.0.0".parse().unwrap(), 9090));
        assert!(settings.is_own_listener("::1".parse().unwrap(), 444));
        assert!(!settings.is_own_listener("192.0.2.1".parse().unwrap(), 8080));
        assert!(!settings.is_own_listener("192.0.2.2".parse().unwrap(), 443));
    }

    #[tokio::test]
    async fn test_malformed_peer_key_is_invalid_request() {
        let (service, backend) = service(10);
        let mut req = request("wg", "wg.example.com", 3000);
        req.wireguard_public_key = Some("not-a-key".to_string());

        assert!(matches!(
            service.create(req).await,
            Err(TunnelError::InvalidRequest(_))
        ));
        assert_eq!(backend.peer_count(), 0);
        assert_eq!(service.status().num_tunnels, 0);
    }

    #[test]
    fn test_normalize_hostname_trailing_dot() {
        assert_eq!(normalize_hostname("a.example.com.").as_deref(), Some("a.example.com"));
        assert!(normalize_hostname(".").is_none());
        assert!(normalize_hostname("a.example.com..").is_none());
    }

    /// Peer backend whose calls stall until released
    #[derive(Default)]
    struct GatedPeerBackend {
        register_entered: Notify,
        register_release: Notify,
        deregister_entered: Notify,
        deregister_release: Notify,
    }

    #[async_trait]
    impl PeerBackend for GatedPeerBackend {
        async fn generate_key_pair(&self) -> Result<KeyPair> {
            Ok(generate_wireguard_keys())
        }

        async fn register_peer(&self, _peer_public_key: &str, _address: Ipv4Addr) -> Result<()> {
            self.register_entered.notify_one();
            self.register_release.notified().await;
            Ok(())
        }

        async fn deregister_peer(&self, _peer_public_key: &str) -> Result<()> {
            self.deregister_entered.notify_one();
            self.deregister_release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_route_follows_record_on_create_and_precedes_it_on_remove() {
        let backend = Arc::new(GatedPeerBackend::default());
        let allocator = Arc::new(PeerAllocator::new("10.10.0.0/16", 51820, backend.clone()).unwrap());
        let service = Arc::new(TunnelService::new(
            Arc::new(TunnelRegistry::new(10, allocator)),
            Arc::new(RouteTable::new()),
            settings(),
        ));

        let mut req = request("wg", "wg.example.com", 3000);
        req.wireguard_public_key = Some(generate_wireguard_keys().public_key);
        let create = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.create(req).await }
        });

        // Create stalled inside peer registration: no record, no route
        backend.register_entered.notified().await;
        assert!(service.registry().get_tunnel("wg").is_err());
        assert!(matches!(
            service.routes().lookup_by_host("wg.example.com"),
            Err(TunnelError::NotFound(_))
        ));

        backend.register_release.notify_one();
        create.await.unwrap().unwrap();
        assert!(service.routes().lookup_by_host("wg.example.com").is_ok());

        let remove = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.remove("wg").await }
        });

        // Remove stalled inside peer release: route already gone, record still live
        backend.deregister_entered.notified().await;
        assert!(matches!(
            service.routes().lookup_by_host("wg.example.com"),
            Err(TunnelError::NotFound(_))
        ));
        assert!(service.routes().lookup_by_port(3000).is_err());
        assert!(service.registry().get_tunnel("wg").is_ok());

        backend.deregister_release.notify_one();
        remove.await.unwrap().unwrap();
        assert!(service.registry().get_tunnel("wg").is_err());
    }
}
