//! Routing table mapping public hostnames and ports to tunnel targets
//!
//! Lookups happen on every proxied request or accepted connection, so the table
//! sits behind a reader/writer lock: many concurrent readers, writers only hold
//! the lock while mutating the maps.

use crate::error::{Result, TunnelError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

/// Resolved backend for a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Identifier of the tunnel this target belongs to
    pub tunnel_id: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl Target {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

#[derive(Debug, Default)]
struct Routes {
    by_host: HashMap<String, Target>,
    by_port: HashMap<u16, Target>,
}

/// Hostname and port routing table
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Routes>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a route for `tunnel_id`.
    ///
    /// The hostname mapping is always installed; the port mapping only when
    /// `port > 0`. Both keys are checked before either is inserted, so a
    /// conflict on either leaves the table untouched.
    pub fn add_route(&self, tunnel_id: &str, hostname: &str, ip: IpAddr, port: u16) -> Result<()> {
        let mut routes = self.routes.write();

        if let Some(existing) = routes.by_host.get(hostname) {
            warn!(
                tunnel_id,
                hostname,
                owner = %existing.tunnel_id,
                "Hostname already routed"
            );
            return Err(TunnelError::Conflict(format!(
                "hostname {} is already in use",
                hostname
            )));
        }

        if port > 0 {
            if let Some(existing) = routes.by_port.get(&port) {
                warn!(tunnel_id, port, owner = %existing.tunnel_id, "Port already routed");
                return Err(TunnelError::Conflict(format!("port {} is already in use", port)));
            }
        }

        let target = Target {
            tunnel_id: tunnel_id.to_string(),
            ip,
            port,
        };

        if port > 0 {
            routes.by_port.insert(port, target.clone());
        }
        routes.by_host.insert(hostname.to_string(), target);

        debug!(tunnel_id, hostname, %ip, port, "Route installed");
        Ok(())
    }

    /// Remove every hostname and port entry owned by `tunnel_id`.
    ///
    /// Removing an unknown identifier is a no-op.
    pub fn remove_route(&self, tunnel_id: &str) {
        let mut routes = self.routes.write();
        let before = routes.by_host.len() + routes.by_port.len();

        routes.by_host.retain(|_, target| target.tunnel_id != tunnel_id);
        routes.by_port.retain(|_, target| target.tunnel_id != tunnel_id);

        let removed = before - (routes.by_host.len() + routes.by_port.len());
        if removed > 0 {
            debug!(tunnel_id, removed, "Routes removed");
        }
    }

    pub fn lookup_by_host(&self, hostname: &str) -> Result<Target> {
        self.routes
            .read()
            .by_host
            .get(hostname)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(format!("no tunnel found for hostname {}", hostname)))
    }

    pub fn lookup_by_port(&self, port: u16) -> Result<Target> {
        self.routes
            .read()
            .by_port
            .get(&port)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(format!("no tunnel found for port {}", port)))
    }

    /// Snapshot of the hostname routes
    pub fn list_routes(&self) -> HashMap<String, Target> {
        self.routes.read().by_host.clone()
    }

    /// Number of hostname routes
    pub fn len(&self) -> usize {
        self.routes.read().by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
