use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the agent
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Management API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Tunnel limits and addressing
    #[serde(default)]
    pub tunnels: TunnelsConfig,

    /// WireGuard interface used for encrypted tunnels
    #[serde(default)]
    pub wireguard: WireGuardConfig,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the public listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP(S) listener port (default: 443)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Raw TCP listener port (default: http_port + 1)
    pub tcp_port: Option<u16>,

    /// Enable TLS on the HTTP listener. If true without cert/key, generates self-signed.
    #[serde(default)]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// How long to wait for servers and open connections on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls || self.has_tls_files()
    }

    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
            .unwrap_or_else(|| self.http_port.saturating_add(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            tcp_port: None,
            tls: false,
            tls_cert: None,
            tls_key: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Path prefix for management endpoints (default: /api)
    #[serde(default = "default_api_base_path")]
    pub base_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_bind_address(),
            port: default_api_port(),
            base_path: default_api_base_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunnelsConfig {
    /// Maximum number of live tunnels
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: usize,

    /// Target IP for tunnels that are not backed by a WireGuard peer
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
}

impl Default for TunnelsConfig {
    fn default() -> Self {
        Self {
            max_tunnels: default_max_tunnels(),
            backend_host: default_backend_host(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WireGuardConfig {
    #[serde(default = "default_wg_interface")]
    pub interface: String,

    /// Address block peers are numbered from
    #[serde(default = "default_wg_cidr")]
    pub cidr: String,

    #[serde(default = "default_wg_listen_port")]
    pub listen_port: u16,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            interface: default_wg_interface(),
            cidr: default_wg_cidr(),
            listen_port: default_wg_listen_port(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    443
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_api_port() -> u16 {
    8080
}

fn default_api_base_path() -> String {
    "/api".to_string()
}

fn default_max_tunnels() -> usize {
    100
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_wg_interface() -> String {
    "wg0".to_string()
}

fn default_wg_cidr() -> String {
    "10.10.0.0/16".to_string()
}

fn default_wg_listen_port() -> u16 {
    51820
}

/// Source of environment overrides, abstracted so tests don't touch the process env
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl<F> EnvSource for F
where
    F: Fn(&str) -> Option<String>,
{
    fn var(&self, key: &str) -> Option<String> {
        self(key)
    }
}

fn override_string(env: &impl EnvSource, key: &str, target: &mut String) {
    if let Some(value) = env.var(key) {
        *target = value;
    }
}

fn override_parsed<T: std::str::FromStr>(env: &impl EnvSource, key: &str, target: &mut T) {
    if let Some(value) = env.var(key).and_then(|v| v.trim().parse().ok()) {
        *target = value;
    }
}

impl Config {
    /// Load from an optional TOML file, apply environment overrides and validate
    pub fn load(path: Option<&Path>, env: &impl EnvSource) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
                })?;
                toml::from_str(&content)?
            }
            None => Config::default(),
        };

        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    /// Override settings from environment variables.
    ///
    /// Values that fail to parse are ignored and the current setting is kept.
    pub fn apply_env(&mut self, env: &impl EnvSource) {
        override_string(env, "PUBLIC_HOST", &mut self.server.bind);
        override_parsed(env, "PUBLIC_PORT", &mut self.server.http_port);
        if let Some(port) = env.var("TCP_PORT").and_then(|v| v.trim().parse().ok()) {
            self.server.tcp_port = Some(port);
        }
        override_parsed(env, "TLS_ENABLED", &mut self.server.tls);
        if let Some(path) = env.var("TLS_CERT_PATH").filter(|p| !p.is_empty()) {
            self.server.tls_cert = Some(path);
        }
        if let Some(path) = env.var("TLS_KEY_PATH").filter(|p| !p.is_empty()) {
            self.server.tls_key = Some(path);
        }
        override_parsed(env, "SHUTDOWN_TIMEOUT_SECONDS", &mut self.server.shutdown_timeout_secs);

        override_string(env, "API_HOST", &mut self.api.host);
        override_parsed(env, "API_PORT", &mut self.api.port);
        override_string(env, "API_BASE_PATH", &mut self.api.base_path);

        override_parsed(env, "MAX_TUNNELS", &mut self.tunnels.max_tunnels);
        override_string(env, "TUNNEL_BACKEND_HOST", &mut self.tunnels.backend_host);

        override_string(env, "WG_INTERFACE", &mut self.wireguard.interface);
        override_string(env, "WG_CIDR", &mut self.wireguard.cidr);
        override_parsed(env, "WG_LISTEN_PORT", &mut self.wireguard.listen_port);

        override_string(env, "LOG_LEVEL", &mut self.log_level);
    }

    /// Target IP for tunnels without a WireGuard peer
    pub fn backend_ip(&self) -> anyhow::Result<IpAddr> {
        self.tunnels
            .backend_host
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid backend_host {}: {}", self.tunnels.backend_host, e))
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be greater than 0".to_string());
        }
        if self.server.tcp_port() == 0 {
            errors.push("server.tcp_port must be greater than 0".to_string());
        }
        if self.server.http_port == self.server.tcp_port() {
            errors.push(format!(
                "server.http_port and server.tcp_port must differ (both {})",
                self.server.http_port
            ));
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("both TLS certificate and key must be provided".to_string());
        }

        if self.api.port == 0 {
            errors.push("api.port must be greater than 0".to_string());
        }
        if !self.api.base_path.starts_with('/') {
            errors.push(format!("api.base_path must start with '/': {}", self.api.base_path));
        }

        if self.tunnels.max_tunnels == 0 {
            errors.push("tunnels.max_tunnels must be at least 1".to_string());
        }
        if let Err(e) = self.backend_ip() {
            errors.push(e.to_string());
        }

        match self.wireguard.cidr.parse::<ipnet::Ipv4Net>() {
            Ok(net) if net.prefix_len() > 30 => {
                errors.push(format!("wireguard.cidr {} is too small for any peer", net));
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("invalid wireguard.cidr {}: {}", self.wireguard.cidr, e)),
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
