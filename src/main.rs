use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tunnelgate::api::{ApiServer, PKG_NAME, VERSION};
use tunnelgate::config::{Config, ProcessEnv};
use tunnelgate::peer::{PeerAllocator, WireGuardCli};
use tunnelgate::proxy::HttpProxyServer;
use tunnelgate::registry::TunnelRegistry;
use tunnelgate::routes::RouteTable;
use tunnelgate::service::{ServiceSettings, TunnelService};
use tunnelgate::tcp::TcpProxyServer;
use tunnelgate::tls;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (file is optional, environment overrides it)
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref(), &ProcessEnv)?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from defaults and environment"),
    }

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Tunnel lifecycle: allocator -> registry -> routes -> service
    let allocator = Arc::new(PeerAllocator::new(
        &config.wireguard.cidr,
        config.wireguard.listen_port,
        Arc::new(WireGuardCli::new(config.wireguard.interface.clone())),
    )?);
    let registry = Arc::new(TunnelRegistry::new(config.tunnels.max_tunnels, allocator));
    let routes = Arc::new(RouteTable::new());
    let service = Arc::new(TunnelService::new(
        Arc::clone(&registry),
        Arc::clone(&routes),
        ServiceSettings {
            backend_ip: config.backend_ip()?,
            http_port: config.server.http_port,
            tcp_port: config.server.tcp_port(),
            api_port: config.api.port,
            bind_ip: config.server.bind.parse().ok(),
            tls: config.server.tls_enabled(),
        },
    ));

    let tls_acceptor = tls::acceptor_from_config(&config.server)?;

    let http_addr = socket_addr(&config.server.bind, config.server.http_port)?;
    let mut http_proxy = HttpProxyServer::bind(
        http_addr,
        Arc::clone(&routes),
        Arc::clone(&registry),
        shutdown_rx.clone(),
    )
    .await
    .map_err(|e| {
        error!(addr = %http_addr, error = %e, "Failed to bind HTTP listener");
        e
    })?;
    if let Some(acceptor) = tls_acceptor {
        http_proxy = http_proxy.with_tls(acceptor);
    }

    let tcp_addr = socket_addr(&config.server.bind, config.server.tcp_port())?;
    let tcp_proxy = TcpProxyServer::bind(
        tcp_addr,
        Arc::clone(&routes),
        Arc::clone(&registry),
        shutdown_rx.clone(),
    )
    .await
    .map_err(|e| {
        error!(addr = %tcp_addr, error = %e, "Failed to bind TCP listener");
        e
    })?
    .with_drain_timeout(config.server.shutdown_timeout());

    let api_addr = socket_addr(&config.api.host, config.api.port)?;
    let api_server = ApiServer::bind(
        api_addr,
        Arc::clone(&service),
        shutdown_rx.clone(),
        &config.api.base_path,
    )
    .await
    .map_err(|e| {
        error!(addr = %api_addr, error = %e, "Failed to bind management API");
        e
    })?;

    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_proxy.run().await {
            error!(error = %e, "HTTP proxy server error");
        }
    });
    let tcp_handle = tokio::spawn(async move {
        if let Err(e) = tcp_proxy.run().await {
            error!(error = %e, "TCP proxy server error");
        }
    });
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "Management API error");
        }
    });

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let timeout = config.server.shutdown_timeout();
    if tokio::time::timeout(timeout, async {
        let _ = http_handle.await;
        let _ = tcp_handle.await;
        let _ = api_handle.await;
    })
    .await
    .is_err()
    {
        error!(timeout_secs = timeout.as_secs(), "Servers did not stop in time");
    }

    info!(tunnels = service.status().num_tunnels, "Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn socket_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addr = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    addr.parse().map_err(|e| {
        error!(host, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", host, port, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tunnel agent");

    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        tcp_port = config.server.tcp_port(),
        tls = config.server.tls_enabled(),
        api = %format!("{}:{}{}", config.api.host, config.api.port, config.api.base_path),
        "Listeners"
    );

    info!(
        max_tunnels = config.tunnels.max_tunnels,
        backend_host = %config.tunnels.backend_host,
        wg_interface = %config.wireguard.interface,
        wg_cidr = %config.wireguard.cidr,
        "Tunnel settings"
    );
}
