//! Raw TCP forwarding by listening port
//!
//! Each accepted connection is routed by the local port it arrived on. Bytes are
//! pumped in both directions with fixed-size buffers; as soon as either
//! direction ends, both sockets are closed.

use crate::error::TunnelError;
use crate::registry::TunnelRegistry;
use crate::routes::RouteTable;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Size of each direction's copy buffer
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Interval for polling drain status during shutdown (in milliseconds)
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Counts a live connection pair for as long as it exists
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Public TCP listener that forwards connections to tunnels by port
pub struct TcpProxyServer {
    listener: TcpListener,
    routes: Arc<RouteTable>,
    registry: Arc<TunnelRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    drain_timeout: Duration,
    active: Arc<AtomicUsize>,
}

impl TcpProxyServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        routes: Arc<RouteTable>,
        registry: Arc<TunnelRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            routes,
            registry,
            shutdown_rx,
            drain_timeout: Duration::from_secs(30),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// How long open connections may keep running after shutdown
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared counter of open connection pairs
    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Tunnel TCP proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let (force_close_tx, force_close_rx) = watch::channel(false);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let port = match stream.local_addr() {
                                Ok(local) => local.port(),
                                Err(e) => {
                                    debug!(addr = %addr, error = %e, "Failed to read local address");
                                    continue;
                                }
                            };
                            let routes = Arc::clone(&self.routes);
                            let registry = Arc::clone(&self.registry);
                            let force_close = force_close_rx.clone();
                            let guard = ActiveGuard::new(&self.active);

                            tokio::spawn(async move {
                                handle_connection(stream, addr, port, routes, registry, force_close).await;
                                drop(guard);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept TCP connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("TCP proxy shutting down");
                        break;
                    }
                }
            }
        }

        // Stop listening before draining
        let active = Arc::clone(&self.active);
        let drain_timeout = self.drain_timeout;
        drop(self);

        drain(&active, drain_timeout, &force_close_tx).await;
        Ok(())
    }
}

/// Wait for open pairs to finish, then force-close the rest
async fn drain(active: &AtomicUsize, timeout: Duration, force_close_tx: &watch::Sender<bool>) {
    let start = Instant::now();
    while active.load(Ordering::SeqCst) > 0 && start.elapsed() < timeout {
        tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
    }

    let remaining = active.load(Ordering::SeqCst);
    if remaining > 0 {
        warn!(remaining, "Drain timeout reached, closing TCP connections");
        let _ = force_close_tx.send(true);
    }
}

async fn handle_connection(
    client: TcpStream,
    client_addr: SocketAddr,
    port: u16,
    routes: Arc<RouteTable>,
    registry: Arc<TunnelRegistry>,
    mut force_close: watch::Receiver<bool>,
) {
    let target = match routes.lookup_by_port(port) {
        Ok(target) => target,
        Err(e) => {
            debug!(port, client = %client_addr, error = %e, "No tunnel found for port");
            return;
        }
    };

    registry.update_last_activity(&target.tunnel_id);

    let backend = match TcpStream::connect(target.addr()).await {
        Ok(stream) => stream,
        Err(e) => {
            let err = TunnelError::BackendUnreachable {
                addr: target.addr().to_string(),
                reason: e.to_string(),
            };
            error!(tunnel_id = %target.tunnel_id, error = %err, "Failed to connect to backend");
            return;
        }
    };

    let _ = client.set_nodelay(true);
    let _ = backend.set_nodelay(true);

    tokio::select! {
        (to_backend, to_client) = pump(client, backend) => {
            debug!(
                tunnel_id = %target.tunnel_id,
                client = %client_addr,
                to_backend,
                to_client,
                "TCP connection closed"
            );
        }
        _ = force_close.wait_for(|closed| *closed) => {
            debug!(tunnel_id = %target.tunnel_id, client = %client_addr, "TCP connection closed on shutdown");
        }
    }
}

/// Copy bytes between two streams until either direction ends.
///
/// Returns the byte counts `(a_to_b, b_to_a)`. Both write halves are shut
/// down before returning.
pub async fn pump<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let result = tokio::select! {
        r = copy_half(&mut a_read, &mut b_write, &mut a_to_b) => r,
        r = copy_half(&mut b_read, &mut a_write, &mut b_to_a) => r,
    };
    if let Err(e) = result {
        debug!(error = %e, "TCP pump ended with error");
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    (a_to_b, b_to_a)
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}
