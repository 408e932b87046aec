use crate::error::{json_error_response, ProxyErrorCode};
use crate::registry::TunnelRegistry;
use crate::routes::{RouteTable, Target};
use crate::service::normalize_hostname;
use crate::tcp::pump;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, UPGRADE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that apply to a single hop and are not forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Public HTTP listener that routes requests to tunnels by Host header
pub struct HttpProxyServer {
    listener: TcpListener,
    routes: Arc<RouteTable>,
    registry: Arc<TunnelRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl HttpProxyServer {
    /// Bind the listener. Binding errors surface here so the caller can treat them as fatal.
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
            tls_acceptor: None,
        })
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self) -> anyhow::Result<()> {
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.local_addr()?, protocol, "Tunnel HTTP proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let routes = Arc::clone(&self.routes);
                            let registry = Arc::clone(&self.registry);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, routes, registry, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, routes, registry, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("HTTP proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    routes: Arc<RouteTable>,
    registry: Arc<TunnelRegistry>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        let registry = Arc::clone(&registry);
        async move { handle_request(req, routes, registry, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    routes: Arc<RouteTable>,
    registry: Arc<TunnelRegistry>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let start = Instant::now();

    let (hostname, host_header) = match extract_host(&req) {
        Some(host) => host,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    let target = match routes.lookup_by_host(&hostname) {
        Ok(target) => target,
        Err(e) => {
            debug!(hostname, error = %e, "No tunnel found for host");
            return Ok(json_error_response(
                ProxyErrorCode::UnknownHost,
                "Service Unavailable",
            ));
        }
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let upgrade = is_upgrade_request(&req);

    // X-Forwarded-* are overwritten, not appended
    let headers = req.headers_mut();
    strip_hop_by_hop_headers(headers, upgrade);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_HOST, host_header.clone());
    headers.insert(hyper::header::HOST, host_header);
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    registry.update_last_activity(&target.tunnel_id);

    match forward(req, &target, upgrade).await {
        Ok(response) => {
            info!(
                tunnel_id = %target.tunnel_id,
                hostname,
                %method,
                path,
                status = response.status().as_u16(),
                duration_ms = start.elapsed().as_millis() as u64,
                request_id,
                "Handled HTTP request"
            );
            Ok(response)
        }
        Err(e) => {
            error!(
                tunnel_id = %target.tunnel_id,
                target = %target.addr(),
                %method,
                path,
                error = %e,
                "Failed to forward request"
            );
            Ok(json_error_response(
                ProxyErrorCode::BackendUnreachable,
                "Failed to connect to backend",
            ))
        }
    }
}

/// Send one request over a fresh backend connection and stream the response back.
///
/// For upgrade requests answered with `101 Switching Protocols`, both upgraded
/// connections are joined and bytes are pumped between them.
async fn forward(
    mut req: Request<Incoming>,
    target: &Target,
    upgrade: bool,
) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let stream = TcpStream::connect(target.addr()).await?;
    stream.set_nodelay(true)?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let tunnel_id = target.tunnel_id.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(tunnel_id, error = %e, "Backend connection closed with error");
        }
    });

    let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = path.parse::<Uri>()?;
    parts.version = Version::HTTP_11;

    let mut response = sender.send_request(Request::from_parts(parts, body)).await?;

    match client_upgrade {
        Some(client_upgrade) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
            let backend_upgrade = hyper::upgrade::on(&mut response);
            let tunnel_id = target.tunnel_id.clone();
            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, backend_upgrade) {
                    Ok((client, backend)) => {
                        let (to_backend, to_client) =
                            pump(TokioIo::new(client), TokioIo::new(backend)).await;
                        debug!(tunnel_id, to_backend, to_client, "Upgraded connection closed");
                    }
                    Err(e) => {
                        debug!(tunnel_id, error = %e, "Connection upgrade failed");
                    }
                }
            });
        }
        _ => strip_hop_by_hop_headers(response.headers_mut(), false),
    }

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Whether the request asks to switch protocols (e.g. WebSocket)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    has_upgrade_connection && req.headers().contains_key(UPGRADE)
}

/// Remove hop-by-hop headers, including any named in `Connection`.
///
/// With `keep_upgrade`, `Upgrade` survives and `Connection` is reduced to `upgrade`.
fn strip_hop_by_hop_headers(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP_HEADERS) {
        if keep_upgrade && name == "upgrade" {
            continue;
        }
        headers.remove(name);
    }

    if keep_upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    }
}

/// Hostname used for routing plus the Host value to pass upstream.
///
/// HTTP/2 requests may carry the authority in the URI instead of a Host header.
fn extract_host<B>(req: &Request<B>) -> Option<(String, HeaderValue)> {
    let raw = match req.headers().get(hyper::header::HOST) {
        Some(value) => value.to_str().ok()?.to_string(),
        None => req.uri().authority()?.as_str().to_string(),
    };

    let hostname = match raw.strip_prefix('[') {
        // IPv6 literal, never a tunnel hostname but still a well-formed Host
        Some(rest) => {
            let (literal, port) = rest.split_once(']')?;
            if !port.is_empty() && port.strip_prefix(':')?.parse::<u16>().is_err() {
                return None;
            }
            format!("[{}]", literal.parse::<Ipv6Addr>().ok()?)
        }
        None => normalize_hostname(raw.split(':').next()?)?,
    };
    let header = HeaderValue::from_str(&raw).ok()?;
    Some((hostname, header))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_host(host: &str) -> Request<()> {
        Request::builder()
            .uri("/path")
            .header(hyper::header::HOST, host)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_extract_host_strips_port_and_lowercases() {
        let (hostname, header) = extract_host(&request_with_host("App.Example.com:8080")).unwrap();
        assert_eq!(hostname, "app.example.com");
        assert_eq!(header, "App.Example.com:8080");
    }

    #[test]
    fn test_extract_host_rejects_garbage() {
        assert!(extract_host(&request_with_host("bad host")).is_none());
        assert!(extract_host(&request_with_host("")).is_none());
    }

    #[test]
    fn test_extract_host_from_authority() {
        let req = Request::builder()
            .uri("https://h2.example.com/path")
            .body(())
            .unwrap();
        let (hostname, _) = extract_host(&req).unwrap();
        assert_eq!(hostname, "h2.example.com");
    }

    #[test]
    fn test_extract_host_ipv6_literal() {
        let (hostname, header) = extract_host(&request_with_host("[::1]:8080")).unwrap();
        assert_eq!(hostname, "[::1]");
        assert_eq!(header, "[::1]:8080");

        assert!(extract_host(&request_with_host("[not-ipv6]")).is_none());
        assert!(extract_host(&request_with_host("[::1")).is_none());
        assert!(extract_host(&request_with_host("[::1]x")).is_none());
    }

    #[test]
    fn test_extract_host_trailing_dot() {
        let (hostname, _) = extract_host(&request_with_host("a.example.com.")).unwrap();
        assert_eq!(hostname, "a.example.com");
        let (hostname, _) = extract_host(&request_with_host("a.example.com.:8080")).unwrap();
        assert_eq!(hostname, "a.example.com");
    }

    #[test]
    fn test_strip_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, X-Internal"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-internal", HeaderValue::from_static("1"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("x-kept", HeaderValue::from_static("1"));

        strip_hop_by_hop_headers(&mut headers, false);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-internal").is_none());
        assert!(headers.get("te").is_none());
        assert_eq!(headers.get("x-kept").unwrap(), "1");
    }

    #[test]
    fn test_upgrade_headers_survive_stripping() {
        let mut req = Request::builder()
            .uri("/ws")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .header("keep-alive", "timeout=5")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        strip_hop_by_hop_headers(req.headers_mut(), true);
        assert_eq!(req.headers().get(CONNECTION).unwrap(), "upgrade");
        assert_eq!(req.headers().get(UPGRADE).unwrap(), "websocket");
        assert!(req.headers().get("keep-alive").is_none());

        let plain = request_with_host("a.example.com");
        assert!(!is_upgrade_request(&plain));
    }

    #[test]
    fn test_missing_host() {
        let req = Request::builder().uri("/path").body(()).unwrap();
        assert!(extract_host(&req).is_none());
    }
}
