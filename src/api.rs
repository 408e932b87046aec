//! Management API for creating, removing and listing tunnels

use crate::error::TunnelError;
use crate::peer::PeerConfig;
use crate::service::{CreateTunnel, TunnelService, TunnelSummary};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the agent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body the API will read
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct CreateTunnelRequest {
    pub tunnel_id: String,
    pub hostname: String,
    pub target_port: u16,
    #[serde(default)]
    pub wireguard_public_key: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTunnelResponse {
    pub tunnel_id: String,
    pub public_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wireguard_config: Option<PeerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveTunnelRequest {
    pub tunnel_id: String,
}

#[derive(Debug, Serialize)]
pub struct RemoveTunnelResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime: String,
    pub num_tunnels: usize,
    pub max_tunnels: usize,
}

#[derive(Debug, Serialize)]
pub struct TunnelListResponse {
    pub tunnels: Vec<TunnelSummary>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => {
            error!(error = %e, "Failed to serialize API response");
            response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn error_response(status: StatusCode, error: impl Into<String>, details: Option<String>) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ApiErrorResponse {
            error: error.into(),
            code: status.as_u16(),
            details,
        },
    )
}

fn tunnel_error_response(err: &TunnelError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    let error = status.canonical_reason().unwrap_or("Error");
    error_response(status, error, Some(err.to_string()))
}

/// Render an uptime as e.g. `1h2m3s`
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Management API server
pub struct ApiServer {
    listener: TcpListener,
    service: Arc<TunnelService>,
    shutdown_rx: watch::Receiver<bool>,
    base_path: Arc<String>,
}

impl ApiServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        service: Arc<TunnelService>,
        shutdown_rx: watch::Receiver<bool>,
        base_path: &str,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            service,
            shutdown_rx,
            base_path: Arc::new(base_path.trim_end_matches('/').to_string()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, base_path = %self.base_path, "Management API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let service = Arc::clone(&self.service);
                            let base_path = Arc::clone(&self.base_path);

                            tokio::spawn(async move {
                                if let Err(e) = serve_api_connection(stream, service, base_path).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Management API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_api_connection<S>(
    stream: S,
    service: Arc<TunnelService>,
    base_path: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req| {
        let service = Arc::clone(&service);
        let base_path = Arc::clone(&base_path);
        async move { handle_api_request(req, service, base_path).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, svc)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

async fn handle_api_request(
    req: Request<Incoming>,
    service: Arc<TunnelService>,
    base_path: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "API request");

    if path == "/health" {
        return Ok(match method {
            Method::GET => response(StatusCode::OK, "ok"),
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed", None),
        });
    }

    let endpoint = match path.strip_prefix(base_path.as_str()) {
        Some(endpoint) => endpoint,
        None => return Ok(error_response(StatusCode::NOT_FOUND, "Not found", None)),
    };

    let response = match (endpoint, method) {
        ("/new-tunnel", Method::POST) => create_tunnel(req, service).await,
        ("/remove-tunnel", Method::POST) => remove_tunnel(req, service).await,
        ("/status", Method::GET) => status(&service),
        ("/tunnels", Method::GET) => list_tunnels(&service),
        ("/new-tunnel" | "/remove-tunnel" | "/status" | "/tunnels", _) => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed", None)
        }
        _ => error_response(StatusCode::NOT_FOUND, "Not found", None),
    };

    Ok(response)
}

/// Read and decode a JSON body, producing a 400 response on failure
async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| {
            error_response(StatusCode::BAD_REQUEST, "Invalid request body", Some(e.to_string()))
        })?
        .to_bytes();

    serde_json::from_slice(&body).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, "Invalid request body", Some(e.to_string()))
    })
}

/// Run a lifecycle transition on its own task so a dropped client connection
/// cannot cancel it halfway through.
async fn run_detached<T, F>(operation: F) -> Result<T, TunnelError>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T, TunnelError>> + Send + 'static,
{
    tokio::spawn(operation).await.unwrap_or_else(|e| {
        error!(error = %e, "Tunnel operation task failed");
        Err(TunnelError::Internal(e.to_string()))
    })
}

async fn create_tunnel(req: Request<Incoming>, service: Arc<TunnelService>) -> Response<Full<Bytes>> {
    let request: CreateTunnelRequest = match read_json(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    let create = CreateTunnel {
        id: request.tunnel_id,
        hostname: request.hostname,
        target_port: request.target_port,
        wireguard_public_key: request.wireguard_public_key,
        metadata: request.metadata,
    };
    let tunnel_id = create.id.clone();

    match run_detached(async move { service.create(create).await }).await {
        Ok(created) => {
            info!(tunnel_id = %created.tunnel_id, endpoint = %created.public_endpoint, "Tunnel created");
            json_response(
                StatusCode::CREATED,
                &CreateTunnelResponse {
                    tunnel_id: created.tunnel_id,
                    public_endpoint: created.public_endpoint,
                    wireguard_config: created.peer,
                },
            )
        }
        Err(e) => {
            warn!(tunnel_id, error = %e, "Failed to create tunnel");
            tunnel_error_response(&e)
        }
    }
}

async fn remove_tunnel(req: Request<Incoming>, service: Arc<TunnelService>) -> Response<Full<Bytes>> {
    let request: RemoveTunnelRequest = match read_json(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    if request.tunnel_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing tunnel_id", None);
    }

    let tunnel_id = request.tunnel_id.clone();
    match run_detached(async move { service.remove(&tunnel_id).await }).await {
        Ok(()) => {
            info!(tunnel_id = %request.tunnel_id, "Tunnel removed");
            json_response(
                StatusCode::OK,
                &RemoveTunnelResponse {
                    success: true,
                    message: Some("Tunnel removed successfully".to_string()),
                },
            )
        }
        Err(e) => {
            warn!(tunnel_id = %request.tunnel_id, error = %e, "Failed to remove tunnel");
            tunnel_error_response(&e)
        }
    }
}

fn status(service: &TunnelService) -> Response<Full<Bytes>> {
    let status = service.status();
    json_response(
        StatusCode::OK,
        &StatusResponse {
            status: "running",
            version: VERSION,
            uptime: format_uptime(status.uptime),
            num_tunnels: status.num_tunnels,
            max_tunnels: status.max_tunnels,
        },
    )
}

fn list_tunnels(service: &TunnelService) -> Response<Full<Bytes>> {
    let tunnels = service.list();
    json_response(
        StatusCode::OK,
        &TunnelListResponse {
            count: tunnels.len(),
            tunnels,
        },
    )
}
