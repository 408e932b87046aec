//! Error taxonomy for tunnel management and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the routing table, tunnel registry and peer allocator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    /// Duplicate hostname, port or tunnel identifier
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown tunnel identifier, hostname or port
    #[error("not found: {0}")]
    NotFound(String),

    /// The configured tunnel limit has been reached
    #[error("maximum number of tunnels ({max}) reached")]
    CapacityExceeded { max: usize },

    /// The peer address block has no addresses left
    #[error("no addresses left in peer network {cidr}")]
    AddressSpaceExhausted { cidr: String },

    /// Key generation or peer registration failed
    #[error("peer provisioning failed: {0}")]
    Provisioning(String),

    /// Outbound connection to a tunnel target failed
    #[error("backend {addr} unreachable: {reason}")]
    BackendUnreachable { addr: String, reason: String },

    /// Malformed management request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A lifecycle task ended without producing a result
    #[error("internal error: {0}")]
    Internal(String),
}

impl TunnelError {
    /// HTTP status used when this error is reported through the management API
    pub fn status_code(&self) -> StatusCode {
        match self {
            TunnelError::Conflict(_) => StatusCode::CONFLICT,
            TunnelError::NotFound(_) => StatusCode::NOT_FOUND,
            TunnelError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TunnelError::AddressSpaceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TunnelError::Provisioning(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TunnelError::BackendUnreachable { .. } => StatusCode::BAD_GATEWAY,
            TunnelError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            TunnelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Error codes for data-path failures
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No route installed for the requested host
    UnknownHost,
    /// Failed to connect to or forward to the tunnel target
    BackendUnreachable,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendUnreachable => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
