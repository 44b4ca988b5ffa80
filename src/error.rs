//! Error kinds for the gateway pipeline and their HTTP responses

use crate::session::{CanonicalKey, GatewayBody};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failure of the address resolver
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// No record exists for the address
    #[error("DNS record not found: {0}")]
    NotFound(String),
    /// The resolver itself failed
    #[error("failed to resolve {address}: {cause}")]
    Failed { address: String, cause: String },
}

/// Failure reported by a resource session
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("failed to open session: {0}")]
    Open(String),
    #[error("session sync failed: {0}")]
    Sync(String),
    #[error("failed to serve request: {0}")]
    Serve(String),
    #[error("failed to close session: {0}")]
    Close(String),
}

/// Failure to obtain a session from the cache.
///
/// Cloneable so that every caller waiting on the same open sees the same error.
#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    #[error("failed to open session for {key}: {cause}")]
    Open {
        key: CanonicalKey,
        #[source]
        cause: SessionError,
    },
    #[error("opening session for {key} timed out after {after:?}")]
    Timeout { key: CanonicalKey, after: Duration },
    #[error("open task for {key} did not complete: {reason}")]
    Aborted { key: CanonicalKey, reason: String },
    #[error("session cache is closed")]
    Closed,
}

/// Failure to register a short name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShortNameError {
    #[error("address is empty")]
    EmptyAddress,
    #[error("short name '{0}' is reserved")]
    Reserved(String),
    #[error("short name '{token}' is already assigned to {existing}")]
    Collision { token: String, existing: String },
    #[error("short name table is full ({capacity} entries)")]
    Full { capacity: usize },
}

/// Failure to start listening
#[derive(Debug, Error)]
pub enum BindError {
    #[error("invalid listen address {0}")]
    InvalidAddress(String),
    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server is already listening")]
    AlreadyListening,
    #[error("server has been closed")]
    Closed,
}

/// Failure at one stage of handling a request.
///
/// Each stage of the router tags its failure so the response status can be
/// chosen precisely.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid Host header")]
    MissingHost,
    #[error("missing address in request path")]
    MissingAddress,
    #[error(transparent)]
    ShortName(#[from] ShortNameError),
    #[error("no address registered for '{0}'")]
    UnknownShortName(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("resolving {address} timed out after {after:?}")]
    ResolveTimeout { address: String, after: Duration },
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Serve(SessionError),
    #[error("request timed out after {0:?}")]
    ServeTimeout(Duration),
}

impl GatewayError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::MissingHost => GatewayErrorCode::MissingHostHeader,
            GatewayError::MissingAddress => GatewayErrorCode::MissingAddress,
            GatewayError::ShortName(ShortNameError::Collision { .. }) => {
                GatewayErrorCode::ShortNameCollision
            }
            GatewayError::ShortName(ShortNameError::Full { .. }) => {
                GatewayErrorCode::ShortNameTableFull
            }
            GatewayError::ShortName(_) => GatewayErrorCode::InvalidAddress,
            GatewayError::UnknownShortName(_) | GatewayError::Resolve(ResolveError::NotFound(_)) => {
                GatewayErrorCode::NotFound
            }
            GatewayError::Resolve(_) | GatewayError::ResolveTimeout { .. } => {
                GatewayErrorCode::ResolveFailed
            }
            GatewayError::Acquire(AcquireError::Closed) => GatewayErrorCode::CacheClosed,
            GatewayError::Acquire(_) => GatewayErrorCode::OpenFailed,
            GatewayError::Serve(_) => GatewayErrorCode::ServeFailed,
            GatewayError::ServeTimeout(_) => GatewayErrorCode::RequestTimeout,
        }
    }

    /// Build the response sent to the client for this error
    pub fn to_response(&self) -> Response<GatewayBody> {
        match self.code() {
            GatewayErrorCode::NotFound => not_found_response(),
            code => json_error_response(code, self.to_string()),
        }
    }
}

/// Error codes carried in JSON error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Shorten request without an address segment
    MissingAddress,
    /// Address cannot be turned into a short name
    InvalidAddress,
    /// Short name already points at another address
    ShortNameCollision,
    /// Short name table reached its capacity
    ShortNameTableFull,
    /// Unknown short name or unresolvable address
    NotFound,
    /// Resolver failed for a reason other than not-found
    ResolveFailed,
    /// Session could not be opened
    OpenFailed,
    /// Session failed while serving the request
    ServeFailed,
    /// Session took too long to serve the request
    RequestTimeout,
    /// Gateway is shutting down
    CacheClosed,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            GatewayErrorCode::MissingAddress => StatusCode::BAD_REQUEST,
            GatewayErrorCode::InvalidAddress => StatusCode::BAD_REQUEST,
            GatewayErrorCode::ShortNameCollision => StatusCode::CONFLICT,
            GatewayErrorCode::ShortNameTableFull => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::ResolveFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::OpenFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::ServeFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::CacheClosed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            GatewayErrorCode::MissingAddress => "MISSING_ADDRESS",
            GatewayErrorCode::InvalidAddress => "INVALID_ADDRESS",
            GatewayErrorCode::ShortNameCollision => "SHORT_NAME_COLLISION",
            GatewayErrorCode::ShortNameTableFull => "SHORT_NAME_TABLE_FULL",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::ResolveFailed => "RESOLVE_FAILED",
            GatewayErrorCode::OpenFailed => "OPEN_FAILED",
            GatewayErrorCode::ServeFailed => "SERVE_FAILED",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::CacheClosed => "CACHE_CLOSED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
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

pub(crate) fn full_body(body: impl Into<Bytes>) -> GatewayBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Plain-text 404 used for unknown short names and unresolvable addresses
pub fn not_found_response() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body("Not found"))
        .expect("valid response builder")
}
