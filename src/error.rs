//! Error classification and response helpers for the request path
//!
//! Responses carry a short plain-text body and an `X-Gateway-Error`
//! header with the machine-readable code; upstream failure detail stays
//! in the logs and never reaches the client.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Body type used by both listeners
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Error codes for request-path failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Missing or invalid Host header
    MissingHostHeader,
    /// No app configured for the requested host
    UnknownHost,
    /// The app is supervised but its process is not running
    AppNotRunning,
    /// The readiness gate expired without a healthy probe
    UpstreamUnhealthy,
    /// Upstream connection or transport failure
    BadGateway,
    /// Static file not found
    NotFound,
    /// Static file I/O failure
    StaticIo,
    /// Handler-boundary catch-all
    Internal,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            GatewayErrorCode::UnknownHost => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::AppNotRunning => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::UpstreamUnhealthy => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::StaticIo => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            GatewayErrorCode::UnknownHost => "UNKNOWN_HOST",
            GatewayErrorCode::AppNotRunning => "APP_NOT_RUNNING",
            GatewayErrorCode::UpstreamUnhealthy => "UPSTREAM_UNHEALTHY",
            GatewayErrorCode::BadGateway => "BAD_GATEWAY",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::StaticIo => "STATIC_IO",
            GatewayErrorCode::Internal => "INTERNAL",
        }
    }
}

/// Plain-text error response with the code header set
pub fn text_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}

pub fn full_body(chunk: impl Into<Bytes>) -> GatewayBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
