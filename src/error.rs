//! Launch errors and JSON error responses for the proxy

use crate::orchestrator::ConvergenceReport;
use crate::tunnel::TunnelError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that end a launch (or a `proxy`/`down` run)
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Bad arguments, bad config file, missing service files
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A service descriptor lacks a variable it must carry
    #[error("service '{service}' is missing required environment variable {variable}")]
    EnvironmentContract { service: String, variable: String },

    /// Another launcher holds the run lock
    #[error("another launch is running (lock {} held by pid {})", .path.display(), .holder)]
    LockContention { path: PathBuf, holder: String },

    /// Services did not converge within the launch timeout
    #[error("services did not converge\n{0}")]
    ConvergenceTimeout(Box<ConvergenceReport>),

    /// The proxy process ended before convergence
    #[error("proxy exited early: {0}")]
    ProxyExited(String),

    /// The proxy listener could not bind
    #[error("proxy failed to bind {addr}: {source}")]
    ProxyBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LaunchError {
    /// Process exit code for this failure class
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Configuration(_) | LaunchError::EnvironmentContract { .. } => 2,
            LaunchError::LockContention { .. } => 3,
            LaunchError::ConvergenceTimeout(_) => 4,
            LaunchError::Tunnel(_) => 5,
            LaunchError::ProxyExited(_) | LaunchError::ProxyBind { .. } | LaunchError::Io(_) => 1,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route matches the request path
    UnknownRoute,
    /// Request timed out waiting for the service
    RequestTimeout,
    /// Failed to connect to the service
    ConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
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
    let body = ErrorResponse::new(code, message).to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(hyper::header::CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    headers.insert("x-proxy-error", hyper::header::HeaderValue::from_static(code.as_header_value()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::UnknownRoute.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyErrorCode::RequestTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyErrorCode::ConnectionFailed.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownRoute, "No route for /localhost_99999/x");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_ROUTE\""));
        assert!(json.contains("\"message\":\"No route for /localhost_99999/x\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ConnectionFailed, "connection refused");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "CONNECTION_FAILED");
    }

    #[test]
    fn test_exit_codes_are_distinct_per_class() {
        assert_eq!(LaunchError::Configuration("bad".into()).exit_code(), 2);
        assert_eq!(
            LaunchError::LockContention { path: PathBuf::from("x.lock"), holder: "42".into() }.exit_code(),
            3
        );
        assert_eq!(LaunchError::Tunnel(TunnelError::Timeout(std::time::Duration::from_secs(30))).exit_code(), 5);
        assert_eq!(LaunchError::ProxyExited("status 1".into()).exit_code(), 1);
    }

    #[test]
    fn test_lock_contention_message_names_holder() {
        let err = LaunchError::LockContention {
            path: PathBuf::from(".portgate/launch.lock"),
            holder: "4242".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains(".portgate/launch.lock"));
        assert!(msg.contains("4242"));
    }
}
